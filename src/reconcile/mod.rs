//! Reconciliation engine
//!
//! All state for one run lives in [`ReconciliationContext`]. Each phase is a
//! free function over the context:
//!
//! 1. [`match_all`] merges the three source maps by signature
//! 2. [`rescan_singles`] looks for on-chain confirmations of provisional records
//! 3. [`find_and_remove_invalidated_nonces`] purges burned nonces
//! 4. [`resolve_duplicates`] settles same-nonce collisions before persistence
//!
//! Tiers are never stored: they are derived from the source maps whenever
//! they are asked for, so a purge can never leave a stale classification.

pub mod dupes;
pub mod invalidation;
pub mod merge;
pub mod rescan;

pub use dupes::{resolve_duplicates, DuplicateResolution};
pub use invalidation::{
    find_and_remove_invalidated_nonces, find_invalidated_nonces, remove_invalidated,
    InvalidationReport,
};
pub use merge::{match_all, merge_record, MatchSummary};
pub use rescan::{rescan_singles, select_nearest, RescanOutcome};

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::model::{AuthorizationRecord, CommentPermit, MergedRecord, SignatureKey, Source, Tier};

/// Which on-chain source wins when chain and bulk disagree on the amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmountPrecedence {
    #[default]
    ChainFirst,
    BulkFirst,
}

impl FromStr for AmountPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chain" | "chain-first" => Ok(AmountPrecedence::ChainFirst),
            "bulk" | "bulk-first" => Ok(AmountPrecedence::BulkFirst),
            other => Err(format!("unknown amount precedence: {}", other)),
        }
    }
}

/// How the rescan picks among amount-matching transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NearestPolicy {
    /// Smallest absolute distance to the comment
    #[default]
    Nearest,
    /// Only transactions at or before the comment
    Before,
    /// Only transactions at or after the comment
    After,
}

impl FromStr for NearestPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(NearestPolicy::Nearest),
            "before" => Ok(NearestPolicy::Before),
            "after" => Ok(NearestPolicy::After),
            other => Err(format!("unknown nearest policy: {}", other)),
        }
    }
}

/// Transaction attached to a provisional record by the rescan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub transaction_hash: String,
    pub block_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationContext {
    pub comment: BTreeMap<SignatureKey, CommentPermit>,
    pub chain: BTreeMap<SignatureKey, AuthorizationRecord>,
    pub bulk: BTreeMap<SignatureKey, AuthorizationRecord>,

    pub merged: BTreeMap<SignatureKey, MergedRecord>,
    pub nonce_index: BTreeMap<U256, Vec<SignatureKey>>,
    pub by_recipient: BTreeMap<Address, Vec<SignatureKey>>,

    pub confirmations: BTreeMap<SignatureKey, Confirmation>,
    pub invalidated: BTreeSet<U256>,
    /// `None` disables the recipient filter
    pub known_recipients: Option<BTreeSet<Address>>,
}

impl ReconciliationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_recipients(mut self, recipients: BTreeSet<Address>) -> Self {
        self.known_recipients = Some(recipients);
        self
    }

    /// First record for a signature wins
    pub fn insert_comment(&mut self, permit: CommentPermit) -> bool {
        let key = permit.authorization.signature.clone();
        insert_first(&mut self.comment, key, permit)
    }

    pub fn insert_chain(&mut self, record: AuthorizationRecord) -> bool {
        let key = record.signature.clone();
        insert_first(&mut self.chain, key, record)
    }

    pub fn insert_bulk(&mut self, record: AuthorizationRecord) -> bool {
        let key = record.signature.clone();
        insert_first(&mut self.bulk, key, record)
    }

    /// Source maps currently holding a signature
    pub fn sources_of(&self, signature: &SignatureKey) -> Vec<Source> {
        let mut sources = Vec::with_capacity(3);
        if self.comment.contains_key(signature) {
            sources.push(Source::Comment);
        }
        if self.bulk.contains_key(signature) {
            sources.push(Source::Bulk);
        }
        if self.chain.contains_key(signature) {
            sources.push(Source::Chain);
        }
        sources
    }

    /// Tier of a merged record, derived from the source maps right now
    pub fn tier_of(&self, signature: &SignatureKey) -> Option<Tier> {
        if !self.merged.contains_key(signature) {
            return None;
        }
        Tier::from_count(self.sources_of(signature).len())
    }

    pub fn tier_members(&self, tier: Tier) -> BTreeSet<SignatureKey> {
        self.merged
            .keys()
            .filter(|sig| self.tier_of(sig) == Some(tier))
            .cloned()
            .collect()
    }

    pub fn singles(&self) -> BTreeSet<SignatureKey> {
        self.tier_members(Tier::Single)
    }

    pub fn doubles(&self) -> BTreeSet<SignatureKey> {
        self.tier_members(Tier::Double)
    }

    pub fn triples(&self) -> BTreeSet<SignatureKey> {
        self.tier_members(Tier::Triple)
    }

    pub fn tier_counts(&self) -> BTreeMap<Tier, usize> {
        let mut counts = BTreeMap::new();
        for sig in self.merged.keys() {
            if let Some(tier) = self.tier_of(sig) {
                *counts.entry(tier).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Merged records attributed to a recipient, in insertion order
    pub fn records_for(&self, recipient: &Address) -> Vec<&MergedRecord> {
        self.by_recipient
            .get(recipient)
            .map(|sigs| sigs.iter().filter_map(|s| self.merged.get(s)).collect())
            .unwrap_or_default()
    }

    pub fn is_known_recipient(&self, recipient: &Address) -> bool {
        self.known_recipients
            .as_ref()
            .map_or(true, |known| known.contains(recipient))
    }

    /// Index a merged record by nonce and recipient
    pub(crate) fn index(&mut self, record: MergedRecord) {
        let sig = record.signature().clone();
        let nonce = record.authorization.nonce;
        let recipient = record.authorization.recipient;

        push_unique(self.nonce_index.entry(nonce).or_default(), &sig);
        push_unique(self.by_recipient.entry(recipient).or_default(), &sig);
        self.merged.insert(sig, record);
    }

    /// Drop a signature from every map
    pub(crate) fn purge(&mut self, signature: &SignatureKey) -> bool {
        let mut removed = self.merged.remove(signature).is_some();
        removed |= self.comment.remove(signature).is_some();
        removed |= self.chain.remove(signature).is_some();
        removed |= self.bulk.remove(signature).is_some();
        self.confirmations.remove(signature);

        for sigs in self.nonce_index.values_mut() {
            sigs.retain(|s| s != signature);
        }
        self.nonce_index.retain(|_, sigs| !sigs.is_empty());
        for sigs in self.by_recipient.values_mut() {
            sigs.retain(|s| s != signature);
        }
        self.by_recipient.retain(|_, sigs| !sigs.is_empty());
        removed
    }
}

fn insert_first<V>(map: &mut BTreeMap<SignatureKey, V>, key: SignatureKey, value: V) -> bool {
    if map.contains_key(&key) {
        return false;
    }
    map.insert(key, value);
    true
}

fn push_unique(list: &mut Vec<SignatureKey>, sig: &SignatureKey) {
    if !list.contains(sig) {
        list.push(sig.clone());
    }
}

//! Leaderboards and persistence-ready ledger entries

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::identity::IdentityStore;
use crate::model::{address_key, Currency, MergedRecord, PaymentClaim, TokenInfo};
use crate::reconcile::ReconciliationContext;
use crate::units::{format_units, parse_uint};

/// Tally bucket for text payouts with no resolvable payee
pub const NO_ASSIGNEE: &str = "No assignee";

/// One row ready for the persistence sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub signature: String,
    pub nonce: String,
    /// Smallest-unit decimal string
    pub amount: String,
    pub token: String,
    pub token_id: Option<u32>,
    pub beneficiary_id: Option<u64>,
    pub recipient: String,
    pub owner: String,
    pub deadline: String,
    pub network_id: Option<u64>,
    pub transaction_hash: Option<String>,
    pub repo_name: Option<String>,
    pub issue_number: Option<u64>,
    pub claim_url: Option<String>,
    pub comment_timestamp: Option<DateTime<Utc>>,
    pub block_timestamp: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn from_record(record: &MergedRecord, beneficiary_id: Option<u64>) -> Self {
        let auth = &record.authorization;
        let context = record.context.as_ref();
        Self {
            signature: auth.signature.to_string(),
            nonce: auth.nonce.to_string(),
            amount: auth.amount.to_string(),
            token: address_key(&auth.token),
            token_id: TokenInfo::by_address(&auth.token).map(|t| t.id),
            beneficiary_id,
            recipient: address_key(&auth.recipient),
            owner: address_key(&auth.owner),
            deadline: auth.deadline.to_string(),
            network_id: auth.network_id,
            transaction_hash: auth.transaction_hash.clone(),
            repo_name: context.map(|c| c.repo_name.clone()),
            issue_number: context.map(|c| c.issue_number),
            claim_url: context.map(|c| c.claim_url.clone()),
            comment_timestamp: context.map(|c| c.comment_timestamp),
            block_timestamp: auth.block_timestamp,
        }
    }

    pub fn amount_value(&self) -> Option<U256> {
        parse_uint(&self.amount).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardRow {
    pub address: String,
    pub amount: U256,
}

impl LeaderboardRow {
    pub fn display_amount(&self) -> String {
        format_units(self.amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Leaderboards {
    /// Every surviving authorization
    pub authorized: Vec<LeaderboardRow>,
    /// Only authorizations with a transaction hash
    pub confirmed: Vec<LeaderboardRow>,
}

impl Leaderboards {
    pub fn authorized_total(&self, address: &str) -> U256 {
        total_for(&self.authorized, address)
    }

    pub fn confirmed_total(&self, address: &str) -> U256 {
        total_for(&self.confirmed, address)
    }
}

fn total_for(rows: &[LeaderboardRow], address: &str) -> U256 {
    let address = address.to_ascii_lowercase();
    rows.iter()
        .find(|r| r.address == address)
        .map(|r| r.amount)
        .unwrap_or_default()
}

fn sorted_rows(totals: BTreeMap<String, U256>) -> Vec<LeaderboardRow> {
    let mut rows: Vec<LeaderboardRow> = totals
        .into_iter()
        .map(|(address, amount)| LeaderboardRow { address, amount })
        .collect();
    rows.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.address.cmp(&b.address)));
    rows
}

/// Fold recipient lists into leaderboards, counting each signature once
pub fn build_leaderboards(ctx: &ReconciliationContext) -> Leaderboards {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut authorized: BTreeMap<String, U256> = BTreeMap::new();
    let mut confirmed: BTreeMap<String, U256> = BTreeMap::new();

    for (recipient, signatures) in &ctx.by_recipient {
        let key = address_key(recipient);
        for sig in signatures {
            if !seen.insert(sig.as_str()) {
                continue;
            }
            let Some(record) = ctx.merged.get(sig) else {
                continue;
            };
            let amount = record.authorization.amount;
            let total = authorized.entry(key.clone()).or_default();
            *total = total.saturating_add(amount);
            if record.is_confirmed() {
                let total = confirmed.entry(key.clone()).or_default();
                *total = total.saturating_add(amount);
            }
        }
    }

    Leaderboards {
        authorized: sorted_rows(authorized),
        confirmed: sorted_rows(confirmed),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEntries {
    pub attributable: Vec<LedgerEntry>,
    /// Recipient has no contributor identity
    pub non_attributable: Vec<LedgerEntry>,
}

/// Persistence-ready entries for every merged record
pub fn build_entries(ctx: &ReconciliationContext, identities: &dyn IdentityStore) -> LedgerEntries {
    let mut entries = LedgerEntries::default();
    for record in ctx.merged.values() {
        let beneficiary = identities.wallet_address_to_identity_id(&record.authorization.recipient);
        let entry = LedgerEntry::from_record(record, beneficiary);
        if entry.token_id.is_none() {
            warn!(
                signature = %entry.signature,
                token = %entry.token,
                "Token missing from token table"
            );
        }
        match beneficiary {
            Some(_) => entries.attributable.push(entry),
            None => entries.non_attributable.push(entry),
        }
    }
    info!(
        attributable = entries.attributable.len(),
        non_attributable = entries.non_attributable.len(),
        "Built ledger entries"
    );
    entries
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyRow {
    pub username: String,
    pub amount: U256,
    pub claims: usize,
}

/// Per-username totals of text payouts.
///
/// The same payout repeated in several comments on one issue is counted once.
pub fn tally_claims(claims: &[PaymentClaim]) -> Vec<TallyRow> {
    let mut seen: BTreeSet<(&str, u64, U256, Currency, Option<&str>)> = BTreeSet::new();
    let mut totals: BTreeMap<String, (U256, usize)> = BTreeMap::new();

    for claim in claims {
        let key = (
            claim.repo_name.as_str(),
            claim.issue_number,
            claim.amount,
            claim.currency,
            claim.payee.as_deref(),
        );
        if !seen.insert(key) {
            continue;
        }
        let username = claim.payee.clone().unwrap_or_else(|| NO_ASSIGNEE.to_string());
        let total = totals.entry(username).or_default();
        total.0 = total.0.saturating_add(claim.amount);
        total.1 += 1;
    }

    let mut rows: Vec<TallyRow> = totals
        .into_iter()
        .map(|(username, (amount, claims))| TallyRow {
            username,
            amount,
            claims,
        })
        .collect();
    rows.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.username.cmp(&b.username)));
    rows
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::identity::{Identity, JsonIdentityStore};
    use crate::model::{RecipientType, SignatureKey};
    use crate::reconcile::fixtures::*;
    use crate::reconcile::{match_all, AmountPrecedence};

    pub fn entry(signature: &str, nonce: &str, amount: &str, tx: Option<&str>) -> LedgerEntry {
        LedgerEntry {
            signature: signature.to_string(),
            nonce: nonce.to_string(),
            amount: amount.to_string(),
            token: address_key(&crate::model::WXDAI.address),
            token_id: Some(2),
            beneficiary_id: Some(1),
            recipient: address_key(&ALICE),
            owner: address_key(&OWNER),
            deadline: "1900000000".to_string(),
            network_id: Some(100),
            transaction_hash: tx.map(str::to_string),
            repo_name: Some("ubiquibot".to_string()),
            issue_number: Some(1),
            claim_url: None,
            comment_timestamp: None,
            block_timestamp: None,
        }
    }

    fn context() -> ReconciliationContext {
        let mut ctx = ReconciliationContext::new();
        ctx.insert_comment(comment("0x01", 1, 10, ALICE, 1_000));
        ctx.insert_chain(on_chain("0x01", 1, 10, ALICE, "0xa", 2_000));
        ctx.insert_comment(comment("0x02", 2, 5, ALICE, 1_000));
        ctx.insert_bulk(on_chain("0x03", 3, 30, BOB, "0xb", 2_000));
        match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut Diagnostics::new());
        ctx
    }

    #[test]
    fn test_leaderboards_split_confirmed() {
        let boards = build_leaderboards(&context());
        let alice = address_key(&ALICE);

        assert_eq!(boards.authorized_total(&alice), U256::from(15u64));
        assert_eq!(boards.confirmed_total(&alice), U256::from(10u64));
        // sorted descending
        assert_eq!(boards.authorized[0].address, address_key(&BOB));
        assert_eq!(boards.authorized[0].amount, U256::from(30u64));
    }

    #[test]
    fn test_duplicate_signature_counted_once() {
        let mut ctx = context();
        let sig = SignatureKey::new("0x01");
        ctx.by_recipient.get_mut(&ALICE).unwrap().push(sig.clone());
        ctx.by_recipient.entry(BOB).or_default().push(sig);

        let boards = build_leaderboards(&ctx);
        assert_eq!(boards.authorized_total(&address_key(&ALICE)), U256::from(15u64));
        assert_eq!(boards.authorized_total(&address_key(&BOB)), U256::from(30u64));
    }

    #[test]
    fn test_entries_route_unknown_beneficiaries() {
        let identities = JsonIdentityStore::from_identities([Identity {
            id: 7,
            username: Some("alice".to_string()),
            wallet_address: ALICE,
        }]);
        let entries = build_entries(&context(), &identities);

        assert_eq!(entries.attributable.len(), 2);
        assert_eq!(entries.non_attributable.len(), 1);
        let first = &entries.attributable[0];
        assert_eq!(first.beneficiary_id, Some(7));
        assert_eq!(first.token_id, Some(2));
        assert_eq!(first.amount, "10");
        assert_eq!(first.deadline, "1900000000");
        assert_eq!(first.repo_name.as_deref(), Some("ubiquibot"));
        assert_eq!(entries.non_attributable[0].recipient, address_key(&BOB));
    }

    #[test]
    fn test_tally_dedups_repeated_payouts() {
        let claim = PaymentClaim {
            repo_name: "ubiquibot".to_string(),
            issue_number: 1,
            issue_url: String::new(),
            amount: U256::from(5u64),
            currency: Currency::Wxdai,
            payee: Some("alice".to_string()),
            recipient_type: RecipientType::Assignee,
        };
        let mut unassigned = claim.clone();
        unassigned.payee = None;
        unassigned.amount = U256::from(1u64);
        let mut other_issue = claim.clone();
        other_issue.issue_number = 2;

        let rows = tally_claims(&[claim.clone(), claim, other_issue, unassigned]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].username, "alice");
        assert_eq!(rows[0].amount, U256::from(10u64));
        assert_eq!(rows[0].claims, 2);
        assert_eq!(rows[1].username, NO_ASSIGNEE);
    }
}

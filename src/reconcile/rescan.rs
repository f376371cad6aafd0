use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::{Confirmation, NearestPolicy, ReconciliationContext};
use crate::chain::abi::PERMIT_TRANSFER_FROM_SELECTOR;
use crate::chain::{decode_permit_transfer, TransactionHistory};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::model::{address_key, AuthorizationRecord, Chain, SignatureKey, Tier};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanOutcome {
    pub confirmed: Vec<(SignatureKey, String)>,
    pub unmatched: Vec<SignatureKey>,
}

/// Pick the transaction that most plausibly paid out a comment.
///
/// Candidates must match the amount exactly and carry a hash and block time.
/// Among them the smallest distance to the comment wins; equal distances go
/// to the earlier block. Hashes in `used` are already spoken for.
pub fn select_nearest<'a>(
    amount: U256,
    comment_time: DateTime<Utc>,
    candidates: &'a [AuthorizationRecord],
    policy: NearestPolicy,
    used: &BTreeSet<String>,
) -> Option<&'a AuthorizationRecord> {
    candidates
        .iter()
        .filter(|c| c.amount == amount)
        .filter_map(|c| {
            let hash = c.transaction_hash.as_ref()?;
            let time = c.block_timestamp?;
            if used.contains(hash) {
                return None;
            }
            let allowed = match policy {
                NearestPolicy::Nearest => true,
                NearestPolicy::Before => time <= comment_time,
                NearestPolicy::After => time >= comment_time,
            };
            allowed.then(|| ((time - comment_time).num_seconds().abs(), time, c))
        })
        .min_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)))
        .map(|(_, _, c)| c)
}

/// Try to confirm provisional single-tier comment records from chain history.
///
/// Each recipient's Permit2 claims are fetched once per chain. A record with
/// no matching transaction stays unconfirmed. When the chosen transaction
/// carries the record's own signature it also joins the chain map, lifting
/// the record's tier.
pub async fn rescan_singles(
    ctx: &mut ReconciliationContext,
    history: &dyn TransactionHistory,
    policy: NearestPolicy,
    diagnostics: &mut Diagnostics,
) -> RescanOutcome {
    let mut pending: Vec<(DateTime<Utc>, SignatureKey)> = ctx
        .merged
        .values()
        .filter(|r| !r.is_confirmed())
        .filter(|r| ctx.tier_of(r.signature()) == Some(Tier::Single))
        .filter_map(|r| r.comment_timestamp().map(|t| (t, r.signature().clone())))
        .collect();
    pending.sort();

    let mut used: BTreeSet<String> = ctx
        .merged
        .values()
        .filter_map(|r| r.authorization.transaction_hash.clone())
        .collect();
    let mut cache: BTreeMap<(Address, Chain), Vec<AuthorizationRecord>> = BTreeMap::new();
    let mut outcome = RescanOutcome::default();

    for (comment_time, sig) in pending {
        let Some(record) = ctx.merged.get(&sig) else {
            continue;
        };
        let recipient = record.authorization.recipient;
        let amount = record.authorization.amount;
        let chain = record
            .authorization
            .network_id
            .and_then(Chain::from_id)
            .unwrap_or_else(|| Chain::for_token(&record.authorization.token));

        if !cache.contains_key(&(recipient, chain)) {
            let candidates = fetch_candidates(history, &recipient, chain, diagnostics).await;
            cache.insert((recipient, chain), candidates);
        }
        let candidates = cache.get(&(recipient, chain)).map(Vec::as_slice).unwrap_or_default();

        let Some(found) = select_nearest(amount, comment_time, candidates, policy, &used) else {
            debug!(signature = %sig, "No matching transaction for provisional record");
            outcome.unmatched.push(sig);
            continue;
        };
        let found = found.clone();
        let (Some(hash), Some(block_timestamp)) =
            (found.transaction_hash.clone(), found.block_timestamp)
        else {
            outcome.unmatched.push(sig);
            continue;
        };

        info!(signature = %sig, tx = %hash, "Confirmed provisional record");
        used.insert(hash.clone());
        let confirmation = Confirmation {
            transaction_hash: hash.clone(),
            block_timestamp,
        };
        if let Some(record) = ctx.merged.get_mut(&sig) {
            record.authorization.transaction_hash = Some(hash.clone());
            record.authorization.block_timestamp = Some(block_timestamp);
        }
        if found.signature == sig {
            ctx.insert_chain(found);
        }
        ctx.confirmations.insert(sig.clone(), confirmation);
        outcome.confirmed.push((sig, hash));
    }

    info!(
        confirmed = outcome.confirmed.len(),
        unmatched = outcome.unmatched.len(),
        "Rescan of provisional records complete"
    );
    outcome
}

async fn fetch_candidates(
    history: &dyn TransactionHistory,
    recipient: &Address,
    chain: Chain,
    diagnostics: &mut Diagnostics,
) -> Vec<AuthorizationRecord> {
    let transactions = match history
        .transactions_for_address(recipient, chain, None, None, Some(PERMIT_TRANSFER_FROM_SELECTOR))
        .await
    {
        Ok(txs) => txs,
        Err(e) => {
            diagnostics.push(Diagnostic::source_error(
                &e,
                format!("rescan of {} on {}", address_key(recipient), chain),
            ));
            return Vec::new();
        }
    };

    transactions
        .iter()
        .filter_map(|tx| match decode_permit_transfer(tx) {
            Ok(record) => Some(record),
            Err(e) => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::DecodeFailure,
                    format!("rescan {}: {}", tx.hash, e),
                ));
                None
            }
        })
        .filter(|record| record.recipient == *recipient)
        .collect()
}

use alloy_primitives::{Address, U256};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::ReconciliationContext;
use crate::chain::abi::INVALIDATE_NONCES_SELECTOR;
use crate::chain::{decode_invalidation, InvalidatedNonce, TransactionHistory};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::model::{address_key, Chain, SignatureKey};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub invalidated: Vec<InvalidatedNonce>,
    pub removed: Vec<SignatureKey>,
}

/// Scan each owner's history on every chain for `invalidateUnorderedNonces` calls
pub async fn find_invalidated_nonces(
    history: &dyn TransactionHistory,
    owners: &[Address],
    chains: &[Chain],
    diagnostics: &mut Diagnostics,
) -> Vec<InvalidatedNonce> {
    let mut found = Vec::new();
    for owner in owners {
        for chain in chains {
            let transactions = match history
                .transactions_for_address(
                    owner,
                    *chain,
                    None,
                    None,
                    Some(INVALIDATE_NONCES_SELECTOR),
                )
                .await
            {
                Ok(txs) => txs,
                Err(e) => {
                    diagnostics.push(Diagnostic::source_error(
                        &e,
                        format!("invalidation scan of {} on {}", address_key(owner), chain),
                    ));
                    continue;
                }
            };

            for tx in &transactions {
                match decode_invalidation(tx) {
                    Ok(invalidated) => found.push(invalidated),
                    Err(e) => diagnostics.push(Diagnostic::new(
                        DiagnosticKind::DecodeFailure,
                        format!("invalidation {}: {}", tx.hash, e),
                    )),
                }
            }
        }
    }
    info!(count = found.len(), "Found invalidated nonces");
    found
}

/// Purge every record bearing an invalidated nonce.
///
/// Records leave the merged set, all three source maps and the recipient
/// lists. The nonce is remembered so a later `match_all` cannot revive it.
/// Applying the same invalidations twice removes nothing the second time.
pub fn remove_invalidated(
    ctx: &mut ReconciliationContext,
    invalidated: &[InvalidatedNonce],
) -> InvalidationReport {
    let mut report = InvalidationReport::default();

    for inv in invalidated {
        ctx.invalidated.insert(inv.nonce);

        let mut doomed: BTreeSet<SignatureKey> = ctx
            .nonce_index
            .get(&inv.nonce)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        doomed.extend(signatures_with_nonce(ctx, inv.nonce));

        for sig in doomed {
            if let Some(record) = ctx.merged.get(&sig) {
                if record.authorization.owner != inv.owner {
                    warn!(
                        signature = %sig,
                        nonce = %inv.nonce,
                        record_owner = %address_key(&record.authorization.owner),
                        invalidating_owner = %address_key(&inv.owner),
                        "Purging record invalidated by a different owner"
                    );
                }
            }
            if ctx.purge(&sig) {
                info!(
                    signature = %sig,
                    nonce = %inv.nonce,
                    tx = %inv.transaction_hash,
                    "Purged invalidated authorization"
                );
                report.removed.push(sig);
            }
        }
        report.invalidated.push(inv.clone());
    }
    report
}

/// Source map entries that never made it into the merged set still carry the nonce
fn signatures_with_nonce(ctx: &ReconciliationContext, nonce: U256) -> Vec<SignatureKey> {
    ctx.comment
        .iter()
        .filter(|(_, p)| p.authorization.nonce == nonce)
        .map(|(k, _)| k)
        .chain(ctx.chain.iter().filter(|(_, r)| r.nonce == nonce).map(|(k, _)| k))
        .chain(ctx.bulk.iter().filter(|(_, r)| r.nonce == nonce).map(|(k, _)| k))
        .cloned()
        .collect()
}

/// Must run after `match_all`
pub async fn find_and_remove_invalidated_nonces(
    ctx: &mut ReconciliationContext,
    history: &dyn TransactionHistory,
    owners: &[Address],
    chains: &[Chain],
    diagnostics: &mut Diagnostics,
) -> InvalidationReport {
    let invalidated = find_invalidated_nonces(history, owners, chains, diagnostics).await;
    let report = remove_invalidated(ctx, &invalidated);
    info!(
        nonces = report.invalidated.len(),
        removed = report.removed.len(),
        "Invalidation pass complete"
    );
    report
}

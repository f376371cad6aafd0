use alloy_primitives::Address;
use std::collections::BTreeSet;
use tracing::info;

use super::abi::PERMIT_TRANSFER_FROM_SELECTOR;
use super::{decode_permit_transfer, TransactionHistory};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::model::{address_key, AuthorizationRecord, Chain};

#[derive(Debug, Clone, Default)]
pub struct CollectedHistory {
    pub records: Vec<AuthorizationRecord>,
    pub transactions_seen: usize,
    pub decode_failures: usize,
}

/// Walk each address's history on every chain and decode its Permit2 claims.
///
/// The same claim shows up under the Permit2 contract, the signer and the
/// recipient, so transactions are de-duplicated by hash. A failing address is
/// skipped with a diagnostic.
pub async fn collect_permit_transfers(
    history: &dyn TransactionHistory,
    addresses: &[Address],
    chains: &[Chain],
    diagnostics: &mut Diagnostics,
) -> CollectedHistory {
    let mut collected = CollectedHistory::default();
    let mut seen: BTreeSet<(Chain, String)> = BTreeSet::new();

    for address in addresses {
        for chain in chains {
            let transactions = match history
                .transactions_for_address(
                    address,
                    *chain,
                    None,
                    None,
                    Some(PERMIT_TRANSFER_FROM_SELECTOR),
                )
                .await
            {
                Ok(txs) => txs,
                Err(e) => {
                    diagnostics.push(Diagnostic::source_error(
                        &e,
                        format!("history of {} on {}", address_key(address), chain),
                    ));
                    continue;
                }
            };

            for tx in transactions {
                if !seen.insert((tx.chain, tx.hash.to_ascii_lowercase())) {
                    continue;
                }
                collected.transactions_seen += 1;
                match decode_permit_transfer(&tx) {
                    Ok(record) => collected.records.push(record),
                    Err(e) => {
                        collected.decode_failures += 1;
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::DecodeFailure,
                            format!("permit transfer {}: {}", tx.hash, e),
                        ));
                    }
                }
            }
        }
    }

    info!(
        addresses = addresses.len(),
        transactions = collected.transactions_seen,
        decoded = collected.records.len(),
        "Collected on-chain permit transfers"
    );
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::decoder::tests::{permit_input, tx, OWNER, RECIPIENT};
    use crate::chain::ChainTransaction;
    use crate::error::SourceError;
    use alloy_primitives::U256;
    use async_trait::async_trait;

    /// Same claim visible from both ends, plus a garbled call on the owner
    struct SharedHistory;

    #[async_trait]
    impl TransactionHistory for SharedHistory {
        async fn transactions_for_address(
            &self,
            address: &Address,
            chain: Chain,
            _from_block: Option<u64>,
            _to_block: Option<u64>,
            _selector: Option<&str>,
        ) -> Result<Vec<ChainTransaction>, SourceError> {
            if chain == Chain::Ethereum {
                return Err(SourceError::Api("NOTOK".to_string()));
            }
            let claim = tx(
                "0xC1",
                permit_input(U256::from(3u64), U256::from(11u64), &[5u8; 65]),
                1_700_000_000,
            );
            let mut txs = vec![claim];
            if *address == OWNER {
                txs.push(tx("0xC2", "0x30f28b7a00".to_string(), 1_700_000_100));
            }
            Ok(txs)
        }
    }

    #[tokio::test]
    async fn test_collects_each_transaction_once() {
        let mut diagnostics = Diagnostics::new();
        let collected = collect_permit_transfers(
            &SharedHistory,
            &[OWNER, RECIPIENT],
            &Chain::ALL,
            &mut diagnostics,
        )
        .await;

        assert_eq!(collected.records.len(), 1);
        assert_eq!(collected.records[0].transaction_hash.as_deref(), Some("0xc1"));
        assert_eq!(collected.transactions_seen, 2);
        assert_eq!(collected.decode_failures, 1);
        assert_eq!(diagnostics.count(DiagnosticKind::DecodeFailure), 1);
        assert_eq!(diagnostics.count(DiagnosticKind::SourceFailure), 2);
    }
}

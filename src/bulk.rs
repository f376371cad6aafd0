//! Bulk on-chain export importer
//!
//! Reads a query-engine export of Permit2 claim transactions. Coverage is
//! narrower than the explorer scan and rows may lack calldata, in which case
//! the input is looked up by hash. Accepted layouts: a flat array of rows, or
//! an object mapping wallet addresses to row arrays.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::chain::{decode_permit_calldata, TransactionLookup};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::model::{AuthorizationRecord, Chain};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkRow {
    #[serde(alias = "tx_hash", alias = "txHash", alias = "evt_tx_hash")]
    pub hash: String,
    #[serde(default, alias = "data")]
    pub input: Option<String>,
    #[serde(default, alias = "chainId", alias = "networkId", alias = "network_id")]
    pub chain_id: Option<u64>,
    #[serde(
        default,
        alias = "timeStamp",
        alias = "block_time",
        alias = "blockTimestamp",
        deserialize_with = "flexible_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExport {
    Rows(Vec<Value>),
    ByWallet(BTreeMap<String, Vec<Value>>),
}

/// Readable rows of an export plus one diagnostic per rejected row
#[derive(Debug, Clone, Default)]
pub struct BulkExport {
    pub rows: Vec<BulkRow>,
    pub rejected: Diagnostics,
}

impl From<Vec<BulkRow>> for BulkExport {
    fn from(rows: Vec<BulkRow>) -> Self {
        Self {
            rows,
            rejected: Diagnostics::new(),
        }
    }
}

/// Seconds as number or string, RFC 3339, or `2023-06-01 12:00:00.000 UTC`
fn flexible_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(i64),
        Text(String),
    }

    let Some(repr) = Option::<Repr>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let parsed = match repr {
        Repr::Seconds(secs) => Utc.timestamp_opt(secs, 0).single(),
        Repr::Text(text) => parse_timestamp(&text),
    };
    parsed
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom("unrecognised timestamp"))
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = text.trim_end_matches(" UTC");
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

/// Parse an export file. Only a file whose layout is unreadable is an error;
/// a single bad row is rejected with a diagnostic.
pub fn parse_bulk_export(content: &str) -> Result<BulkExport, serde_json::Error> {
    let raw = match serde_json::from_str::<RawExport>(content)? {
        RawExport::Rows(rows) => rows,
        RawExport::ByWallet(by_wallet) => by_wallet.into_values().flatten().collect(),
    };

    let mut export = BulkExport::default();
    for (position, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<BulkRow>(value.clone()) {
            Ok(row) => export.rows.push(row),
            Err(e) => export.rejected.push(
                Diagnostic::new(
                    DiagnosticKind::DecodeFailure,
                    format!("bulk row {}: {}", position, e),
                )
                .with_raw(value.to_string()),
            ),
        }
    }
    Ok(export)
}

pub fn load_bulk_export(path: &Path) -> Result<BulkExport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bulk export {}", path.display()))?;
    let export = parse_bulk_export(&content)
        .with_context(|| format!("Failed to parse bulk export {}", path.display()))?;
    if !export.rejected.is_empty() {
        warn!(
            path = %path.display(),
            rejected = export.rejected.len(),
            "Bulk export has unreadable rows"
        );
    }
    info!(path = %path.display(), rows = export.rows.len(), "Loaded bulk export");
    Ok(export)
}

/// Decode export rows into authorization records.
///
/// Rows that cannot be decoded are skipped with a diagnostic. Without a
/// lookup, rows lacking calldata are skipped too.
pub async fn import_rows(
    rows: Vec<BulkRow>,
    lookup: Option<&dyn TransactionLookup>,
    diagnostics: &mut Diagnostics,
) -> Vec<AuthorizationRecord> {
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let chain = row.chain_id.and_then(Chain::from_id);
        let input = match (&row.input, lookup) {
            (Some(input), _) if !input.trim().is_empty() && input != "0x" => Some(input.clone()),
            (_, Some(lookup)) => lookup_input(lookup, &row.hash, chain, diagnostics).await,
            (_, None) => None,
        };
        let Some(input) = input else {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::DecodeFailure,
                format!("bulk row {} has no calldata", row.hash),
            ));
            continue;
        };

        match decode_permit_calldata(&input) {
            Ok(record) => {
                let network = chain.unwrap_or_else(|| Chain::for_token(&record.token));
                records.push(AuthorizationRecord {
                    network_id: Some(network.id()),
                    transaction_hash: Some(row.hash.to_ascii_lowercase()),
                    block_timestamp: row.timestamp,
                    ..record
                });
            }
            Err(e) => diagnostics.push(Diagnostic::new(
                DiagnosticKind::DecodeFailure,
                format!("bulk row {}: {}", row.hash, e),
            )),
        }
    }

    info!(records = records.len(), "Imported bulk authorizations");
    records
}

/// Try the row's chain, or every chain when the export does not say
async fn lookup_input(
    lookup: &dyn TransactionLookup,
    hash: &str,
    chain: Option<Chain>,
    diagnostics: &mut Diagnostics,
) -> Option<String> {
    let chains: Vec<Chain> = match chain {
        Some(chain) => vec![chain],
        None => Chain::ALL.to_vec(),
    };
    for chain in chains {
        match lookup.transaction_input(hash, chain).await {
            Ok(Some(input)) => return Some(input),
            Ok(None) => continue,
            Err(e) => {
                warn!(hash, %chain, error = %e, "Bulk row lookup failed");
                diagnostics.push(Diagnostic::source_error(&e, format!("lookup of {}", hash)));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::decoder::tests::{permit_input, RECIPIENT};
    use crate::error::SourceError;
    use alloy_primitives::U256;
    use async_trait::async_trait;

    struct GnosisOnly(String);

    #[async_trait]
    impl TransactionLookup for GnosisOnly {
        async fn transaction_input(
            &self,
            _hash: &str,
            chain: Chain,
        ) -> Result<Option<String>, SourceError> {
            Ok((chain == Chain::Gnosis).then(|| self.0.clone()))
        }
    }

    #[test]
    fn test_parse_flat_and_wallet_keyed_exports() {
        let flat = r#"[{"hash": "0xA", "input": "0x30f28b7a", "chainId": 100,
            "timeStamp": "1690000000"}]"#;
        let rows = parse_bulk_export(flat).unwrap().rows;
        assert_eq!(rows[0].chain_id, Some(100));
        assert_eq!(rows[0].timestamp.unwrap().timestamp(), 1_690_000_000);

        let keyed =
            r#"{"0xabc": [{"tx_hash": "0xB", "block_time": "2023-06-01 12:00:00.000 UTC"}]}"#;
        let rows = parse_bulk_export(keyed).unwrap().rows;
        assert_eq!(rows[0].hash, "0xB");
        assert_eq!(rows[0].input, None);
        assert_eq!(rows[0].timestamp.unwrap().to_rfc3339(), "2023-06-01T12:00:00+00:00");
    }

    #[test]
    fn test_network_aliases() {
        let rows = parse_bulk_export(
            r#"[{"hash": "0xA", "chain_id": 1},
                {"hash": "0xB", "networkId": 100},
                {"hash": "0xC", "network_id": 1}]"#,
        )
        .unwrap()
        .rows;
        let chains: Vec<_> = rows.iter().map(|r| r.chain_id).collect();
        assert_eq!(chains, [Some(1), Some(100), Some(1)]);
    }

    #[test]
    fn test_bad_row_rejected_others_kept() {
        let export = parse_bulk_export(
            r#"[{"hash": "0xA", "chainId": 100},
                {"hash": "0xB", "timeStamp": "soon"},
                {"timeStamp": "1690000000"}]"#,
        )
        .unwrap();
        assert_eq!(export.rows.len(), 1);
        assert_eq!(export.rows[0].hash, "0xA");
        assert_eq!(export.rejected.count(DiagnosticKind::DecodeFailure), 2);
    }

    #[test]
    fn test_unreadable_layout_is_error() {
        assert!(parse_bulk_export(r#""not an export""#).is_err());
    }

    #[tokio::test]
    async fn test_import_decodes_and_looks_up_missing_input() {
        let input = permit_input(U256::from(8u64), U256::from(4u64), &[7u8; 65]);
        let rows = vec![
            BulkRow {
                hash: "0xAA".to_string(),
                input: Some(input.clone()),
                chain_id: None,
                timestamp: None,
            },
            BulkRow {
                hash: "0xBB".to_string(),
                input: None,
                chain_id: None,
                timestamp: None,
            },
            BulkRow {
                hash: "0xCC".to_string(),
                input: Some("0xdeadbeef".to_string()),
                chain_id: Some(1),
                timestamp: None,
            },
        ];
        let lookup = GnosisOnly(input);
        let mut diagnostics = Diagnostics::new();
        let records = import_rows(rows, Some(&lookup), &mut diagnostics).await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].recipient, RECIPIENT);
        // WXDAI lives on Gnosis
        assert_eq!(records[0].network_id, Some(100));
        assert_eq!(records[1].transaction_hash.as_deref(), Some("0xbb"));
        assert_eq!(diagnostics.count(DiagnosticKind::DecodeFailure), 1);
    }

    #[tokio::test]
    async fn test_rows_without_input_skipped_without_lookup() {
        let rows = vec![BulkRow {
            hash: "0xBB".to_string(),
            input: None,
            chain_id: Some(100),
            timestamp: None,
        }];
        let mut diagnostics = Diagnostics::new();
        assert!(import_rows(rows, None, &mut diagnostics).await.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }
}

//! Etherscan-compatible transaction history client
//!
//! Free-tier explorers throttle hard, so every request is issued serially and
//! a "Max rate limit reached" reply is retried after a fixed delay.

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::decoder::ChainTransaction;
use crate::error::SourceError;
use crate::model::Chain;

/// Rows per explorer page
const PAGE_SIZE: usize = 1000;
/// Explorers refuse `page × offset` beyond 10 000
const MAX_PAGES: usize = 10;
const LATEST_BLOCK: u64 = 99_999_999;

#[async_trait]
pub trait TransactionHistory: Send + Sync {
    /// Transactions sent from or to `address`, oldest first.
    ///
    /// When `selector` is given only calls with that method selector are kept.
    async fn transactions_for_address(
        &self,
        address: &Address,
        chain: Chain,
        from_block: Option<u64>,
        to_block: Option<u64>,
        selector: Option<&str>,
    ) -> Result<Vec<ChainTransaction>, SourceError>;
}

#[async_trait]
pub trait TransactionLookup: Send + Sync {
    /// Calldata of a transaction, `None` when the explorer does not know it
    async fn transaction_input(&self, hash: &str, chain: Chain)
        -> Result<Option<String>, SourceError>;
}

/// One explorer deployment
#[derive(Debug, Clone)]
pub struct ExplorerEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub start_block: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// Explorer reply after status interpretation
#[derive(Debug, Clone, PartialEq)]
pub enum ExplorerReply {
    Rows(Value),
    Empty,
    RateLimited,
    Error(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxRow {
    hash: String,
    #[serde(default)]
    input: String,
    from: String,
    #[serde(default)]
    to: String,
    time_stamp: String,
    #[serde(default)]
    method_id: Option<String>,
    #[serde(default)]
    is_error: Option<String>,
}

/// Interpret an explorer JSON envelope
pub fn classify_reply(body: &str) -> Result<ExplorerReply, SourceError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    let message = envelope.message.unwrap_or_default();

    if let Value::String(text) = &envelope.result {
        if text.to_ascii_lowercase().contains("rate limit") {
            return Ok(ExplorerReply::RateLimited);
        }
    }

    match envelope.status.as_deref() {
        Some("1") => Ok(ExplorerReply::Rows(envelope.result)),
        Some("0") if message.starts_with("No transactions found") => Ok(ExplorerReply::Empty),
        Some("0") => Ok(ExplorerReply::Error(match envelope.result {
            Value::String(text) => format!("{}: {}", message, text),
            _ => message,
        })),
        // proxy module replies carry no status
        _ => Ok(ExplorerReply::Rows(envelope.result)),
    }
}

/// Convert `txlist` rows, dropping reverted transactions.
///
/// A row that cannot be read is logged and skipped, the rest of the page is kept.
pub fn parse_tx_list(rows: Value, chain: Chain) -> Result<Vec<ChainTransaction>, SourceError> {
    let rows: Vec<Value> = serde_json::from_value(rows)?;
    let mut transactions = Vec::with_capacity(rows.len());

    for raw in rows {
        let parsed = serde_json::from_value::<TxRow>(raw)
            .map_err(SourceError::from)
            .and_then(|row| parse_tx_row(row, chain));
        match parsed {
            Ok(Some(tx)) => transactions.push(tx),
            Ok(None) => {}
            Err(e) => warn!(%chain, error = %e, "Skipping unreadable explorer row"),
        }
    }
    Ok(transactions)
}

/// `None` for reverted transactions
fn parse_tx_row(row: TxRow, chain: Chain) -> Result<Option<ChainTransaction>, SourceError> {
    if row.is_error.as_deref() == Some("1") {
        return Ok(None);
    }
    let from = row
        .from
        .parse::<Address>()
        .map_err(|e| SourceError::Malformed(format!("from {}: {}", row.from, e)))?;
    let to = if row.to.is_empty() {
        None
    } else {
        Some(
            row.to
                .parse::<Address>()
                .map_err(|e| SourceError::Malformed(format!("to {}: {}", row.to, e)))?,
        )
    };
    let secs: i64 = row
        .time_stamp
        .parse()
        .map_err(|_| SourceError::Malformed(format!("timeStamp {}", row.time_stamp)))?;
    let timestamp = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| SourceError::Malformed(format!("timeStamp {}", secs)))?;

    Ok(Some(ChainTransaction {
        hash: row.hash.to_ascii_lowercase(),
        input: row.input,
        from,
        to,
        timestamp,
        method_selector: row.method_id.filter(|m| !m.is_empty()),
        chain,
    }))
}

/// Client for Etherscan and Gnosisscan
pub struct ExplorerClient {
    client: reqwest::Client,
    endpoints: BTreeMap<Chain, ExplorerEndpoint>,
    retry: RetryPolicy,
}

impl ExplorerClient {
    pub fn new(endpoints: BTreeMap<Chain, ExplorerEndpoint>, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("payout-ledger/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            endpoints,
            retry,
        }
    }

    fn endpoint(&self, chain: Chain) -> Result<&ExplorerEndpoint, SourceError> {
        self.endpoints
            .get(&chain)
            .ok_or_else(|| SourceError::Api(format!("no explorer configured for {}", chain)))
    }

    /// GET with bounded rate-limit retry
    async fn request(
        &self,
        chain: Chain,
        params: &[(&str, String)],
    ) -> Result<ExplorerReply, SourceError> {
        let endpoint = self.endpoint(chain)?;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let response = self
                .client
                .get(&endpoint.base_url)
                .query(params)
                .query(&[("apikey", endpoint.api_key.as_str())])
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            let preview: String = body.chars().take(200).collect();
            debug!(%chain, %status, body = %preview, "Explorer response");

            let reply = if status.as_u16() == 429 {
                ExplorerReply::RateLimited
            } else if !status.is_success() {
                return Err(SourceError::Api(format!("{}: {}", status, body)));
            } else {
                classify_reply(&body)?
            };

            match reply {
                ExplorerReply::RateLimited if attempts <= self.retry.max_retries => {
                    warn!(
                        %chain,
                        attempts,
                        delay_secs = self.retry.delay.as_secs(),
                        "Explorer rate limited, retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                ExplorerReply::RateLimited => return Err(SourceError::RateLimited { attempts }),
                other => return Ok(other),
            }
        }
    }
}

#[async_trait]
impl TransactionHistory for ExplorerClient {
    async fn transactions_for_address(
        &self,
        address: &Address,
        chain: Chain,
        from_block: Option<u64>,
        to_block: Option<u64>,
        selector: Option<&str>,
    ) -> Result<Vec<ChainTransaction>, SourceError> {
        let start = from_block.unwrap_or(self.endpoint(chain)?.start_block);
        let end = to_block.unwrap_or(LATEST_BLOCK);
        let mut transactions = Vec::new();

        for page in 1..=MAX_PAGES {
            let params = [
                ("module", "account".to_string()),
                ("action", "txlist".to_string()),
                ("address", format!("{:#x}", address)),
                ("startblock", start.to_string()),
                ("endblock", end.to_string()),
                ("page", page.to_string()),
                ("offset", PAGE_SIZE.to_string()),
                ("sort", "asc".to_string()),
            ];
            let (rows, returned) = match self.request(chain, &params).await? {
                ExplorerReply::Rows(rows) => {
                    let returned = rows.as_array().map_or(0, Vec::len);
                    (parse_tx_list(rows, chain)?, returned)
                }
                ExplorerReply::Empty => (Vec::new(), 0),
                ExplorerReply::Error(message) => return Err(SourceError::Api(message)),
                ExplorerReply::RateLimited => return Err(SourceError::RateLimited { attempts: 0 }),
            };
            let full_page = returned >= PAGE_SIZE;
            transactions.extend(rows);
            if !full_page {
                break;
            }
        }

        if let Some(selector) = selector {
            transactions.retain(|tx| tx.has_selector(selector));
        }
        info!(
            address = %format!("{:#x}", address),
            %chain,
            count = transactions.len(),
            "Fetched transaction history"
        );
        Ok(transactions)
    }
}

#[async_trait]
impl TransactionLookup for ExplorerClient {
    async fn transaction_input(
        &self,
        hash: &str,
        chain: Chain,
    ) -> Result<Option<String>, SourceError> {
        let params = [
            ("module", "proxy".to_string()),
            ("action", "eth_getTransactionByHash".to_string()),
            ("txhash", hash.to_string()),
        ];
        match self.request(chain, &params).await? {
            ExplorerReply::Rows(Value::Object(tx)) => Ok(tx
                .get("input")
                .and_then(Value::as_str)
                .map(str::to_string)),
            ExplorerReply::Rows(_) | ExplorerReply::Empty => Ok(None),
            ExplorerReply::Error(message) => Err(SourceError::Api(message)),
            ExplorerReply::RateLimited => Err(SourceError::RateLimited { attempts: 0 }),
        }
    }
}

//! Ledger persistence
//!
//! The sink is written to idempotently: callers list what is already stored
//! and insert only new signatures, so an interrupted run can start over.
//!
//! `JsonLedgerStore` keeps one JSON file per collection in a directory:
//! - `ledger.json`            accepted entries
//! - `review-duplicates.json` ambiguous nonce collisions
//! - `non-attributable.json`  entries whose recipient has no identity

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::ledger::LedgerEntry;

const LEDGER_FILE: &str = "ledger.json";
const REVIEW_FILE: &str = "review-duplicates.json";
const NON_ATTRIBUTABLE_FILE: &str = "non-attributable.json";

/// Entry the sink refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub signature: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub failures: Vec<EntryFailure>,
}

#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn list_existing_ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn insert_ledger_entries(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> Result<InsertOutcome, StoreError>;

    /// Side channel for entries a human has to look at
    async fn write_review(&self, entries: &[LedgerEntry]) -> Result<(), StoreError>;

    async fn write_non_attributable(&self, entries: &[LedgerEntry]) -> Result<(), StoreError>;
}

/// Drop entries whose signature is already stored
pub fn filter_new(existing: &[LedgerEntry], entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    let stored: BTreeSet<&str> = existing.iter().map(|e| e.signature.as_str()).collect();
    entries
        .into_iter()
        .filter(|e| !stored.contains(e.signature.as_str()))
        .collect()
}

pub struct JsonLedgerStore {
    dir: PathBuf,
}

impl JsonLedgerStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        info!(path = %dir.display(), "Opened ledger store");
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        let content = serde_json::to_string_pretty(rows)?;
        std::fs::write(&path, content).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), rows = rows.len(), "Wrote store file");
        Ok(())
    }
}

#[async_trait]
impl LedgerSink for JsonLedgerStore {
    async fn list_existing_ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        self.read(LEDGER_FILE)
    }

    async fn insert_ledger_entries(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut stored: Vec<LedgerEntry> = self.read(LEDGER_FILE)?;
        let mut signatures: BTreeSet<String> = stored.iter().map(|e| e.signature.clone()).collect();
        let mut outcome = InsertOutcome::default();

        for entry in entries {
            if entry.token_id.is_none() {
                outcome.failures.push(EntryFailure {
                    signature: entry.signature.clone(),
                    reason: format!("unknown token {}", entry.token),
                });
                continue;
            }
            if !signatures.insert(entry.signature.clone()) {
                outcome.failures.push(EntryFailure {
                    signature: entry.signature.clone(),
                    reason: "signature already stored".to_string(),
                });
                continue;
            }
            stored.push(entry);
            outcome.inserted += 1;
        }

        self.write(LEDGER_FILE, &stored)?;
        Ok(outcome)
    }

    async fn write_review(&self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        self.write(REVIEW_FILE, entries)
    }

    async fn write_non_attributable(&self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        self.write(NON_ATTRIBUTABLE_FILE, entries)
    }
}

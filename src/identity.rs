//! Contributor identity resolution
//!
//! Maps wallet addresses to contributor identities. The JSON store mirrors the
//! `wallets` and `users` tables of the rewards database:
//!
//! ```json
//! {
//!   "wallets": [{ "id": 1, "address": "0x..." }],
//!   "users":   [{ "id": 42, "username": "alice", "wallet_id": 1 }]
//! }
//! ```

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

/// A contributor with a registered wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id, used as the beneficiary id of ledger entries
    pub id: u64,
    pub username: Option<String>,
    pub wallet_address: Address,
}

pub trait IdentityStore: Send + Sync {
    fn wallet_address_to_identity_id(&self, address: &Address) -> Option<u64>;

    fn list_known_identities(&self) -> Vec<Identity>;

    /// Every registered wallet, including wallets with no user attached
    fn known_wallets(&self) -> BTreeSet<Address>;

    fn username_for_wallet(&self, address: &Address) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize)]
struct WalletRow {
    id: u64,
    address: Address,
}

#[derive(Debug, Clone, Deserialize)]
struct UserRow {
    id: u64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    wallet_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    wallets: Vec<WalletRow>,
    #[serde(default)]
    users: Vec<UserRow>,
}

/// In-memory store loaded from a JSON export
#[derive(Debug, Clone, Default)]
pub struct JsonIdentityStore {
    wallets: BTreeSet<Address>,
    identities: BTreeMap<Address, Identity>,
}

impl JsonIdentityStore {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identities from {}", path.display()))?;
        let store = Self::from_json(&content)
            .with_context(|| format!("Failed to parse identities in {}", path.display()))?;
        info!(
            wallets = store.wallets.len(),
            identities = store.identities.len(),
            "Loaded identities"
        );
        Ok(store)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: IdentityFile = serde_json::from_str(content)?;
        let by_wallet_id: BTreeMap<u64, Address> =
            file.wallets.iter().map(|w| (w.id, w.address)).collect();

        let mut identities = BTreeMap::new();
        for user in file.users {
            let Some(address) = user.wallet_id.and_then(|id| by_wallet_id.get(&id)) else {
                continue;
            };
            identities.insert(
                *address,
                Identity {
                    id: user.id,
                    username: user.username,
                    wallet_address: *address,
                },
            );
        }

        Ok(Self {
            wallets: by_wallet_id.into_values().collect(),
            identities,
        })
    }

    /// Build directly from identities, each wallet becomes known
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let identities: BTreeMap<Address, Identity> = identities
            .into_iter()
            .map(|i| (i.wallet_address, i))
            .collect();
        Self {
            wallets: identities.keys().copied().collect(),
            identities,
        }
    }

    /// Register a wallet that has no contributor attached
    pub fn with_wallet(mut self, address: Address) -> Self {
        self.wallets.insert(address);
        self
    }
}

impl IdentityStore for JsonIdentityStore {
    fn wallet_address_to_identity_id(&self, address: &Address) -> Option<u64> {
        self.identities.get(address).map(|i| i.id)
    }

    fn list_known_identities(&self) -> Vec<Identity> {
        self.identities.values().cloned().collect()
    }

    fn known_wallets(&self) -> BTreeSet<Address> {
        self.wallets.clone()
    }

    fn username_for_wallet(&self, address: &Address) -> Option<String> {
        self.identities.get(address).and_then(|i| i.username.clone())
    }
}

//! Payout ledger reconstruction
//!
//! Reward comments, explorer history and a bulk on-chain export each describe
//! Permit2 payouts in their own shape. The reconciliation engine merges them
//! by signature, purges invalidated nonces and folds what survives into
//! per-recipient leaderboards and persistence-ready ledger entries.

pub mod bulk;
pub mod chain;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod github;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod scan;
pub mod store;
pub mod units;

pub use config::Config;
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use model::{AuthorizationRecord, MergedRecord, SignatureKey, Tier};
pub use pipeline::{Collaborators, Pipeline, RunReport};
pub use reconcile::ReconciliationContext;

//! Run controller
//!
//! One [`Pipeline::run`] owns one reconciliation context from the first
//! comment to the last persisted entry. Phases run strictly in sequence:
//! scan, chain history, bulk import, match, rescan, invalidation purge,
//! ledger build, duplicate resolution, persistence.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::bulk::{import_rows, BulkExport};
use crate::chain::{collect_permit_transfers, TransactionHistory, TransactionLookup};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::PipelineError;
use crate::extract::CommentExtractor;
use crate::github::IssueSource;
use crate::identity::IdentityStore;
use crate::ledger::{build_entries, build_leaderboards, tally_claims, Leaderboards, TallyRow};
use crate::metrics::RunMetrics;
use crate::model::{Chain, SignatureKey, Tier};
use crate::reconcile::{
    find_and_remove_invalidated_nonces, match_all, rescan_singles, resolve_duplicates,
    ReconciliationContext,
};
use crate::scan::scan_organizations;
use crate::store::{filter_new, EntryFailure, LedgerSink};

/// External collaborators of a run
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub issues: &'a dyn IssueSource,
    pub history: &'a dyn TransactionHistory,
    /// Used for bulk rows that arrive without calldata
    pub lookup: Option<&'a dyn TransactionLookup>,
    pub identities: &'a dyn IdentityStore,
    pub sink: &'a dyn LedgerSink,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub leaderboards: Leaderboards,
    pub tally: Vec<TallyRow>,
    pub tiers: BTreeMap<Tier, usize>,
    pub invalidated_nonces: Vec<String>,
    pub purged: Vec<SignatureKey>,
    pub rescan_confirmed: usize,
    pub persisted: usize,
    pub persist_failures: Vec<EntryFailure>,
    pub already_stored: usize,
    pub superseded: usize,
    pub held_for_review: usize,
    pub non_attributable: usize,
    #[serde(skip)]
    pub diagnostics: Diagnostics,
    #[serde(skip)]
    pub metrics: String,
    #[serde(skip)]
    pub context: ReconciliationContext,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    extractor: CommentExtractor,
    deps: Collaborators<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, deps: Collaborators<'a>) -> Result<Self> {
        let extractor = CommentExtractor::new(&config.claim_host, &config.bot_authors)
            .context("Failed to build comment extractor")?;
        Ok(Self {
            config,
            extractor,
            deps,
        })
    }

    /// Permit2 itself, the treasury owners and every registered wallet
    fn history_addresses(&self) -> Vec<Address> {
        let mut addresses = vec![self.config.permit2_address];
        let known = self.deps.identities.known_wallets();
        for address in self.config.treasury_owners.iter().chain(known.iter()) {
            if !addresses.contains(address) {
                addresses.push(*address);
            }
        }
        addresses
    }

    pub async fn run(&self, bulk: BulkExport) -> Result<RunReport> {
        let config = self.config;
        let deps = self.deps;
        let metrics = RunMetrics::new()?;
        let mut diagnostics = Diagnostics::new();

        let known = deps.identities.known_wallets();
        let mut ctx = if known.is_empty() {
            ReconciliationContext::new()
        } else {
            ReconciliationContext::new().with_known_recipients(known)
        };

        let skip = |name: &str, archived: bool| archived || config.is_skipped_repo(name);
        let scan = scan_organizations(
            deps.issues,
            &self.extractor,
            deps.identities,
            &config.orgs,
            &skip,
            &mut diagnostics,
        )
        .await;
        metrics.comments_scanned.inc_by(scan.comments_scanned as u64);
        metrics.repositories_failed.inc_by(scan.repositories_failed as u64);
        metrics.authorizations_extracted.inc_by(scan.permits.len() as u64);
        metrics.payment_claims.inc_by(scan.claims.len() as u64);
        for permit in scan.permits {
            ctx.insert_comment(permit);
        }

        let collected = collect_permit_transfers(
            deps.history,
            &self.history_addresses(),
            &Chain::ALL,
            &mut diagnostics,
        )
        .await;
        metrics.chain_records.inc_by(collected.records.len() as u64);
        for record in collected.records {
            ctx.insert_chain(record);
        }

        diagnostics.extend(bulk.rejected);
        let imported = import_rows(bulk.rows, deps.lookup, &mut diagnostics).await;
        metrics.bulk_records.inc_by(imported.len() as u64);
        for record in imported {
            ctx.insert_bulk(record);
        }

        if ctx.comment.is_empty()
            && ctx.chain.is_empty()
            && ctx.bulk.is_empty()
            && scan.claims.is_empty()
        {
            return Err(PipelineError::NoData.into());
        }

        match_all(&mut ctx, config.amount_precedence, &mut diagnostics);
        let rescan =
            rescan_singles(&mut ctx, deps.history, config.nearest_policy, &mut diagnostics).await;
        metrics.rescan_confirmations.inc_by(rescan.confirmed.len() as u64);

        let invalidation = find_and_remove_invalidated_nonces(
            &mut ctx,
            deps.history,
            &config.treasury_owners,
            &Chain::ALL,
            &mut diagnostics,
        )
        .await;
        metrics.invalidated_purged.inc_by(invalidation.removed.len() as u64);

        let leaderboards = build_leaderboards(&ctx);
        let tally = tally_claims(&scan.claims);
        let entries = build_entries(&ctx, deps.identities);
        let resolution = resolve_duplicates(entries.attributable, &mut diagnostics);

        let existing = deps
            .sink
            .list_existing_ledger_entries()
            .await
            .context("Failed to list stored ledger entries")?;
        let candidates = resolution.kept.len();
        let fresh = filter_new(&existing, resolution.kept);
        let already_stored = candidates - fresh.len();
        let outcome = deps
            .sink
            .insert_ledger_entries(fresh)
            .await
            .context("Failed to insert ledger entries")?;
        for failure in &outcome.failures {
            warn!(
                signature = %failure.signature,
                reason = %failure.reason,
                "Ledger entry rejected"
            );
        }
        deps.sink
            .write_review(&resolution.ambiguous)
            .await
            .context("Failed to write review entries")?;
        deps.sink
            .write_non_attributable(&entries.non_attributable)
            .await
            .context("Failed to write non-attributable entries")?;
        metrics.entries_persisted.inc_by(outcome.inserted as u64);

        let tiers = ctx.tier_counts();
        metrics.record_tiers(&tiers);
        metrics.record_diagnostics(&diagnostics);

        info!(
            merged = ctx.merged.len(),
            persisted = outcome.inserted,
            already_stored,
            review = resolution.ambiguous.len(),
            non_attributable = entries.non_attributable.len(),
            diagnostics = diagnostics.len(),
            "Run complete"
        );

        Ok(RunReport {
            leaderboards,
            tally,
            tiers,
            invalidated_nonces: invalidation
                .invalidated
                .iter()
                .map(|i| i.nonce.to_string())
                .collect(),
            purged: invalidation.removed,
            rescan_confirmed: rescan.confirmed.len(),
            persisted: outcome.inserted,
            persist_failures: outcome.failures,
            already_stored,
            superseded: resolution.superseded.len(),
            held_for_review: resolution.ambiguous.len(),
            non_attributable: entries.non_attributable.len(),
            metrics: metrics.render()?,
            diagnostics,
            context: ctx,
        })
    }
}

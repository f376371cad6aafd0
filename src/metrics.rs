//! Per-run prometheus counters
//!
//! Each run owns its own [`Registry`] so repeated runs in one process (tests,
//! library callers) never collide on metric registration.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

use crate::diagnostics::Diagnostics;
use crate::model::Tier;

pub struct RunMetrics {
    registry: Registry,
    pub comments_scanned: IntCounter,
    pub repositories_failed: IntCounter,
    pub authorizations_extracted: IntCounter,
    pub payment_claims: IntCounter,
    pub chain_records: IntCounter,
    pub bulk_records: IntCounter,
    pub merged_records: IntCounterVec,
    pub invalidated_purged: IntCounter,
    pub rescan_confirmations: IntCounter,
    pub entries_persisted: IntCounter,
    pub diagnostics: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("payout_ledger"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace("payout_ledger"), &[label])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl RunMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            comments_scanned: counter(&registry, "comments_scanned_total", "Issue comments read")?,
            repositories_failed: counter(
                &registry,
                "repositories_failed_total",
                "Repositories skipped after a source failure",
            )?,
            authorizations_extracted: counter(
                &registry,
                "comment_authorizations_total",
                "Authorizations decoded from claim links",
            )?,
            payment_claims: counter(
                &registry,
                "payment_claims_total",
                "Text payouts found by claim markers",
            )?,
            chain_records: counter(
                &registry,
                "chain_records_total",
                "Authorizations decoded from explorer history",
            )?,
            bulk_records: counter(
                &registry,
                "bulk_records_total",
                "Authorizations decoded from the bulk export",
            )?,
            merged_records: counter_vec(
                &registry,
                "merged_records_total",
                "Merged records by corroboration tier",
                "tier",
            )?,
            invalidated_purged: counter(
                &registry,
                "invalidated_purged_total",
                "Records purged for an invalidated nonce",
            )?,
            rescan_confirmations: counter(
                &registry,
                "rescan_confirmations_total",
                "Provisional records confirmed by the rescan",
            )?,
            entries_persisted: counter(
                &registry,
                "entries_persisted_total",
                "Ledger entries written to the sink",
            )?,
            diagnostics: counter_vec(
                &registry,
                "diagnostics_total",
                "Diagnostics recorded by kind",
                "kind",
            )?,
            registry,
        })
    }

    pub fn record_tiers(&self, tiers: &BTreeMap<Tier, usize>) {
        for (tier, count) in tiers {
            self.merged_records
                .with_label_values(&[&tier.to_string()])
                .inc_by(*count as u64);
        }
    }

    pub fn record_diagnostics(&self, diagnostics: &Diagnostics) {
        for (kind, count) in diagnostics.counts_by_label() {
            self.diagnostics.with_label_values(&[kind]).inc_by(count as u64);
        }
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostic, DiagnosticKind};

    #[test]
    fn test_render_includes_counters() {
        let metrics = RunMetrics::new().unwrap();
        metrics.comments_scanned.inc_by(12);
        metrics.record_tiers(&BTreeMap::from([(Tier::Double, 3)]));
        let mut diagnostics = Diagnostics::new();
        diagnostics.push(Diagnostic::new(DiagnosticKind::DecodeFailure, "bad"));
        metrics.record_diagnostics(&diagnostics);

        let text = metrics.render().unwrap();
        assert!(text.contains("payout_ledger_comments_scanned_total 12"));
        assert!(text.contains(r#"payout_ledger_merged_records_total{tier="double"} 3"#));
        assert!(text.contains(r#"payout_ledger_diagnostics_total{kind="decode_failure"} 1"#));
    }

    #[test]
    fn test_registries_are_independent() {
        assert!(RunMetrics::new().is_ok());
        assert!(RunMetrics::new().is_ok());
    }
}

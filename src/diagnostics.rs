//! Structured anomaly records
//!
//! Extraction, decoding and reconciliation never abort on a bad record. They
//! push a [`Diagnostic`] instead, so every skipped payout stays auditable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseAnomaly {
    /// Claim link present but no text marker matched
    PermitWithoutMarker,
    /// Single-permit pass attributed a zero or missing payout
    SinglePermitZeroPayment,
    /// Multi-permit pass attributed a zero or missing payout
    MultiPermitZeroPayment,
    /// Multi-permit pass could not pair a payout with a username
    MultiPermitUnattributed,
    UnresolvedUsername,
    /// Claim payload entry is not an ERC-20 permit
    UnsupportedPermitType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "reason")]
pub enum DiagnosticKind {
    Parse(ParseAnomaly),
    DecodeFailure,
    RateLimited,
    /// Source call failed for a reason other than throttling
    SourceFailure,
    UnattributableRecipient,
    AmbiguousDuplicate,
    SourceConflict,
    ZeroAmount,
}

impl DiagnosticKind {
    pub fn label(&self) -> &'static str {
        match self {
            DiagnosticKind::Parse(_) => "parse_anomaly",
            DiagnosticKind::DecodeFailure => "decode_failure",
            DiagnosticKind::RateLimited => "rate_limited",
            DiagnosticKind::SourceFailure => "source_failure",
            DiagnosticKind::UnattributableRecipient => "unattributable_recipient",
            DiagnosticKind::AmbiguousDuplicate => "ambiguous_duplicate",
            DiagnosticKind::SourceConflict => "source_conflict",
            DiagnosticKind::ZeroAmount => "zero_amount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub repo_name: Option<String>,
    pub issue_number: Option<u64>,
    pub detail: String,
    /// Raw comment body or payload kept for manual audit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            repo_name: None,
            issue_number: None,
            detail: detail.into(),
            raw: None,
        }
    }

    pub fn at(mut self, repo_name: &str, issue_number: u64) -> Self {
        self.repo_name = Some(repo_name.to_string());
        self.issue_number = Some(issue_number);
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    /// Failed source call, throttling kept apart from other failures
    pub fn source_error(error: &SourceError, what: impl fmt::Display) -> Self {
        let kind = match error {
            SourceError::RateLimited { .. } => DiagnosticKind::RateLimited,
            _ => DiagnosticKind::SourceFailure,
        };
        Diagnostic::new(kind, format!("{}: {}", what, error))
    }
}

/// Run-wide collector
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    records: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log. Zero amounts are noise and only logged at debug.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        let kind = diagnostic.kind.label();
        let repo = diagnostic.repo_name.as_deref().unwrap_or("-");
        let issue = diagnostic.issue_number.unwrap_or_default();
        match diagnostic.kind {
            DiagnosticKind::ZeroAmount | DiagnosticKind::UnattributableRecipient => {
                debug!(kind, repo, issue, detail = %diagnostic.detail, "Skipped record")
            }
            _ => warn!(kind, repo, issue, detail = %diagnostic.detail, "Anomaly recorded"),
        }
        self.records.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.records.extend(other.records);
    }

    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records.iter().filter(|d| d.kind == kind).count()
    }

    pub fn counts_by_label(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.kind.label()).or_insert(0) += 1;
        }
        counts
    }
}

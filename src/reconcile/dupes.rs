use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::ledger::LedgerEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateResolution {
    pub kept: Vec<LedgerEntry>,
    /// Lost to a clear winner
    pub superseded: Vec<LedgerEntry>,
    /// No clear winner, held back for manual review
    pub ambiguous: Vec<LedgerEntry>,
}

/// Settle nonce collisions within each repository.
///
/// A group keeps one entry only when exactly one member is confirmed on chain
/// and strictly larger than every sibling. Otherwise the whole group is held
/// back. Entries without a repository share one bucket.
pub fn resolve_duplicates(
    entries: Vec<LedgerEntry>,
    diagnostics: &mut Diagnostics,
) -> DuplicateResolution {
    let mut groups: BTreeMap<(Option<String>, String), Vec<LedgerEntry>> = BTreeMap::new();
    let mut order = Vec::new();
    for entry in entries {
        let key = (entry.repo_name.clone(), entry.nonce.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(entry);
    }

    let mut resolution = DuplicateResolution::default();
    for key in order {
        let Some(mut group) = groups.remove(&key) else {
            continue;
        };
        if group.len() == 1 {
            resolution.kept.append(&mut group);
            continue;
        }

        match clear_winner(&group) {
            Some(index) => {
                let winner = group.remove(index);
                info!(
                    repo = key.0.as_deref().unwrap_or("-"),
                    nonce = %key.1,
                    winner = %winner.signature,
                    superseded = group.len(),
                    "Resolved duplicate nonce"
                );
                resolution.kept.push(winner);
                resolution.superseded.append(&mut group);
            }
            None => {
                warn!(
                    repo = key.0.as_deref().unwrap_or("-"),
                    nonce = %key.1,
                    entries = group.len(),
                    "Ambiguous duplicate nonce held for review"
                );
                let mut diagnostic = Diagnostic::new(
                    DiagnosticKind::AmbiguousDuplicate,
                    format!("nonce {} appears {} times", key.1, group.len()),
                );
                diagnostic.repo_name = key.0.clone();
                diagnostics.push(diagnostic);
                resolution.ambiguous.append(&mut group);
            }
        }
    }
    resolution
}

fn clear_winner(group: &[LedgerEntry]) -> Option<usize> {
    group.iter().enumerate().find_map(|(i, candidate)| {
        candidate.transaction_hash.as_ref()?;
        let amount = candidate.amount_value()?;
        let beats_all = group
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .all(|(_, other)| other.amount_value().is_some_and(|a| amount > a));
        beats_all.then_some(i)
    })
}

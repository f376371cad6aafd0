use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use super::{AmountPrecedence, ReconciliationContext};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::model::{
    address_key, AuthorizationRecord, CommentPermit, MergedRecord, SignatureKey, Tier,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub merged: usize,
    pub zero_amount: usize,
    pub unattributable: usize,
    pub invalidated: usize,
    pub tiers: BTreeMap<Tier, usize>,
}

/// Build one merged record with explicit per-field precedence.
///
/// * amount: chain → bulk (or bulk → chain) → comment
/// * recipient, owner, nonce, token, deadline, network: chain → bulk → comment
/// * transaction hash and block time: chain → bulk
/// * issue context: comment only
///
/// Returns `None` when no source holds the signature.
pub fn merge_record(
    signature: &SignatureKey,
    comment: Option<&CommentPermit>,
    chain: Option<&AuthorizationRecord>,
    bulk: Option<&AuthorizationRecord>,
    precedence: AmountPrecedence,
    diagnostics: &mut Diagnostics,
) -> Option<MergedRecord> {
    let from_comment = comment.map(|c| &c.authorization);
    let structural = chain.or(bulk).or(from_comment)?;
    let on_chain = match precedence {
        AmountPrecedence::ChainFirst => chain.or(bulk),
        AmountPrecedence::BulkFirst => bulk.or(chain),
    };

    if let (Some(c), Some(b)) = (chain, bulk) {
        if c.amount != b.amount {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::SourceConflict,
                format!(
                    "{}: chain amount {} vs bulk amount {} ({:?} wins)",
                    signature, c.amount, b.amount, precedence
                ),
            ));
        }
        if c.recipient != b.recipient {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::SourceConflict,
                format!(
                    "{}: chain recipient {} vs bulk recipient {}",
                    signature,
                    address_key(&c.recipient),
                    address_key(&b.recipient)
                ),
            ));
        }
    }

    let amount = on_chain.or(from_comment).map(|r| r.amount).unwrap_or_default();
    let transaction_hash = chain
        .and_then(|r| r.transaction_hash.clone())
        .or_else(|| bulk.and_then(|r| r.transaction_hash.clone()));
    let block_timestamp = chain
        .and_then(|r| r.block_timestamp)
        .or_else(|| bulk.and_then(|r| r.block_timestamp));

    Some(MergedRecord {
        authorization: AuthorizationRecord {
            owner: structural.owner,
            nonce: structural.nonce,
            deadline: structural.deadline,
            token: structural.token,
            amount,
            recipient: structural.recipient,
            signature: signature.clone(),
            network_id: structural.network_id,
            transaction_hash,
            block_timestamp,
        },
        context: comment.map(|c| c.context.clone()),
    })
}

/// Merge every signature of the three source maps.
///
/// Derived state is rebuilt from scratch, so running this twice yields the
/// same context. Confirmations found by an earlier rescan are re-applied.
pub fn match_all(
    ctx: &mut ReconciliationContext,
    precedence: AmountPrecedence,
    diagnostics: &mut Diagnostics,
) -> MatchSummary {
    ctx.merged.clear();
    ctx.nonce_index.clear();
    ctx.by_recipient.clear();

    let signatures: BTreeSet<SignatureKey> = ctx
        .comment
        .keys()
        .chain(ctx.chain.keys())
        .chain(ctx.bulk.keys())
        .cloned()
        .collect();

    let mut summary = MatchSummary::default();
    for sig in &signatures {
        let Some(mut record) = merge_record(
            sig,
            ctx.comment.get(sig),
            ctx.chain.get(sig),
            ctx.bulk.get(sig),
            precedence,
            diagnostics,
        ) else {
            continue;
        };

        if ctx.invalidated.contains(&record.authorization.nonce) {
            summary.invalidated += 1;
            continue;
        }
        if record.authorization.amount.is_zero() {
            summary.zero_amount += 1;
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::ZeroAmount,
                format!("{} has no amount", sig),
            ));
            continue;
        }
        if !ctx.is_known_recipient(&record.authorization.recipient) {
            summary.unattributable += 1;
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::UnattributableRecipient,
                format!(
                    "{} pays unknown recipient {}",
                    sig,
                    address_key(&record.authorization.recipient)
                ),
            ));
            continue;
        }

        if record.authorization.transaction_hash.is_none() {
            if let Some(confirmation) = ctx.confirmations.get(sig) {
                record.authorization.transaction_hash = Some(confirmation.transaction_hash.clone());
                record.authorization.block_timestamp = Some(confirmation.block_timestamp);
            }
        }

        ctx.index(record);
        summary.merged += 1;
    }

    summary.tiers = ctx.tier_counts();
    info!(
        merged = summary.merged,
        zero_amount = summary.zero_amount,
        unattributable = summary.unattributable,
        singles = summary.tiers.get(&Tier::Single).copied().unwrap_or_default(),
        doubles = summary.tiers.get(&Tier::Double).copied().unwrap_or_default(),
        triples = summary.tiers.get(&Tier::Triple).copied().unwrap_or_default(),
        "Matched authorization sources"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use crate::reconcile::fixtures::*;
    use alloy_primitives::U256;

    #[test]
    fn test_comment_and_chain_make_a_double() {
        let mut ctx = ReconciliationContext::new();
        ctx.insert_comment(comment("0xAA", 1, 17, ALICE, 1_000));
        ctx.insert_chain(on_chain("0xaa", 1, 17, ALICE, "0xtx", 2_000));

        let mut diagnostics = Diagnostics::new();
        let summary = match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut diagnostics);

        let sig = SignatureKey::new("0xaa");
        assert_eq!(summary.merged, 1);
        assert_eq!(ctx.tier_of(&sig), Some(Tier::Double));
        let record = &ctx.merged[&sig];
        assert_eq!(record.authorization.block_timestamp, Some(at(2_000)));
        assert_eq!(record.authorization.transaction_hash.as_deref(), Some("0xtx"));
        assert_eq!(record.comment_timestamp(), Some(at(1_000)));
        assert_eq!(ctx.sources_of(&sig), vec![Source::Comment, Source::Chain]);
    }

    #[test]
    fn test_all_three_sources_make_a_triple() {
        let mut ctx = ReconciliationContext::new();
        ctx.insert_comment(comment("0x01", 1, 17, ALICE, 1_000));
        ctx.insert_bulk(on_chain("0x01", 1, 17, ALICE, "0xtx", 2_000));
        ctx.insert_chain(on_chain("0x01", 1, 17, ALICE, "0xtx", 2_000));
        match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut Diagnostics::new());
        assert_eq!(ctx.triples().len(), 1);
    }

    #[test]
    fn test_amount_precedence_and_conflict_diagnostic() {
        let chain = on_chain("0x01", 1, 10, ALICE, "0xtx", 2_000);
        let bulk = on_chain("0x01", 1, 12, ALICE, "0xtx", 2_000);
        let sig = SignatureKey::new("0x01");

        let mut diagnostics = Diagnostics::new();
        let chain_first = merge_record(
            &sig,
            None,
            Some(&chain),
            Some(&bulk),
            AmountPrecedence::ChainFirst,
            &mut diagnostics,
        )
        .unwrap();
        assert_eq!(chain_first.authorization.amount, U256::from(10u64));
        assert_eq!(diagnostics.count(DiagnosticKind::SourceConflict), 1);

        let bulk_first = merge_record(
            &sig,
            None,
            Some(&chain),
            Some(&bulk),
            AmountPrecedence::BulkFirst,
            &mut diagnostics,
        )
        .unwrap();
        assert_eq!(bulk_first.authorization.amount, U256::from(12u64));
    }

    #[test]
    fn test_comment_amount_is_the_fallback() {
        let c = comment("0x01", 1, 17, ALICE, 1_000);
        let sig = SignatureKey::new("0x01");
        let merged = merge_record(
            &sig,
            Some(&c),
            None,
            None,
            AmountPrecedence::ChainFirst,
            &mut Diagnostics::new(),
        )
        .unwrap();
        assert_eq!(merged.authorization.amount, U256::from(17u64));
        assert_eq!(merged.authorization.transaction_hash, None);
        assert!(merged.context.is_some());
    }

    #[test]
    fn test_zero_amount_and_unknown_recipient_are_skipped() {
        let mut ctx = ReconciliationContext::new().with_known_recipients([ALICE].into());
        ctx.insert_comment(comment("0x01", 1, 0, ALICE, 1_000));
        ctx.insert_comment(comment("0x02", 2, 5, BOB, 1_000));
        ctx.insert_comment(comment("0x03", 3, 5, ALICE, 1_000));

        let mut diagnostics = Diagnostics::new();
        let summary = match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut diagnostics);

        assert_eq!(summary.merged, 1);
        assert_eq!(summary.zero_amount, 1);
        assert_eq!(summary.unattributable, 1);
        assert_eq!(diagnostics.count(DiagnosticKind::UnattributableRecipient), 1);
        assert!(ctx.merged.contains_key(&SignatureKey::new("0x03")));
    }

    #[test]
    fn test_match_all_is_idempotent() {
        let mut ctx = ReconciliationContext::new();
        ctx.insert_comment(comment("0x01", 1, 5, ALICE, 1_000));
        ctx.insert_chain(on_chain("0x01", 1, 5, ALICE, "0xa", 2_000));
        ctx.insert_bulk(on_chain("0x02", 2, 7, BOB, "0xb", 3_000));
        ctx.insert_comment(comment("0x03", 2, 9, BOB, 1_500));

        match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut Diagnostics::new());
        let first = ctx.clone();
        match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut Diagnostics::new());

        assert_eq!(ctx, first);
        assert_eq!(ctx.nonce_index[&U256::from(2u64)].len(), 2);
        assert_eq!(ctx.by_recipient[&BOB].len(), 2);
    }

    #[test]
    fn test_tier_never_exceeds_source_count() {
        let mut ctx = ReconciliationContext::new();
        ctx.insert_comment(comment("0x01", 1, 5, ALICE, 1_000));
        ctx.insert_bulk(on_chain("0x01", 1, 5, ALICE, "0xa", 2_000));
        ctx.insert_chain(on_chain("0x02", 2, 5, ALICE, "0xb", 2_000));
        match_all(&mut ctx, AmountPrecedence::ChainFirst, &mut Diagnostics::new());

        for sig in ctx.merged.keys() {
            let count = ctx.sources_of(sig).len();
            let tier = ctx.tier_of(sig).unwrap();
            assert!(tier <= Tier::from_count(count).unwrap());
        }
    }
}

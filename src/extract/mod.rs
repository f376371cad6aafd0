//! Comment payout extraction
//!
//! Turns a bot reward comment into signature-keyed authorizations (from claim
//! links) and username-keyed payment claims (from text markers). Nothing here
//! returns an error for a bad comment: anomalies become diagnostics.

pub mod claim_link;
pub mod markers;
pub mod payload;

use alloy_primitives::U256;
use regex::Regex;
use tracing::debug;

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, ParseAnomaly};
use crate::identity::IdentityStore;
use crate::model::{CommentPermit, IssueComment, IssueContext, PaymentClaim, RecipientType};
use crate::units::parse_units;
use markers::{Marker, MarkerPatterns, Payout};

const CREATOR_REWARD: &str = "Task Creator Reward";
const CONVERSATION_REWARDS: &str = "Conversation Rewards";

/// Everything recovered from one comment
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub permits: Vec<CommentPermit>,
    pub claims: Vec<PaymentClaim>,
    pub diagnostics: Diagnostics,
}

impl Extraction {
    fn is_empty(&self) -> bool {
        self.permits.is_empty() && self.claims.is_empty() && self.diagnostics.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CommentExtractor {
    claim_host: String,
    bot_authors: Vec<String>,
    link: Regex,
    patterns: MarkerPatterns,
}

impl CommentExtractor {
    pub fn new(claim_host: &str, bot_authors: &[String]) -> Result<Self, regex::Error> {
        let host = claim_host.trim_end_matches('/');
        let link = Regex::new(&format!(r"{}/?\?claim=[^\s)]*", regex::escape(host)))?;
        Ok(Self {
            claim_host: host.to_string(),
            bot_authors: bot_authors.iter().map(|a| a.to_ascii_lowercase()).collect(),
            link,
            patterns: MarkerPatterns::new()?,
        })
    }

    pub fn is_eligible_author(&self, author: &str) -> bool {
        self.bot_authors.contains(&author.to_ascii_lowercase())
    }

    /// Extract payouts from one comment.
    ///
    /// Returns `None` for comments by non-bot authors and comments with no
    /// recognizable payout.
    pub fn extract(
        &self,
        comment: &IssueComment,
        identities: &dyn IdentityStore,
    ) -> Option<Extraction> {
        if !self.is_eligible_author(&comment.author) {
            return None;
        }

        let mut out = Extraction::default();
        let links = self.claim_links(&comment.body);
        for link in &links {
            self.extract_link(comment, link, identities, &mut out);
        }

        let marker = self.patterns.find_marker(&comment.body);
        match &marker {
            Some(Marker::Bold(payout)) | Some(Marker::Bare(payout)) => {
                self.marker_claim(comment, payout, &mut out)
            }
            Some(Marker::Alt(pairs)) => {
                for (user, payout) in pairs {
                    match user {
                        Some(user) => push_claim(comment, user, payout, &mut out),
                        None => out.diagnostics.push(
                            anomaly(
                                comment,
                                ParseAnomaly::UnresolvedUsername,
                                format!(
                                    "no @username follows {} {}",
                                    payout.amount, payout.currency
                                ),
                            )
                            .with_raw(comment.body.clone()),
                        ),
                    }
                }
            }
            None if !links.is_empty() => out.diagnostics.push(anomaly(
                comment,
                ParseAnomaly::PermitWithoutMarker,
                "no-match-but-permit-found",
            )),
            None => {}
        }

        if links.len() > 1 {
            if !matches!(marker, Some(Marker::Alt(_))) {
                self.attribute_mentions(comment, &mut out);
            }
            self.attribute_multi_permit(comment, &mut out);
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn claim_links(&self, body: &str) -> Vec<String> {
        let mut links: Vec<String> = Vec::new();
        for m in self.link.find_iter(body) {
            let link = m.as_str().to_string();
            if !links.contains(&link) {
                links.push(link);
            }
        }
        links
    }

    fn extract_link(
        &self,
        comment: &IssueComment,
        link: &str,
        identities: &dyn IdentityStore,
        out: &mut Extraction,
    ) {
        let decode_failure = |detail: String| {
            Diagnostic::new(DiagnosticKind::DecodeFailure, detail)
                .at(&comment.repo_name, comment.issue_number)
                .with_raw(link.to_string())
        };

        let sanitized = match claim_link::claim_parameter(link)
            .and_then(claim_link::sanitize_payload)
        {
            Ok(s) => s,
            Err(e) => {
                out.diagnostics.push(decode_failure(format!("claim link: {}", e)));
                return;
            }
        };
        let bytes = match claim_link::decode_payload(&sanitized) {
            Ok(b) => b,
            Err(e) => {
                out.diagnostics.push(decode_failure(format!("claim base64: {}", e)));
                return;
            }
        };
        let parsed = match payload::parse_claim_payload(&bytes) {
            Ok(p) => p,
            Err(e) => {
                out.diagnostics.push(decode_failure(format!("claim payload: {}", e)));
                return;
            }
        };
        for (position, e) in &parsed.rejected {
            out.diagnostics
                .push(decode_failure(format!("claim entry {}: {}", position, e)));
        }

        let claim_url = format!("{}/?claim={}", self.claim_host, sanitized);
        for entry in parsed.entries {
            if !entry.is_erc20() {
                out.diagnostics.push(anomaly(
                    comment,
                    ParseAnomaly::UnsupportedPermitType,
                    format!("skipping {} entry", entry.kind().unwrap_or("unknown")),
                ));
                continue;
            }
            let authorization = match entry.to_authorization() {
                Ok(a) => a,
                Err(e) => {
                    out.diagnostics.push(decode_failure(format!("claim entry: {}", e)));
                    continue;
                }
            };
            debug!(
                repo = %comment.repo_name,
                issue = comment.issue_number,
                signature = %authorization.signature,
                "Claim link authorization"
            );
            let context = IssueContext {
                repo_name: comment.repo_name.clone(),
                issue_number: comment.issue_number,
                issue_creator: comment.creator.clone(),
                issue_assignee: comment.assignee.clone(),
                comment_timestamp: comment.created_at,
                claim_url: claim_url.clone(),
                beneficiary_username: identities.username_for_wallet(&authorization.recipient),
            };
            out.permits.push(CommentPermit {
                authorization,
                context,
            });
        }
    }

    /// Bold or bare marker: type from the reward heading, payee from the issue
    fn marker_claim(&self, comment: &IssueComment, payout: &Payout, out: &mut Extraction) {
        let recipient_type = if comment.body.contains(CREATOR_REWARD) {
            RecipientType::Creator
        } else if comment.body.contains(CONVERSATION_REWARDS) {
            RecipientType::Conversation
        } else {
            RecipientType::Assignee
        };

        let payee = match recipient_type {
            RecipientType::Assignee => comment.assignee.clone(),
            RecipientType::Creator => Some(comment.creator.clone()),
            RecipientType::Conversation => self.patterns.mentions(&comment.body).into_iter().next(),
        };
        if payee.is_none() {
            out.diagnostics.push(
                anomaly(
                    comment,
                    ParseAnomaly::UnresolvedUsername,
                    format!("no payee for {} {}", payout.amount, payout.currency),
                )
                .with_raw(comment.body.clone()),
            );
        }

        match parse_units(&payout.amount) {
            Ok(amount) => out.claims.push(PaymentClaim {
                repo_name: comment.repo_name.clone(),
                issue_number: comment.issue_number,
                issue_url: comment.issue_url.clone(),
                amount,
                currency: payout.currency,
                payee,
                recipient_type,
            }),
            Err(e) => out.diagnostics.push(
                Diagnostic::new(DiagnosticKind::DecodeFailure, e.to_string())
                    .at(&comment.repo_name, comment.issue_number),
            ),
        }
    }

    /// Pair each distinct `@user` mention with the payout at the same position
    fn attribute_mentions(&self, comment: &IssueComment, out: &mut Extraction) {
        let payouts = self.patterns.payouts(&comment.body);
        for (i, user) in self.patterns.mentions(&comment.body).iter().enumerate() {
            attribute(
                comment,
                user,
                payouts.get(i),
                ParseAnomaly::SinglePermitZeroPayment,
                out,
            );
        }
    }

    /// When payouts outnumber mentioned users, fall back to `[ **user:` markers
    fn attribute_multi_permit(&self, comment: &IssueComment, out: &mut Extraction) {
        let payouts = self.patterns.payouts(&comment.body);
        let mentioned = self.patterns.mentions(&comment.body);
        if payouts.len() <= mentioned.len() {
            return;
        }

        let users = self.patterns.multi_permit_users(&comment.body);
        for (i, payout) in payouts.iter().enumerate() {
            match users.get(i) {
                Some(user) => attribute(
                    comment,
                    user,
                    Some(payout),
                    ParseAnomaly::MultiPermitZeroPayment,
                    out,
                ),
                None => out.diagnostics.push(
                    anomaly(
                        comment,
                        ParseAnomaly::MultiPermitUnattributed,
                        format!("multi-permit-user-debug: {} {}", payout.amount, payout.currency),
                    )
                    .with_raw(comment.body.clone()),
                ),
            }
        }
    }
}

fn attribute(
    comment: &IssueComment,
    user: &str,
    payout: Option<&Payout>,
    zero_kind: ParseAnomaly,
    out: &mut Extraction,
) {
    let amount = payout.and_then(|p| parse_units(&p.amount).ok());
    match (payout, amount) {
        (Some(payout), Some(amount)) if !amount.is_zero() => {
            push_claim_amount(comment, user, payout, amount, out)
        }
        _ => out.diagnostics.push(
            anomaly(comment, zero_kind, format!("no payout attributable to {}", user))
                .with_raw(comment.body.clone()),
        ),
    }
}

fn push_claim(comment: &IssueComment, user: &str, payout: &Payout, out: &mut Extraction) {
    match parse_units(&payout.amount) {
        Ok(amount) => push_claim_amount(comment, user, payout, amount, out),
        Err(e) => out.diagnostics.push(
            Diagnostic::new(DiagnosticKind::DecodeFailure, e.to_string())
                .at(&comment.repo_name, comment.issue_number),
        ),
    }
}

fn push_claim_amount(
    comment: &IssueComment,
    user: &str,
    payout: &Payout,
    amount: U256,
    out: &mut Extraction,
) {
    out.claims.push(PaymentClaim {
        repo_name: comment.repo_name.clone(),
        issue_number: comment.issue_number,
        issue_url: comment.issue_url.clone(),
        amount,
        currency: payout.currency,
        payee: Some(user.to_string()),
        recipient_type: RecipientType::classify(
            user,
            comment.assignee.as_deref(),
            &comment.creator,
        ),
    });
}

fn anomaly(comment: &IssueComment, kind: ParseAnomaly, detail: impl Into<String>) -> Diagnostic {
    Diagnostic::new(DiagnosticKind::Parse(kind), detail)
        .at(&comment.repo_name, comment.issue_number)
}

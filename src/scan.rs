//! Comment scanner
//!
//! Walks every configured organization and repository one at a time and runs
//! the extractor over each comment. A repository that fails is skipped with a
//! diagnostic; the scan itself never aborts.

use tracing::{info, warn};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::extract::CommentExtractor;
use crate::github::{list_issue_comments, IssueSource};
use crate::identity::IdentityStore;
use crate::model::{CommentPermit, PaymentClaim};

#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub permits: Vec<CommentPermit>,
    pub claims: Vec<PaymentClaim>,
    pub repositories_scanned: usize,
    pub repositories_failed: usize,
    pub comments_scanned: usize,
}

impl ScanOutput {
    pub fn has_data(&self) -> bool {
        !self.permits.is_empty() || !self.claims.is_empty()
    }
}

/// `skip` receives each repository name and its archived flag
pub async fn scan_organizations(
    source: &dyn IssueSource,
    extractor: &CommentExtractor,
    identities: &dyn IdentityStore,
    orgs: &[String],
    skip: &(dyn Fn(&str, bool) -> bool + Sync),
    diagnostics: &mut Diagnostics,
) -> ScanOutput {
    let mut output = ScanOutput::default();

    for org in orgs {
        let repositories = match source.list_public_repositories(org).await {
            Ok(repos) => repos,
            Err(e) => {
                warn!(org = %org, error = %e, "Failed to list repositories");
                diagnostics.push(Diagnostic::source_error(&e, format!("repositories of {}", org)));
                continue;
            }
        };
        info!(org = %org, repositories = repositories.len(), "Scanning organization");

        for repo in repositories {
            if skip(&repo.name, repo.archived) {
                info!(repo = %repo.name, archived = repo.archived, "Skipping repository");
                continue;
            }
            let comments = match list_issue_comments(source, org, &repo.name).await {
                Ok(comments) => comments,
                Err(e) => {
                    output.repositories_failed += 1;
                    diagnostics.push(
                        Diagnostic::source_error(&e, format!("comments of {}/{}", org, repo.name))
                            .with_raw(repo.name.clone()),
                    );
                    continue;
                }
            };

            output.repositories_scanned += 1;
            output.comments_scanned += comments.len();
            let before = (output.permits.len(), output.claims.len());
            for comment in &comments {
                let Some(extraction) = extractor.extract(comment, identities) else {
                    continue;
                };
                output.permits.extend(extraction.permits);
                output.claims.extend(extraction.claims);
                diagnostics.extend(extraction.diagnostics);
            }
            info!(
                repo = %repo.name,
                comments = comments.len(),
                permits = output.permits.len() - before.0,
                claims = output.claims.len() - before.1,
                "Scanned repository"
            );
        }
    }

    info!(
        repositories = output.repositories_scanned,
        failed = output.repositories_failed,
        comments = output.comments_scanned,
        permits = output.permits.len(),
        claims = output.claims.len(),
        "Comment scan complete"
    );
    output
}

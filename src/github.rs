//! GitHub issue comment source (GraphQL)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::RetryPolicy;
use crate::error::SourceError;
use crate::model::IssueComment;

const GRAPHQL_URL: &str = "https://api.github.com/graphql";
/// Never wait longer than this for a rate limit window to reset
const MAX_RESET_WAIT: Duration = Duration::from_secs(15 * 60);

const REPOSITORIES_QUERY: &str = r#"
query($org: String!, $cursor: String) {
  organization(login: $org) {
    repositories(first: 100, after: $cursor, privacy: PUBLIC) {
      pageInfo { hasNextPage endCursor }
      nodes { name isArchived }
    }
  }
}"#;

const ISSUE_COMMENTS_QUERY: &str = r#"
query($org: String!, $repo: String!, $cursor: String) {
  repository(owner: $org, name: $repo) {
    issues(first: 50, after: $cursor, orderBy: {field: CREATED_AT, direction: ASC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        number
        url
        author { login }
        assignees(first: 1) { nodes { login } }
        comments(first: 100) {
          nodes { body createdAt author { login } }
        }
      }
    }
  }
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub archived: bool,
}

/// One page of comments plus the cursor to resume from
#[derive(Debug, Clone, Default)]
pub struct IssueCommentPage {
    pub comments: Vec<IssueComment>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn list_public_repositories(&self, org: &str) -> Result<Vec<Repository>, SourceError>;

    /// Comments of one page of issues. Restart from `cursor` to resume.
    async fn issue_comments_page(
        &self,
        org: &str,
        repo: &str,
        cursor: Option<String>,
    ) -> Result<IssueCommentPage, SourceError>;
}

/// Drain every page of a repository's issue comments
pub async fn list_issue_comments(
    source: &dyn IssueSource,
    org: &str,
    repo: &str,
) -> Result<Vec<IssueComment>, SourceError> {
    let mut comments = Vec::new();
    let mut cursor = None;
    loop {
        let page = source.issue_comments_page(org, repo, cursor).await?;
        comments.extend(page.comments);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(comments)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

impl PageInfo {
    fn next(self) -> Option<String> {
        if self.has_next_page {
            self.end_cursor
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoNode {
    name: String,
    is_archived: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoConnection {
    page_info: PageInfo,
    nodes: Vec<RepoNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentNode {
    body: String,
    created_at: DateTime<Utc>,
    author: Option<Login>,
}

#[derive(Debug, Deserialize)]
struct IssueNode {
    number: u64,
    url: String,
    author: Option<Login>,
    assignees: Nodes<Login>,
    comments: Nodes<CommentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueConnection {
    page_info: PageInfo,
    nodes: Vec<IssueNode>,
}

/// Parse the `organization.repositories` payload
pub fn parse_repositories(data: &Value) -> Result<(Vec<Repository>, Option<String>), SourceError> {
    let connection = data
        .pointer("/organization/repositories")
        .cloned()
        .ok_or_else(|| SourceError::Malformed("missing organization.repositories".to_string()))?;
    let connection: RepoConnection = serde_json::from_value(connection)?;
    let repos = connection
        .nodes
        .into_iter()
        .map(|n| Repository {
            name: n.name,
            archived: n.is_archived,
        })
        .collect();
    Ok((repos, connection.page_info.next()))
}

/// Parse the `repository.issues` payload into flat comments
pub fn parse_issue_comments(data: &Value, repo: &str) -> Result<IssueCommentPage, SourceError> {
    let connection = data
        .pointer("/repository/issues")
        .cloned()
        .ok_or_else(|| SourceError::Malformed("missing repository.issues".to_string()))?;
    let connection: IssueConnection = serde_json::from_value(connection)?;

    let mut comments = Vec::new();
    for issue in connection.nodes {
        let creator = issue.author.map(|a| a.login).unwrap_or_default();
        let assignee = issue.assignees.nodes.into_iter().next().map(|a| a.login);
        for comment in issue.comments.nodes {
            comments.push(IssueComment {
                repo_name: repo.to_string(),
                issue_number: issue.number,
                issue_url: issue.url.clone(),
                author: comment.author.map(|a| a.login).unwrap_or_default(),
                creator: creator.clone(),
                assignee: assignee.clone(),
                body: comment.body,
                created_at: comment.created_at,
            });
        }
    }
    Ok(IssueCommentPage {
        comments,
        next_cursor: connection.page_info.next(),
    })
}

fn is_rate_limited(body: &Value) -> bool {
    body.get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| {
            errors
                .iter()
                .any(|e| e.get("type").and_then(Value::as_str) == Some("RATE_LIMITED"))
        })
}

/// GraphQL client authenticated with a personal token
pub struct GithubClient {
    client: reqwest::Client,
    token: String,
    url: String,
    retry: RetryPolicy,
}

impl GithubClient {
    pub fn new(token: String, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("payout-ledger/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            token,
            url: GRAPHQL_URL.to_string(),
            retry,
        }
    }

    /// Wait until the reported reset time, falling back to the fixed delay
    fn reset_wait(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .map(|reset| {
                let secs = (reset - Utc::now().timestamp()).max(1) as u64;
                Duration::from_secs(secs).min(MAX_RESET_WAIT)
            })
            .unwrap_or(self.retry.delay)
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, SourceError> {
        let payload = json!({ "query": query, "variables": variables });
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let response = self
                .client
                .post(&self.url)
                .bearer_auth(&self.token)
                .json(&payload)
                .send()
                .await?;

            let status = response.status();
            let wait = self.reset_wait(response.headers());
            let body: Value = response.json().await?;

            let limited = matches!(status.as_u16(), 403 | 429) || is_rate_limited(&body);
            if limited {
                if attempts > self.retry.max_retries {
                    return Err(SourceError::RateLimited { attempts });
                }
                warn!(
                    attempts,
                    wait_secs = wait.as_secs(),
                    "GitHub rate limited, waiting for reset"
                );
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                return Err(SourceError::Api(format!("{}: {}", status, body)));
            }
            if let Some(errors) = body.get("errors") {
                return Err(SourceError::Api(errors.to_string()));
            }
            return body
                .get("data")
                .cloned()
                .ok_or_else(|| SourceError::Malformed("response without data".to_string()));
        }
    }
}

#[async_trait]
impl IssueSource for GithubClient {
    async fn list_public_repositories(&self, org: &str) -> Result<Vec<Repository>, SourceError> {
        let mut repositories = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let data = self
                .graphql(REPOSITORIES_QUERY, json!({ "org": org, "cursor": cursor }))
                .await?;
            let (page, next) = parse_repositories(&data)?;
            repositories.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(org, count = repositories.len(), "Listed repositories");
        Ok(repositories)
    }

    async fn issue_comments_page(
        &self,
        org: &str,
        repo: &str,
        cursor: Option<String>,
    ) -> Result<IssueCommentPage, SourceError> {
        let data = self
            .graphql(
                ISSUE_COMMENTS_QUERY,
                json!({ "org": org, "repo": repo, "cursor": cursor }),
            )
            .await?;
        let page = parse_issue_comments(&data, repo)?;
        debug!(org, repo, comments = page.comments.len(), "Fetched issue comment page");
        Ok(page)
    }
}

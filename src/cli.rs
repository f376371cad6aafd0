use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::bulk::{load_bulk_export, BulkExport};
use crate::chain::{decode_permit_calldata, ExplorerClient, TransactionLookup};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::extract::CommentExtractor;
use crate::github::GithubClient;
use crate::identity::JsonIdentityStore;
use crate::ledger::{tally_claims, Leaderboards, TallyRow};
use crate::model::{Chain, IssueComment};
use crate::pipeline::{Collaborators, Pipeline};
use crate::reconcile::find_invalidated_nonces;
use crate::scan::scan_organizations;
use crate::store::JsonLedgerStore;
use crate::units::format_units;

#[derive(Parser)]
#[command(name = "payout-ledger")]
#[command(
    about = "Reconstruct contributor payouts from reward comments and Permit2 transactions",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Overrides OUTPUT_DIR
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Overrides IDENTITIES_PATH
    #[arg(long, global = true)]
    pub identities: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Full reconciliation and ledger persistence
    Run {
        /// Overrides BULK_EXPORT_PATH
        #[arg(long)]
        bulk: Option<PathBuf>,

        /// Overrides ORGS
        #[arg(long, value_delimiter = ',')]
        orgs: Vec<String>,
    },

    /// Scan reward comments only and print the comment tally
    Scan {
        #[arg(long, value_delimiter = ',')]
        orgs: Vec<String>,
    },

    /// Decode a permitTransferFrom call from calldata or a transaction hash
    Decode {
        #[arg(long, conflicts_with = "tx")]
        input: Option<String>,

        #[arg(long)]
        tx: Option<String>,

        /// Chain id used with --tx
        #[arg(long, default_value_t = 100)]
        chain: u64,
    },

    /// Run the extractor over a single comment body
    ParseComment {
        /// Read the body from a file instead of --body
        #[arg(long, conflicts_with = "body")]
        file: Option<PathBuf>,

        #[arg(long)]
        body: Option<String>,

        #[arg(long, default_value = "ubiquibot")]
        author: String,

        #[arg(long)]
        assignee: Option<String>,

        #[arg(long, default_value = "")]
        creator: String,

        #[arg(long, default_value = "unknown")]
        repo: String,

        #[arg(long, default_value_t = 0)]
        issue: u64,
    },

    /// List nonces burned through invalidateUnorderedNonces
    Invalidations {
        /// Overrides TREASURY_OWNERS
        #[arg(long, value_delimiter = ',')]
        owners: Vec<String>,
    },
}

pub async fn execute_cli(cli: Cli) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(path) = cli.identities {
        config.identities_path = Some(path);
    }

    match cli.command {
        Commands::Run { bulk, orgs } => {
            if bulk.is_some() {
                config.bulk_export_path = bulk;
            }
            if !orgs.is_empty() {
                config.orgs = orgs;
            }
            handle_run(&config).await
        }
        Commands::Scan { orgs } => {
            if !orgs.is_empty() {
                config.orgs = orgs;
            }
            handle_scan(&config).await
        }
        Commands::Decode { input, tx, chain } => handle_decode(&config, input, tx, chain).await,
        Commands::ParseComment {
            file,
            body,
            author,
            assignee,
            creator,
            repo,
            issue,
        } => {
            let body = match (file, body) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(body)) => body,
                (None, None) => bail!("either --file or --body is required"),
            };
            let comment = IssueComment {
                issue_url: format!("https://github.com/{}/issues/{}", repo, issue),
                repo_name: repo,
                issue_number: issue,
                author,
                creator,
                assignee,
                body,
                created_at: Utc::now(),
            };
            handle_parse_comment(&config, &comment)
        }
        Commands::Invalidations { owners } => {
            if !owners.is_empty() {
                config.treasury_owners = owners
                    .iter()
                    .map(|o| {
                        o.parse::<Address>()
                            .with_context(|| format!("Invalid owner address {}", o))
                    })
                    .collect::<Result<_>>()?;
            }
            handle_invalidations(&config).await
        }
    }
}

fn load_identities(config: &Config) -> Result<JsonIdentityStore> {
    match &config.identities_path {
        Some(path) => JsonIdentityStore::load(path),
        None => {
            warn!("IDENTITIES_PATH not set, every recipient is non-attributable");
            Ok(JsonIdentityStore::default())
        }
    }
}

fn github_client(config: &Config) -> Result<GithubClient> {
    let token = config
        .github_token
        .clone()
        .context("GITHUB_TOKEN is required to read issue comments")?;
    Ok(GithubClient::new(token, config.retry_policy()))
}

fn explorer_client(config: &Config) -> ExplorerClient {
    ExplorerClient::new(config.explorer_endpoints(), config.retry_policy())
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Wrote output");
    Ok(path)
}

fn print_leaderboards(leaderboards: &Leaderboards) {
    println!("Authorized");
    for row in &leaderboards.authorized {
        println!("  {:<44} {:>16}", row.address, row.display_amount());
    }
    println!("Confirmed on chain");
    for row in &leaderboards.confirmed {
        println!("  {:<44} {:>16}", row.address, row.display_amount());
    }
}

fn print_tally(tally: &[TallyRow]) {
    println!("Comment tally");
    for row in tally {
        println!("  {:<32} {:>16} ({} claims)", row.username, format_units(row.amount), row.claims);
    }
}

async fn handle_run(config: &Config) -> Result<()> {
    let github = github_client(config)?;
    let explorer = explorer_client(config);
    let identities = load_identities(config)?;
    let store = JsonLedgerStore::open(&config.output_dir.join("ledger"))?;
    let bulk = match &config.bulk_export_path {
        Some(path) => load_bulk_export(path)?,
        None => BulkExport::default(),
    };

    let deps = Collaborators {
        issues: &github,
        history: &explorer,
        lookup: Some(&explorer),
        identities: &identities,
        sink: &store,
    };
    let report = Pipeline::new(config, deps)?.run(bulk).await?;

    write_json(&config.output_dir, "report.json", &report)?;
    write_json(&config.output_dir, "diagnostics.json", report.diagnostics.records())?;
    let metrics_path = config.output_dir.join("metrics.prom");
    std::fs::write(&metrics_path, &report.metrics)
        .with_context(|| format!("Failed to write {}", metrics_path.display()))?;

    print_leaderboards(&report.leaderboards);
    print_tally(&report.tally);
    println!(
        "Persisted {} entries, {} held for review, {} non-attributable, {} diagnostics",
        report.persisted,
        report.held_for_review,
        report.non_attributable,
        report.diagnostics.len()
    );
    Ok(())
}

async fn handle_scan(config: &Config) -> Result<()> {
    let github = github_client(config)?;
    let identities = load_identities(config)?;
    let extractor = CommentExtractor::new(&config.claim_host, &config.bot_authors)?;
    let mut diagnostics = Diagnostics::new();

    let skip = |name: &str, archived: bool| archived || config.is_skipped_repo(name);
    let scan = scan_organizations(
        &github,
        &extractor,
        &identities,
        &config.orgs,
        &skip,
        &mut diagnostics,
    )
    .await;

    let tally = tally_claims(&scan.claims);
    write_json(
        &config.output_dir,
        "scan.json",
        &json!({ "permits": &scan.permits, "claims": &scan.claims, "tally": &tally }),
    )?;
    write_json(&config.output_dir, "diagnostics.json", diagnostics.records())?;
    print_tally(&tally);
    println!(
        "{} comments, {} permits, {} claims, {} diagnostics",
        scan.comments_scanned,
        scan.permits.len(),
        scan.claims.len(),
        diagnostics.len()
    );
    Ok(())
}

async fn handle_decode(
    config: &Config,
    input: Option<String>,
    tx: Option<String>,
    chain: u64,
) -> Result<()> {
    let calldata = match (input, tx) {
        (Some(input), _) => input,
        (None, Some(hash)) => {
            let chain = Chain::from_id(chain)
                .with_context(|| format!("Unsupported chain id {}", chain))?;
            explorer_client(config)
                .transaction_input(&hash, chain)
                .await?
                .with_context(|| format!("Transaction {} not found on {}", hash, chain))?
        }
        (None, None) => bail!("either --input or --tx is required"),
    };
    let record = decode_permit_calldata(&calldata)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn handle_parse_comment(config: &Config, comment: &IssueComment) -> Result<()> {
    let identities = load_identities(config)?;
    let extractor = CommentExtractor::new(&config.claim_host, &config.bot_authors)?;
    let output = match extractor.extract(comment, &identities) {
        Some(extraction) => json!({
            "permits": extraction.permits,
            "claims": extraction.claims,
            "diagnostics": extraction.diagnostics.records(),
        }),
        None => serde_json::Value::Null,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn handle_invalidations(config: &Config) -> Result<()> {
    let explorer = explorer_client(config);
    let mut diagnostics = Diagnostics::new();
    let invalidated = find_invalidated_nonces(
        &explorer,
        &config.treasury_owners,
        &Chain::ALL,
        &mut diagnostics,
    )
    .await;
    println!("{}", serde_json::to_string_pretty(&invalidated)?);
    if !diagnostics.is_empty() {
        warn!(count = diagnostics.len(), "Some owners could not be scanned");
    }
    Ok(())
}

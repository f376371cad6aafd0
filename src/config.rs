use alloy_primitives::{address, Address};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::abi::PERMIT2_ADDRESS;
use crate::chain::{ExplorerEndpoint, RetryPolicy};
use crate::model::Chain;
use crate::reconcile::{AmountPrecedence, NearestPolicy};

const ETHEREUM_START_BLOCK: u64 = 10_373_290;
const GNOSIS_START_BLOCK: u64 = 15_349_006;

const DEFAULT_TREASURY_OWNERS: [Address; 4] = [
    address!("f87ca4583c792212e52720d127e7e0a38b818ad1"),
    address!("44ca15db101fd1c194467db6af0c67c6bbf4ab51"),
    address!("816863778f0ea481e00195606b50d91f7c64637c"),
    address!("70fbcf82ffa891c4267b77847c21243c566f7617"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub orgs: Vec<String>,
    /// Comment authors whose reward comments are trusted
    pub bot_authors: Vec<String>,
    pub claim_host: String,
    pub skip_repos: Vec<String>,
    #[serde(skip_serializing)]
    pub etherscan_api_key: String,
    #[serde(skip_serializing)]
    pub gnosisscan_api_key: String,
    pub etherscan_api_url: String,
    pub gnosisscan_api_url: String,
    pub permit2_address: Address,
    /// Signers of reward permits, scanned for nonce invalidations
    pub treasury_owners: Vec<Address>,
    pub identities_path: Option<PathBuf>,
    pub bulk_export_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub rate_limit_delay_secs: u64,
    pub max_retries: u32,
    pub nearest_policy: NearestPolicy,
    pub amount_precedence: AmountPrecedence,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: None,
            orgs: vec!["Ubiquity".to_string(), "ubiquibot".to_string()],
            bot_authors: vec![
                "ubiquibot".to_string(),
                "pavlovcik".to_string(),
                "0x4007".to_string(),
            ],
            claim_host: "https://pay.ubq.fi".to_string(),
            skip_repos: vec!["devpool-directory".to_string()],
            etherscan_api_key: String::new(),
            gnosisscan_api_key: String::new(),
            etherscan_api_url: "https://api.etherscan.io/api".to_string(),
            gnosisscan_api_url: "https://api.gnosisscan.io/api".to_string(),
            permit2_address: PERMIT2_ADDRESS,
            treasury_owners: DEFAULT_TREASURY_OWNERS.to_vec(),
            identities_path: None,
            bulk_export_path: None,
            output_dir: PathBuf::from("output"),
            rate_limit_delay_secs: 3,
            max_retries: 5,
            nearest_policy: NearestPolicy::default(),
            amount_precedence: AmountPrecedence::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by the process environment. `.env` is loaded by `main`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(token) = var("GITHUB_TOKEN") {
            config.github_token = Some(token);
        }
        if let Some(orgs) = var("ORGS") {
            config.orgs = split_list(&orgs);
        }
        if let Some(authors) = var("BOT_AUTHORS") {
            config.bot_authors = split_list(&authors);
        }
        if let Some(host) = var("CLAIM_HOST") {
            config.claim_host = host;
        }
        if let Some(repos) = var("SKIP_REPOS") {
            config.skip_repos = split_list(&repos);
        }
        if let Some(key) = var("ETHERSCAN_API_KEY") {
            config.etherscan_api_key = key;
        }
        if let Some(key) = var("GNOSISSCAN_API_KEY") {
            config.gnosisscan_api_key = key;
        }
        if let Some(url) = var("ETHERSCAN_API_URL") {
            config.etherscan_api_url = url;
        }
        if let Some(url) = var("GNOSISSCAN_API_URL") {
            config.gnosisscan_api_url = url;
        }
        if let Some(permit2) = var("PERMIT2_ADDRESS") {
            config.permit2_address = permit2
                .trim()
                .parse()
                .with_context(|| format!("Invalid PERMIT2_ADDRESS {}", permit2))?;
        }
        if let Some(owners) = var("TREASURY_OWNERS") {
            config.treasury_owners = parse_addresses(&owners)?;
        }
        if let Some(path) = var("IDENTITIES_PATH") {
            config.identities_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("BULK_EXPORT_PATH") {
            config.bulk_export_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = var("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(delay) = var("RATE_LIMIT_DELAY_SECS") {
            config.rate_limit_delay_secs = delay.parse()?;
        }
        if let Some(retries) = var("MAX_RETRIES") {
            config.max_retries = retries.parse()?;
        }
        if let Some(policy) = var("NEAREST_POLICY") {
            config.nearest_policy = policy.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(precedence) = var("AMOUNT_PRECEDENCE") {
            config.amount_precedence = precedence.parse().map_err(anyhow::Error::msg)?;
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs(self.rate_limit_delay_secs),
        }
    }

    pub fn explorer_endpoints(&self) -> BTreeMap<Chain, ExplorerEndpoint> {
        BTreeMap::from([
            (
                Chain::Ethereum,
                ExplorerEndpoint {
                    base_url: self.etherscan_api_url.clone(),
                    api_key: self.etherscan_api_key.clone(),
                    start_block: ETHEREUM_START_BLOCK,
                },
            ),
            (
                Chain::Gnosis,
                ExplorerEndpoint {
                    base_url: self.gnosisscan_api_url.clone(),
                    api_key: self.gnosisscan_api_key.clone(),
                    start_block: GNOSIS_START_BLOCK,
                },
            ),
        ])
    }

    pub fn is_skipped_repo(&self, name: &str) -> bool {
        self.skip_repos.iter().any(|r| r.eq_ignore_ascii_case(name))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_addresses(value: &str) -> Result<Vec<Address>> {
    split_list(value)
        .iter()
        .map(|a| {
            a.parse::<Address>()
                .with_context(|| format!("Invalid address {}", a))
        })
        .collect()
}

//! Canonical records shared by every source and by the reconciliation engine

use alloy_primitives::{address, Address, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Chain {
    Ethereum,
    Gnosis,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Ethereum, Chain::Gnosis];

    pub fn id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Gnosis => 100,
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            1 => Some(Chain::Ethereum),
            100 => Some(Chain::Gnosis),
            _ => None,
        }
    }

    /// Chain a payout token lives on. Unknown tokens default to mainnet.
    pub fn for_token(token: &Address) -> Self {
        TokenInfo::by_address(token)
            .map(|t| t.chain)
            .unwrap_or(Chain::Ethereum)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Gnosis => "gnosis",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known payout token with its persistence id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: &'static str,
    pub address: Address,
    pub chain: Chain,
    pub id: u32,
}

pub const DAI: TokenInfo = TokenInfo {
    symbol: "DAI",
    address: address!("6b175474e89094c44da98b954eedeac495271d0f"),
    chain: Chain::Ethereum,
    id: 1,
};

pub const WXDAI: TokenInfo = TokenInfo {
    symbol: "WXDAI",
    address: address!("e91d153e0b41518a2ce8dd3d7944fa863463a97d"),
    chain: Chain::Gnosis,
    id: 2,
};

pub const KNOWN_TOKENS: [TokenInfo; 2] = [DAI, WXDAI];

impl TokenInfo {
    pub fn by_address(token: &Address) -> Option<TokenInfo> {
        KNOWN_TOKENS.iter().copied().find(|t| t.address == *token)
    }
}

/// Currency tickers recognised in reward comments
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Xdai,
    Dai,
    Wxdai,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Xdai => "XDAI",
            Currency::Dai => "DAI",
            Currency::Wxdai => "WXDAI",
        }
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "XDAI" => Ok(Currency::Xdai),
            "DAI" => Ok(Currency::Dai),
            "WXDAI" => Ok(Currency::Wxdai),
            other => Err(format!("unsupported currency: {}", other)),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-cased `0x`-prefixed signature hex, the primary matching key across sources
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureKey(String);

impl SignatureKey {
    pub fn new(raw: &str) -> Self {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        Self(format!("0x{}", body.to_ascii_lowercase()))
    }

    pub fn from_bytes(bytes: &Bytes) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-cased `0x` address string used for leaderboard keys and logs
pub fn address_key(address: &Address) -> String {
    format!("{:#x}", address)
}

/// One token-transfer permission, whichever source described it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    pub owner: Address,
    pub nonce: U256,
    pub deadline: U256,
    pub token: Address,
    pub amount: U256,
    pub recipient: Address,
    pub signature: SignatureKey,
    pub network_id: Option<u64>,
    pub transaction_hash: Option<String>,
    pub block_timestamp: Option<DateTime<Utc>>,
}

/// Where a comment-sourced authorization was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueContext {
    pub repo_name: String,
    pub issue_number: u64,
    pub issue_creator: String,
    pub issue_assignee: Option<String>,
    pub comment_timestamp: DateTime<Utc>,
    pub claim_url: String,
    pub beneficiary_username: Option<String>,
}

/// One issue comment as delivered by the issue source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub repo_name: String,
    pub issue_number: u64,
    pub issue_url: String,
    pub author: String,
    pub creator: String,
    pub assignee: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Comment-sourced authorization with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPermit {
    pub authorization: AuthorizationRecord,
    pub context: IssueContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    Assignee,
    Creator,
    Conversation,
}

impl RecipientType {
    /// Assignee wins over creator when one user is both
    pub fn classify(user: &str, assignee: Option<&str>, creator: &str) -> Self {
        if assignee.is_some_and(|a| a.eq_ignore_ascii_case(user)) {
            RecipientType::Assignee
        } else if creator.eq_ignore_ascii_case(user) {
            RecipientType::Creator
        } else {
            RecipientType::Conversation
        }
    }
}

/// Text-only payout marker, carries no signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentClaim {
    pub repo_name: String,
    pub issue_number: u64,
    pub issue_url: String,
    pub amount: U256,
    pub currency: Currency,
    pub payee: Option<String>,
    pub recipient_type: RecipientType,
}

/// The three independent evidence sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Comment,
    Bulk,
    Chain,
}

/// Corroboration tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Single,
    Double,
    Triple,
}

impl Tier {
    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            0 => None,
            1 => Some(Tier::Single),
            2 => Some(Tier::Double),
            _ => Some(Tier::Triple),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Single => "single",
            Tier::Double => "double",
            Tier::Triple => "triple",
        };
        f.write_str(name)
    }
}

/// Reconciled view of one signature across sources.
///
/// Which sources hold it is not stored here; ask the reconciliation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub authorization: AuthorizationRecord,
    pub context: Option<IssueContext>,
}

impl MergedRecord {
    pub fn signature(&self) -> &SignatureKey {
        &self.authorization.signature
    }

    pub fn comment_timestamp(&self) -> Option<DateTime<Utc>> {
        self.context.as_ref().map(|c| c.comment_timestamp)
    }

    pub fn is_confirmed(&self) -> bool {
        self.authorization.transaction_hash.is_some()
    }
}

//! JSON shapes carried inside claim links
//!
//! Two layouts have been issued over time: the nested Permit2 shape
//! (`permit.permitted.token`, `transferDetails.to`, ...) and the flat reward
//! shape (`tokenAddress`, `beneficiary`, ...). A link carries either one
//! object or an array of them. Integers show up as decimal strings, hex
//! strings, JSON numbers or ethers `BigNumber` objects.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::DecodeError;
use crate::model::{AuthorizationRecord, SignatureKey};
use crate::units::parse_uint;

/// Unsigned integer accepted in any of the historical encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexUint(pub U256);

impl<'de> Deserialize<'de> for FlexUint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct BigNumber {
            #[serde(alias = "_hex")]
            hex: String,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
            Big(BigNumber),
        }

        let value = match Repr::deserialize(deserializer)? {
            Repr::Text(text) => parse_uint(&text).map_err(serde::de::Error::custom)?,
            Repr::Number(n) => U256::from(n),
            Repr::Big(big) => parse_uint(&big.hex).map_err(serde::de::Error::custom)?,
        };
        Ok(FlexUint(value))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenPermissions {
    pub token: Address,
    pub amount: FlexUint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermitBody {
    pub permitted: TokenPermissions,
    pub nonce: FlexUint,
    pub deadline: FlexUint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferDetails {
    pub to: Address,
    #[serde(rename = "requestedAmount")]
    pub requested_amount: FlexUint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NestedPermit {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub permit: PermitBody,
    #[serde(rename = "transferDetails")]
    pub transfer_details: TransferDetails,
    pub owner: Address,
    pub signature: String,
    #[serde(rename = "networkId", default)]
    pub network_id: Option<FlexUint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlatPermit {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "tokenAddress")]
    pub token_address: Address,
    pub amount: FlexUint,
    pub nonce: FlexUint,
    pub deadline: FlexUint,
    pub beneficiary: Address,
    pub owner: Address,
    pub signature: String,
    #[serde(rename = "networkId", default)]
    pub network_id: Option<FlexUint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PermitEntry {
    Nested(NestedPermit),
    Flat(FlatPermit),
}

/// Entries of one claim payload, with the ones that did not match either layout
#[derive(Debug, Default)]
pub struct ClaimEntries {
    pub entries: Vec<PermitEntry>,
    /// Position in the payload and the reason it was rejected
    pub rejected: Vec<(usize, serde_json::Error)>,
}

/// Parse decoded claim bytes. Only unreadable JSON fails as a whole, each
/// entry of an array is converted on its own.
pub fn parse_claim_payload(bytes: &[u8]) -> Result<ClaimEntries, serde_json::Error> {
    let values = match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(values) => values,
        value => vec![value],
    };

    let mut parsed = ClaimEntries::default();
    for (position, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<PermitEntry>(value) {
            Ok(entry) => parsed.entries.push(entry),
            Err(e) => parsed.rejected.push((position, e)),
        }
    }
    Ok(parsed)
}

impl PermitEntry {
    pub fn kind(&self) -> Option<&str> {
        match self {
            PermitEntry::Nested(p) => p.kind.as_deref(),
            PermitEntry::Flat(p) => p.kind.as_deref(),
        }
    }

    /// NFT reward permits share the link format but are not token payouts
    pub fn is_erc20(&self) -> bool {
        !self
            .kind()
            .is_some_and(|k| k.to_ascii_lowercase().contains("erc721"))
    }

    pub fn to_authorization(&self) -> Result<AuthorizationRecord, DecodeError> {
        let record = match self {
            PermitEntry::Nested(p) => AuthorizationRecord {
                owner: p.owner,
                nonce: p.permit.nonce.0,
                deadline: p.permit.deadline.0,
                token: p.permit.permitted.token,
                amount: p.permit.permitted.amount.0,
                recipient: p.transfer_details.to,
                signature: signature_key(&p.signature)?,
                network_id: network_id(p.network_id)?,
                transaction_hash: None,
                block_timestamp: None,
            },
            PermitEntry::Flat(p) => AuthorizationRecord {
                owner: p.owner,
                nonce: p.nonce.0,
                deadline: p.deadline.0,
                token: p.token_address,
                amount: p.amount.0,
                recipient: p.beneficiary,
                signature: signature_key(&p.signature)?,
                network_id: network_id(p.network_id)?,
                transaction_hash: None,
                block_timestamp: None,
            },
        };
        Ok(record)
    }
}

fn signature_key(raw: &str) -> Result<SignatureKey, DecodeError> {
    let body = raw.trim().trim_start_matches("0x");
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DecodeError::Field {
            field: "signature",
            reason: format!("not a hex string: {}", raw),
        });
    }
    Ok(SignatureKey::new(raw))
}

fn network_id(value: Option<FlexUint>) -> Result<Option<u64>, DecodeError> {
    value
        .map(|v| {
            u64::try_from(v.0).map_err(|_| DecodeError::Field {
                field: "networkId",
                reason: v.0.to_string(),
            })
        })
        .transpose()
}

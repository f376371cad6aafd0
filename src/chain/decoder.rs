use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::abi::{invalidateUnorderedNoncesCall, permitTransferFromCall};
use crate::error::DecodeError;
use crate::model::{AuthorizationRecord, Chain, SignatureKey};

/// Raw transaction as reported by a block explorer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    /// Calldata hex, with or without `0x`
    pub input: String,
    pub from: Address,
    pub to: Option<Address>,
    pub timestamp: DateTime<Utc>,
    pub method_selector: Option<String>,
    pub chain: Chain,
}

impl ChainTransaction {
    /// Lower-cased `0x` selector, from the explorer field or the calldata prefix
    pub fn selector(&self) -> Option<String> {
        match self.method_selector.as_deref() {
            Some(s) if s.len() == 10 => Some(s.to_ascii_lowercase()),
            _ => selector_of(&self.input),
        }
    }

    pub fn has_selector(&self, selector: &str) -> bool {
        self.selector()
            .is_some_and(|s| s.eq_ignore_ascii_case(selector))
    }
}

/// Nonce burned through `invalidateUnorderedNonces`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidatedNonce {
    pub owner: Address,
    pub word_pos: U256,
    pub bit_pos: U256,
    pub nonce: U256,
    pub transaction_hash: String,
}

pub fn selector_of(input: &str) -> Option<String> {
    let body = strip_hex_prefix(input);
    (body.len() >= 8).then(|| format!("0x{}", body[..8].to_ascii_lowercase()))
}

fn strip_hex_prefix(input: &str) -> &str {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
}

fn calldata<C: SolCall>(input: &str) -> Result<Vec<u8>, DecodeError> {
    let bytes = hex::decode(strip_hex_prefix(input))?;
    if bytes.len() < 4 {
        return Err(DecodeError::TooShort(bytes.len()));
    }
    if bytes[..4] != C::SELECTOR {
        return Err(DecodeError::SelectorMismatch {
            expected: hex::encode(C::SELECTOR),
            found: hex::encode(&bytes[..4]),
        });
    }
    Ok(bytes)
}

/// Decode bare `permitTransferFrom` calldata.
///
/// The record amount is the permitted amount, the recipient is the transfer
/// destination. Hash, block time and network are left empty.
pub fn decode_permit_calldata(input: &str) -> Result<AuthorizationRecord, DecodeError> {
    let bytes = calldata::<permitTransferFromCall>(input)?;
    let call = permitTransferFromCall::abi_decode_raw(&bytes[4..], false)?;

    Ok(AuthorizationRecord {
        owner: call.owner,
        nonce: call.permit.nonce,
        deadline: call.permit.deadline,
        token: call.permit.permitted.token,
        amount: call.permit.permitted.amount,
        recipient: call.transferDetails.to,
        signature: SignatureKey::from_bytes(&call.signature),
        network_id: None,
        transaction_hash: None,
        block_timestamp: None,
    })
}

/// Decode a `permitTransferFrom` transaction into an authorization record
pub fn decode_permit_transfer(tx: &ChainTransaction) -> Result<AuthorizationRecord, DecodeError> {
    Ok(AuthorizationRecord {
        network_id: Some(tx.chain.id()),
        transaction_hash: Some(tx.hash.to_ascii_lowercase()),
        block_timestamp: Some(tx.timestamp),
        ..decode_permit_calldata(&tx.input)?
    })
}

/// Decode an `invalidateUnorderedNonces` call.
///
/// The burned nonce is `(wordPos << 8) | bitPos`, the owner is the sender.
pub fn decode_invalidation(tx: &ChainTransaction) -> Result<InvalidatedNonce, DecodeError> {
    let bytes = calldata::<invalidateUnorderedNoncesCall>(&tx.input)?;
    let call = invalidateUnorderedNoncesCall::abi_decode_raw(&bytes[4..], false)?;

    Ok(InvalidatedNonce {
        owner: tx.from,
        word_pos: call.wordPos,
        bit_pos: call.bitPos,
        nonce: (call.wordPos << 8usize) | call.bitPos,
        transaction_hash: tx.hash.to_ascii_lowercase(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::abi::{PermitTransferFrom, SignatureTransferDetails, TokenPermissions};
    use crate::chain::abi::INVALIDATE_NONCES_SELECTOR;
    use crate::model::WXDAI;
    use alloy_primitives::{address, Bytes};
    use chrono::TimeZone;

    pub const OWNER: Address = address!("44ca15db101fd1c194467db6af0c67c6bbf4ab51");
    pub const RECIPIENT: Address = address!("4007ce2083c7f3e18097aeb3a39bb8ec149a341d");

    /// Encoded `permitTransferFrom` calldata, hex with `0x`
    pub fn permit_input(amount: U256, nonce: U256, signature: &[u8]) -> String {
        let call = permitTransferFromCall {
            permit: PermitTransferFrom {
                permitted: TokenPermissions {
                    token: WXDAI.address,
                    amount,
                },
                nonce,
                deadline: U256::from(1_900_000_000u64),
            },
            transferDetails: SignatureTransferDetails {
                to: RECIPIENT,
                requestedAmount: amount,
            },
            owner: OWNER,
            signature: Bytes::from(signature.to_vec()),
        };
        format!("0x{}", hex::encode(call.abi_encode()))
    }

    pub fn invalidation_input(word_pos: u64, bit_pos: u64) -> String {
        let call = invalidateUnorderedNoncesCall {
            wordPos: U256::from(word_pos),
            bitPos: U256::from(bit_pos),
        };
        format!("0x{}", hex::encode(call.abi_encode()))
    }

    pub fn tx(hash: &str, input: String, secs: i64) -> ChainTransaction {
        ChainTransaction {
            hash: hash.to_string(),
            input,
            from: OWNER,
            to: Some(crate::chain::abi::PERMIT2_ADDRESS),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            method_selector: None,
            chain: Chain::Gnosis,
        }
    }

    #[test]
    fn test_decode_permit_transfer() {
        let input = permit_input(U256::from(17u64), U256::from(99u64), &[0xAB; 65]);
        let record = decode_permit_transfer(&tx("0xHASH", input, 1_700_000_000)).unwrap();

        assert_eq!(record.owner, OWNER);
        assert_eq!(record.recipient, RECIPIENT);
        assert_eq!(record.token, WXDAI.address);
        assert_eq!(record.amount, U256::from(17u64));
        assert_eq!(record.nonce, U256::from(99u64));
        assert_eq!(record.signature.as_str(), format!("0x{}", "ab".repeat(65)));
        assert_eq!(record.transaction_hash.as_deref(), Some("0xhash"));
        assert_eq!(record.network_id, Some(100));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let input = permit_input(U256::from(5u64), U256::from(1u64), &[1, 2, 3]);
        let t = tx("0x1", input, 1);
        assert_eq!(
            decode_permit_transfer(&t).unwrap(),
            decode_permit_transfer(&t).unwrap()
        );
    }

    #[test]
    fn test_wrong_selector_rejected() {
        let t = tx("0x1", invalidation_input(1, 2), 1);
        assert!(matches!(
            decode_permit_transfer(&t),
            Err(DecodeError::SelectorMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let input = permit_input(U256::from(5u64), U256::from(1u64), &[1, 2, 3]);
        let truncated = input[..input.len() - 64].to_string();
        assert!(matches!(
            decode_permit_transfer(&tx("0x1", truncated, 1)),
            Err(DecodeError::Abi(_))
        ));
        assert!(matches!(
            decode_permit_transfer(&tx("0x1", "0x30f2".to_string(), 1)),
            Err(DecodeError::TooShort(2))
        ));
        assert!(matches!(
            decode_permit_transfer(&tx("0x1", "0xzz".to_string(), 1)),
            Err(DecodeError::Hex(_))
        ));
    }

    #[test]
    fn test_decode_invalidation_nonce() {
        let t = tx("0xINV", invalidation_input(3, 7), 1);
        assert!(t.has_selector(INVALIDATE_NONCES_SELECTOR));

        let invalidated = decode_invalidation(&t).unwrap();
        assert_eq!(invalidated.owner, OWNER);
        assert_eq!(invalidated.nonce, U256::from((3u64 << 8) | 7));
        assert_eq!(invalidated.transaction_hash, "0xinv");
    }

    #[test]
    fn test_selector_prefers_explorer_field() {
        let mut t = tx("0x1", "0x".to_string(), 1);
        assert_eq!(t.selector(), None);
        t.method_selector = Some("0x3FF9DCB1".to_string());
        assert!(t.has_selector(INVALIDATE_NONCES_SELECTOR));
    }
}

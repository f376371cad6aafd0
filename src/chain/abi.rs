//! Permit2 signature-transfer ABI
//!
//! Only the two methods the ledger cares about are declared. Selectors:
//! `permitTransferFrom` = `0x30f28b7a`, `invalidateUnorderedNonces` = `0x3ff9dcb1`.

use alloy_primitives::{address, Address};
use alloy_sol_types::sol;

/// Canonical Permit2 deployment, same address on every chain
pub const PERMIT2_ADDRESS: Address = address!("000000000022d473030f116ddee9f6b43ac78ba3");

pub const PERMIT_TRANSFER_FROM_SELECTOR: &str = "0x30f28b7a";
pub const INVALIDATE_NONCES_SELECTOR: &str = "0x3ff9dcb1";

sol! {
    struct TokenPermissions {
        address token;
        uint256 amount;
    }

    struct PermitTransferFrom {
        TokenPermissions permitted;
        uint256 nonce;
        uint256 deadline;
    }

    struct SignatureTransferDetails {
        address to;
        uint256 requestedAmount;
    }

    function permitTransferFrom(
        PermitTransferFrom permit,
        SignatureTransferDetails transferDetails,
        address owner,
        bytes signature
    );

    function invalidateUnorderedNonces(uint256 wordPos, uint256 bitPos);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_sol_types::SolCall;

    #[test]
    fn test_selectors_match_deployed_contract() {
        assert_eq!(
            format!("0x{}", hex::encode(permitTransferFromCall::SELECTOR)),
            PERMIT_TRANSFER_FROM_SELECTOR
        );
        assert_eq!(
            format!("0x{}", hex::encode(invalidateUnorderedNoncesCall::SELECTOR)),
            INVALIDATE_NONCES_SELECTOR
        );
    }
}

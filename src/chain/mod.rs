//! On-chain evidence: Permit2 calldata decoding and explorer history

pub mod abi;
pub mod decoder;
pub mod explorer;
pub mod history;

pub use decoder::{
    decode_invalidation, decode_permit_calldata, decode_permit_transfer, ChainTransaction,
    InvalidatedNonce,
};
pub use explorer::{
    ExplorerClient, ExplorerEndpoint, RetryPolicy, TransactionHistory, TransactionLookup,
};
pub use history::{collect_permit_transfers, CollectedHistory};

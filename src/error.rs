use thiserror::Error;

/// Calldata that does not match the expected Permit2 method
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid hex input: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Input too short for a method selector ({0} bytes)")]
    TooShort(usize),
    #[error("Unexpected selector 0x{found}, expected 0x{expected}")]
    SelectorMismatch { expected: String, found: String },
    #[error("ABI decode failed: {0}")]
    Abi(#[from] alloy_sol_types::Error),
    #[error("Invalid field {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

/// Claim link payloads that cannot be recovered
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Claim link has no claim parameter")]
    MissingParameter,
    #[error("Payload is empty after sanitization")]
    Empty,
    #[error("Payload still contains non-base64 character {0:?}")]
    InvalidCharacter(char),
}

/// Failures of the external issue and transaction sources
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence sink failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level run outcome that the operator must see
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no data found processing all repositories")]
    NoData,
}

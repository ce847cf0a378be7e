// src/error.rs
use ethers::types::{Bytes, H256, U256};
use jsonrpsee::types::error::ErrorObjectOwned;
use thiserror::Error;

pub const INVALID_PARAMS_CODE: i32 = -32602;
pub const INTERNAL_ERROR_CODE: i32 = -32603;
pub const CHAIN_ERROR_CODE: i32 = -32000;
pub const VALIDATION_FAILED_CODE: i32 = -32500;
pub const QUEUE_FULL_CODE: i32 = -32504;
pub const PREFUND_EXCEEDED_CODE: i32 = -32505;
pub const SUBMISSION_EXHAUSTED_CODE: i32 = -32506;
pub const RATE_LIMITED_CODE: i32 = -32429;

/// Failures talking to the chain node or the signer.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("execution reverted")]
    Revert(Bytes),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("timed out waiting for transaction {0:?}")]
    Timeout(H256),

    #[error("transaction {0:?} dropped from mempool")]
    Dropped(H256),

    #[error("signer error: {0}")]
    Signer(String),
}

#[derive(Error, Debug, Clone)]
pub enum BundlerError {
    #[error("Malformed user operation: {0}")]
    MalformedOperation(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Queue is full")]
    QueueFull,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Prefund shortfall {shortfall} exceeds ceiling {ceiling}")]
    PrefundExceeded { shortfall: U256, ceiling: U256 },

    #[error("Submission exhausted after {attempts} attempts: {last_error}")]
    SubmissionExhausted { attempts: u32, last_error: String },

    #[error("Operation hash mismatch: expected {expected:?}, computed {computed:?}")]
    HashMismatch { expected: H256, computed: H256 },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

impl BundlerError {
    pub fn code(&self) -> i32 {
        match self {
            BundlerError::MalformedOperation(_) | BundlerError::InvalidParams(_) => {
                INVALID_PARAMS_CODE
            }
            BundlerError::ValidationFailed(_) => VALIDATION_FAILED_CODE,
            BundlerError::QueueFull => QUEUE_FULL_CODE,
            BundlerError::RateLimited => RATE_LIMITED_CODE,
            BundlerError::PrefundExceeded { .. } => PREFUND_EXCEEDED_CODE,
            BundlerError::SubmissionExhausted { .. } => SUBMISSION_EXHAUSTED_CODE,
            BundlerError::HashMismatch { .. } => INTERNAL_ERROR_CODE,
            BundlerError::Chain(_) => CHAIN_ERROR_CODE,
        }
    }
}

impl From<BundlerError> for ErrorObjectOwned {
    fn from(err: BundlerError) -> Self {
        ErrorObjectOwned::owned(err.code(), err.to_string(), None::<()>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_have_distinct_codes() {
        assert_ne!(BundlerError::QueueFull.code(), BundlerError::RateLimited.code());
        let obj: ErrorObjectOwned = BundlerError::MalformedOperation("bad".into()).into();
        assert_eq!(obj.code(), INVALID_PARAMS_CODE);
        assert!(obj.message().contains("bad"));
    }
}

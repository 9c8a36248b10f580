use std::io;

use thiserror::Error;

use crate::merkle::MerkleError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("attestation rejected: {0}")]
    AttestationRejected(String),
    #[error("ledger out of order: expected step {expected}, got {actual}")]
    LedgerOutOfOrder { expected: u64, actual: u64 },
    #[error("ledger is finalized; no further appends accepted")]
    LedgerFinalized,
    #[error("proof rejected: {0}")]
    ProofRejected(String),
    #[error("anchor counter conflict for run {run_id}: submitted {submitted}, authority at {current}")]
    AnchorNonMonotonic {
        run_id: String,
        submitted: u64,
        current: u64,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("merkle error: {0}")]
    Merkle(#[from] MerkleError),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ChainError {
    /// Transport failures are the only class safe to retry with unchanged
    /// arguments; everything else requires the caller to resynchronize first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

//! Error types for chainward

use ethers::types::Address;
use thiserror::Error;

/// Main error type for the toolkit
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain communication error for {address:?}: {message}")]
    ChainCommunication { address: Address, message: String },

    #[error("Transaction store error: {0}")]
    Store(String),

    #[error("Transaction {tx_id} not found")]
    TxNotFound { tx_id: uuid::Uuid },

    #[error("Fee estimation error: {0}")]
    FeeEstimation(String),

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Signing error for {address:?}: {message}")]
    Signing { address: Address, message: String },

    #[error("Invalid transaction: {0}")]
    InvalidTx(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Resend cycle failed for {failed} of {total} addresses")]
    ResendCycle { failed: usize, total: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable by the next scheduled cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ChainCommunication { .. } | Error::Timeout { .. } | Error::ResendCycle { .. }
        )
    }
}

/// Result type for toolkit operations
pub type Result<T> = std::result::Result<T, Error>;

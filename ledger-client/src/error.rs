//! Error types for ledger calls

use crate::types::{Address, Amount, TxHash};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The call did not answer within its deadline
    #[error("Ledger call timed out after {0} ms")]
    Timeout(u64),

    /// Transport or node failure; the request may or may not have landed
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// Sender cannot cover value plus fee
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Value plus fee budget
        required: Amount,
        /// Balance at the time of the call
        available: Amount,
    },

    /// Transfer signature does not belong to the sending address
    #[error("Signature rejected for {0}")]
    InvalidSignature(Address),

    /// Ledger refused the transfer for a non-transient reason
    #[error("Transfer rejected: {0}")]
    Rejected(String),

    /// Transaction lookup failed
    #[error("Transaction not found: {0}")]
    NotFound(TxHash),

    /// Snapshot persistence error
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl LedgerError {
    /// Whether a retry of the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Timeout(_) | LedgerError::Unavailable(_))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Snapshot(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Snapshot(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(LedgerError::Timeout(500).is_retryable());
        assert!(LedgerError::Unavailable("reset".to_string()).is_retryable());

        assert!(!LedgerError::InsufficientBalance {
            required: 10,
            available: 5
        }
        .is_retryable());
        assert!(!LedgerError::Rejected("nonce".to_string()).is_retryable());
        assert!(!LedgerError::NotFound(TxHash::new("0xabc")).is_retryable());
    }
}

//! Error types for the swap watcher

use thiserror::Error;

/// Main error type for the watcher
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sequencer error: {0}")]
    Sequencer(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited by {service}")]
    RateLimited { service: String },

    #[error("Request declined by the user: {0}")]
    UserDeclined(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Cancellation window for ready tx {ready_tx_id} closed at {available_from}")]
    CancelWindowClosed { ready_tx_id: i64, available_from: u64 },

    #[error("History {history_id} is not eligible for reimbursement")]
    NotReimbursable { history_id: i64 },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Operator receipt signed by {recovered}, expected {expected}")]
    InvalidOperatorSignature { recovered: String, expected: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WatcherError {
    /// Check if error is retryable (no new information this tick)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatcherError::Sequencer(_)
                | WatcherError::ChainConnection { .. }
                | WatcherError::Timeout { .. }
                | WatcherError::RateLimited { .. }
        )
    }

    /// Check if error was caused by the caller rather than the system
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            WatcherError::UserDeclined(_)
                | WatcherError::NotFound { .. }
                | WatcherError::CancelWindowClosed { .. }
                | WatcherError::NotReimbursable { .. }
                | WatcherError::InvalidSubmission(_)
                | WatcherError::InvalidOperatorSignature { .. }
        )
    }
}

/// Result type for watcher operations
pub type WatcherResult<T> = Result<T, WatcherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(WatcherError::Sequencer("503".into()).is_retryable());
        assert!(WatcherError::Timeout {
            operation: "receipt".into()
        }
        .is_retryable());
        assert!(!WatcherError::UserDeclined("cancel".into()).is_retryable());
        assert!(!WatcherError::NotReimbursable { history_id: 1 }.is_retryable());
    }

    #[test]
    fn test_caller_errors() {
        assert!(WatcherError::CancelWindowClosed {
            ready_tx_id: 1,
            available_from: 10
        }
        .is_caller_error());
        assert!(!WatcherError::Internal("boom".into()).is_caller_error());
    }
}

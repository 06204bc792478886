//! Error types for the swap engine

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the swap engine
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for coin {coin}: {message}")]
    ChainConnection { coin: String, message: String },

    #[error("Broadcast error for coin {coin}: {message}")]
    Broadcast { coin: String, message: String },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Secret hash mismatch")]
    SecretHashMismatch,

    #[error("Transaction {txid} on {coin} not confirmed within {waited_secs}s")]
    ConfirmationTimeout {
        coin: String,
        txid: String,
        waited_secs: u64,
    },

    #[error("Deadline {deadline} passed on {coin} (chain time {chain_time})")]
    DeadlinePassed {
        coin: String,
        deadline: u64,
        chain_time: u64,
    },

    #[error("Locktime {locktime} not reached (chain time {chain_time})")]
    LocktimeNotReached { locktime: u64, chain_time: u64 },

    #[error("Payment {txid} on {coin} already spent by {spent_by}")]
    AlreadySpent {
        coin: String,
        txid: String,
        spent_by: String,
    },

    #[error("Refund error: {0}")]
    Refund(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Coin {0} not found")]
    CoinNotFound(String),

    #[error("Swap {0} not found")]
    SwapNotFound(Uuid),

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Swap {uuid} is not cancelable in state {state}")]
    NotCancelable { uuid: Uuid, state: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Sequence conflict for swap {swap_id}: expected {expected}, got {got}")]
    SequenceConflict {
        swap_id: Uuid,
        expected: u64,
        got: u64,
    },

    #[error("Transaction {txid} not found on {coin}")]
    TransactionNotFound { coin: String, txid: String },

    #[error("Reorg detected on {coin}: {txid} dropped to {confirmations} confirmations")]
    ReorgDetected {
        coin: String,
        txid: String,
        confirmations: u64,
    },

    #[error("Swap cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialisable error category carried in a swap's error record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Negotiation,
    Transient,
    Validation,
    ConfirmationTimeout,
    Deadline,
    Reorg,
    Refund,
    Cancelled,
    Internal,
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::ChainConnection { .. }
                | SwapError::Broadcast { .. }
                | SwapError::Timeout { .. }
                | SwapError::Io(_)
                | SwapError::Database(_)
                | SwapError::Messaging(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SwapError::Validation(_)
                | SwapError::SecretHashMismatch
                | SwapError::ReorgDetected { .. }
                | SwapError::AlreadySpent { .. }
                | SwapError::Refund(_)
        )
    }

    /// Category recorded on the swap when this error ends a step
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwapError::Negotiation(_) => ErrorKind::Negotiation,
            SwapError::Validation(_) | SwapError::SecretHashMismatch => ErrorKind::Validation,
            SwapError::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            SwapError::DeadlinePassed { .. } | SwapError::LocktimeNotReached { .. } => {
                ErrorKind::Deadline
            }
            SwapError::ReorgDetected { .. } => ErrorKind::Reorg,
            SwapError::Refund(_) | SwapError::AlreadySpent { .. } => ErrorKind::Refund,
            SwapError::Cancelled => ErrorKind::Cancelled,
            e if e.is_retryable() => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type for swap engine operations
pub type SwapResult<T> = Result<T, SwapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let broadcast = SwapError::Broadcast {
            coin: "BTC".into(),
            message: "connection reset".into(),
        };
        assert!(broadcast.is_retryable());
        assert_eq!(broadcast.kind(), ErrorKind::Transient);

        let mismatch = SwapError::SecretHashMismatch;
        assert!(!mismatch.is_retryable());
        assert!(mismatch.should_alert());
        assert_eq!(mismatch.kind(), ErrorKind::Validation);

        let spent = SwapError::AlreadySpent {
            coin: "ETH".into(),
            txid: "aa".into(),
            spent_by: "bb".into(),
        };
        assert!(!spent.is_retryable());
        assert_eq!(spent.kind(), ErrorKind::Refund);

        let reorg = SwapError::ReorgDetected {
            coin: "BTC".into(),
            txid: "cc".into(),
            confirmations: 0,
        };
        assert!(reorg.should_alert());
        assert_eq!(reorg.kind(), ErrorKind::Reorg);
    }
}

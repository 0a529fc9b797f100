//! Error types for the HTLC relayer

use crate::chain::Chain;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error on {chain}: {message}")]
    ChainConnection { chain: Chain, message: String },

    #[error("Decode error on {chain}: {message}")]
    Decode { chain: Chain, message: String },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("Order {order_id} already exists")]
    DuplicateOrder { order_id: String },

    #[error("Hashlock {hashlock} is held by active order {order_id}")]
    HashlockInUse { hashlock: String, order_id: String },

    #[error("Invalid order terms: {0}")]
    InvalidOrder(String),

    #[error("Fill rejected for order {order_id}: {reason}")]
    InvalidFill { order_id: String, reason: String },

    #[error("Invalid state transition on {chain} leg from {from} to {to}")]
    InvalidStateTransition {
        chain: Chain,
        from: String,
        to: String,
    },

    #[error("Secret does not match hashlock {hashlock}")]
    InvalidSecret { hashlock: String },

    #[error("Timelock on {chain} for {hashlock} not expired: locktime {locktime}, current {current}")]
    TimelockNotExpired {
        chain: Chain,
        hashlock: String,
        locktime: u64,
        current: u64,
    },

    #[error("No HTLC lock found on {chain} for {hashlock}")]
    LockNotFound { chain: Chain, hashlock: String },

    #[error("HTLC on {chain} for {hashlock} already spent")]
    AlreadySpent { chain: Chain, hashlock: String },

    #[error("Broadcast failure on {chain}: {message}")]
    BroadcastFailure { chain: Chain, message: String },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::BroadcastFailure { .. }
                | RelayerError::Timeout { .. }
        )
    }

    /// Local storage failed, so whatever was being recorded is not durable yet
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, RelayerError::Io(_) | RelayerError::Database(_))
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::BroadcastFailure { .. } | RelayerError::Signer(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::Config(_) => "config",
            RelayerError::Io(_) => "io",
            RelayerError::Database(_) => "database",
            RelayerError::Serialization(_) => "serialization",
            RelayerError::ChainConnection { .. } => "connection",
            RelayerError::Decode { .. } => "decode",
            RelayerError::OrderNotFound { .. } => "order_not_found",
            RelayerError::DuplicateOrder { .. } => "duplicate_order",
            RelayerError::HashlockInUse { .. } => "hashlock_in_use",
            RelayerError::InvalidOrder(_) => "invalid_order",
            RelayerError::InvalidFill { .. } => "invalid_fill",
            RelayerError::InvalidStateTransition { .. } => "invalid_transition",
            RelayerError::InvalidSecret { .. } => "invalid_secret",
            RelayerError::TimelockNotExpired { .. } => "timelock_not_expired",
            RelayerError::LockNotFound { .. } => "lock_not_found",
            RelayerError::AlreadySpent { .. } => "already_spent",
            RelayerError::BroadcastFailure { .. } => "broadcast_failure",
            RelayerError::Signer(_) => "signer",
            RelayerError::Timeout { .. } => "timeout",
            RelayerError::Internal(_) => "internal",
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = RelayerError::ChainConnection {
            chain: Chain::Bitcoin,
            message: "refused".to_string(),
        };
        assert!(err.is_retryable());

        let err = RelayerError::TimelockNotExpired {
            chain: Chain::Ethereum,
            hashlock: "00".to_string(),
            locktime: 10,
            current: 5,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "timelock_not_expired");

        let err = RelayerError::BroadcastFailure {
            chain: Chain::Bitcoin,
            message: "mempool full".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.should_alert());
        assert!(!err.is_storage_failure());

        let err = RelayerError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(err.is_storage_failure());
        assert!(!err.is_retryable());
    }
}

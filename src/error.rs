//! Error types for the Quotagate service.

use std::time::Duration;

use thiserror::Error;

/// Errors raised at the quota store boundary.
///
/// These are transient infrastructure failures. The limiter never lets them
/// reach the caller of a protected endpoint; they are turned into a decision.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The transaction did not complete within its time bound
    #[error("Transaction timed out after {0:?}")]
    TransactionTimeout(Duration),

    /// The transaction kept conflicting with concurrent writers
    #[error("Transaction aborted after {attempts} attempts")]
    TransactionAborted { attempts: u32 },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// A limit type was used that no policy is registered for
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// A policy definition violates its constraints
    #[error("Invalid rate limit policy '{limit_type}': {reason}")]
    InvalidPolicy { limit_type: String, reason: String },

    /// Quota store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected failure inside the middleware adapter
    #[error("Adapter internal error: {0}")]
    AdapterInternal(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

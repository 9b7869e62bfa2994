//! Error types for PackIO
//!
//! This module defines the common error type used by the storage engine
//! and the RPC layer. The variants are grouped so that callers can pick a
//! retry policy: resolution failures are permanent, lock timeouts are
//! transient, corruption needs an operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Common result type for PackIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for PackIO
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("timed out after {timeout:?} waiting for lock on {}", .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("corruption detected: {0}")]
    Corruption(String),

    // Resolution errors
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("policy not found: {0}")]
    PolicyNotFound(u32),

    #[error("invalid policy directory: {0}")]
    InvalidPolicyDir(String),

    #[error("partition path unavailable: {0}")]
    PartitionUnavailable(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    // Usage errors
    #[error("invalid object state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Call errors
    #[error("operation cancelled")]
    Cancelled,

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound(_)
                | Self::PolicyNotFound(_)
                | Self::InvalidPolicyDir(_)
                | Self::PartitionUnavailable(_)
                | Self::ObjectNotFound(_)
        )
    }

    /// Check if this error means on-disk state is damaged
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

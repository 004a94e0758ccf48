/// Unified error handling for atalaya
///
/// This module provides the error type system for the topology core: argument
/// and lifecycle errors surfaced immediately, selection timeouts the caller may
/// retry around, and wire-version incompatibility which is terminal until the
/// deployment is fixed.
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for atalaya operations
#[derive(Debug, Error)]
pub enum AtalayaError {
    /// Bad construction or call parameters
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Operation attempted before initialization
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Operation attempted after teardown
    #[error("{resource} has been disposed")]
    Disposed { resource: &'static str },

    /// No compatible server was found within the selection deadline
    #[error("Server selection timed out after {elapsed:?}. Client view of the cluster: {cluster_view}")]
    SelectionTimeout {
        elapsed: Duration,
        cluster_view: String,
    },

    /// A tracked server's wire-version range is outside the supported range
    #[error("Server at {endpoint} reports wire versions {server_range}, outside the supported range {supported_range}")]
    Incompatible {
        endpoint: String,
        server_range: String,
        supported_range: String,
    },

    /// Server selection was cancelled by the caller
    #[error("Server selection was cancelled")]
    Cancelled,

    /// A heartbeat failed; local to the monitor, never surfaced from selection
    #[error("Heartbeat failed: {message}")]
    Heartbeat { message: String },

    /// Network-level errors from collaborator connections
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Connection pool errors surfaced by channel acquisition
    #[error("Connection pool error: {message}")]
    Pool { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for atalaya operations
pub type Result<T> = std::result::Result<T, AtalayaError>;

/// Convenience methods for creating specific error types
impl AtalayaError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        AtalayaError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        AtalayaError::InvalidState {
            message: message.into(),
        }
    }

    /// Create a disposed error for the named resource
    pub fn disposed(resource: &'static str) -> Self {
        AtalayaError::Disposed { resource }
    }

    /// Create a heartbeat failure
    pub fn heartbeat<S: Into<String>>(message: S) -> Self {
        AtalayaError::Heartbeat {
            message: message.into(),
        }
    }

    /// Create a connection pool error
    pub fn pool<S: Into<String>>(message: S) -> Self {
        AtalayaError::Pool {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the caller may retry the operation)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AtalayaError::SelectionTimeout { .. } => true,
            AtalayaError::Heartbeat { .. } => true,
            AtalayaError::Network(_) => true,
            AtalayaError::Pool { .. } => true,
            _ => false,
        }
    }
}

//! Error types for reconciliation operations.
//!
//! Defines the failures that can occur while polling tracking, retrying
//! provider operations, and delivering requester callbacks. Each variant is
//! categorized so callers can tell storage problems (abort the run) from
//! provider and callback problems (contained to one request).

use std::{fmt, time::Duration};

use postback_core::CoreError;
use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Error types for reconciliation operations.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// Storage query or update failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Tracking provider rejected or failed an operation.
    #[error("provider error: {message}")]
    Provider {
        /// Provider error message
        message: String,
    },

    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request or task exceeded its time budget.
    #[error("operation timed out after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the operation timed out
        timeout_seconds: u64,
    },

    /// Callback URL cannot be used for a notification.
    #[error("invalid callback url {url}: {message}")]
    InvalidCallback {
        /// Offending URL
        url: String,
        /// Why the URL was rejected
        message: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Task pool no longer accepts work.
    #[error("task pool is closed")]
    PoolClosed,

    /// In-flight tasks did not finish before the shutdown deadline.
    #[error("shutdown timed out after {timeout:?} with {abandoned} tasks still running")]
    ShutdownTimeout {
        /// Shutdown deadline that was exceeded
        timeout: Duration,
        /// Tasks aborted at the deadline
        abandoned: usize,
    },

    /// Background task panicked.
    #[error("background task panicked: {message}")]
    TaskPanic {
        /// Join error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal reconciliation error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl ReconcileError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider { message: message.into() }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an invalid callback error.
    pub fn invalid_callback(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCallback { url: url.into(), message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl From<CoreError> for ReconcileError {
    fn from(error: CoreError) -> Self {
        Self::storage(error.to_string())
    }
}

/// Category of reconciliation error for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Storage operations.
    Storage,
    /// Tracking provider.
    Provider,
    /// Callback delivery, including connectivity and bad URLs.
    Callback,
    /// Configuration problems.
    Configuration,
    /// Task pool lifecycle and internal errors.
    Internal,
}

impl From<&ReconcileError> for ErrorCategory {
    fn from(error: &ReconcileError) -> Self {
        match error {
            ReconcileError::Storage { .. } => Self::Storage,
            ReconcileError::Provider { .. } => Self::Provider,
            ReconcileError::Network { .. }
            | ReconcileError::Timeout { .. }
            | ReconcileError::InvalidCallback { .. } => Self::Callback,
            ReconcileError::Configuration { .. } => Self::Configuration,
            ReconcileError::PoolClosed
            | ReconcileError::ShutdownTimeout { .. }
            | ReconcileError::TaskPanic { .. }
            | ReconcileError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Provider => write!(f, "provider"),
            Self::Callback => write!(f, "callback"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

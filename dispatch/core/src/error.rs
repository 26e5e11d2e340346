//! Error Types
//!
//! The dispatch taxonomy. Pool, queue and registry errors are returned
//! synchronously to the caller of the violating operation. State-machine
//! timeouts and idle-sweep disposals never surface here; they are reported
//! through [`crate::events::DispatchEvent`] only.
//!
//! # Error Classes
//!
//! | Class | Variants | Meaning for the caller |
//! |-------|----------|------------------------|
//! | `Backpressure` | `PoolExhausted`, `QueueFull`, `PriorityQueueFull`, `QueueTimeout`, `AlreadyInProgress`, `InsufficientResources` | Try again later |
//! | `Fatal` | provider, registry and configuration errors | Fix the request or the setup |
//! | `Cancelled` | `Aborted`, `ShuttingDown` | The caller (or shutdown) stopped the request |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

// ============================================================================
// Provider Errors
// ============================================================================

/// What went wrong inside a provider call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transport-level failure (refused, reset, DNS)
    Network,
    /// The provider did not answer in time
    Timeout,
    /// The provider asked us to slow down
    RateLimited,
    /// The provider is temporarily down (5xx, overloaded)
    ServiceUnavailable,
    /// The request itself is malformed
    InvalidRequest,
    /// Credentials rejected
    Authentication,
    /// The operation was cancelled
    Cancelled,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Whether an operation failing with this kind is worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::ServiceUnavailable
        )
    }

    /// Short stable label, used to derive retry keys and metric labels
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// An error raised by a provider operation
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    /// Classification used for retry decisions
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl ProviderError {
    /// Create a provider error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Network failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Rate limited by the provider
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// Provider temporarily unavailable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    /// Malformed request
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Whether this error should be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// ============================================================================
// Dispatch Errors
// ============================================================================

/// Coarse grouping of [`DispatchError`] for user-facing handling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Capacity pressure; the same request may succeed later
    Backpressure,
    /// Provider or setup failure
    Fatal,
    /// Stopped by an abort or shutdown
    Cancelled,
}

/// Errors surfaced by the dispatch core
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `acquire` was called for a provider whose pool was never initialized
    #[error("Provider {0} has no initialized connection pool")]
    ProviderNotInitialized(String),

    /// Every pooled connection for the provider is in use and the pool is at capacity
    #[error("Connection pool for {provider} exhausted ({max} connections in use)")]
    PoolExhausted {
        /// Provider whose pool is full
        provider: String,
        /// Configured pool capacity
        max: usize,
    },

    /// A provider with this id is already registered
    #[error("Provider {0} is already registered")]
    AlreadyRegistered(String),

    /// No provider with this id is registered
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// A connect attempt outlived its state deadline
    #[error("Connection to {provider} timed out after {timeout:?}")]
    ConnectionTimeout {
        /// Provider being connected
        provider: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The queue holds `max` items already
    #[error("Request queue full ({max} requests)")]
    QueueFull {
        /// Global queue capacity
        max: usize,
    },

    /// The priority class holds `max` items already
    #[error("Queue for priority {priority} full ({max} requests)")]
    PriorityQueueFull {
        /// Priority class label
        priority: String,
        /// Capacity of that class
        max: usize,
    },

    /// The request expired in the queue before it could start
    #[error("Request {0} timed out waiting in queue")]
    QueueTimeout(String),

    /// A run for this model is already executing
    #[error("Execution for model {0} already in progress")]
    AlreadyInProgress(String),

    /// The scheduler could not reserve any resources for the task
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Retryable failures persisted past the retry budget
    #[error("Gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Total attempts made (initial call included)
        attempts: u32,
        /// The last underlying error
        #[source]
        source: ProviderError,
    },

    /// Non-retryable provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A running task outlived its hard deadline
    #[error("Request {request} exceeded its execution deadline of {timeout:?}")]
    ExecutionTimeout {
        /// Request that overran
        request: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The request was aborted by id
    #[error("Request {0} was aborted")]
    Aborted(String),

    /// No queued or active request has this id
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// The dispatcher is shutting down
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DispatchError {
    /// Which class this error belongs to
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PoolExhausted { .. }
            | Self::QueueFull { .. }
            | Self::PriorityQueueFull { .. }
            | Self::QueueTimeout(_)
            | Self::AlreadyInProgress(_)
            | Self::InsufficientResources(_) => ErrorClass::Backpressure,
            Self::Aborted(_) | Self::ShuttingDown => ErrorClass::Cancelled,
            Self::ProviderNotInitialized(_)
            | Self::AlreadyRegistered(_)
            | Self::ProviderNotFound(_)
            | Self::ConnectionTimeout { .. }
            | Self::ExecutionTimeout { .. }
            | Self::RetryExhausted { .. }
            | Self::Provider(_)
            | Self::RequestNotFound(_)
            | Self::Config(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the caller may reasonably resubmit later
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        self.class() == ErrorClass::Backpressure
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

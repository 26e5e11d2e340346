//! Dispatch Events
//!
//! Every lifecycle notification the core produces, as one closed enum. Callers
//! subscribe through [`EventBus::subscribe`] and match on the variants they
//! care about; there are no string event names to mistype.
//!
//! # Delivery
//!
//! Events go out on a tokio `broadcast` channel. Emitting never blocks and
//! never fails: with no subscribers the event is dropped, and a subscriber
//! that falls behind by more than the channel capacity sees `Lagged` and
//! skips ahead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::connection::pool::ConnectionId;
use crate::connection::state::ConnectionState;
use crate::provider::registry::ProviderStatus;
use crate::scheduling::executor::ConstraintViolation;
use crate::scheduling::metrics::HealthStatus;
use crate::scheduling::queue::{Priority, RequestId};

/// Default broadcast buffer per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by the dispatch core
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    // ============================================
    // Request Lifecycle
    // ============================================
    /// Request admitted into the queue
    Queued {
        /// Request identifier
        request_id: RequestId,
        /// Target provider
        provider_id: String,
        /// Priority class it was queued under
        priority: Priority,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Request began executing on a pooled connection
    Started {
        /// Request identifier
        request_id: RequestId,
        /// Provider serving it
        provider_id: String,
        /// Connection it holds
        connection_id: ConnectionId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Request finished successfully
    Completed {
        /// Request identifier
        request_id: RequestId,
        /// Provider that served it
        provider_id: String,
        /// Wall-clock latency in milliseconds
        latency_ms: u64,
        /// Tokens consumed
        tokens: u32,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Request failed
    Error {
        /// Request identifier
        request_id: RequestId,
        /// Provider it was routed to
        provider_id: String,
        /// Error description
        error: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Request was aborted by id
    Aborted {
        /// Request identifier
        request_id: RequestId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Request expired before it was dequeued
    QueueTimeout {
        /// Request identifier
        request_id: RequestId,
        /// Priority class it waited in
        priority: Priority,
        /// How long it waited
        waited_ms: u64,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    // ============================================
    // Connection Lifecycle
    // ============================================
    /// A connection moved between lifecycle states
    StateChanged {
        /// Provider owning the connection
        provider_id: String,
        /// Connection whose state changed
        connection_id: ConnectionId,
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
        /// Error that accompanied the transition, if any
        error: Option<String>,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A connection entered a specific state (emitted alongside `StateChanged`)
    StateEntered {
        /// Provider owning the connection
        provider_id: String,
        /// Connection that entered the state
        connection_id: ConnectionId,
        /// The state entered
        state: ConnectionState,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Pool entry created for a provider
    PoolInitialized {
        /// Provider whose pool was created
        provider_id: String,
        /// Maximum simultaneous connections
        max_size: usize,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// `acquire` found every connection busy and the pool at capacity
    PoolExhausted {
        /// Provider whose pool is full
        provider_id: String,
        /// Pool capacity
        max_size: usize,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// An idle connection was disposed by the sweep
    ConnectionReclaimed {
        /// Provider owning the connection
        provider_id: String,
        /// Connection that was disposed
        connection_id: ConnectionId,
        /// How long it had been idle
        idle_ms: u64,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    // ============================================
    // Provider Registry
    // ============================================
    /// Provider added to the registry
    ProviderRegistered {
        /// Provider identifier
        provider_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Provider removed from the registry
    ProviderUnregistered {
        /// Provider identifier
        provider_id: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Provider status updated
    ProviderStatusChanged {
        /// Provider identifier
        provider_id: String,
        /// New status
        status: ProviderStatus,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    // ============================================
    // Metrics and Execution
    // ============================================
    /// Provider health recomputed from its error rate
    HealthUpdate {
        /// Provider identifier
        provider_id: String,
        /// Derived health
        status: HealthStatus,
        /// Error rate over all recorded requests (0.0 - 1.0)
        error_rate: f64,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Provider metrics changed
    MetricsUpdated {
        /// Provider identifier
        provider_id: String,
        /// Requests recorded so far
        request_count: u64,
        /// Rolling average latency over the sample window
        avg_latency_ms: f64,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// One task of a batch failed; siblings continue
    TaskFailed {
        /// Model the batch was scheduled for
        model_id: String,
        /// Request that failed
        request_id: RequestId,
        /// Error description
        error: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Execution monitoring flagged a soft limit
    ConstraintViolation {
        /// Request being monitored
        request_id: RequestId,
        /// Which limit was crossed
        violation: ConstraintViolation,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl DispatchEvent {
    /// When the event was produced
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Queued { timestamp, .. }
            | Self::Started { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Aborted { timestamp, .. }
            | Self::QueueTimeout { timestamp, .. }
            | Self::StateChanged { timestamp, .. }
            | Self::StateEntered { timestamp, .. }
            | Self::PoolInitialized { timestamp, .. }
            | Self::PoolExhausted { timestamp, .. }
            | Self::ConnectionReclaimed { timestamp, .. }
            | Self::ProviderRegistered { timestamp, .. }
            | Self::ProviderUnregistered { timestamp, .. }
            | Self::ProviderStatusChanged { timestamp, .. }
            | Self::HealthUpdate { timestamp, .. }
            | Self::MetricsUpdated { timestamp, .. }
            | Self::TaskFailed { timestamp, .. }
            | Self::ConstraintViolation { timestamp, .. } => *timestamp,
        }
    }

    /// The request this event concerns, if any
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Queued { request_id, .. }
            | Self::Started { request_id, .. }
            | Self::Completed { request_id, .. }
            | Self::Error { request_id, .. }
            | Self::Aborted { request_id, .. }
            | Self::QueueTimeout { request_id, .. }
            | Self::TaskFailed { request_id, .. }
            | Self::ConstraintViolation { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// The provider this event concerns, if any
    #[must_use]
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::Queued { provider_id, .. }
            | Self::Started { provider_id, .. }
            | Self::Completed { provider_id, .. }
            | Self::Error { provider_id, .. }
            | Self::StateChanged { provider_id, .. }
            | Self::StateEntered { provider_id, .. }
            | Self::PoolInitialized { provider_id, .. }
            | Self::PoolExhausted { provider_id, .. }
            | Self::ConnectionReclaimed { provider_id, .. }
            | Self::ProviderRegistered { provider_id, .. }
            | Self::ProviderUnregistered { provider_id, .. }
            | Self::ProviderStatusChanged { provider_id, .. }
            | Self::HealthUpdate { provider_id, .. }
            | Self::MetricsUpdated { provider_id, .. } => Some(provider_id),
            _ => None,
        }
    }

    /// Short name of the variant, for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Aborted { .. } => "aborted",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::StateChanged { .. } => "state_changed",
            Self::StateEntered { .. } => "state_entered",
            Self::PoolInitialized { .. } => "pool_initialized",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ConnectionReclaimed { .. } => "connection_reclaimed",
            Self::ProviderRegistered { .. } => "provider_registered",
            Self::ProviderUnregistered { .. } => "provider_unregistered",
            Self::ProviderStatusChanged { .. } => "provider_status_changed",
            Self::HealthUpdate { .. } => "health_update",
            Self::MetricsUpdated { .. } => "metrics_updated",
            Self::TaskFailed { .. } => "task_failed",
            Self::ConstraintViolation { .. } => "constraint_violation",
        }
    }
}

/// Fan-out channel for [`DispatchEvent`]s
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: DispatchEvent) {
        tracing::trace!(event = event.name(), "Dispatch event");
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

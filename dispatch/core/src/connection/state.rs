//! Connection State Machine
//!
//! Lifecycle of one pooled connection:
//!
//! ```text
//!                 ┌──────────────┐
//!        ┌───────►│ Disconnected │◄─────────────────────┐
//!        │        └──────┬───────┘                      │
//!        │               │                              │
//!        │               ▼                              │
//!        │        ┌──────────────┐  timeout   ┌───────┐ │
//!        │        │  Connecting  ├───────────►│ Error ├─┤
//!        │        └──────┬───────┘            └───┬───┘ │
//!        │               │                        │     │
//!        │               ▼                        ▼     │
//!        │        ┌──────────────┐        ┌─────────────┴┐
//!        └────────┤  Connected   │◄───────┤ Reconnecting │
//!                 └──────────────┘        └──────────────┘
//! ```
//!
//! `Connecting` and `Reconnecting` carry deadlines. Entering either arms one
//! [`ScheduledTask`]; any later transition drops it. If it fires first, the
//! machine is forced into `Error`. The expiry is reported only through
//! events, never as an error return.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::pool::ConnectionId;
use crate::config::StateMachineConfig;
use crate::error::DispatchError;
use crate::events::{DispatchEvent, EventBus};
use crate::provider::traits::ModelInfo;
use crate::timer::ScheduledTask;

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected (initial, re-enterable)
    #[default]
    Disconnected,
    /// Connect in flight
    Connecting,
    /// Ready for requests
    Connected,
    /// Last connect or request failed
    Error,
    /// Reconnect in flight after an error
    Reconnecting,
}

impl ConnectionState {
    /// States reachable in one step
    #[must_use]
    pub fn allowed_transitions(&self) -> &'static [ConnectionState] {
        use ConnectionState::{Connected, Connecting, Disconnected, Error, Reconnecting};
        match self {
            Disconnected => &[Connecting, Error],
            Connecting => &[Connected, Error, Reconnecting],
            Connected => &[Disconnected, Error],
            Error => &[Reconnecting, Disconnected],
            Reconnecting => &[Connected, Error, Disconnected],
        }
    }

    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    /// Get display label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Optional data carried by a transition
#[derive(Clone, Debug, Default)]
pub struct TransitionMetadata {
    /// Error that caused the transition
    pub error: Option<String>,
    /// Model reported by the provider
    pub model_info: Option<ModelInfo>,
}

impl TransitionMetadata {
    /// Metadata carrying an error
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            model_info: None,
        }
    }

    /// Metadata carrying model info
    #[must_use]
    pub fn model(info: ModelInfo) -> Self {
        Self {
            error: None,
            model_info: Some(info),
        }
    }
}

/// Snapshot of a machine's state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStateRecord {
    /// State before the last transition
    pub previous: Option<ConnectionState>,
    /// Current state
    pub current: ConnectionState,
    /// When the last transition happened
    pub changed_at: DateTime<Utc>,
    /// Most recent error, if any
    pub last_error: Option<String>,
    /// Model info from the last successful connect
    pub model_info: Option<ModelInfo>,
}

impl Default for ConnectionStateRecord {
    fn default() -> Self {
        Self {
            previous: None,
            current: ConnectionState::Disconnected,
            changed_at: Utc::now(),
            last_error: None,
            model_info: None,
        }
    }
}

struct MachineInner {
    record: ConnectionStateRecord,
    timeout: Option<ScheduledTask>,
    /// Bumped on every transition; a timeout armed in an older epoch is stale
    epoch: u64,
}

struct Shared {
    provider_id: String,
    connection_id: ConnectionId,
    config: StateMachineConfig,
    events: EventBus,
    inner: Mutex<MachineInner>,
}

/// Validated lifecycle for one connection
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("provider_id", &self.shared.provider_id)
            .field("connection_id", &self.shared.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Disconnected`
    pub fn new(
        provider_id: impl Into<String>,
        connection_id: ConnectionId,
        config: StateMachineConfig,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider_id: provider_id.into(),
                connection_id,
                config,
                events,
                inner: Mutex::new(MachineInner {
                    record: ConnectionStateRecord::default(),
                    timeout: None,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Move to `next`
    ///
    /// Returns `false` and leaves the state untouched if the edge is not
    /// allowed.
    pub fn transition_to(&self, next: ConnectionState, metadata: TransitionMetadata) -> bool {
        self.apply(next, metadata, None)
    }

    /// Force back to `Disconnected`, clearing timers, error and model info
    pub fn reset(&self) {
        let from = {
            let mut inner = self.shared.inner.lock();
            inner.timeout = None;
            inner.epoch += 1;
            let from = inner.record.current;
            inner.record = ConnectionStateRecord {
                previous: Some(from),
                ..ConnectionStateRecord::default()
            };
            from
        };

        if from != ConnectionState::Disconnected {
            self.emit_transition(from, ConnectionState::Disconnected, None);
        }
    }

    fn apply(
        &self,
        next: ConnectionState,
        metadata: TransitionMetadata,
        expected_epoch: Option<u64>,
    ) -> bool {
        let shared = &self.shared;
        let from = {
            let mut inner = shared.inner.lock();
            if expected_epoch.is_some_and(|epoch| epoch != inner.epoch) {
                return false;
            }

            let from = inner.record.current;
            if !from.can_transition_to(next) {
                tracing::warn!(
                    provider = %shared.provider_id,
                    connection = %shared.connection_id,
                    from = %from,
                    to = %next,
                    "Invalid connection state transition"
                );
                return false;
            }

            inner.timeout = None;
            inner.epoch += 1;
            inner.record.previous = Some(from);
            inner.record.current = next;
            inner.record.changed_at = Utc::now();
            if metadata.error.is_some() {
                inner.record.last_error = metadata.error.clone();
            }
            if metadata.model_info.is_some() {
                inner.record.model_info = metadata.model_info;
            }

            if let Some(deadline) = shared.config.timeout_for(next) {
                let epoch = inner.epoch;
                let weak: Weak<Shared> = Arc::downgrade(shared);
                inner.timeout = Some(ScheduledTask::after(
                    "connection-state-timeout",
                    deadline,
                    move || {
                        if let Some(shared) = weak.upgrade() {
                            Self { shared }.expire(next, deadline, epoch);
                        }
                    },
                ));
            }
            from
        };

        self.emit_transition(from, next, metadata.error);
        true
    }

    fn expire(&self, state: ConnectionState, deadline: std::time::Duration, epoch: u64) {
        let error = DispatchError::ConnectionTimeout {
            provider: self.shared.provider_id.clone(),
            timeout: deadline,
        };
        tracing::warn!(
            provider = %self.shared.provider_id,
            connection = %self.shared.connection_id,
            state = %state,
            "Connection state deadline expired"
        );
        self.apply(
            ConnectionState::Error,
            TransitionMetadata::error(error.to_string()),
            Some(epoch),
        );
    }

    fn emit_transition(&self, from: ConnectionState, to: ConnectionState, error: Option<String>) {
        let shared = &self.shared;
        tracing::debug!(
            provider = %shared.provider_id,
            connection = %shared.connection_id,
            from = %from,
            to = %to,
            "Connection state changed"
        );
        let timestamp = Utc::now();
        shared.events.emit(DispatchEvent::StateChanged {
            provider_id: shared.provider_id.clone(),
            connection_id: shared.connection_id,
            from,
            to,
            error,
            timestamp,
        });
        shared.events.emit(DispatchEvent::StateEntered {
            provider_id: shared.provider_id.clone(),
            connection_id: shared.connection_id,
            state: to,
            timestamp,
        });
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().record.current
    }

    /// Full record
    #[must_use]
    pub fn record(&self) -> ConnectionStateRecord {
        self.shared.inner.lock().record.clone()
    }

    /// Whether a state deadline is armed
    #[must_use]
    pub fn has_pending_timeout(&self) -> bool {
        self.shared
            .inner
            .lock()
            .timeout
            .as_ref()
            .is_some_and(ScheduledTask::is_active)
    }

    /// Provider this connection belongs to
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.shared.provider_id
    }

    /// Connection this machine tracks
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }
}

//! Request Queue
//!
//! Multi-priority admission queue with:
//! - A global capacity and a capacity per priority class
//! - Strict priority: a lower class is served only when every higher class
//!   is empty; FIFO within a class
//! - Per-item expiry: a request that waits longer than the item timeout is
//!   removed and reported through [`DispatchEvent::QueueTimeout`] and the
//!   expiry handler
//! - An active set tracking dequeued requests until `complete`
//!
//! Each queued item owns its expiry [`ScheduledTask`]. Dequeue, removal and
//! `clear` drop it, so no timer outlives its item.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::QueueConfig;
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventBus};
use crate::timer::ScheduledTask;

// ============================================================================
// Identifiers and Priority
// ============================================================================

/// Priority class
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Served first
    High,
    /// Default class
    #[default]
    Normal,
    /// Served last
    Low,
}

impl Priority {
    /// Get display label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Unique identifier for a request
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }

    /// Borrow as str
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// A request waiting in (or just taken from) the queue
#[derive(Debug)]
pub struct QueuedRequest<T> {
    /// Request id
    pub id: RequestId,
    /// Caller's payload
    pub payload: T,
    /// Class it was queued in
    pub priority: Priority,
    /// Monotonic enqueue time
    pub enqueued_at: Instant,
    /// Wall-clock enqueue time
    pub enqueued_wall: DateTime<Utc>,
}

impl<T> QueuedRequest<T> {
    /// Time spent waiting so far
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// The oldest waiting request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldestRequest {
    /// Request id
    pub id: RequestId,
    /// Its class
    pub priority: Priority,
    /// How long it has waited, in milliseconds
    pub age_ms: u64,
}

/// Queue statistics for back-pressure decisions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Requests waiting across all classes
    pub total_queued: usize,
    /// Requests dequeued and not yet completed
    pub active: usize,
    /// Waiting requests per class
    pub per_priority: BTreeMap<Priority, usize>,
    /// Oldest waiting request, if any
    pub oldest: Option<OldestRequest>,
}

/// Called with each request removed by expiry
pub type ExpiryHandler<T> = Arc<dyn Fn(QueuedRequest<T>) + Send + Sync>;

struct Entry<T> {
    request: QueuedRequest<T>,
    expiry: Option<ScheduledTask>,
}

struct ActiveEntry {
    priority: Priority,
    started_at: Instant,
}

struct QueueInner<T> {
    classes: HashMap<Priority, VecDeque<Entry<T>>>,
    active: HashMap<RequestId, ActiveEntry>,
}

impl<T> QueueInner<T> {
    fn total(&self) -> usize {
        self.classes.values().map(VecDeque::len).sum()
    }

    fn take(&mut self, id: &RequestId) -> Option<Entry<T>> {
        for class in self.classes.values_mut() {
            if let Some(pos) = class.iter().position(|e| &e.request.id == id) {
                return class.remove(pos);
            }
        }
        None
    }
}

struct QueueShared<T> {
    config: QueueConfig,
    inner: Mutex<QueueInner<T>>,
    events: EventBus,
    on_expire: RwLock<Option<ExpiryHandler<T>>>,
}

// ============================================================================
// Request Queue
// ============================================================================

/// Priority admission queue
///
/// Cheap to clone; clones share the same queue.
pub struct RequestQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        let classes = config
            .priority_order
            .iter()
            .map(|p| (*p, VecDeque::new()))
            .collect();
        Self {
            shared: Arc::new(QueueShared {
                config,
                inner: Mutex::new(QueueInner {
                    classes,
                    active: HashMap::new(),
                }),
                events,
                on_expire: RwLock::new(None),
            }),
        }
    }

    /// Install the callback that receives expired requests
    pub fn set_expiry_handler(&self, handler: ExpiryHandler<T>) {
        *self.shared.on_expire.write() = Some(handler);
    }

    /// Admit a request
    ///
    /// Classes missing from the configured priority order have no capacity.
    ///
    /// # Errors
    ///
    /// - `QueueFull` if the queue holds `max_size` requests
    /// - `PriorityQueueFull` if the class is at its capacity
    pub fn enqueue(&self, payload: T, priority: Priority) -> Result<RequestId> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        let max = shared.config.max_size;
        if inner.total() >= max {
            return Err(DispatchError::QueueFull { max });
        }
        let capacity = if shared.config.priority_order.contains(&priority) {
            shared.config.per_priority.get(priority)
        } else {
            0
        };
        let class_len = inner.classes.get(&priority).map_or(0, VecDeque::len);
        if class_len >= capacity {
            return Err(DispatchError::PriorityQueueFull {
                priority: priority.to_string(),
                max: capacity,
            });
        }

        let id = RequestId::generate();
        let timeout = shared.config.item_timeout();
        let expiry = (!timeout.is_zero()).then(|| {
            let weak = Arc::downgrade(shared);
            let expired_id = id.clone();
            ScheduledTask::after("queue-item-expiry", timeout, move || {
                Self::expire(&weak, &expired_id);
            })
        });

        inner.classes.entry(priority).or_default().push_back(Entry {
            request: QueuedRequest {
                id: id.clone(),
                payload,
                priority,
                enqueued_at: Instant::now(),
                enqueued_wall: Utc::now(),
            },
            expiry,
        });

        tracing::debug!(request_id = %id, priority = %priority, queued = inner.total(), "Request queued");
        Ok(id)
    }

    fn expire(weak: &Weak<QueueShared<T>>, id: &RequestId) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let Some(entry) = shared.inner.lock().take(id) else {
            return;
        };

        let request = entry.request;
        let waited = request.waited();
        tracing::warn!(
            request_id = %request.id,
            priority = %request.priority,
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Request expired in queue"
        );
        shared.events.emit(DispatchEvent::QueueTimeout {
            request_id: request.id.clone(),
            priority: request.priority,
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        });

        let handler = shared.on_expire.read().clone();
        if let Some(handler) = handler {
            handler(request);
        }
    }

    /// Take the next request by strict priority, marking it active
    pub fn dequeue(&self) -> Option<QueuedRequest<T>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        for priority in &shared.config.priority_order {
            let entry = inner.classes.get_mut(priority).and_then(VecDeque::pop_front);
            if let Some(Entry { request, expiry }) = entry {
                drop(expiry);
                inner.active.insert(
                    request.id.clone(),
                    ActiveEntry {
                        priority: request.priority,
                        started_at: Instant::now(),
                    },
                );
                return Some(request);
            }
        }
        None
    }

    /// Remove a request from the active set
    ///
    /// Returns false if it was not active.
    pub fn complete(&self, id: &RequestId) -> bool {
        let removed = self.shared.inner.lock().active.remove(id);
        if let Some(entry) = &removed {
            tracing::trace!(
                request_id = %id,
                priority = %entry.priority,
                active_ms = u64::try_from(entry.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Request completed"
            );
        }
        removed.is_some()
    }

    /// Cancel a waiting request
    ///
    /// The request is removed and returned with its timer cancelled. An
    /// active request is left alone: it stays tracked until `complete`, so
    /// its owner can still find and cancel it.
    pub fn remove_request(&self, id: &RequestId) -> Option<QueuedRequest<T>> {
        self.shared.inner.lock().take(id).map(|entry| entry.request)
    }

    /// Drop every waiting request and the active set
    ///
    /// Returns the requests that were waiting, oldest class first.
    pub fn clear(&self) -> Vec<QueuedRequest<T>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        inner.active.clear();
        let mut drained = Vec::new();
        for priority in &shared.config.priority_order {
            if let Some(class) = inner.classes.get_mut(priority) {
                drained.extend(class.drain(..).map(|entry| entry.request));
            }
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Request queue cleared");
        }
        drained
    }

    /// Whether a request is waiting
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.shared
            .inner
            .lock()
            .classes
            .values()
            .any(|class| class.iter().any(|e| &e.request.id == id))
    }

    /// Whether a request is active
    #[must_use]
    pub fn is_active(&self, id: &RequestId) -> bool {
        self.shared.inner.lock().active.contains_key(id)
    }

    /// Requests waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.inner.lock().total()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.shared.inner.lock();
        let per_priority = inner
            .classes
            .iter()
            .map(|(priority, class)| (*priority, class.len()))
            .collect();
        let oldest = inner
            .classes
            .values()
            .filter_map(VecDeque::front)
            .min_by_key(|e| e.request.enqueued_at)
            .map(|e| OldestRequest {
                id: e.request.id.clone(),
                priority: e.request.priority,
                age_ms: u64::try_from(e.request.waited().as_millis()).unwrap_or(u64::MAX),
            });

        QueueStats {
            total_queued: inner.total(),
            active: inner.active.len(),
            per_priority,
            oldest,
        }
    }
}

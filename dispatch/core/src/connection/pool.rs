//! Connection Pool
//!
//! Per-provider sets of reusable connections with:
//! - A hard per-provider limit (default 5)
//! - Exclusive leases: a connection serves one request at a time
//! - Periodic reclamation of connections idle longer than the idle timeout
//!
//! # Design
//!
//! Every provider gets a pool entry on `initialize`. Entries start empty and
//! grow on demand: when no idle connection exists and the entry is under its
//! limit, the provider's factory builds a fresh one. All bookkeeping happens
//! under one lock that is never held across an `.await`, so an acquire or a
//! release is atomic with respect to every other task. Network work
//! (connect, disconnect) happens outside the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::state::{ConnectionState, ConnectionStateMachine, TransitionMetadata};
use crate::config::{PoolConfig, StateMachineConfig};
use crate::error::{DispatchError, ErrorKind, ProviderError, Result};
use crate::events::{DispatchEvent, EventBus};
use crate::provider::traits::{ModelInfo, Provider, ProviderFactory, ProviderSpec};
use crate::timer::ScheduledTask;

/// Unique identifier for a pooled connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a process-unique id
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Leases
// ============================================================================

/// An exclusively held pooled connection
///
/// Returned by [`ConnectionPool::acquire`]; hand it back with
/// [`ConnectionPool::release`].
#[derive(Clone)]
pub struct PooledConnection {
    id: ConnectionId,
    spec: Arc<ProviderSpec>,
    provider: Arc<dyn Provider>,
    state: ConnectionStateMachine,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("provider", &self.spec.id)
            .field("state", &self.state.state())
            .finish()
    }
}

impl PooledConnection {
    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Provider id
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.spec.id
    }

    /// The provider instance
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Lifecycle of this connection
    #[must_use]
    pub fn state_machine(&self) -> &ConnectionStateMachine {
        &self.state
    }

    /// Bring the connection to `Connected`
    ///
    /// From `Disconnected` this goes through `Connecting`, from `Error`
    /// through `Reconnecting`. A failed or timed-out connect leaves the
    /// machine in `Error` and returns the provider's error.
    ///
    /// The connect deadline is the state's timeout, or the provider's own
    /// `connect_timeout_ms` when that is shorter.
    ///
    /// # Errors
    ///
    /// The provider's connect error, or a timeout error if the deadline
    /// passes first.
    pub async fn ensure_connected(
        &self,
        state_config: &StateMachineConfig,
    ) -> std::result::Result<Option<ModelInfo>, ProviderError> {
        let sm = &self.state;
        let attempt_state = match sm.state() {
            ConnectionState::Connected => return Ok(sm.record().model_info),
            ConnectionState::Disconnected => ConnectionState::Connecting,
            ConnectionState::Error => ConnectionState::Reconnecting,
            // Left over from an aborted connect
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                sm.reset();
                ConnectionState::Connecting
            }
        };
        sm.transition_to(attempt_state, TransitionMetadata::default());

        let connect = self.provider.connect(&self.spec.config);
        let deadline = match (
            state_config.timeout_for(attempt_state),
            self.spec.config.connect_timeout(),
        ) {
            (Some(state), Some(own)) => Some(state.min(own)),
            (state, own) => state.or(own),
        };
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, connect).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(format!(
                    "connect to {} exceeded {deadline:?}",
                    self.spec.id
                ))),
            },
            None => connect.await,
        };

        match outcome {
            Ok(info) => {
                let connected =
                    sm.transition_to(ConnectionState::Connected, TransitionMetadata::model(info.clone()));
                if connected {
                    Ok(Some(info))
                } else {
                    // The deadline fired between connect returning and now
                    Err(ProviderError::timeout(format!(
                        "connect to {} completed after its deadline",
                        self.spec.id
                    )))
                }
            }
            Err(e) => {
                if sm.state() != ConnectionState::Error {
                    sm.transition_to(
                        ConnectionState::Error,
                        TransitionMetadata::error(e.to_string()),
                    );
                }
                Err(e)
            }
        }
    }

    /// Note a failed call made over this connection
    ///
    /// Network and timeout failures move a `Connected` connection to
    /// `Error`, so the next `ensure_connected` goes through `Reconnecting`.
    /// Any other failure leaves the link as it is.
    pub fn record_failure(&self, error: &ProviderError) {
        if !matches!(error.kind, ErrorKind::Network | ErrorKind::Timeout) {
            return;
        }
        if self.state.state() == ConnectionState::Connected {
            tracing::debug!(
                connection = %self.id,
                provider = %self.spec.id,
                error = %error,
                "Connection marked failed"
            );
            self.state.transition_to(
                ConnectionState::Error,
                TransitionMetadata::error(error.to_string()),
            );
        }
    }
}

// ============================================================================
// Pool Internals
// ============================================================================

struct Slot {
    lease: PooledConnection,
    in_use: bool,
    last_used_at: Instant,
}

struct ProviderPool {
    spec: Arc<ProviderSpec>,
    factory: Arc<dyn ProviderFactory>,
    max_size: usize,
    slots: Vec<Slot>,
    created: u64,
    disposed: u64,
    exhausted: u64,
}

impl ProviderPool {
    fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

/// Statistics for one provider's pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Provider id
    pub provider_id: String,
    /// Configured limit
    pub max_size: usize,
    /// Connections currently held by requests
    pub in_use: usize,
    /// Connections waiting for reuse
    pub idle: usize,
    /// Connections ever created
    pub created: u64,
    /// Connections disposed by sweep or removal
    pub disposed: u64,
    /// Times `acquire` failed with `PoolExhausted`
    pub exhausted: u64,
}

/// A connection removed from the pool, awaiting disconnect
struct Evicted {
    lease: PooledConnection,
    idle_for: Option<Duration>,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Bounded per-provider connection pools
pub struct ConnectionPool {
    pools: Mutex<HashMap<String, ProviderPool>>,
    config: PoolConfig,
    state_config: StateMachineConfig,
    events: EventBus,
    sweeper: Mutex<Option<ScheduledTask>>,
}

impl ConnectionPool {
    /// Create the pool and start its idle sweep
    ///
    /// The sweep runs every `idle_timeout`. It needs a tokio runtime; outside
    /// one, call [`ConnectionPool::sweep_idle`] manually.
    #[must_use]
    pub fn new(config: PoolConfig, state_config: StateMachineConfig, events: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let sweeper = ScheduledTask::every("pool-idle-sweep", config.idle_timeout(), move || {
                if let Some(pool) = weak.upgrade() {
                    tokio::spawn(async move {
                        pool.sweep_idle().await;
                    });
                }
            });
            Self {
                pools: Mutex::new(HashMap::new()),
                config,
                state_config,
                events,
                sweeper: Mutex::new(Some(sweeper)),
            }
        })
    }

    /// Create an empty pool entry for a provider
    ///
    /// Calling it again for the same provider changes nothing.
    pub fn initialize(&self, spec: ProviderSpec, factory: Arc<dyn ProviderFactory>) {
        let provider_id = spec.id.clone();
        let max_size = spec
            .config
            .max_connections
            .unwrap_or(self.config.max_connections)
            .max(1);
        {
            let mut pools = self.pools.lock();
            if pools.contains_key(&provider_id) {
                return;
            }
            pools.insert(
                provider_id.clone(),
                ProviderPool {
                    spec: Arc::new(spec),
                    factory,
                    max_size,
                    slots: Vec::new(),
                    created: 0,
                    disposed: 0,
                    exhausted: 0,
                },
            );
        }

        tracing::info!(provider = %provider_id, max_size, "Connection pool initialized");
        self.events.emit(DispatchEvent::PoolInitialized {
            provider_id,
            max_size,
            timestamp: Utc::now(),
        });
    }

    /// Whether a provider has a pool entry
    #[must_use]
    pub fn is_initialized(&self, provider_id: &str) -> bool {
        self.pools.lock().contains_key(provider_id)
    }

    /// Lease a connection
    ///
    /// Prefers the most recently used idle connection; otherwise builds a
    /// new one if the pool is under its limit.
    ///
    /// # Errors
    ///
    /// - `ProviderNotInitialized` if `initialize` was never called
    /// - `PoolExhausted` if every connection is leased and the pool is full
    /// - `Provider` if the factory cannot build a connection
    pub fn acquire(&self, provider_id: &str) -> Result<PooledConnection> {
        let mut pools = self.pools.lock();
        let pool = pools
            .get_mut(provider_id)
            .ok_or_else(|| DispatchError::ProviderNotInitialized(provider_id.to_string()))?;

        let idle = pool
            .slots
            .iter_mut()
            .filter(|s| !s.in_use)
            .max_by_key(|s| s.last_used_at);
        if let Some(slot) = idle {
            slot.in_use = true;
            tracing::debug!(provider = %provider_id, connection = %slot.lease.id, "Reusing pooled connection");
            return Ok(slot.lease.clone());
        }

        if pool.slots.len() < pool.max_size {
            let provider = pool.factory.create(&pool.spec)?;
            let id = ConnectionId::next();
            let lease = PooledConnection {
                id,
                spec: Arc::clone(&pool.spec),
                provider,
                state: ConnectionStateMachine::new(
                    provider_id,
                    id,
                    self.state_config.clone(),
                    self.events.clone(),
                ),
            };
            pool.slots.push(Slot {
                lease: lease.clone(),
                in_use: true,
                last_used_at: Instant::now(),
            });
            pool.created += 1;
            tracing::debug!(
                provider = %provider_id,
                connection = %id,
                size = pool.slots.len(),
                "Created pooled connection"
            );
            return Ok(lease);
        }

        pool.exhausted += 1;
        let max = pool.max_size;
        drop(pools);

        tracing::warn!(provider = %provider_id, max, "Connection pool exhausted");
        self.events.emit(DispatchEvent::PoolExhausted {
            provider_id: provider_id.to_string(),
            max_size: max,
            timestamp: Utc::now(),
        });
        Err(DispatchError::PoolExhausted {
            provider: provider_id.to_string(),
            max,
        })
    }

    /// Return a leased connection
    ///
    /// Unknown providers or connections (already disposed) are ignored.
    pub fn release(&self, provider_id: &str, connection: &PooledConnection) {
        let mut pools = self.pools.lock();
        let Some(slot) = pools
            .get_mut(provider_id)
            .and_then(|p| p.slots.iter_mut().find(|s| s.lease.id == connection.id))
        else {
            tracing::debug!(provider = %provider_id, connection = %connection.id, "Release of unknown connection ignored");
            return;
        };
        slot.in_use = false;
        slot.last_used_at = Instant::now();
    }

    /// Dispose idle connections older than the idle timeout
    ///
    /// Leased connections are never touched. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut pools = self.pools.lock();
            for pool in pools.values_mut() {
                let before = pool.slots.len();
                pool.slots.retain(|slot| {
                    let idle_for = now.saturating_duration_since(slot.last_used_at);
                    let stale = !slot.in_use && idle_for > idle_timeout;
                    if stale {
                        evicted.push(Evicted {
                            lease: slot.lease.clone(),
                            idle_for: Some(idle_for),
                        });
                    }
                    !stale
                });
                pool.disposed += u64::try_from(before - pool.slots.len()).unwrap_or(u64::MAX);
            }
        }

        let count = evicted.len();
        if count > 0 {
            tracing::debug!(count, "Reclaiming idle connections");
        }
        self.disconnect_all(evicted).await;
        count
    }

    /// Disconnect and drop one provider's pool entry
    ///
    /// Returns false if the provider had no entry.
    pub async fn remove_provider(&self, provider_id: &str) -> bool {
        let Some(pool) = self.pools.lock().remove(provider_id) else {
            return false;
        };
        let evicted = pool
            .slots
            .into_iter()
            .map(|slot| Evicted {
                lease: slot.lease,
                idle_for: None,
            })
            .collect();
        self.disconnect_all(evicted).await;
        tracing::info!(provider = %provider_id, "Connection pool removed");
        true
    }

    /// Disconnect every connection of every provider and clear all state
    ///
    /// Stops the idle sweep. A failing disconnect is logged and skipped.
    pub async fn dispose(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.cancel();
        }
        let drained: Vec<ProviderPool> = self.pools.lock().drain().map(|(_, p)| p).collect();
        let evicted = drained
            .into_iter()
            .flat_map(|pool| pool.slots)
            .map(|slot| Evicted {
                lease: slot.lease,
                idle_for: None,
            })
            .collect();
        self.disconnect_all(evicted).await;
        tracing::info!("Connection pool disposed");
    }

    async fn disconnect_all(&self, evicted: Vec<Evicted>) {
        for Evicted { lease, idle_for } in evicted {
            if let Err(e) = lease.provider.disconnect().await {
                tracing::warn!(
                    provider = %lease.provider_id(),
                    connection = %lease.id,
                    error = %e,
                    "Disconnect failed during disposal"
                );
            }
            lease.state.reset();
            if let Some(idle_for) = idle_for {
                self.events.emit(DispatchEvent::ConnectionReclaimed {
                    provider_id: lease.provider_id().to_string(),
                    connection_id: lease.id,
                    idle_ms: u64::try_from(idle_for.as_millis()).unwrap_or(u64::MAX),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Statistics for one provider
    #[must_use]
    pub fn stats(&self, provider_id: &str) -> Option<PoolStats> {
        let pools = self.pools.lock();
        pools.get(provider_id).map(|pool| {
            let in_use = pool.in_use();
            PoolStats {
                provider_id: provider_id.to_string(),
                max_size: pool.max_size,
                in_use,
                idle: pool.slots.len() - in_use,
                created: pool.created,
                disposed: pool.disposed,
                exhausted: pool.exhausted,
            }
        })
    }

    /// Statistics for every provider
    #[must_use]
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let ids: Vec<String> = self.pools.lock().keys().cloned().collect();
        let mut stats: Vec<PoolStats> = ids.iter().filter_map(|id| self.stats(id)).collect();
        stats.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        stats
    }

    /// Connection state of every connection of a provider
    #[must_use]
    pub fn connection_states(&self, provider_id: &str) -> Vec<(ConnectionId, ConnectionState)> {
        let pools = self.pools.lock();
        pools
            .get(provider_id)
            .map(|pool| {
                pool.slots
                    .iter()
                    .map(|s| (s.lease.id, s.lease.state.state()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::simulated::{SimulatedBehavior, SimulatedProviderFactory};
    use std::collections::HashSet;

    fn setup(max: usize) -> (Arc<ConnectionPool>, SimulatedProviderFactory) {
        let pool = ConnectionPool::new(
            PoolConfig {
                max_connections: max,
                idle_timeout_ms: 60_000,
            },
            StateMachineConfig::default(),
            EventBus::default(),
        );
        let factory = SimulatedProviderFactory::new(SimulatedBehavior::instant());
        pool.initialize(factory.spec("sim"), Arc::new(factory.clone()));
        (pool, factory)
    }

    #[tokio::test]
    async fn test_acquire_uninitialized_provider() {
        let (pool, _) = setup(2);
        assert!(matches!(
            pool.acquire("ghost"),
            Err(DispatchError::ProviderNotInitialized(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (pool, factory) = setup(2);
        let lease = pool.acquire("sim").unwrap();
        pool.initialize(factory.spec("sim"), Arc::new(factory.clone()));

        let stats = pool.stats("sim").unwrap();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.created, 1);
        pool.release("sim", &lease);
    }

    #[tokio::test]
    async fn test_leases_are_exclusive_and_bounded() {
        let (pool, _) = setup(3);
        let leases: Vec<_> = (0..3).map(|_| pool.acquire("sim").unwrap()).collect();
        let ids: HashSet<_> = leases.iter().map(PooledConnection::id).collect();
        assert_eq!(ids.len(), 3);

        assert!(matches!(
            pool.acquire("sim"),
            Err(DispatchError::PoolExhausted { max: 3, .. })
        ));
        let stats = pool.stats("sim").unwrap();
        assert_eq!(stats.in_use, 3);
        assert_eq!(stats.exhausted, 1);
    }

    #[tokio::test]
    async fn test_sixth_acquire_exhausts_default_pool() {
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            StateMachineConfig::default(),
            EventBus::default(),
        );
        let factory = SimulatedProviderFactory::new(SimulatedBehavior::instant());
        pool.initialize(factory.spec("sim"), Arc::new(factory.clone()));

        let leases: Vec<_> = (0..5).map(|_| pool.acquire("sim").unwrap()).collect();
        assert_eq!(leases.len(), 5);
        assert!(matches!(
            pool.acquire("sim"),
            Err(DispatchError::PoolExhausted { ref provider, max: 5 }) if provider == "sim"
        ));

        let stats = pool.stats("sim").unwrap();
        assert_eq!(stats.max_size, 5);
        assert_eq!(stats.in_use, 5);
        assert_eq!(stats.created, 5);
        assert_eq!(stats.exhausted, 1);
    }

    #[tokio::test]
    async fn test_release_makes_connection_reusable() {
        let (pool, factory) = setup(1);
        let first = pool.acquire("sim").unwrap();
        pool.release("sim", &first);

        let second = pool.acquire("sim").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(factory.script().stats().instances, 1);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let (pool, _) = setup(1);
        let lease = pool.acquire("sim").unwrap();
        pool.release("other", &lease);
        assert_eq!(pool.stats("sim").unwrap().in_use, 1);

        pool.dispose().await;
        pool.release("sim", &lease);
        assert!(pool.stats("sim").is_none());
    }

    #[tokio::test]
    async fn test_per_provider_limit_overrides_global() {
        let (pool, factory) = setup(5);
        let mut spec = factory.spec("small");
        spec.config.max_connections = Some(1);
        pool.initialize(spec, Arc::new(factory.clone()));

        let _lease = pool.acquire("small").unwrap();
        assert!(pool.acquire("small").is_err());
        assert_eq!(pool.stats("small").unwrap().max_size, 1);
    }

    #[tokio::test]
    async fn test_ensure_connected_and_reconnect() {
        let (pool, factory) = setup(1);
        let lease = pool.acquire("sim").unwrap();
        let config = StateMachineConfig::default();

        factory.script().fail_connect_next(1, ErrorKind::Network);
        assert!(lease.ensure_connected(&config).await.is_err());
        assert_eq!(lease.state_machine().state(), ConnectionState::Error);

        let info = lease.ensure_connected(&config).await.unwrap();
        assert_eq!(info.map(|i| i.name), Some("sim-small".to_string()));
        let record = lease.state_machine().record();
        assert_eq!(record.current, ConnectionState::Connected);
        assert_eq!(record.previous, Some(ConnectionState::Reconnecting));

        // Already connected: no new connect call
        lease.ensure_connected(&config).await.unwrap();
        assert_eq!(factory.script().stats().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_connect_timeout_shortens_deadline() {
        let pool = ConnectionPool::new(
            PoolConfig::default(),
            StateMachineConfig::default(),
            EventBus::default(),
        );
        let factory = SimulatedProviderFactory::new(
            SimulatedBehavior::instant().with_connect_latency(Duration::from_secs(10)),
        );
        let mut spec = factory.spec("slow");
        spec.config.connect_timeout_ms = Some(2_000);
        pool.initialize(spec, Arc::new(factory.clone()));
        let lease = pool.acquire("slow").unwrap();

        let started = Instant::now();
        let err = lease
            .ensure_connected(&StateMachineConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(lease.state_machine().state(), ConnectionState::Error);
        assert_eq!(factory.script().stats().connects, 0);
    }

    #[tokio::test]
    async fn test_network_failure_forces_reconnect() {
        let (pool, factory) = setup(1);
        let lease = pool.acquire("sim").unwrap();
        let config = StateMachineConfig::default();
        lease.ensure_connected(&config).await.unwrap();

        lease.record_failure(&ProviderError::rate_limited("slow down"));
        assert_eq!(lease.state_machine().state(), ConnectionState::Connected);

        lease.record_failure(&ProviderError::network("connection reset"));
        let record = lease.state_machine().record();
        assert_eq!(record.current, ConnectionState::Error);
        assert!(record
            .last_error
            .is_some_and(|e| e.contains("connection reset")));

        lease.ensure_connected(&config).await.unwrap();
        let record = lease.state_machine().record();
        assert_eq!(record.current, ConnectionState::Connected);
        assert_eq!(record.previous, Some(ConnectionState::Reconnecting));
        assert_eq!(factory.script().stats().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_stale_idle_connections() {
        let (pool, factory) = setup(3);
        let busy = pool.acquire("sim").unwrap();
        let idle = pool.acquire("sim").unwrap();
        pool.release("sim", &idle);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.sweep_idle().await, 0);

        // The periodic sweep fires at 60s too; either pass may reclaim it
        tokio::time::advance(Duration::from_secs(31)).await;
        pool.sweep_idle().await;
        tokio::task::yield_now().await;

        let stats = pool.stats("sim").unwrap();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.disposed, 1);
        assert_eq!(factory.script().stats().disconnects, 1);

        let states = pool.connection_states("sim");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, busy.id());
    }

    #[tokio::test]
    async fn test_dispose_clears_everything() {
        let (pool, factory) = setup(2);
        let _a = pool.acquire("sim").unwrap();
        let b = pool.acquire("sim").unwrap();
        pool.release("sim", &b);

        pool.dispose().await;
        assert!(!pool.is_initialized("sim"));
        assert_eq!(factory.script().stats().disconnects, 2);
        assert!(pool.all_stats().is_empty());
    }
}

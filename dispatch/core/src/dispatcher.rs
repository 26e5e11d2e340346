//! Dispatcher
//!
//! The application context: owns one instance of every component and drives
//! admitted requests through them.
//!
//! ```text
//! enqueue ─▶ RequestQueue ─▶ worker (slot, then dequeue) ─▶ ConnectionPool.acquire
//!                                                              │
//!            MetricsTracker ◀── Executor.run ◀── RetryCoordinator ◀── ensure_connected
//!                                   │
//!                                   └─▶ ConnectionPool.release, reply to caller
//! ```
//!
//! The worker takes an execution slot before it dequeues, so a request stays
//! in the queue (where its expiry timer can fire) until capacity frees up.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::connection::{ConnectionId, ConnectionPool, ConnectionState, PoolStats, PooledConnection};
use crate::error::{DispatchError, ErrorClass, ProviderError, Result};
use crate::events::{DispatchEvent, EventBus};
use crate::provider::{
    CompletionRequest, CompletionResponse, ProviderFactory, ProviderRegistry, ProviderSpec,
    ProviderStatus, StreamingToken, TokenUsage,
};
use crate::scheduling::{
    BatchReport, BatchTask, ConstraintViolation, ExecutionReport, Executor, JitterSource,
    MetricsSnapshot, MetricsTracker, Priority, QueueStats, QueuedRequest, RequestId,
    RequestQueue, RequestStatus, RetryCoordinator, Scheduler, ThreadJitter,
};

/// Buffer between the provider stream and the caller
const STREAM_BUFFER: usize = 32;

// ============================================================================
// Results and Handles
// ============================================================================

/// A completed request
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    /// Request identifier
    pub request_id: RequestId,
    /// Provider that served it
    pub provider_id: String,
    /// What the provider returned
    pub response: CompletionResponse,
    /// Execution latency in milliseconds (queue wait excluded)
    pub latency_ms: u64,
    /// Soft limits crossed while running
    pub violations: Vec<ConstraintViolation>,
}

/// A completed streaming request
#[derive(Clone, Debug)]
pub struct StreamOutcome {
    /// Request identifier
    pub request_id: RequestId,
    /// Provider that served it
    pub provider_id: String,
    /// Full response text
    pub message: String,
    /// Token accounting
    pub usage: TokenUsage,
    /// Execution latency in milliseconds
    pub latency_ms: u64,
    /// Soft limits crossed while running
    pub violations: Vec<ConstraintViolation>,
}

/// Waits for one admitted request
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    reply: oneshot::Receiver<Result<DispatchOutcome>>,
}

impl RequestHandle {
    /// The request's id
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the result
    ///
    /// # Errors
    ///
    /// Whatever ended the request: queue timeout, abort, provider failure.
    pub async fn wait(self) -> Result<DispatchOutcome> {
        self.reply.await.map_err(|_| DispatchError::ShuttingDown)?
    }
}

/// Receives tokens from one admitted streaming request
#[derive(Debug)]
pub struct StreamHandle {
    id: RequestId,
    tokens: mpsc::Receiver<StreamingToken>,
    done: oneshot::Receiver<Result<StreamOutcome>>,
}

impl StreamHandle {
    /// The request's id
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Next token; `None` once the stream has ended
    pub async fn next_token(&mut self) -> Option<StreamingToken> {
        self.tokens.recv().await
    }

    /// Stop reading tokens and wait for the final result
    ///
    /// # Errors
    ///
    /// Whatever ended the request.
    pub async fn finish(self) -> Result<StreamOutcome> {
        drop(self.tokens);
        self.done.await.map_err(|_| DispatchError::ShuttingDown)?
    }
}

// ============================================================================
// Queued Work
// ============================================================================

enum Reply {
    Complete(oneshot::Sender<Result<DispatchOutcome>>),
    Stream {
        tokens: mpsc::Sender<StreamingToken>,
        done: oneshot::Sender<Result<StreamOutcome>>,
    },
}

impl Reply {
    fn fail(self, error: DispatchError) {
        // The caller may have stopped waiting
        match self {
            Self::Complete(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Stream { done, .. } => {
                let _ = done.send(Err(error));
            }
        }
    }
}

struct Job {
    provider_id: String,
    request: CompletionRequest,
    reply: Reply,
}

/// Returns a pooled connection when dropped
struct Lease {
    pool: Arc<ConnectionPool>,
    connection: PooledConnection,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool
            .release(self.connection.provider_id(), &self.connection);
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Owns and wires every dispatch component
pub struct Dispatcher {
    config: DispatchConfig,
    events: EventBus,
    registry: ProviderRegistry,
    pool: Arc<ConnectionPool>,
    queue: RequestQueue<Job>,
    retry: RetryCoordinator,
    executor: Arc<Executor>,
    metrics: Arc<MetricsTracker>,
    statuses: Arc<DashMap<RequestId, RequestStatus>>,
    in_flight: DashMap<RequestId, CancellationToken>,
    wake: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build every component from `config`
    ///
    /// Call from within a tokio runtime; the pool's idle sweep and queue
    /// expiry timers run on it.
    #[must_use]
    pub fn new(config: DispatchConfig) -> Arc<Self> {
        Self::with_jitter(config, Arc::new(ThreadJitter))
    }

    /// Like [`Dispatcher::new`] with a specific retry jitter source
    #[must_use]
    pub fn with_jitter(config: DispatchConfig, jitter: Arc<dyn JitterSource>) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        let registry = ProviderRegistry::new(events.clone());
        let pool = ConnectionPool::new(
            config.pool.clone(),
            config.state_machine.clone(),
            events.clone(),
        );
        let metrics = Arc::new(MetricsTracker::new(config.metrics.clone(), events.clone()));
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), Arc::clone(&metrics)));
        let executor = Arc::new(Executor::new(
            config.executor.clone(),
            scheduler,
            Arc::clone(&metrics),
            events.clone(),
        ));
        let retry = RetryCoordinator::with_jitter(config.retry.clone(), jitter);

        let statuses: Arc<DashMap<RequestId, RequestStatus>> = Arc::new(DashMap::new());
        let queue = RequestQueue::new(config.queue.clone(), events.clone());
        {
            let statuses = Arc::clone(&statuses);
            queue.set_expiry_handler(Arc::new(move |expired: QueuedRequest<Job>| {
                statuses.insert(expired.id.clone(), RequestStatus::TimedOut);
                expired
                    .payload
                    .reply
                    .fail(DispatchError::QueueTimeout(expired.id.to_string()));
            }));
        }

        tracing::info!(
            max_concurrent = config.executor.max_concurrent,
            queue_max = config.queue.max_size,
            pool_max = config.pool.max_connections,
            source = ?config.source(),
            "Dispatcher created"
        );

        Arc::new(Self {
            config,
            events,
            registry,
            pool,
            queue,
            retry,
            executor,
            metrics,
            statuses,
            in_flight: DashMap::new(),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    // ========================================================================
    // Providers
    // ========================================================================

    /// Register a provider and create its connection pool
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the id is taken.
    pub fn add_provider(&self, spec: ProviderSpec, factory: Arc<dyn ProviderFactory>) -> Result<()> {
        self.registry.register_provider(spec.clone())?;
        self.pool.initialize(spec, factory);
        Ok(())
    }

    /// Unregister a provider and dispose its connections
    ///
    /// # Errors
    ///
    /// `ProviderNotFound` if the id is unknown.
    pub async fn remove_provider(&self, provider_id: &str) -> Result<()> {
        self.registry.unregister_provider(provider_id)?;
        self.pool.remove_provider(provider_id).await;
        self.metrics.remove(provider_id);
        Ok(())
    }

    /// Mark a provider active or inactive for routing
    ///
    /// # Errors
    ///
    /// `ProviderNotFound` if the id is unknown.
    pub fn set_provider_status(&self, provider_id: &str, status: ProviderStatus) -> Result<()> {
        self.registry.update_provider_state(provider_id, status)
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Admit a completion request
    ///
    /// With no `provider`, the first active provider in registration order
    /// serves it.
    ///
    /// # Errors
    ///
    /// - `ShuttingDown` after [`Dispatcher::shutdown`]
    /// - `ProviderNotFound` if the provider is unknown or inactive
    /// - `QueueFull` / `PriorityQueueFull` under back-pressure
    pub fn enqueue(
        &self,
        provider: Option<&str>,
        request: CompletionRequest,
        priority: Priority,
    ) -> Result<RequestHandle> {
        let provider_id = self.resolve_provider(provider)?;
        let (tx, rx) = oneshot::channel();
        let id = self.admit(provider_id, request, priority, Reply::Complete(tx))?;
        Ok(RequestHandle { id, reply: rx })
    }

    /// Admit a request and wait for its result
    ///
    /// # Errors
    ///
    /// Admission errors, then whatever ended the request.
    pub async fn execute(
        &self,
        provider: Option<&str>,
        request: CompletionRequest,
        priority: Priority,
    ) -> Result<DispatchOutcome> {
        self.enqueue(provider, request, priority)?.wait().await
    }

    /// Admit a streaming request
    ///
    /// # Errors
    ///
    /// Same admission errors as [`Dispatcher::enqueue`].
    pub fn execute_streaming(
        &self,
        provider: Option<&str>,
        request: CompletionRequest,
        priority: Priority,
    ) -> Result<StreamHandle> {
        let provider_id = self.resolve_provider(provider)?;
        let (tokens_tx, tokens_rx) = mpsc::channel(STREAM_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();
        let id = self.admit(
            provider_id,
            request,
            priority,
            Reply::Stream {
                tokens: tokens_tx,
                done: done_tx,
            },
        )?;
        Ok(StreamHandle {
            id,
            tokens: tokens_rx,
            done: done_rx,
        })
    }

    /// Run `requests` against one provider as a batch for `model_id`
    ///
    /// Tasks bypass the admission queue but share the execution ceiling.
    /// One task failing does not affect the others.
    ///
    /// # Errors
    ///
    /// `AlreadyInProgress` if a batch for `model_id` is running.
    pub async fn run_batch(
        self: &Arc<Self>,
        model_id: &str,
        provider_id: &str,
        requests: Vec<CompletionRequest>,
    ) -> Result<BatchReport<CompletionResponse>> {
        let tasks = requests
            .into_iter()
            .map(|request| {
                let this = Arc::clone(self);
                let request_id = RequestId::generate();
                let op_id = request_id.to_string();
                let provider = provider_id.to_string();
                BatchTask {
                    request_id,
                    provider_id: provider_id.to_string(),
                    operation: Box::pin(async move {
                        this.complete_once(&op_id, &provider, request).await
                    }),
                }
            })
            .collect();
        self.executor.execute_batch(model_id, tasks).await
    }

    /// Abort a queued or running request
    ///
    /// # Errors
    ///
    /// `RequestNotFound` if it is neither queued nor running.
    pub fn abort(&self, id: &RequestId) -> Result<()> {
        if let Some(queued) = self.queue.remove_request(id) {
            tracing::info!(request_id = %id, "Aborted queued request");
            self.statuses.insert(id.clone(), RequestStatus::Aborted);
            self.events.emit(DispatchEvent::Aborted {
                request_id: id.clone(),
                timestamp: Utc::now(),
            });
            queued
                .payload
                .reply
                .fail(DispatchError::Aborted(id.to_string()));
            return Ok(());
        }

        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(entry) => {
                tracing::info!(request_id = %id, "Aborting running request");
                entry.get().cancel();
                Ok(())
            }
            // Dequeued but not yet registered by the worker: leave a
            // cancelled token for it to pick up
            Entry::Vacant(entry) if self.queue.is_active(id) => {
                tracing::info!(request_id = %id, "Aborting request before start");
                let token = self.shutdown.child_token();
                token.cancel();
                entry.insert(token);
                Ok(())
            }
            Entry::Vacant(_) => Err(DispatchError::RequestNotFound(id.to_string())),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the worker that drains the queue
    ///
    /// Calling it again while the worker runs does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { this.run_worker().await }));
        tracing::info!("Dispatcher started");
    }

    /// Stop accepting work and tear everything down
    ///
    /// Queued requests resolve with `ShuttingDown`; running ones are
    /// cancelled; then the pool is disposed.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(
            queued = self.queue.len(),
            running = self.in_flight.len(),
            "Dispatcher shutting down"
        );
        self.shutdown.cancel();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        for queued in self.queue.clear() {
            self.statuses.insert(queued.id.clone(), RequestStatus::Aborted);
            queued.payload.reply.fail(DispatchError::ShuttingDown);
        }

        self.executor
            .shutdown(self.config.executor.acquire_timeout())
            .await;
        self.pool.dispose().await;
        tracing::info!("Dispatcher stopped");
    }

    /// Whether [`Dispatcher::shutdown`] has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Subscribe to dispatch events
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Connection pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Executor
    #[must_use]
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Metrics tracker
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    /// Status of a request this dispatcher has seen
    #[must_use]
    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.statuses.get(id).map(|s| *s)
    }

    /// Queue statistics
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Metrics for one provider
    #[must_use]
    pub fn metrics_snapshot(&self, provider_id: &str) -> Option<MetricsSnapshot> {
        self.metrics.snapshot(provider_id)
    }

    /// Pool statistics for one provider
    #[must_use]
    pub fn pool_stats(&self, provider_id: &str) -> Option<PoolStats> {
        self.pool.stats(provider_id)
    }

    /// Lifecycle state of each pooled connection of a provider
    #[must_use]
    pub fn connection_states(&self, provider_id: &str) -> Vec<(ConnectionId, ConnectionState)> {
        self.pool.connection_states(provider_id)
    }

    /// Requests currently executing
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn resolve_provider(&self, provider: Option<&str>) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        match provider {
            Some(id) => match self.registry.state(id) {
                Some(ProviderStatus::Active) => Ok(id.to_string()),
                Some(status) => Err(DispatchError::ProviderNotFound(format!(
                    "{id} is {}",
                    status.label()
                ))),
                None => Err(DispatchError::ProviderNotFound(id.to_string())),
            },
            None => self
                .registry
                .get_next_available_provider()
                .map(|r| r.id)
                .ok_or_else(|| DispatchError::ProviderNotFound("no active provider".to_string())),
        }
    }

    fn admit(
        &self,
        provider_id: String,
        request: CompletionRequest,
        priority: Priority,
        reply: Reply,
    ) -> Result<RequestId> {
        let job = Job {
            provider_id: provider_id.clone(),
            request,
            reply,
        };
        let id = self.queue.enqueue(job, priority)?;
        self.statuses
            .entry(id.clone())
            .or_insert(RequestStatus::Queued);

        tracing::debug!(request_id = %id, provider = %provider_id, priority = %priority, "Request queued");
        self.events.emit(DispatchEvent::Queued {
            request_id: id.clone(),
            provider_id,
            priority,
            timestamp: Utc::now(),
        });
        self.wake.notify_one();
        Ok(id)
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                () = self.shutdown.cancelled() => break,
                permit = self.executor.wait_for_slot() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = loop {
                if let Some(job) = self.queue.dequeue() {
                    break Some(job);
                }
                tokio::select! {
                    () = self.shutdown.cancelled() => break None,
                    () = self.wake.notified() => {}
                }
            };
            let Some(job) = job else { break };

            let cancel = self
                .in_flight
                .entry(job.id.clone())
                .or_insert_with(|| self.shutdown.child_token())
                .clone();
            self.statuses.insert(job.id.clone(), RequestStatus::Running);

            let this = Arc::clone(&self);
            tokio::spawn(async move { this.process(job, permit, cancel).await });
        }
        tracing::debug!("Dispatcher worker exited");
    }

    async fn process(
        self: Arc<Self>,
        queued: QueuedRequest<Job>,
        permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) {
        let id = queued.id;
        let Job {
            provider_id,
            request,
            reply,
        } = queued.payload;
        tracing::debug!(
            request_id = %id,
            provider = %provider_id,
            waited_ms = elapsed_ms(queued.enqueued_at),
            "Request dequeued"
        );

        if cancel.is_cancelled() {
            drop(permit);
            let e = if self.shutdown.is_cancelled() {
                DispatchError::ShuttingDown
            } else {
                DispatchError::Aborted(id.to_string())
            };
            self.settle_error(&id, &provider_id, &e, None, None);
            reply.fail(e);
            self.finish(&id);
            return;
        }

        let lease = match self.pool.acquire(&provider_id) {
            Ok(connection) => Lease {
                pool: Arc::clone(&self.pool),
                connection,
            },
            Err(e) => {
                drop(permit);
                self.settle_error(&id, &provider_id, &e, None, None);
                reply.fail(e);
                self.finish(&id);
                return;
            }
        };

        self.events.emit(DispatchEvent::Started {
            request_id: id.clone(),
            provider_id: provider_id.clone(),
            connection_id: lease.connection.id(),
            timestamp: Utc::now(),
        });
        let started = Instant::now();
        let connection = &lease.connection;

        match reply {
            Reply::Complete(tx) => {
                let op = self.call_with_retry(id.as_str(), connection, &request);
                let result = self
                    .executor
                    .run(permit, id.clone(), &provider_id, cancel, op)
                    .await;
                let result = self.settle(&id, connection, started, result, |r: &CompletionResponse| {
                    r.usage.total()
                });
                let _ = tx.send(result.map(|report| DispatchOutcome {
                    latency_ms: report.elapsed_ms(),
                    request_id: report.request_id,
                    provider_id: report.provider_id,
                    response: report.value,
                    violations: report.violations,
                }));
            }
            Reply::Stream { tokens, done } => {
                let op = self.forward_stream(id.as_str(), connection, &request, tokens);
                let result = self
                    .executor
                    .run(permit, id.clone(), &provider_id, cancel, op)
                    .await;
                let result = self.settle(
                    &id,
                    connection,
                    started,
                    result,
                    |(_, usage): &(String, TokenUsage)| usage.total(),
                );
                let _ = done.send(result.map(|report| {
                    let latency_ms = report.elapsed_ms();
                    let (message, usage) = report.value;
                    StreamOutcome {
                        latency_ms,
                        request_id: report.request_id,
                        provider_id: report.provider_id,
                        message,
                        usage,
                        violations: report.violations,
                    }
                }));
            }
        }

        if matches!(self.status(&id), Some(RequestStatus::Aborted)) {
            lease.connection.provider().cancel().await;
        }
        drop(lease);
        self.finish(&id);
    }

    /// Connect if needed and complete, retrying transient failures
    async fn call_with_retry(
        &self,
        op_id: &str,
        connection: &PooledConnection,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let state_config = &self.config.state_machine;
        self.retry
            .run(op_id, |_| async move {
                connection.ensure_connected(state_config).await?;
                let result = connection.provider().generate_completion(request).await;
                if let Err(e) = &result {
                    connection.record_failure(e);
                }
                result
            })
            .await
    }

    /// Open a stream (retrying transient failures) and forward its tokens
    async fn forward_stream(
        &self,
        op_id: &str,
        connection: &PooledConnection,
        request: &CompletionRequest,
        tokens: mpsc::Sender<StreamingToken>,
    ) -> Result<(String, TokenUsage)> {
        let state_config = &self.config.state_machine;
        let mut stream = self
            .retry
            .run(op_id, |_| async move {
                connection.ensure_connected(state_config).await?;
                let result = connection.provider().stream_completion(request).await;
                if let Err(e) = &result {
                    connection.record_failure(e);
                }
                result
            })
            .await?;

        while let Some(token) = stream.recv().await {
            match token {
                StreamingToken::Token(text) => {
                    // A caller that stopped reading still gets the final result
                    let _ = tokens.send(StreamingToken::Token(text)).await;
                }
                StreamingToken::Complete { message, usage } => {
                    let _ = tokens
                        .send(StreamingToken::Complete {
                            message: message.clone(),
                            usage,
                        })
                        .await;
                    return Ok((message, usage));
                }
                StreamingToken::Error(e) => {
                    connection.record_failure(&e);
                    let _ = tokens.send(StreamingToken::Error(e.clone())).await;
                    return Err(DispatchError::Provider(e));
                }
            }
        }
        Err(DispatchError::Provider(ProviderError::network(format!(
            "stream from {} closed before completion",
            connection.provider_id()
        ))))
    }

    /// One batch task: lease a connection, complete, record the outcome
    async fn complete_once(
        &self,
        op_id: &str,
        provider_id: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let lease = Lease {
            pool: Arc::clone(&self.pool),
            connection: self.pool.acquire(provider_id)?,
        };
        let started = Instant::now();
        let result = self
            .call_with_retry(op_id, &lease.connection, &request)
            .await;
        let latency_ms = elapsed_ms(started);
        match &result {
            Ok(response) => {
                self.metrics
                    .record_success(provider_id, latency_ms, response.usage.total());
            }
            Err(e) if e.class() == ErrorClass::Fatal => {
                self.metrics.record_error(provider_id, e, Some(latency_ms));
            }
            Err(_) => {}
        }
        result
    }

    /// Record metrics, status and events for a finished execution
    fn settle<T>(
        &self,
        id: &RequestId,
        connection: &PooledConnection,
        started: Instant,
        result: Result<ExecutionReport<T>>,
        tokens: impl Fn(&T) -> u32,
    ) -> Result<ExecutionReport<T>> {
        let provider_id = connection.provider_id();
        match result {
            Ok(report) => {
                let latency_ms = report.elapsed_ms();
                let used = tokens(&report.value);
                self.metrics.record_success(provider_id, latency_ms, used);
                self.statuses.insert(id.clone(), RequestStatus::Completed);
                tracing::debug!(request_id = %id, provider = provider_id, latency_ms, "Request completed");
                self.events.emit(DispatchEvent::Completed {
                    request_id: id.clone(),
                    provider_id: provider_id.to_string(),
                    latency_ms,
                    tokens: used,
                    timestamp: Utc::now(),
                });
                Ok(report)
            }
            Err(DispatchError::Aborted(_)) if self.shutdown.is_cancelled() => {
                let e = DispatchError::ShuttingDown;
                self.settle_error(id, provider_id, &e, Some(started), Some(connection));
                Err(e)
            }
            Err(e) => {
                self.settle_error(id, provider_id, &e, Some(started), Some(connection));
                Err(e)
            }
        }
    }

    fn settle_error(
        &self,
        id: &RequestId,
        provider_id: &str,
        error: &DispatchError,
        started: Option<Instant>,
        connection: Option<&PooledConnection>,
    ) {
        let status = RequestStatus::for_error(error);
        self.statuses.insert(id.clone(), status);

        if error.class() == ErrorClass::Fatal {
            self.metrics
                .record_error(provider_id, error, started.map(elapsed_ms));
        }

        if status == RequestStatus::Aborted {
            tracing::info!(request_id = %id, provider = provider_id, "Request aborted");
            self.events.emit(DispatchEvent::Aborted {
                request_id: id.clone(),
                timestamp: Utc::now(),
            });
        } else {
            tracing::warn!(
                request_id = %id,
                provider = provider_id,
                connection = ?connection.map(PooledConnection::id),
                error = %error,
                "Request failed"
            );
            self.events.emit(DispatchEvent::Error {
                request_id: id.clone(),
                provider_id: provider_id.to_string(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Active entry goes first so a late `abort` cannot leave a token behind
    fn finish(&self, id: &RequestId) {
        self.queue.complete(id);
        self.in_flight.remove(id);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

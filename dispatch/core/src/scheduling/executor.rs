//! Task Execution
//!
//! Runs admitted work under the global concurrency ceiling, holding a
//! resource reservation for the task's lifetime and sampling it once per
//! monitoring tick.
//!
//! ```text
//!   permit (≤ max_concurrent) ─▶ reserve budget ─▶ select! {
//!                                                     cancelled   → Aborted
//!                                                     operation   → report
//!                                                     hard limit  → ExecutionTimeout
//!                                                     tick        → sample, flag soft limits
//!                                                  }
//! ```
//!
//! Soft limits (time limit, reserved resources) never fail a task. Crossing
//! one attaches a [`ConstraintViolation`] to the report and emits an event.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::metrics::MetricsTracker;
use super::queue::RequestId;
use super::resources::{ReservedUsageProbe, ResourceAllocation, UsageProbe};
use super::scheduler::{SchedulePlan, Scheduler};
use crate::config::ExecutorConfig;
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventBus};

// ============================================================================
// Status and Violations
// ============================================================================

/// Where a request is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting in the admission queue
    Queued,
    /// Executing on a connection
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by an abort or shutdown
    Aborted,
    /// Expired in the queue or overran its deadline
    TimedOut,
}

impl RequestStatus {
    /// Whether the request will not change status again
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Terminal status for a request that ended with `error`
    #[must_use]
    pub fn for_error(error: &DispatchError) -> Self {
        match error {
            DispatchError::Aborted(_) | DispatchError::ShuttingDown => Self::Aborted,
            DispatchError::QueueTimeout(_) | DispatchError::ExecutionTimeout { .. } => {
                Self::TimedOut
            }
            _ => Self::Failed,
        }
    }
}

/// A soft limit crossed while a task ran
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintViolation {
    /// Ran longer than the configured time limit
    ExceedsTimeLimit {
        /// The limit
        limit_ms: u64,
        /// Elapsed time when flagged
        elapsed_ms: u64,
    },
    /// Used more than it reserved
    ExceedsResourceLimits {
        /// What the task reserved
        allocated: ResourceAllocation,
        /// What was observed
        observed: ResourceAllocation,
    },
}

// ============================================================================
// Reports
// ============================================================================

/// Result of one monitored execution
#[derive(Debug)]
pub struct ExecutionReport<T> {
    /// Request that ran
    pub request_id: RequestId,
    /// Provider it ran against
    pub provider_id: String,
    /// What the operation produced
    pub value: T,
    /// Wall time from start to finish
    pub elapsed: Duration,
    /// Budget reserved for the task
    pub allocation: ResourceAllocation,
    /// Highest usage sampled
    pub peak_usage: ResourceAllocation,
    /// Monitoring ticks observed
    pub samples: u32,
    /// Soft limits crossed
    pub violations: Vec<ConstraintViolation>,
}

impl<T> ExecutionReport<T> {
    /// Elapsed time in milliseconds
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// One unit of a batch
pub struct BatchTask<T> {
    /// Request identifier
    pub request_id: RequestId,
    /// Provider the work targets
    pub provider_id: String,
    /// The work itself
    pub operation: BoxFuture<'static, Result<T>>,
}

impl<T> BatchTask<T> {
    /// Task with a generated request id
    pub fn new(
        provider_id: impl Into<String>,
        operation: impl Future<Output = Result<T>> + Send + 'static,
    ) -> Self {
        Self {
            request_id: RequestId::generate(),
            provider_id: provider_id.into(),
            operation: Box::pin(operation),
        }
    }
}

/// How one batch task ended
#[derive(Debug)]
pub struct TaskOutcome<T> {
    /// Request identifier
    pub request_id: RequestId,
    /// Terminal status
    pub status: RequestStatus,
    /// Report or error
    pub result: Result<ExecutionReport<T>>,
}

/// Everything a batch run produced
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Model the batch ran for
    pub model_id: String,
    /// Slot plan made before the run
    pub plan: SchedulePlan,
    /// Outcomes in task order
    pub outcomes: Vec<TaskOutcome<T>>,
}

impl<T> BatchReport<T> {
    /// Tasks that completed
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == RequestStatus::Completed)
            .count()
    }

    /// Tasks that did not complete
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Bounded, monitored execution
pub struct Executor {
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsTracker>,
    probe: Arc<dyn UsageProbe>,
    events: EventBus,
}

impl Executor {
    /// Executor with `config.max_concurrent` slots
    #[must_use]
    pub fn new(
        config: ExecutorConfig,
        scheduler: Arc<Scheduler>,
        metrics: Arc<MetricsTracker>,
        events: EventBus,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            permits,
            scheduler,
            metrics,
            probe: Arc::new(ReservedUsageProbe),
            events,
        }
    }

    /// Replace the usage probe sampled at each tick
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Scheduler sizing the budgets
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Executions currently holding a slot
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// Wait as long as it takes for a slot
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once the executor is closed.
    pub async fn wait_for_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ShuttingDown)
    }

    /// Wait up to `wait` for a slot
    ///
    /// # Errors
    ///
    /// - `QueueTimeout` if no slot frees up in time
    /// - `ShuttingDown` once the executor is closed
    pub async fn acquire_slot(
        &self,
        request_id: &RequestId,
        wait: Duration,
    ) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(wait, self.wait_for_slot()).await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(request_id = %request_id, wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "No execution slot in time");
                Err(DispatchError::QueueTimeout(request_id.to_string()))
            }
        }
    }

    /// Acquire a slot (bounded by `acquire_timeout`) and run `operation`
    ///
    /// # Errors
    ///
    /// Slot acquisition errors, plus everything [`Executor::run`] returns.
    pub async fn execute<T, Fut>(
        &self,
        request_id: RequestId,
        provider_id: &str,
        cancel: CancellationToken,
        operation: Fut,
    ) -> Result<ExecutionReport<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        let permit = self
            .acquire_slot(&request_id, self.config.acquire_timeout())
            .await?;
        self.run(permit, request_id, provider_id, cancel, operation)
            .await
    }

    /// Run `operation` on an already-held slot
    ///
    /// The slot and the resource reservation are released when this returns.
    ///
    /// # Errors
    ///
    /// - `InsufficientResources` if no budget can be reserved
    /// - `Aborted` if `cancel` fires first
    /// - `ExecutionTimeout` if the hard deadline passes first
    /// - whatever `operation` itself fails with
    pub async fn run<T, Fut>(
        &self,
        permit: OwnedSemaphorePermit,
        request_id: RequestId,
        provider_id: &str,
        cancel: CancellationToken,
        operation: Fut,
    ) -> Result<ExecutionReport<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.run_capped(permit, request_id, provider_id, cancel, operation, None)
            .await
    }

    /// `run`, with the reservation capped by a planned slot budget
    async fn run_capped<T, Fut>(
        &self,
        permit: OwnedSemaphorePermit,
        request_id: RequestId,
        provider_id: &str,
        cancel: CancellationToken,
        operation: Fut,
        ceiling: Option<ResourceAllocation>,
    ) -> Result<ExecutionReport<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _permit = permit;
        let reservation = self
            .scheduler
            .reserve_within(provider_id, ceiling.as_ref())?;
        let allocation = reservation.allocation();
        let total = self.scheduler.ledger().total();

        let time_limit = self.config.time_limit();
        let hard_limit = self.config.task_timeout();
        let tick = self.config.monitor_interval();

        let started = Instant::now();
        let deadline = tokio::time::sleep(hard_limit);
        let mut ticker = interval_at(started + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(deadline);
        tokio::pin!(operation);

        let mut monitor = Monitor::new(allocation);

        tracing::debug!(
            request_id = %request_id,
            provider = provider_id,
            cpu = allocation.cpu,
            memory_mb = allocation.memory_mb,
            gpu = allocation.gpu,
            "Execution started"
        );

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    break Err(DispatchError::Aborted(request_id.to_string()));
                }
                result = &mut operation => break result,
                () = &mut deadline => {
                    tracing::warn!(
                        request_id = %request_id,
                        timeout_ms = u64::try_from(hard_limit.as_millis()).unwrap_or(u64::MAX),
                        "Execution deadline exceeded"
                    );
                    break Err(DispatchError::ExecutionTimeout {
                        request: request_id.to_string(),
                        timeout: hard_limit,
                    });
                }
                _ = ticker.tick() => {
                    let usage = self.probe.sample(&request_id, &allocation);
                    self.metrics
                        .record_utilization(provider_id, usage.utilization_of(&total));
                    for violation in monitor.observe(started.elapsed(), time_limit, usage) {
                        self.flag(&request_id, violation);
                    }
                }
            }
        };

        let elapsed = started.elapsed();
        drop(reservation);
        self.metrics.record_utilization(provider_id, 0.0);

        let value = outcome?;
        // Finished between ticks, past the limit
        if let Some(violation) = monitor.check_time(elapsed, time_limit) {
            self.flag(&request_id, violation);
        }

        Ok(ExecutionReport {
            request_id,
            provider_id: provider_id.to_string(),
            value,
            elapsed,
            allocation,
            peak_usage: monitor.peak,
            samples: monitor.samples,
            violations: monitor.violations,
        })
    }

    /// Run every task of a batch for `model_id`, isolating failures
    ///
    /// A failed task is reported as `Failed` with a `TaskFailed` event; its
    /// siblings keep running.
    ///
    /// # Errors
    ///
    /// `AlreadyInProgress` if a batch for this model is already running.
    pub async fn execute_batch<T>(
        &self,
        model_id: &str,
        tasks: Vec<BatchTask<T>>,
    ) -> Result<BatchReport<T>> {
        let _guard = self.scheduler.begin_run(model_id)?;
        let plan_provider = tasks
            .first()
            .map_or_else(|| model_id.to_string(), |t| t.provider_id.clone());
        let plan = self.scheduler.plan(model_id, &plan_provider, None);
        let planned = &plan;

        tracing::info!(model = model_id, tasks = tasks.len(), "Batch started");

        let runs = tasks.into_iter().map(|task| async move {
            let request_id = task.request_id.clone();
            let result = match self
                .acquire_slot(&task.request_id, self.config.acquire_timeout())
                .await
            {
                Ok(permit) => {
                    // Past the planned window only the live budget applies
                    let ceiling = planned.slot_at(Utc::now()).map(|slot| slot.allocation);
                    self.run_capped(
                        permit,
                        task.request_id,
                        &task.provider_id,
                        CancellationToken::new(),
                        task.operation,
                        ceiling,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            let status = match &result {
                Ok(_) => RequestStatus::Completed,
                Err(e) => {
                    tracing::error!(model = model_id, request_id = %request_id, error = %e, "Task failed");
                    self.events.emit(DispatchEvent::TaskFailed {
                        model_id: model_id.to_string(),
                        request_id: request_id.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    RequestStatus::for_error(e)
                }
            };

            TaskOutcome {
                request_id,
                status,
                result,
            }
        });

        let outcomes = join_all(runs).await;
        let report = BatchReport {
            model_id: model_id.to_string(),
            plan,
            outcomes,
        };

        tracing::info!(
            model = model_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Refuse new work; waiters get `ShuttingDown`
    pub fn close(&self) {
        self.permits.close();
    }

    /// Wait up to `wait` for in-flight executions to finish, then close
    ///
    /// Returns `false` if executions were still running when `wait` passed.
    pub async fn shutdown(&self, wait: Duration) -> bool {
        let max = u32::try_from(self.config.max_concurrent).unwrap_or(u32::MAX);
        let all = Arc::clone(&self.permits).acquire_many_owned(max);
        let drained = matches!(tokio::time::timeout(wait, all).await, Ok(Ok(_)));
        if !drained {
            tracing::warn!(in_flight = self.in_flight(), "Executions still running at shutdown");
        }
        self.close();
        drained
    }

    fn flag(&self, request_id: &RequestId, violation: ConstraintViolation) {
        tracing::warn!(request_id = %request_id, violation = ?violation, "Constraint violation");
        self.events.emit(DispatchEvent::ConstraintViolation {
            request_id: request_id.clone(),
            violation,
            timestamp: Utc::now(),
        });
    }
}

/// Per-execution sampling state
struct Monitor {
    allocation: ResourceAllocation,
    peak: ResourceAllocation,
    samples: u32,
    time_flagged: bool,
    resources_flagged: bool,
    violations: Vec<ConstraintViolation>,
}

impl Monitor {
    fn new(allocation: ResourceAllocation) -> Self {
        Self {
            allocation,
            peak: ResourceAllocation::zero(),
            samples: 0,
            time_flagged: false,
            resources_flagged: false,
            violations: Vec::new(),
        }
    }

    /// Record one sample, returning newly crossed limits
    fn observe(
        &mut self,
        elapsed: Duration,
        time_limit: Duration,
        usage: ResourceAllocation,
    ) -> Vec<ConstraintViolation> {
        self.samples += 1;
        self.peak = ResourceAllocation::new(
            self.peak.cpu.max(usage.cpu),
            self.peak.memory_mb.max(usage.memory_mb),
            self.peak.gpu.max(usage.gpu),
        );

        let mut crossed = Vec::new();
        if let Some(v) = self.check_time(elapsed, time_limit) {
            crossed.push(v);
        }
        if !self.resources_flagged && !usage.fits_within(&self.allocation) {
            self.resources_flagged = true;
            let v = ConstraintViolation::ExceedsResourceLimits {
                allocated: self.allocation,
                observed: usage,
            };
            self.violations.push(v.clone());
            crossed.push(v);
        }
        crossed
    }

    fn check_time(&mut self, elapsed: Duration, time_limit: Duration) -> Option<ConstraintViolation> {
        if self.time_flagged || elapsed <= time_limit {
            return None;
        }
        self.time_flagged = true;
        let v = ConstraintViolation::ExceedsTimeLimit {
            limit_ms: u64::try_from(time_limit.as_millis()).unwrap_or(u64::MAX),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };
        self.violations.push(v.clone());
        Some(v)
    }
}

//! Load Generation
//!
//! Submits simulated completion requests at a fixed rate, cycling through
//! the priority classes, and tallies how each one ends.
//!
//! ```text
//!   ticker ──▶ enqueue ──▶ JoinSet ──▶ handle.wait() ──▶ Tally
//!     │           │
//!     │           └─ admission error ──▶ rejected
//!     └─ every Nth request: scripted transient failure on one provider
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use dispatch_core::{
    CompletionRequest, DispatchOutcome, Dispatcher, ErrorKind, Priority, RequestStatus,
    SimulationScript,
};

/// How often progress is logged
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// What to submit and how fast
#[derive(Clone, Debug)]
pub struct LoadPlan {
    /// Stop after this many requests; `None` runs until told to stop
    pub requests: Option<u64>,
    /// Requests per second
    pub rate: f64,
    /// Script a transient failure before every Nth request
    pub fail_every: Option<u64>,
}

/// How the submitted requests ended
#[derive(Clone, Debug, Default, Serialize)]
pub struct LoadSummary {
    /// Requests admitted into the queue
    pub submitted: u64,
    /// Requests refused at admission
    pub rejected: u64,
    /// Requests that completed
    pub completed: u64,
    /// Requests that failed
    pub failed: u64,
    /// Requests that expired in the queue or overran their deadline
    pub timed_out: u64,
    /// Requests cut short by shutdown
    pub aborted: u64,
    /// Mean execution latency of completed requests
    pub avg_latency_ms: f64,
}

#[derive(Debug, Default)]
struct Tally {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    aborted: AtomicU64,
    latency_sum_ms: AtomicU64,
}

impl Tally {
    fn record(&self, result: &dispatch_core::Result<DispatchOutcome>) {
        match result {
            Ok(outcome) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.latency_sum_ms
                    .fetch_add(outcome.latency_ms, Ordering::Relaxed);
            }
            Err(e) => {
                let counter = match RequestStatus::for_error(e) {
                    RequestStatus::TimedOut => &self.timed_out,
                    RequestStatus::Aborted => &self.aborted,
                    _ => &self.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn summary(&self) -> LoadSummary {
        let completed = self.completed.load(Ordering::Relaxed);
        let avg_latency_ms = if completed == 0 {
            0.0
        } else {
            self.latency_sum_ms.load(Ordering::Relaxed) as f64 / completed as f64
        };
        LoadSummary {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            avg_latency_ms,
        }
    }
}

/// Drives a dispatcher with synthetic requests
pub struct LoadGenerator {
    dispatcher: Arc<Dispatcher>,
    scripts: Vec<Arc<SimulationScript>>,
    plan: LoadPlan,
    tally: Arc<Tally>,
}

impl LoadGenerator {
    /// Generator for `dispatcher`; `scripts` receive the injected failures
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        scripts: Vec<Arc<SimulationScript>>,
        plan: LoadPlan,
    ) -> Self {
        Self {
            dispatcher,
            scripts,
            plan,
            tally: Arc::new(Tally::default()),
        }
    }

    /// Submit until the plan is done or `stop` flips, then wait for every
    /// admitted request to resolve
    ///
    /// On `stop` the dispatcher is shut down first, so queued requests
    /// resolve immediately instead of running.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> LoadSummary {
        let period = Duration::from_secs_f64(1.0 / self.plan.rate.max(0.001));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = tokio::time::interval(REPORT_INTERVAL);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut pending = JoinSet::new();
        let mut seq = 0u64;
        let mut stopped = false;

        info!(rate = self.plan.rate, limit = ?self.plan.requests, "Load generation started");

        loop {
            if self.plan.requests.is_some_and(|limit| seq >= limit) {
                break;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        stopped = true;
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.submit(seq, &mut pending);
                    seq += 1;
                }
                _ = report.tick() => self.log_progress(),
                Some(_) = pending.join_next(), if !pending.is_empty() => {}
            }
        }

        if stopped {
            info!(pending = pending.len(), "Stop requested, shutting dispatcher down");
            self.dispatcher.shutdown().await;
        } else {
            info!(pending = pending.len(), "All requests submitted, waiting for results");
        }

        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Request task ended abnormally");
            }
        }

        let summary = self.tally.summary();
        info!(
            submitted = summary.submitted,
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            aborted = summary.aborted,
            rejected = summary.rejected,
            "Load generation finished"
        );
        summary
    }

    fn submit(&self, seq: u64, pending: &mut JoinSet<()>) {
        if let Some(every) = self.plan.fail_every.filter(|n| *n > 0) {
            if seq % every == every - 1 && !self.scripts.is_empty() {
                let index = usize::try_from(seq).unwrap_or(0) % self.scripts.len();
                self.scripts[index].fail_next(1, ErrorKind::ServiceUnavailable);
                debug!(seq, provider_index = index, "Injected transient failure");
            }
        }

        let priority = match seq % 3 {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        };
        let request = CompletionRequest::new(format!("load request {seq}"), "");

        match self.dispatcher.enqueue(None, request, priority) {
            Ok(handle) => {
                self.tally.submitted.fetch_add(1, Ordering::Relaxed);
                let tally = Arc::clone(&self.tally);
                pending.spawn(async move {
                    let result = handle.wait().await;
                    tally.record(&result);
                });
            }
            Err(e) => {
                self.tally.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(seq, priority = %priority, error = %e, backpressure = e.is_backpressure(), "Request rejected");
            }
        }
    }

    fn log_progress(&self) {
        let queue = self.dispatcher.queue_stats();
        let summary = self.tally.summary();
        info!(
            queued = queue.total_queued,
            running = self.dispatcher.in_flight(),
            completed = summary.completed,
            failed = summary.failed,
            "Load progress"
        );
    }
}

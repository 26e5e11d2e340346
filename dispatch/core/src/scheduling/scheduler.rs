//! Resource-Aware Scheduling
//!
//! Decides how much of the host a task may use and over which time slots.
//!
//! ```text
//! window ─┬─ slot 0 ─┬─ slot 1 ─┬─ ... ─┬─ slot n-1 ─┐
//!         │ interval │ interval │       │ remainder  │
//!
//! per-slot budget = min(available × fraction, per-task cap)
//!                   × slow_scale   (if the provider's average latency is high)
//! ```
//!
//! Runs are guarded per model id: while one run for a model is in flight a
//! second one fails fast with `AlreadyInProgress`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::metrics::MetricsTracker;
use super::resources::{ResourceAllocation, ResourceLedger, ResourceReservation};
use crate::config::SchedulerConfig;
use crate::error::{DispatchError, Result};

/// One slice of an execution window
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Position in the window
    pub index: usize,
    /// Slot start
    pub starts_at: DateTime<Utc>,
    /// Slot length in milliseconds (the last slot may be shorter)
    pub duration_ms: u64,
    /// Budget for the slot
    pub allocation: ResourceAllocation,
}

/// Slots and budget planned for one model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulePlan {
    /// Model the plan is for
    pub model_id: String,
    /// Provider whose metrics shaped the budget
    pub provider_id: String,
    /// Slots covering the window, in order
    pub slots: Vec<TimeSlot>,
    /// When the plan was made
    pub created_at: DateTime<Utc>,
}

impl SchedulePlan {
    /// Total planned duration
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.slots.iter().map(|s| s.duration_ms).sum())
    }

    /// Slot covering `at`, if it falls inside the window
    #[must_use]
    pub fn slot_at(&self, at: DateTime<Utc>) -> Option<&TimeSlot> {
        self.slots.iter().find(|slot| {
            let length = i64::try_from(slot.duration_ms).unwrap_or(i64::MAX);
            at >= slot.starts_at && at < slot.starts_at + chrono::Duration::milliseconds(length)
        })
    }
}

/// Holds a model's run slot; releases it on drop
#[derive(Debug)]
pub struct RunGuard {
    model_id: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl RunGuard {
    /// Model this guard belongs to
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.model_id);
    }
}

/// Plans slots and sizes per-task resource budgets
pub struct Scheduler {
    config: SchedulerConfig,
    ledger: ResourceLedger,
    metrics: Arc<MetricsTracker>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    /// Scheduler over the host totals in `config`
    #[must_use]
    pub fn new(config: SchedulerConfig, metrics: Arc<MetricsTracker>) -> Self {
        let ledger = ResourceLedger::new(config.total_resources);
        Self {
            config,
            ledger,
            metrics,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The ledger reservations are made against
    #[must_use]
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Claim the run slot for `model_id`
    ///
    /// # Errors
    ///
    /// `AlreadyInProgress` if a run for this model holds the slot.
    pub fn begin_run(&self, model_id: &str) -> Result<RunGuard> {
        let mut running = self.running.lock();
        if !running.insert(model_id.to_string()) {
            tracing::debug!(model = model_id, "Run already in progress");
            return Err(DispatchError::AlreadyInProgress(model_id.to_string()));
        }
        Ok(RunGuard {
            model_id: model_id.to_string(),
            running: Arc::clone(&self.running),
        })
    }

    /// Whether a run for `model_id` is in flight
    #[must_use]
    pub fn is_running(&self, model_id: &str) -> bool {
        self.running.lock().contains(model_id)
    }

    /// Budget one task of `provider_id` may take right now
    #[must_use]
    pub fn allocation_for(&self, provider_id: &str) -> ResourceAllocation {
        self.budget(self.ledger.available(), self.latency_scale(provider_id))
    }

    fn budget(&self, available: ResourceAllocation, scale: f64) -> ResourceAllocation {
        available
            .scale(self.config.max_allocation_fraction)
            .min(&self.config.per_task_cap)
            .scale(scale)
    }

    /// Shrink factor for providers whose average latency is high
    fn latency_scale(&self, provider_id: &str) -> f64 {
        match self.metrics.average_latency(provider_id) {
            Some(avg) if avg > self.config.slow_latency_ms => {
                tracing::debug!(
                    provider = provider_id,
                    avg_latency_ms = avg,
                    "Scaling down allocation for slow provider"
                );
                self.config.slow_allocation_scale
            }
            _ => 1.0,
        }
    }

    /// Partition `window` (default: the configured window) into slots
    ///
    /// Every slot carries the budget computed at planning time. Tasks run
    /// under a plan reserve no more than the budget of the slot they start
    /// in (see [`Scheduler::reserve_within`]).
    #[must_use]
    pub fn plan(&self, model_id: &str, provider_id: &str, window: Option<Duration>) -> SchedulePlan {
        let window = window.unwrap_or_else(|| self.config.window());
        let interval = self.config.slot_interval().max(Duration::from_millis(1));
        let allocation = self.allocation_for(provider_id);
        let created_at = Utc::now();

        let mut slots = Vec::new();
        let mut offset = Duration::ZERO;
        while offset < window {
            let length = interval.min(window - offset);
            slots.push(TimeSlot {
                index: slots.len(),
                starts_at: created_at
                    + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero()),
                duration_ms: u64::try_from(length.as_millis()).unwrap_or(u64::MAX),
                allocation,
            });
            offset += length;
        }

        tracing::debug!(
            model = model_id,
            provider = provider_id,
            slots = slots.len(),
            "Planned execution window"
        );

        SchedulePlan {
            model_id: model_id.to_string(),
            provider_id: provider_id.to_string(),
            slots,
            created_at,
        }
    }

    /// Reserve a task's budget from the ledger
    ///
    /// # Errors
    ///
    /// `InsufficientResources` if nothing is left to allocate.
    pub fn reserve(&self, provider_id: &str) -> Result<ResourceReservation> {
        self.reserve_within(provider_id, None)
    }

    /// Reserve a task's budget, capped by a planned slot budget
    ///
    /// The budget is sized from what is available at the moment of
    /// reservation; no other reservation can slip in between.
    ///
    /// # Errors
    ///
    /// `InsufficientResources` if nothing is left to allocate.
    pub fn reserve_within(
        &self,
        provider_id: &str,
        ceiling: Option<&ResourceAllocation>,
    ) -> Result<ResourceReservation> {
        let scale = self.latency_scale(provider_id);
        self.ledger
            .reserve_from_available(|available| {
                let budget = self.budget(available, scale);
                ceiling.map_or(budget, |cap| budget.min(cap))
            })
            .ok_or_else(|| {
                DispatchError::InsufficientResources(format!("no capacity left for {provider_id}"))
            })
    }
}

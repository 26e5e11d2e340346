//! Resource Ledger
//!
//! Tracks CPU, memory and GPU shares reserved by running tasks against the
//! host's advertised totals. A reservation is an RAII guard: dropping it
//! returns its share. The sum of live reservations never exceeds the totals.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::queue::RequestId;

// ============================================================================
// Resource Allocation
// ============================================================================

/// CPU/memory/GPU share
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceAllocation {
    /// CPU cores
    pub cpu: f64,
    /// Memory in megabytes
    pub memory_mb: f64,
    /// GPU share (1.0 = one whole device)
    pub gpu: f64,
}

impl ResourceAllocation {
    /// Create an allocation
    #[must_use]
    pub const fn new(cpu: f64, memory_mb: f64, gpu: f64) -> Self {
        Self { cpu, memory_mb, gpu }
    }

    /// Nothing
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Component-wise sum
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        Self::new(
            self.cpu + other.cpu,
            self.memory_mb + other.memory_mb,
            self.gpu + other.gpu,
        )
    }

    /// Component-wise difference, floored at zero
    #[must_use]
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self::new(
            (self.cpu - other.cpu).max(0.0),
            (self.memory_mb - other.memory_mb).max(0.0),
            (self.gpu - other.gpu).max(0.0),
        )
    }

    /// Every component multiplied by `factor`
    #[must_use]
    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.cpu * factor, self.memory_mb * factor, self.gpu * factor)
    }

    /// Component-wise minimum
    #[must_use]
    pub fn min(&self, other: &Self) -> Self {
        Self::new(
            self.cpu.min(other.cpu),
            self.memory_mb.min(other.memory_mb),
            self.gpu.min(other.gpu),
        )
    }

    /// Whether every component is within `limit`
    #[must_use]
    pub fn fits_within(&self, limit: &Self) -> bool {
        // Tolerate float noise from repeated add/sub
        const EPS: f64 = 1e-9;
        self.cpu <= limit.cpu + EPS
            && self.memory_mb <= limit.memory_mb + EPS
            && self.gpu <= limit.gpu + EPS
    }

    /// Whether every component is zero
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.cpu <= 0.0 && self.memory_mb <= 0.0 && self.gpu <= 0.0
    }

    /// Largest component-wise fraction of `total` this occupies (0.0 - 1.0+)
    #[must_use]
    pub fn utilization_of(&self, total: &Self) -> f64 {
        let ratio = |used: f64, cap: f64| if cap > 0.0 { used / cap } else { 0.0 };
        ratio(self.cpu, total.cpu)
            .max(ratio(self.memory_mb, total.memory_mb))
            .max(ratio(self.gpu, total.gpu))
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug)]
struct LedgerState {
    reserved: ResourceAllocation,
    active: usize,
    peak_utilization: f64,
    total_reservations: u64,
    rejected: u64,
}

#[derive(Debug)]
struct LedgerInner {
    total: ResourceAllocation,
    state: Mutex<LedgerState>,
}

/// Snapshot of ledger usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Advertised totals
    pub total: ResourceAllocation,
    /// Currently reserved
    pub reserved: ResourceAllocation,
    /// Live reservations
    pub active: usize,
    /// Highest utilization seen
    pub peak_utilization: f64,
    /// Reservations ever granted
    pub total_reservations: u64,
    /// Reservations refused for lack of capacity
    pub rejected: u64,
}

/// Reservations against advertised host resources
///
/// Cheap to clone; clones share the same ledger.
#[derive(Clone, Debug)]
pub struct ResourceLedger {
    inner: Arc<LedgerInner>,
}

impl ResourceLedger {
    /// Ledger over `total`
    #[must_use]
    pub fn new(total: ResourceAllocation) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                total,
                state: Mutex::new(LedgerState {
                    reserved: ResourceAllocation::zero(),
                    active: 0,
                    peak_utilization: 0.0,
                    total_reservations: 0,
                    rejected: 0,
                }),
            }),
        }
    }

    /// Advertised totals
    #[must_use]
    pub fn total(&self) -> ResourceAllocation {
        self.inner.total
    }

    /// Totals minus live reservations
    #[must_use]
    pub fn available(&self) -> ResourceAllocation {
        let state = self.inner.state.lock();
        self.inner.total.saturating_sub(&state.reserved)
    }

    /// Reserve `allocation` if it fits in what is left
    ///
    /// Returns `None` without reserving anything if it does not fit.
    pub fn try_reserve(&self, allocation: ResourceAllocation) -> Option<ResourceReservation> {
        let mut state = self.inner.state.lock();
        self.reserve_locked(&mut state, allocation)
    }

    /// Reserve a share sized from what is currently left
    ///
    /// `size` sees the available resources and returns the share to take.
    /// Sizing and reserving happen under one lock, so no other reservation
    /// can land in between. A zero share reserves nothing.
    pub fn reserve_from_available(
        &self,
        size: impl FnOnce(ResourceAllocation) -> ResourceAllocation,
    ) -> Option<ResourceReservation> {
        let mut state = self.inner.state.lock();
        let allocation = size(self.inner.total.saturating_sub(&state.reserved));
        if allocation.is_zero() {
            state.rejected += 1;
            return None;
        }
        self.reserve_locked(&mut state, allocation)
    }

    fn reserve_locked(
        &self,
        state: &mut LedgerState,
        allocation: ResourceAllocation,
    ) -> Option<ResourceReservation> {
        let next = state.reserved.add(&allocation);
        if !next.fits_within(&self.inner.total) {
            state.rejected += 1;
            return None;
        }
        state.reserved = next;
        state.active += 1;
        state.total_reservations += 1;
        let utilization = next.utilization_of(&self.inner.total);
        if utilization > state.peak_utilization {
            state.peak_utilization = utilization;
        }
        Some(ResourceReservation {
            ledger: Arc::clone(&self.inner),
            allocation,
        })
    }

    /// Current usage
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let state = self.inner.state.lock();
        LedgerStats {
            total: self.inner.total,
            reserved: state.reserved,
            active: state.active,
            peak_utilization: state.peak_utilization,
            total_reservations: state.total_reservations,
            rejected: state.rejected,
        }
    }
}

/// Share held by one running task; released on drop
#[derive(Debug)]
pub struct ResourceReservation {
    ledger: Arc<LedgerInner>,
    allocation: ResourceAllocation,
}

impl ResourceReservation {
    /// What this reservation holds
    #[must_use]
    pub fn allocation(&self) -> ResourceAllocation {
        self.allocation
    }
}

impl Drop for ResourceReservation {
    fn drop(&mut self) {
        let mut state = self.ledger.state.lock();
        state.reserved = state.reserved.saturating_sub(&self.allocation);
        state.active = state.active.saturating_sub(1);
    }
}

// ============================================================================
// Usage Probes
// ============================================================================

/// Reports what a running task is actually consuming
///
/// Sampled by the executor at every monitoring tick.
pub trait UsageProbe: Send + Sync {
    /// Current usage of `request_id`, given what it reserved
    fn sample(&self, request_id: &RequestId, reserved: &ResourceAllocation) -> ResourceAllocation;
}

/// Assumes every task uses exactly what it reserved
#[derive(Debug, Default)]
pub struct ReservedUsageProbe;

impl UsageProbe for ReservedUsageProbe {
    fn sample(&self, _request_id: &RequestId, reserved: &ResourceAllocation) -> ResourceAllocation {
        *reserved
    }
}

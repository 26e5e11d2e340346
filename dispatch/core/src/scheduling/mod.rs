//! Scheduling
//!
//! Admission, retry, resource budgeting, bounded execution and the metrics
//! that feed back into budgeting.

pub mod executor;
pub mod metrics;
pub mod queue;
pub mod resources;
pub mod retry;
pub mod scheduler;

pub use executor::{
    BatchReport, BatchTask, ConstraintViolation, ExecutionReport, Executor, RequestStatus,
    TaskOutcome,
};
pub use metrics::{HealthStatus, Histogram, HistogramSnapshot, MetricsSnapshot, MetricsTracker};
pub use queue::{
    ExpiryHandler, OldestRequest, Priority, QueueStats, QueuedRequest, RequestId, RequestQueue,
};
pub use resources::{
    LedgerStats, ReservedUsageProbe, ResourceAllocation, ResourceLedger, ResourceReservation,
    UsageProbe,
};
pub use retry::{JitterSource, NoJitter, RetryCoordinator, SeededJitter, ThreadJitter};
pub use scheduler::{RunGuard, SchedulePlan, Scheduler, TimeSlot};

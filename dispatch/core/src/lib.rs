//! Dispatch Core - Request Admission and Execution for LLM Provider Clients
//!
//! Decides when, on which pooled connection, and under what resource budget a
//! model request runs, and tracks the lifecycle of every provider connection.
//! No wire protocol lives here: backends plug in through the [`Provider`]
//! trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Dispatcher                              │
//! │                                                                   │
//! │  enqueue ──▶ ┌──────────────┐    ┌──────────┐                    │
//! │              │ RequestQueue │──▶ │  worker  │ (slot, then dequeue)│
//! │              │ high/normal/ │    └────┬─────┘                    │
//! │              │ low + expiry │         │                          │
//! │              └──────────────┘         ▼                          │
//! │  ┌──────────────────┐    ┌──────────────────┐   ┌─────────────┐ │
//! │  │ ProviderRegistry │    │  ConnectionPool  │──▶│ State       │ │
//! │  │  (FIFO priority) │    │  (max N / prov.) │   │ Machine     │ │
//! │  └──────────────────┘    └────────┬─────────┘   │ (timeouts)  │ │
//! │                                   ▼             └─────────────┘ │
//! │  ┌──────────────┐   ┌─────────────────────┐   ┌──────────────┐  │
//! │  │  Scheduler   │◀──│      Executor       │──▶│ Retry        │  │
//! │  │ slots/budget │   │ ceiling + monitor   │   │ Coordinator  │  │
//! │  └──────▲───────┘   └──────────┬──────────┘   └──────────────┘  │
//! │         │                      ▼                                 │
//! │         └────────────── MetricsTracker ──▶ EventBus              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: owns every component; the entry point for callers
//! - [`ConnectionPool`]: bounded, reusable provider connections
//! - [`ConnectionStateMachine`]: guarded connection lifecycle with deadlines
//! - [`RequestQueue`]: multi-priority admission with per-item expiry
//! - [`RetryCoordinator`]: exponential backoff with injectable jitter
//! - [`Executor`] / [`Scheduler`]: concurrency ceiling and resource budgets
//! - [`MetricsTracker`]: per-provider latency, errors, tokens, health
//! - [`DispatchEvent`]: the closed set of lifecycle events
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dispatch_core::{
//!     CompletionRequest, DispatchConfig, Dispatcher, Priority, SimulatedBehavior,
//!     SimulatedProviderFactory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> dispatch_core::Result<()> {
//!     let dispatcher = Dispatcher::new(DispatchConfig::default());
//!     let factory = SimulatedProviderFactory::new(SimulatedBehavior::default());
//!     dispatcher.add_provider(factory.spec("sim-1"), Arc::new(factory))?;
//!     dispatcher.start();
//!
//!     let outcome = dispatcher
//!         .execute(None, CompletionRequest::new("Hello", ""), Priority::High)
//!         .await?;
//!     println!("{}", outcome.response.content);
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod provider;
pub mod scheduling;
pub mod timer;

pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigSource, DispatchConfig,
    ExecutorConfig, MetricsConfig, PoolConfig, PriorityLimits, QueueConfig, RetryConfig,
    SchedulerConfig, StateMachineConfig,
};
pub use connection::{
    ConnectionId, ConnectionPool, ConnectionState, ConnectionStateMachine, ConnectionStateRecord,
    PoolStats, PooledConnection, TransitionMetadata,
};
pub use dispatcher::{DispatchOutcome, Dispatcher, RequestHandle, StreamHandle, StreamOutcome};
pub use error::{ConfigError, DispatchError, ErrorClass, ErrorKind, ProviderError, Result};
pub use events::{DispatchEvent, EventBus, DEFAULT_EVENT_CAPACITY};
pub use provider::{
    CompletionRequest, CompletionResponse, ModelInfo, Provider, ProviderCapabilities,
    ProviderConfig, ProviderFactory, ProviderRegistration, ProviderRegistry, ProviderSpec,
    ProviderStatus, SimulatedBehavior, SimulatedProvider, SimulatedProviderFactory,
    SimulationScript, StreamingToken, TokenUsage,
};
pub use scheduling::{
    BatchReport, BatchTask, ConstraintViolation, ExecutionReport, Executor, HealthStatus,
    JitterSource, MetricsSnapshot, MetricsTracker, NoJitter, Priority, QueueStats, RequestId,
    RequestQueue, RequestStatus, ResourceAllocation, ResourceLedger, RetryCoordinator,
    Scheduler, SeededJitter,
};
pub use timer::ScheduledTask;

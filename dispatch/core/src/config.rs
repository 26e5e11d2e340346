//! Dispatch Configuration
//!
//! One `DispatchConfig` aggregates the settings of every component. It loads
//! from `$XDG_CONFIG_HOME/dispatch/dispatch.toml`, and `DISPATCH_*`
//! environment variables override the file.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [pool]
//! max_connections = 5
//! idle_timeout_ms = 300000
//!
//! [queue]
//! max_size = 100
//! item_timeout_ms = 30000
//! priority_order = ["high", "normal", "low"]
//!
//! [queue.per_priority]
//! high = 50
//! normal = 50
//! low = 50
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//!
//! [executor]
//! max_concurrent = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::state::ConnectionState;
use crate::error::ConfigError;
use crate::scheduling::queue::Priority;
use crate::scheduling::resources::ResourceAllocation;

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Component Sections
// =============================================================================

/// Connection pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum simultaneous connections per provider
    pub max_connections: usize,
    /// Idle age after which a connection is reclaimed (also the sweep interval)
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            idle_timeout_ms: 300_000, // 5 minutes
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a Duration
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Capacity of each priority class
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityLimits {
    /// Capacity of the `high` class
    pub high: usize,
    /// Capacity of the `normal` class
    pub normal: usize,
    /// Capacity of the `low` class
    pub low: usize,
}

impl Default for PriorityLimits {
    fn default() -> Self {
        Self {
            high: 50,
            normal: 50,
            low: 50,
        }
    }
}

impl PriorityLimits {
    /// Capacity for one class
    #[must_use]
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

/// Request queue configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global queue capacity across all classes
    pub max_size: usize,
    /// Per-class capacity
    pub per_priority: PriorityLimits,
    /// How long an item may wait before it expires
    pub item_timeout_ms: u64,
    /// Classes in service order, highest first
    pub priority_order: Vec<Priority>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            per_priority: PriorityLimits::default(),
            item_timeout_ms: 30_000,
            priority_order: vec![Priority::High, Priority::Normal, Priority::Low],
        }
    }
}

impl QueueConfig {
    /// Item timeout as a Duration
    #[must_use]
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}

/// Connection state machine deadlines
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Deadline for `Connecting`
    pub connecting_timeout_ms: u64,
    /// Deadline for `Reconnecting`
    pub reconnecting_timeout_ms: u64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            connecting_timeout_ms: 30_000,
            reconnecting_timeout_ms: 60_000,
        }
    }
}

impl StateMachineConfig {
    /// Deadline for a state, if it has one
    #[must_use]
    pub fn timeout_for(&self, state: ConnectionState) -> Option<Duration> {
        match state {
            ConnectionState::Connecting => Some(Duration::from_millis(self.connecting_timeout_ms)),
            ConnectionState::Reconnecting => {
                Some(Duration::from_millis(self.reconnecting_timeout_ms))
            }
            _ => None,
        }
    }
}

/// Retry behavior for provider operations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay for the exponential term
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the exponential term (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.3,
        }
    }
}

/// Time-slot scheduling and resource allocation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of one slot
    pub slot_interval_ms: u64,
    /// Total window partitioned into slots
    pub window_ms: u64,
    /// Largest share of currently available resources one task may take
    pub max_allocation_fraction: f64,
    /// Absolute per-task cap
    pub per_task_cap: ResourceAllocation,
    /// Resources the host advertises
    pub total_resources: ResourceAllocation,
    /// Average latency above which a provider counts as slow
    pub slow_latency_ms: f64,
    /// Allocation multiplier applied to slow providers
    pub slow_allocation_scale: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slot_interval_ms: 300_000,  // 5 minutes
            window_ms: 3_600_000,       // 1 hour
            max_allocation_fraction: 0.8,
            per_task_cap: ResourceAllocation::new(2.0, 4096.0, 0.5),
            total_resources: ResourceAllocation::new(8.0, 16_384.0, 1.0),
            slow_latency_ms: 5_000.0,
            slow_allocation_scale: 0.5,
        }
    }
}

impl SchedulerConfig {
    /// Slot length as a Duration
    #[must_use]
    pub fn slot_interval(&self) -> Duration {
        Duration::from_millis(self.slot_interval_ms)
    }

    /// Window length as a Duration
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Execution concurrency and monitoring
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Global in-flight ceiling
    pub max_concurrent: usize,
    /// How long a direct executor call waits for capacity
    pub acquire_timeout_ms: u64,
    /// Monitoring tick
    pub monitor_interval_ms: u64,
    /// Soft deadline; crossing it flags a constraint violation
    pub time_limit_ms: u64,
    /// Hard deadline; crossing it fails the task
    pub task_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            acquire_timeout_ms: 30_000,
            monitor_interval_ms: 1_000,
            time_limit_ms: 60_000,
            task_timeout_ms: 300_000,
        }
    }
}

impl ExecutorConfig {
    /// Acquire timeout as a Duration
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Monitoring tick as a Duration
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    /// Soft deadline as a Duration
    #[must_use]
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    /// Hard deadline as a Duration
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Metrics tracking
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples kept for the rolling latency average
    pub latency_window: usize,
    /// Error rate at which a provider is degraded
    pub degraded_error_rate: f64,
    /// Error rate at which a provider is unhealthy
    pub unhealthy_error_rate: f64,
    /// Requests needed before health is judged
    pub min_requests_for_health: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_window: 100,
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
            min_requests_for_health: 5,
        }
    }
}

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// Complete dispatch configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Connection pool
    pub pool: PoolConfig,
    /// Request queue
    pub queue: QueueConfig,
    /// Connection state machine
    pub state_machine: StateMachineConfig,
    /// Retry coordinator
    pub retry: RetryConfig,
    /// Scheduler
    pub scheduler: SchedulerConfig,
    /// Executor
    pub executor: ExecutorConfig,
    /// Metrics tracker
    pub metrics: MetricsConfig,
    /// Event bus buffer per subscriber
    pub event_capacity: usize,

    /// Path to the config file that was loaded (if any)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,

    #[serde(skip)]
    source: ConfigSource,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
            state_machine: StateMachineConfig::default(),
            retry: RetryConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            metrics: MetricsConfig::default(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DispatchConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the configuration came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Parse a TOML document; missing keys keep their defaults
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseError` for malformed TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values the components cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.pool.max_connections == 0 {
            return invalid("pool.max_connections must be at least 1");
        }
        if self.queue.max_size == 0 {
            return invalid("queue.max_size must be at least 1");
        }
        if self.queue.priority_order.is_empty() {
            return invalid("queue.priority_order must name at least one class");
        }
        for (i, p) in self.queue.priority_order.iter().enumerate() {
            if self.queue.priority_order[..i].contains(p) {
                return Err(ConfigError::ValidationError(format!(
                    "queue.priority_order lists {p} twice"
                )));
            }
        }
        if self.executor.max_concurrent == 0 {
            return invalid("executor.max_concurrent must be at least 1");
        }
        let fraction = self.scheduler.max_allocation_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return invalid("scheduler.max_allocation_fraction must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry.jitter_factor must be in [0, 1]");
        }
        if self.scheduler.slot_interval_ms == 0 {
            return invalid("scheduler.slot_interval_ms must be positive");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be at least 1");
        }
        if self.metrics.latency_window == 0 {
            return invalid("metrics.latency_window must be at least 1");
        }
        Ok(())
    }

    /// Apply `DISPATCH_*` overrides using `lookup` to read variables
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut touched = false;
        let mut read = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => {
                    touched = true;
                    Some(v)
                }
                Err(_) => {
                    tracing::warn!(var = name, value = %raw, "Ignoring unparsable environment override");
                    None
                }
            }
        };

        if let Some(v) = read("DISPATCH_POOL_MAX") {
            self.pool.max_connections = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = read("DISPATCH_IDLE_TIMEOUT_MS") {
            self.pool.idle_timeout_ms = v;
        }
        if let Some(v) = read("DISPATCH_QUEUE_MAX") {
            self.queue.max_size = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = read("DISPATCH_QUEUE_TIMEOUT_MS") {
            self.queue.item_timeout_ms = v;
        }
        if let Some(v) = read("DISPATCH_CONNECTING_TIMEOUT_MS") {
            self.state_machine.connecting_timeout_ms = v;
        }
        if let Some(v) = read("DISPATCH_RECONNECTING_TIMEOUT_MS") {
            self.state_machine.reconnecting_timeout_ms = v;
        }
        if let Some(v) = read("DISPATCH_MAX_RETRIES") {
            self.retry.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = read("DISPATCH_RETRY_BASE_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = read("DISPATCH_MAX_CONCURRENT") {
            self.executor.max_concurrent = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = read("DISPATCH_TASK_TIMEOUT_MS") {
            self.executor.task_timeout_ms = v;
        }

        if touched {
            self.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/dispatch/dispatch.toml`, usually
/// `~/.config/dispatch/dispatch.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dispatch").join("dispatch.toml"))
}

/// Load configuration from the default path plus the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read, parsed, or
/// validated. A missing file is not an error.
pub fn load_config() -> Result<DispatchConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path plus the process environment
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config_from_path(path: Option<&Path>) -> Result<DispatchConfig, ConfigError> {
    let mut config = match path {
        Some(config_path) if config_path.exists() => {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            let mut config = DispatchConfig::from_toml_str(&content)?;
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config
        }
        Some(config_path) => {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
            DispatchConfig::new()
        }
        None => DispatchConfig::new(),
    };

    config.apply_env_overrides(|name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

//! Provider Metrics
//!
//! Per-provider observability for the dispatch core:
//! - Request, success and error counts
//! - Rolling average latency over the last N samples
//! - Latency distribution (p50/p99)
//! - Tokens consumed
//! - Resource utilization
//! - Health derived from error rate
//!
//! Every recorded outcome emits `MetricsUpdated`; a change in derived health
//! emits `HealthUpdate`. The scheduler reads average latency back to scale
//! down allocations for slow providers.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::MetricsConfig;
use crate::error::DispatchError;
use crate::events::{DispatchEvent, EventBus};

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (milliseconds)
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    ///
    /// Negative values count as zero in the sum and maximum.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        let whole = value.max(0.0) as u64;
        self.sum.fetch_add(whole, Ordering::Relaxed);
        self.max.fetch_max(whole, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total: self.total_count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Values recorded
    pub total: u64,
    /// Sum of values recorded
    pub sum: u64,
    /// Largest value recorded
    pub max: u64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p.clamp(0.0, 1.0)).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Median
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 99th percentile
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Health
// ============================================================================

/// Provider health derived from its error rate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Error rate below the degraded threshold
    Healthy,
    /// Error rate at or above the degraded threshold
    Degraded,
    /// Error rate at or above the unhealthy threshold
    Unhealthy,
    /// Too few requests to judge
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Lowercase label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

#[derive(Debug)]
struct ProviderMetrics {
    request_count: u64,
    success_count: u64,
    error_count: u64,
    total_tokens: u64,
    /// Most recent latencies, oldest first
    window: VecDeque<f64>,
    latency: Histogram,
    errors_by_kind: BTreeMap<String, u64>,
    utilization: f64,
    peak_utilization: f64,
    health: HealthStatus,
    last_updated: DateTime<Utc>,
}

impl ProviderMetrics {
    fn new() -> Self {
        Self {
            request_count: 0,
            success_count: 0,
            error_count: 0,
            total_tokens: 0,
            window: VecDeque::new(),
            latency: Histogram::latency_default(),
            errors_by_kind: BTreeMap::new(),
            utilization: 0.0,
            peak_utilization: 0.0,
            health: HealthStatus::Unknown,
            last_updated: Utc::now(),
        }
    }

    fn push_latency(&mut self, latency_ms: f64, window: usize) {
        self.window.push_back(latency_ms);
        while self.window.len() > window.max(1) {
            self.window.pop_front();
        }
        self.latency.record(latency_ms);
    }

    fn avg_latency(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64
    }

    fn snapshot(&self, provider_id: &str) -> MetricsSnapshot {
        let latency = self.latency.snapshot();
        MetricsSnapshot {
            provider_id: provider_id.to_string(),
            request_count: self.request_count,
            success_count: self.success_count,
            error_count: self.error_count,
            error_rate: self.error_rate(),
            avg_latency_ms: self.avg_latency(),
            p50_latency_ms: latency.p50(),
            p99_latency_ms: latency.p99(),
            max_latency_ms: latency.max,
            total_tokens: self.total_tokens,
            resource_utilization: self.utilization,
            peak_resource_utilization: self.peak_utilization,
            errors_by_kind: self.errors_by_kind.clone(),
            health: self.health,
            last_updated: self.last_updated,
        }
    }
}

/// Metrics for one provider at a point in time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Provider identifier
    pub provider_id: String,
    /// Requests recorded
    pub request_count: u64,
    /// Successful requests
    pub success_count: u64,
    /// Failed requests
    pub error_count: u64,
    /// `error_count / request_count`
    pub error_rate: f64,
    /// Rolling average over the sample window
    pub avg_latency_ms: f64,
    /// Median latency bucket
    pub p50_latency_ms: f64,
    /// 99th percentile latency bucket
    pub p99_latency_ms: f64,
    /// Slowest request recorded
    pub max_latency_ms: u64,
    /// Tokens consumed
    pub total_tokens: u64,
    /// Last recorded resource utilization (0.0 - 1.0)
    pub resource_utilization: f64,
    /// Highest resource utilization recorded
    pub peak_resource_utilization: f64,
    /// Failures grouped by error kind
    pub errors_by_kind: BTreeMap<String, u64>,
    /// Derived health
    pub health: HealthStatus,
    /// Last time anything was recorded
    pub last_updated: DateTime<Utc>,
}

// ============================================================================
// Metrics Tracker
// ============================================================================

/// Records request outcomes per provider
pub struct MetricsTracker {
    config: MetricsConfig,
    providers: DashMap<String, ProviderMetrics>,
    events: EventBus,
}

impl MetricsTracker {
    /// Create a tracker publishing to `events`
    #[must_use]
    pub fn new(config: MetricsConfig, events: EventBus) -> Self {
        Self {
            config,
            providers: DashMap::new(),
            events,
        }
    }

    /// Record a successful request
    pub fn record_success(&self, provider_id: &str, latency_ms: u64, tokens: u32) {
        let window = self.config.latency_window;
        self.update(provider_id, |m| {
            m.success_count += 1;
            m.total_tokens += u64::from(tokens);
            m.push_latency(latency_ms as f64, window);
        });
    }

    /// Record a failed request
    ///
    /// Latency is only sampled when the failure happened after the provider
    /// was actually reached.
    pub fn record_error(&self, provider_id: &str, error: &DispatchError, latency_ms: Option<u64>) {
        let window = self.config.latency_window;
        let kind = error_kind_label(error);
        self.update(provider_id, |m| {
            m.error_count += 1;
            *m.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
            if let Some(latency) = latency_ms {
                m.push_latency(latency as f64, window);
            }
        });
    }

    /// Record the share of host resources a provider's task is using
    pub fn record_utilization(&self, provider_id: &str, utilization: f64) {
        let mut entry = self
            .providers
            .entry(provider_id.to_string())
            .or_insert_with(ProviderMetrics::new);
        entry.utilization = utilization;
        if utilization > entry.peak_utilization {
            entry.peak_utilization = utilization;
        }
        entry.last_updated = Utc::now();
    }

    /// Rolling average latency, if anything has been sampled
    #[must_use]
    pub fn average_latency(&self, provider_id: &str) -> Option<f64> {
        self.providers
            .get(provider_id)
            .filter(|m| !m.window.is_empty())
            .map(|m| m.avg_latency())
    }

    /// Current health
    #[must_use]
    pub fn health(&self, provider_id: &str) -> HealthStatus {
        self.providers
            .get(provider_id)
            .map_or(HealthStatus::Unknown, |m| m.health)
    }

    /// Snapshot for one provider
    #[must_use]
    pub fn snapshot(&self, provider_id: &str) -> Option<MetricsSnapshot> {
        self.providers.get(provider_id).map(|m| m.snapshot(provider_id))
    }

    /// Snapshots for every provider, sorted by id
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<_> = self
            .providers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }

    /// Drop everything recorded for a provider
    pub fn remove(&self, provider_id: &str) -> bool {
        self.providers.remove(provider_id).is_some()
    }

    /// Export as Prometheus text format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshots = self.all_snapshots();
        let mut output = String::new();

        let families: [(&str, &str, &str, fn(&MetricsSnapshot) -> f64); 7] = [
            ("dispatch_requests_total", "counter", "Requests per provider", |s| {
                s.request_count as f64
            }),
            ("dispatch_errors_total", "counter", "Failed requests per provider", |s| {
                s.error_count as f64
            }),
            ("dispatch_latency_avg_ms", "gauge", "Rolling average latency", |s| {
                s.avg_latency_ms
            }),
            ("dispatch_latency_p50_ms", "gauge", "Median latency", |s| s.p50_latency_ms),
            ("dispatch_latency_p99_ms", "gauge", "99th percentile latency", |s| {
                s.p99_latency_ms
            }),
            ("dispatch_tokens_total", "counter", "Tokens consumed", |s| {
                s.total_tokens as f64
            }),
            ("dispatch_resource_utilization", "gauge", "Share of host resources in use", |s| {
                s.resource_utilization
            }),
        ];

        for (name, kind, help, value) in families {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} {kind}");
            for snapshot in &snapshots {
                let _ = writeln!(
                    output,
                    "{name}{{provider=\"{}\"}} {}",
                    snapshot.provider_id,
                    value(snapshot)
                );
            }
            output.push('\n');
        }

        output
    }

    fn update(&self, provider_id: &str, apply: impl FnOnce(&mut ProviderMetrics)) {
        let (request_count, avg_latency_ms, error_rate, health, health_changed) = {
            let mut entry = self
                .providers
                .entry(provider_id.to_string())
                .or_insert_with(ProviderMetrics::new);
            entry.request_count += 1;
            apply(&mut *entry);
            entry.last_updated = Utc::now();

            let health = self.derive_health(&*entry);
            let changed = health != entry.health;
            entry.health = health;
            (
                entry.request_count,
                entry.avg_latency(),
                entry.error_rate(),
                health,
                changed,
            )
        };

        self.events.emit(DispatchEvent::MetricsUpdated {
            provider_id: provider_id.to_string(),
            request_count,
            avg_latency_ms,
            timestamp: Utc::now(),
        });

        if health_changed {
            tracing::info!(
                provider = provider_id,
                health = health.label(),
                error_rate,
                "Provider health changed"
            );
            self.events.emit(DispatchEvent::HealthUpdate {
                provider_id: provider_id.to_string(),
                status: health,
                error_rate,
                timestamp: Utc::now(),
            });
        }
    }

    fn derive_health(&self, metrics: &ProviderMetrics) -> HealthStatus {
        if metrics.request_count < self.config.min_requests_for_health {
            return HealthStatus::Unknown;
        }
        let rate = metrics.error_rate();
        if rate >= self.config.unhealthy_error_rate {
            HealthStatus::Unhealthy
        } else if rate >= self.config.degraded_error_rate {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

fn error_kind_label(error: &DispatchError) -> &'static str {
    match error {
        DispatchError::Provider(e) | DispatchError::RetryExhausted { source: e, .. } => {
            e.kind.label()
        }
        DispatchError::ConnectionTimeout { .. } | DispatchError::ExecutionTimeout { .. } => {
            "timeout"
        }
        DispatchError::Aborted(_) => "aborted",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    fn tracker() -> (MetricsTracker, EventBus) {
        let events = EventBus::default();
        (MetricsTracker::new(MetricsConfig::default(), events.clone()), events)
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new(vec![10.0, 25.0, 50.0, 100.0]);

        hist.record(5.0);
        hist.record(15.0);
        hist.record(75.0);
        hist.record(200.0); // overflow lands in the last bucket

        let snap = hist.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.counts, vec![1, 1, 0, 2]);
        assert_eq!(snap.max, 200);
        assert_eq!(snap.p50(), 25.0);
        assert_eq!(snap.p99(), 100.0);
    }

    #[test]
    fn test_histogram_clamps_fractional_and_negative_values() {
        let hist = Histogram::new(vec![10.0, 100.0]);
        hist.record(-3.0);
        hist.record(7.9);

        let snap = hist.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.counts, vec![2, 0]);
        assert_eq!(snap.sum, 7);
        assert_eq!(snap.max, 7);
        assert_eq!(snap.percentile(1.5), 10.0);
    }

    #[test]
    fn test_rolling_window_is_bounded() {
        let events = EventBus::default();
        let tracker = MetricsTracker::new(
            MetricsConfig {
                latency_window: 3,
                ..MetricsConfig::default()
            },
            events,
        );

        for latency in [1000, 1000, 100, 100, 100] {
            tracker.record_success("p1", latency, 10);
        }

        let snapshot = tracker.snapshot("p1").unwrap();
        assert_eq!(snapshot.request_count, 5);
        assert_eq!(snapshot.total_tokens, 50);
        assert!((snapshot.avg_latency_ms - 100.0).abs() < f64::EPSILON);
        assert_eq!(tracker.average_latency("p1"), Some(100.0));
    }

    #[tokio::test]
    async fn test_record_emits_metrics_updated() {
        let (tracker, events) = tracker();
        let mut rx = events.subscribe();

        tracker.record_success("p1", 250, 42);

        match rx.recv().await.unwrap() {
            DispatchEvent::MetricsUpdated {
                provider_id,
                request_count,
                avg_latency_ms,
                ..
            } => {
                assert_eq!(provider_id, "p1");
                assert_eq!(request_count, 1);
                assert!((avg_latency_ms - 250.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_health_transitions_emit_updates() {
        let (tracker, events) = tracker();
        let mut rx = events.subscribe();

        // 4 successes: still below min_requests_for_health
        for _ in 0..4 {
            tracker.record_success("p1", 10, 1);
        }
        assert_eq!(tracker.health("p1"), HealthStatus::Unknown);

        tracker.record_success("p1", 10, 1);
        assert_eq!(tracker.health("p1"), HealthStatus::Healthy);

        let err = DispatchError::Provider(ProviderError::network("down"));
        for _ in 0..5 {
            tracker.record_error("p1", &err, None);
        }
        assert_eq!(tracker.health("p1"), HealthStatus::Unhealthy);

        let mut health_updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DispatchEvent::HealthUpdate { status, .. } = event {
                health_updates.push(status);
            }
        }
        assert_eq!(
            health_updates,
            vec![
                HealthStatus::Healthy,
                HealthStatus::Degraded,
                HealthStatus::Unhealthy
            ]
        );

        let snapshot = tracker.snapshot("p1").unwrap();
        assert_eq!(snapshot.errors_by_kind.get("network"), Some(&5));
        assert!((snapshot.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_without_latency_leaves_average_alone() {
        let (tracker, _events) = tracker();
        tracker.record_success("p1", 200, 1);
        tracker.record_error("p1", &DispatchError::Aborted("r1".into()), None);
        tracker.record_error(
            "p1",
            &DispatchError::Provider(ProviderError::timeout("slow")),
            Some(400),
        );

        let snapshot = tracker.snapshot("p1").unwrap();
        assert_eq!(snapshot.error_count, 2);
        assert!((snapshot.avg_latency_ms - 300.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.errors_by_kind.get("aborted"), Some(&1));
    }

    #[test]
    fn test_prometheus_export() {
        let (tracker, _events) = tracker();
        tracker.record_success("alpha", 100, 7);
        tracker.record_utilization("alpha", 0.25);

        let text = tracker.to_prometheus();
        assert!(text.contains("# TYPE dispatch_requests_total counter"));
        assert!(text.contains("dispatch_requests_total{provider=\"alpha\"} 1"));
        assert!(text.contains("dispatch_tokens_total{provider=\"alpha\"} 7"));
        assert!(text.contains("dispatch_resource_utilization{provider=\"alpha\"} 0.25"));
    }
}

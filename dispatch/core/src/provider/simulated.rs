//! Simulated Provider
//!
//! A provider that needs no backend. It answers after a configurable latency,
//! fails on a deterministic schedule, streams its answer word by word, and
//! counts every call. The daemon runs it as a stand-in load target and the
//! test suites use it to drive failures through the real dispatch path.
//!
//! # Usage
//!
//! ```ignore
//! let factory = SimulatedProviderFactory::new(SimulatedBehavior::default());
//! factory.script().fail_next(2, ErrorKind::Network);
//!
//! // ...dispatch requests...
//!
//! assert_eq!(factory.script().stats().failures, 2);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use super::traits::{
    CompletionRequest, CompletionResponse, ModelInfo, Provider, ProviderCapabilities,
    ProviderConfig, ProviderFactory, ProviderSpec, StreamingToken, TokenUsage,
};
use crate::error::{ErrorKind, ProviderError};

/// Provider kind served by [`SimulatedProviderFactory`]
pub const SIMULATED_KIND: &str = "simulated";

// ============================================================================
// Behavior and Script
// ============================================================================

/// Timing and identity of simulated connections
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatedBehavior {
    /// Model name reported by `model_info`
    pub model: String,
    /// Time to answer a completion
    pub latency: Duration,
    /// Time `connect` takes
    pub connect_latency: Duration,
    /// Delay between streamed tokens
    pub token_delay: Duration,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            model: "sim-small".to_string(),
            latency: Duration::from_millis(50),
            connect_latency: Duration::from_millis(5),
            token_delay: Duration::from_millis(5),
        }
    }
}

impl SimulatedBehavior {
    /// Behavior with no delays at all
    #[must_use]
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
            connect_latency: Duration::ZERO,
            token_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set completion latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set connect latency
    #[must_use]
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }
}

/// Call counters shared by every instance built from one script
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStats {
    /// Provider instances created
    pub instances: u64,
    /// Successful connects
    pub connects: u64,
    /// Disconnects
    pub disconnects: u64,
    /// Completion calls (streaming included), successful or not
    pub calls: u64,
    /// Calls that failed by script
    pub failures: u64,
    /// Cancel requests received
    pub cancels: u64,
}

/// Failure schedule shared across instances
///
/// Failures are consumed in order by whichever instance makes the next call.
#[derive(Debug, Default)]
pub struct SimulationScript {
    completion_failures: Mutex<VecDeque<ErrorKind>>,
    connect_failures: Mutex<VecDeque<ErrorKind>>,
    instances: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    calls: AtomicU64,
    failures: AtomicU64,
    cancels: AtomicU64,
}

impl SimulationScript {
    /// Empty script: everything succeeds
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` completion calls with `kind`
    pub fn fail_next(&self, count: usize, kind: ErrorKind) {
        let mut queue = self.completion_failures.lock();
        queue.extend(std::iter::repeat(kind).take(count));
    }

    /// Fail the next `count` connect calls with `kind`
    pub fn fail_connect_next(&self, count: usize, kind: ErrorKind) {
        let mut queue = self.connect_failures.lock();
        queue.extend(std::iter::repeat(kind).take(count));
    }

    /// Drop any pending scripted failures
    pub fn clear(&self) {
        self.completion_failures.lock().clear();
        self.connect_failures.lock().clear();
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> SimulationStats {
        SimulationStats {
            instances: self.instances.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
        }
    }

    fn next_completion_failure(&self) -> Option<ErrorKind> {
        let failure = self.completion_failures.lock().pop_front();
        if failure.is_some() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        failure
    }

    fn next_connect_failure(&self) -> Option<ErrorKind> {
        self.connect_failures.lock().pop_front()
    }
}

// ============================================================================
// Simulated Provider
// ============================================================================

/// In-process provider with scripted behavior
pub struct SimulatedProvider {
    id: String,
    behavior: SimulatedBehavior,
    script: Arc<SimulationScript>,
    connected: Mutex<bool>,
    cancelled: Notify,
}

impl std::fmt::Debug for SimulatedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedProvider")
            .field("id", &self.id)
            .field("model", &self.behavior.model)
            .field("connected", &*self.connected.lock())
            .finish()
    }
}

impl SimulatedProvider {
    /// Standalone provider with its own script
    pub fn new(id: impl Into<String>, behavior: SimulatedBehavior) -> Self {
        Self::with_script(id, behavior, SimulationScript::new())
    }

    /// Provider sharing `script` with its siblings
    pub fn with_script(
        id: impl Into<String>,
        behavior: SimulatedBehavior,
        script: Arc<SimulationScript>,
    ) -> Self {
        script.instances.fetch_add(1, Ordering::Relaxed);
        Self {
            id: id.into(),
            behavior,
            script,
            connected: Mutex::new(false),
            cancelled: Notify::new(),
        }
    }

    /// The script driving this instance
    #[must_use]
    pub fn script(&self) -> &Arc<SimulationScript> {
        &self.script
    }

    /// Whether `connect` succeeded and `disconnect` has not been called since
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    fn model_info_now(&self) -> ModelInfo {
        ModelInfo {
            name: self.behavior.model.clone(),
            description: Some(format!("Simulated model served by {}", self.id)),
            context_window: Some(8192),
            loaded: self.is_connected(),
        }
    }

    /// Wait `delay`, or fail early if `cancel` is called
    async fn simulate_work(&self, delay: Duration) -> Result<(), ProviderError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.cancelled.notified() => Err(ProviderError::new(
                ErrorKind::Cancelled,
                format!("{} cancelled", self.id),
            )),
        }
    }

    fn begin_call(&self) -> Result<(), ProviderError> {
        self.script.calls.fetch_add(1, Ordering::Relaxed);
        if !self.is_connected() {
            return Err(ProviderError::network(format!("{} is not connected", self.id)));
        }
        if let Some(kind) = self.script.next_completion_failure() {
            return Err(ProviderError::new(kind, format!("scripted {kind} failure")));
        }
        Ok(())
    }

    fn respond(&self, request: &CompletionRequest) -> (String, TokenUsage) {
        let content = format!("Simulated response to: {}", request.prompt);
        let usage = TokenUsage {
            prompt_tokens: word_count(&request.prompt),
            completion_tokens: word_count(&content),
        };
        (content, usage)
    }
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self, _config: &ProviderConfig) -> Result<ModelInfo, ProviderError> {
        self.simulate_work(self.behavior.connect_latency).await?;
        if let Some(kind) = self.script.next_connect_failure() {
            return Err(ProviderError::new(kind, format!("{} refused connection", self.id)));
        }
        *self.connected.lock() = true;
        self.script.connects.fetch_add(1, Ordering::Relaxed);
        Ok(self.model_info_now())
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        *self.connected.lock() = false;
        self.script.disconnects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn model_info(&self) -> Result<ModelInfo, ProviderError> {
        Ok(self.model_info_now())
    }

    async fn generate_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let started = Instant::now();
        self.begin_call()?;
        self.simulate_work(self.behavior.latency).await?;

        let (content, usage) = self.respond(request);
        let model = if request.model.is_empty() {
            self.behavior.model.clone()
        } else {
            request.model.clone()
        };
        Ok(CompletionResponse {
            content,
            model,
            usage,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, ProviderError> {
        self.begin_call()?;
        self.simulate_work(self.behavior.latency).await?;

        let (content, usage) = self.respond(request);
        let token_delay = self.behavior.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for word in content.split_whitespace() {
                if !token_delay.is_zero() {
                    tokio::time::sleep(token_delay).await;
                }
                if tx.send(StreamingToken::Token(format!("{word} "))).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(StreamingToken::Complete {
                    message: content,
                    usage,
                })
                .await;
        });

        Ok(rx)
    }

    async fn cancel(&self) {
        self.script.cancels.fetch_add(1, Ordering::Relaxed);
        self.cancelled.notify_waiters();
    }

    async fn health_check(&self) -> bool {
        self.is_connected()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`SimulatedProvider`]s that share one script
#[derive(Clone, Debug)]
pub struct SimulatedProviderFactory {
    behavior: SimulatedBehavior,
    script: Arc<SimulationScript>,
}

impl SimulatedProviderFactory {
    /// Factory with a fresh script
    #[must_use]
    pub fn new(behavior: SimulatedBehavior) -> Self {
        Self {
            behavior,
            script: SimulationScript::new(),
        }
    }

    /// Script shared by every instance this factory creates
    #[must_use]
    pub fn script(&self) -> &Arc<SimulationScript> {
        &self.script
    }

    /// Spec describing a simulated provider with this factory's model
    #[must_use]
    pub fn spec(&self, id: impl Into<String>) -> ProviderSpec {
        ProviderSpec::new(id, SIMULATED_KIND).with_capabilities(ProviderCapabilities {
            streaming: true,
            cancellation: true,
            models: vec![self.behavior.model.clone()],
        })
    }
}

impl ProviderFactory for SimulatedProviderFactory {
    fn create(&self, spec: &ProviderSpec) -> Result<Arc<dyn Provider>, ProviderError> {
        if spec.kind != SIMULATED_KIND {
            return Err(ProviderError::invalid_request(format!(
                "simulated factory cannot build provider kind '{}'",
                spec.kind
            )));
        }
        Ok(Arc::new(SimulatedProvider::with_script(
            spec.id.clone(),
            self.behavior.clone(),
            Arc::clone(&self.script),
        )))
    }
}

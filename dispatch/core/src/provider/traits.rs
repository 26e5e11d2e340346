//! Provider Traits
//!
//! The abstract capability the dispatch core drives. A `Provider` is one live
//! connection to an LLM backend; a `ProviderFactory` builds a fresh one from a
//! `ProviderSpec` each time the pool needs another connection. Wire protocols
//! (HTTP, local process, ...) live entirely behind these traits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;

/// Token stream events from a provider
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// A token from the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message
        message: String,
        /// Token accounting for the whole response
        usage: TokenUsage,
    },
    /// Error occurred during streaming
    Error(ProviderError),
}

/// A completion request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The prompt to send
    pub prompt: String,
    /// Model to use (provider-specific identifier)
    pub model: String,
    /// Maximum tokens in response (0 = provider default)
    pub max_tokens: u32,
    /// Temperature (0.0-1.0)
    pub temperature: f32,
    /// System prompt
    pub system: Option<String>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: String::new(),
            max_tokens: 0,
            temperature: 0.7,
            system: None,
        }
    }
}

impl CompletionRequest {
    /// Create a request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,
    /// Tokens generated
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Prompt plus completion
    #[must_use]
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Response from a non-streaming completion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The response text
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Token accounting
    pub usage: TokenUsage,
    /// Time the provider spent generating, in milliseconds
    pub duration_ms: u64,
}

/// Information about the model behind a connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Context window in tokens (if known)
    pub context_window: Option<u32>,
    /// Whether the model is loaded and ready
    pub loaded: bool,
}

/// What a provider can do
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Supports `stream_completion`
    pub streaming: bool,
    /// Honors `cancel`
    pub cancellation: bool,
    /// Models it serves
    pub models: Vec<String>,
}

/// Per-provider configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Endpoint address, meaning is provider-specific
    pub endpoint: Option<String>,
    /// Model used when a request names none
    pub default_model: Option<String>,
    /// Overrides the pool's global connection limit for this provider
    pub max_connections: Option<usize>,
    /// Connect timeout in milliseconds, if the provider enforces its own
    pub connect_timeout_ms: Option<u64>,
    /// Free-form provider options
    pub options: HashMap<String, String>,
}

impl ProviderConfig {
    /// Connect timeout as a Duration
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Everything a factory needs to build a connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider identifier (unique within a registry)
    pub id: String,
    /// Provider type, e.g. `"simulated"`
    pub kind: String,
    /// Capability descriptor
    pub capabilities: ProviderCapabilities,
    /// Configuration
    pub config: ProviderConfig,
}

impl ProviderSpec {
    /// Create a spec with default capabilities and configuration
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            capabilities: ProviderCapabilities::default(),
            config: ProviderConfig::default(),
        }
    }

    /// Set capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }
}

/// One live connection to an LLM backend
///
/// Implementations own their transport. The pool guarantees exclusive use:
/// a provider instance serves at most one request at a time.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier
    fn id(&self) -> &str;

    /// Open the connection, returning the model it is bound to
    async fn connect(&self, config: &ProviderConfig) -> Result<ModelInfo, ProviderError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), ProviderError>;

    /// Model behind this connection
    async fn model_info(&self) -> Result<ModelInfo, ProviderError>;

    /// Send a request and wait for the complete response
    async fn generate_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Send a request and receive tokens as they arrive
    ///
    /// The channel closes after `Complete` or `Error`.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, ProviderError>;

    /// Abort whatever this connection is doing
    ///
    /// Providers without cancellation support ignore it.
    async fn cancel(&self) {}

    /// Whether the backend is reachable
    async fn health_check(&self) -> bool;
}

/// Builds fresh provider connections
pub trait ProviderFactory: Send + Sync {
    /// Create a new, unconnected provider instance
    ///
    /// # Errors
    ///
    /// Returns an error if the spec cannot be served by this factory.
    fn create(&self, spec: &ProviderSpec) -> Result<Arc<dyn Provider>, ProviderError>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&ProviderSpec) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync,
{
    fn create(&self, spec: &ProviderSpec) -> Result<Arc<dyn Provider>, ProviderError> {
        self(spec)
    }
}

//! Providers
//!
//! The provider abstraction, the registry of known providers, and an
//! in-process simulated provider.

pub mod registry;
pub mod simulated;
pub mod traits;

pub use registry::{ProviderRegistration, ProviderRegistry, ProviderStatus};
pub use simulated::{
    SimulatedBehavior, SimulatedProvider, SimulatedProviderFactory, SimulationScript,
    SimulationStats, SIMULATED_KIND,
};
pub use traits::{
    CompletionRequest, CompletionResponse, ModelInfo, Provider, ProviderCapabilities,
    ProviderConfig, ProviderFactory, ProviderSpec, StreamingToken, TokenUsage,
};

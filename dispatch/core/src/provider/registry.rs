//! Provider Registry
//!
//! Known providers in registration order. Lookup of "the next usable
//! provider" walks that order and takes the first one whose status is
//! `Active`, so earlier registrations win.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::traits::{ProviderCapabilities, ProviderConfig, ProviderSpec};
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventBus};

/// Availability of a registered provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Usable for new requests
    Active,
    /// Registered but switched off
    Inactive,
    /// Failing; skipped until it recovers
    Error,
}

impl ProviderStatus {
    /// Get display label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A provider known to the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderRegistration {
    /// Provider identifier
    pub id: String,
    /// Provider type
    pub kind: String,
    /// Capability descriptor
    pub capabilities: ProviderCapabilities,
    /// Configuration
    pub config: ProviderConfig,
    /// When it was registered
    pub registered_at: DateTime<Utc>,
    /// Current status
    pub status: ProviderStatus,
}

impl ProviderRegistration {
    /// Rebuild the spec this registration came from
    #[must_use]
    pub fn spec(&self) -> ProviderSpec {
        ProviderSpec {
            id: self.id.clone(),
            kind: self.kind.clone(),
            capabilities: self.capabilities.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, ProviderRegistration>,
    /// Ids in registration order, earliest first
    order: Vec<String>,
}

/// Registered providers with FIFO lookup priority
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
    events: EventBus,
}

impl ProviderRegistry {
    /// Create an empty registry publishing to `events`
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    /// Register a provider; it starts out `Active`
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the id is taken.
    pub fn register_provider(&self, spec: ProviderSpec) -> Result<()> {
        let id = spec.id.clone();
        {
            let mut inner = self.inner.write();
            if inner.entries.contains_key(&id) {
                return Err(DispatchError::AlreadyRegistered(id));
            }
            let registration = ProviderRegistration {
                id: spec.id,
                kind: spec.kind,
                capabilities: spec.capabilities,
                config: spec.config,
                registered_at: Utc::now(),
                status: ProviderStatus::Active,
            };
            inner.entries.insert(id.clone(), registration);
            inner.order.push(id.clone());
        }

        tracing::info!(provider = %id, "Provider registered");
        self.events.emit(DispatchEvent::ProviderRegistered {
            provider_id: id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Remove a provider
    ///
    /// # Errors
    ///
    /// `ProviderNotFound` if the id is unknown.
    pub fn unregister_provider(&self, id: &str) -> Result<ProviderRegistration> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner
                .entries
                .remove(id)
                .ok_or_else(|| DispatchError::ProviderNotFound(id.to_string()))?;
            inner.order.retain(|entry| entry != id);
            removed
        };

        tracing::info!(provider = %id, "Provider unregistered");
        self.events.emit(DispatchEvent::ProviderUnregistered {
            provider_id: id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(removed)
    }

    /// First `Active` provider in registration order
    #[must_use]
    pub fn get_next_available_provider(&self) -> Option<ProviderRegistration> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .find(|reg| reg.status == ProviderStatus::Active)
            .cloned()
    }

    /// Set a provider's status
    ///
    /// # Errors
    ///
    /// `ProviderNotFound` if the id is unknown.
    pub fn update_provider_state(&self, id: &str, status: ProviderStatus) -> Result<()> {
        let previous = {
            let mut inner = self.inner.write();
            let entry = inner
                .entries
                .get_mut(id)
                .ok_or_else(|| DispatchError::ProviderNotFound(id.to_string()))?;
            std::mem::replace(&mut entry.status, status)
        };

        if previous != status {
            tracing::debug!(provider = %id, from = %previous, to = %status, "Provider status changed");
        }
        self.events.emit(DispatchEvent::ProviderStatusChanged {
            provider_id: id.to_string(),
            status,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Registration for an id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ProviderRegistration> {
        self.inner.read().entries.get(id).cloned()
    }

    /// Current status for an id
    #[must_use]
    pub fn state(&self, id: &str) -> Option<ProviderStatus> {
        self.inner.read().entries.get(id).map(|r| r.status)
    }

    /// All registrations in priority order
    #[must_use]
    pub fn list(&self) -> Vec<ProviderRegistration> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether no provider is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

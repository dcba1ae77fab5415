//! Provider registry: resolves the active provider id to an instance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tasksync_common::{Error, Result};

use crate::config::SyncProviderPrivateCfg;
use crate::http::HttpProvider;
use crate::provider::SyncProvider;

/// Factory function type for creating providers.
pub type ProviderFactory =
    Box<dyn Fn(&SyncProviderPrivateCfg) -> Result<Arc<dyn SyncProvider>> + Send + Sync>;

/// Which provider is active. Written by the settings surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveProvider {
    pub provider_id: String,
}

/// Registry for sync provider factories.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - `name` is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Provider '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build the provider named by `active` from its private config.
    ///
    /// # Errors
    /// - Provider not registered
    /// - Configuration invalid
    pub fn resolve(
        &self,
        active: &ActiveProvider,
        cfg: &SyncProviderPrivateCfg,
    ) -> Result<Arc<dyn SyncProvider>> {
        let factory = self.factories.get(&active.provider_id).ok_or_else(|| {
            Error::NotFound(format!("Provider '{}' is not registered", active.provider_id))
        })?;
        cfg.validate()?;
        factory(cfg)
    }

    /// Registered provider names.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the built-in HTTP provider.
pub fn create_default_registry(request_timeout: Duration) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.factories.insert(
        "http".to_string(),
        Box::new(
            move |cfg: &SyncProviderPrivateCfg| -> Result<Arc<dyn SyncProvider>> {
                Ok(Arc::new(HttpProvider::new(cfg, request_timeout)?))
            },
        ),
    );
    registry
}

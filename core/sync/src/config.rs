//! Engine configuration and the settings store boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use tasksync_common::{Error, Result};
use tasksync_crypto::KdfParams;
use tasksync_provider::{ActiveProvider, SyncProviderPrivateCfg};

use crate::scheduler::SyncMode;

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Upper bound on every remote call.
    pub request_timeout_ms: u64,
    /// Most ops sent in one upload request.
    pub max_ops_per_upload: usize,
    /// Most serialized bytes sent in one upload request.
    pub max_upload_bytes: usize,
    /// Page size for downloads.
    pub download_page_limit: usize,
    /// Retries for transient transport failures within one call.
    /// Retries of a transient failure within one remote call.
    pub max_retries: u32,
    /// First backoff delay; doubled on each further retry.
    pub retry_initial_delay_ms: u64,
    /// Opportunistically move unencrypted accounts to the server-derived key.
    pub auto_encryption_enabled: bool,
    pub sync_mode: SyncMode,
    pub kdf: KdfParams,
}

impl SyncConfig {
    /// Upper bound on one remote call, retries included.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_ops_per_upload: 100,
            max_upload_bytes: 1024 * 1024,
            download_page_limit: 500,
            max_retries: 3,
            retry_initial_delay_ms: 500,
            auto_encryption_enabled: false,
            sync_mode: SyncMode::Manual,
            kdf: KdfParams::default(),
        }
    }
}

/// Everything the settings surface persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_provider: Option<ActiveProvider>,
    #[serde(default)]
    pub providers: BTreeMap<String, SyncProviderPrivateCfg>,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Settings {
    /// Check every provider config and that the active one exists.
    pub fn validate(&self) -> Result<()> {
        for (id, cfg) in &self.providers {
            cfg.validate()
                .map_err(|e| Error::Config(format!("Provider '{}': {}", id, e)))?;
        }
        if let Some(active) = &self.active_provider {
            if !self.providers.contains_key(&active.provider_id) {
                return Err(Error::Config(format!(
                    "Active provider '{}' has no configuration",
                    active.provider_id
                )));
            }
        }
        Ok(())
    }

    /// The active provider and its private config.
    ///
    /// # Errors
    /// - No provider selected
    pub fn active(&self) -> Result<(&ActiveProvider, &SyncProviderPrivateCfg)> {
        let active = self
            .active_provider
            .as_ref()
            .ok_or_else(|| Error::Config("No sync provider selected".to_string()))?;
        let cfg = self.providers.get(&active.provider_id).ok_or_else(|| {
            Error::Config(format!(
                "Active provider '{}' has no configuration",
                active.provider_id
            ))
        })?;
        Ok((active, cfg))
    }

    /// Copy with the active provider's config replaced.
    pub fn with_active_cfg(&self, cfg: SyncProviderPrivateCfg) -> Result<Self> {
        let (active, _) = self.active()?;
        let mut next = self.clone();
        next.providers.insert(active.provider_id.clone(), cfg);
        Ok(next)
    }

    /// Select `provider_id` and store its config.
    pub fn select(&mut self, provider_id: impl Into<String>, cfg: SyncProviderPrivateCfg) {
        let provider_id = provider_id.into();
        self.providers.insert(provider_id.clone(), cfg);
        self.active_provider = Some(ActiveProvider { provider_id });
    }
}

/// Persistence boundary for [`Settings`].
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load settings, defaults when nothing is stored yet.
    async fn load(&self) -> Result<Settings>;

    /// Validate and persist settings.
    async fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings held in memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    settings: RwLock<Settings>,
}

impl MemoryConfigStore {
    /// Store pre-filled with `settings`.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<Settings> {
        Ok(self.settings.read().await.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        *self.settings.write().await = settings.clone();
        Ok(())
    }
}

/// Settings in a JSON file, replaced atomically on save.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    /// Store backed by the JSON file at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> Result<Settings> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

//! Import conflicts: the one place a person breaks a tie.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use tasksync_common::SyncImportReason;

/// Which side's full-state import would discard the other side's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportConflictScenario {
    /// A remote import arrived while local ops are still pending.
    IncomingImport,
    /// A pending local import would supersede remote ops we have not seen.
    LocalImportFiltersRemote,
}

/// What the user is asked about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConflict {
    pub scenario: ImportConflictScenario,
    pub reason: SyncImportReason,
    /// Local ops that would be lost (incoming) or remote ops that would be
    /// superseded (local import).
    pub affected_ops: usize,
}

impl ImportConflict {
    /// Prompt text for the conflict dialog.
    pub fn message(&self) -> String {
        match self.scenario {
            ImportConflictScenario::IncomingImport => format!(
                "Another device replaced all sync data because {}. {} local change(s) not yet \
                 synced would be lost. Keep the remote data or upload your local data instead?",
                self.reason, self.affected_ops
            ),
            ImportConflictScenario::LocalImportFiltersRemote => format!(
                "Your data is about to replace all sync data because {}, but {} change(s) from \
                 other devices arrived meanwhile. Upload your local data anyway or keep the remote \
                 data?",
                self.reason, self.affected_ops
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportResolution {
    UseLocal,
    UseRemote,
    /// Decide later; sync stays disabled until re-enabled.
    Cancel,
}

#[async_trait]
pub trait ImportConflictHandler: Send + Sync {
    async fn resolve(&self, conflict: &ImportConflict) -> ImportResolution;
}

/// Always answers the same; records what it was asked.
#[derive(Debug)]
pub struct StaticConflictHandler {
    resolution: ImportResolution,
    asked: Mutex<Vec<ImportConflict>>,
}

impl StaticConflictHandler {
    pub fn new(resolution: ImportResolution) -> Self {
        Self {
            resolution,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Every conflict this handler was asked about, oldest first.
    pub fn asked(&self) -> Vec<ImportConflict> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Default for StaticConflictHandler {
    fn default() -> Self {
        Self::new(ImportResolution::UseRemote)
    }
}

#[async_trait]
impl ImportConflictHandler for StaticConflictHandler {
    async fn resolve(&self, conflict: &ImportConflict) -> ImportResolution {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(conflict.clone());
        }
        self.resolution
    }
}

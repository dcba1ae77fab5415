//! Cycle status and outcome reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the engine is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Uploading,
    Downloading,
    Applying,
    InSync,
    Error,
}

impl SyncStatus {
    /// Whether a cycle is currently running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SyncStatus::Uploading | SyncStatus::Downloading | SyncStatus::Applying
        )
    }
}

/// Result of one completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// `InSync` or `Error`.
    pub status: SyncStatus,
    pub uploaded: usize,
    pub rejected: usize,
    pub downloaded: usize,
    /// Remote ops that changed local state.
    pub applied: usize,
    /// Remote ops skipped as unreadable or too new.
    pub skipped: usize,
    /// A full-state import was uploaded this cycle.
    pub import_uploaded: bool,
    pub reason: Option<String>,
    pub duration: Duration,
}

impl SyncOutcome {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status,
            uploaded: 0,
            rejected: 0,
            downloaded: 0,
            applied: 0,
            skipped: 0,
            import_uploaded: false,
            reason: None,
            duration: Duration::ZERO,
        }
    }

    /// Mark the cycle failed with a reason, keeping the first reason seen.
    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = SyncStatus::Error;
        if self.reason.is_none() {
            self.reason = Some(reason.into());
        }
    }
}

/// Result of [`SyncEngine::trigger`](crate::SyncEngine::trigger).
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Ran(SyncOutcome),
    /// A cycle was already running; it will run once more when done.
    Coalesced,
}

/// Snapshot of the engine's status for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub sync_disabled: bool,
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            reason: None,
            last_cycle_at: None,
            sync_disabled: false,
        }
    }
}

impl StatusReport {
    pub fn has_sync_error(&self) -> bool {
        self.status == SyncStatus::Error
    }
}

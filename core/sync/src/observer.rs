//! Explicit notification interface for the layer embedding the engine.

use std::sync::Mutex;
use tracing::{error, info, warn};

use tasksync_common::Operation;

use crate::conflict::ImportConflict;
use crate::status::SyncStatus;

/// Something the user has to see and acknowledge.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    /// The remote refused a whole upload batch as too large. The ops stay
    /// pending and go out in smaller batches.
    PayloadTooLarge { pending_ops: usize },
    /// The remote no longer accepts our credentials.
    AuthenticationRequired,
    /// An import conflict was resolved by cancelling; sync is disabled.
    SyncDisabled(ImportConflict),
    /// A destructive remote operation failed half-way.
    Critical(String),
}

/// Receives engine events. Every method has a no-op default.
pub trait SyncObserver: Send + Sync {
    fn on_status(&self, _status: SyncStatus, _reason: Option<&str>) {}

    /// Remote operations that changed local state, after they were applied.
    fn on_remote_applied(&self, _ops: &[Operation]) {}

    fn on_alert(&self, _alert: &Alert) {}
}

/// Ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Writes events to the tracing log.
#[derive(Debug, Default)]
pub struct LogObserver;

impl SyncObserver for LogObserver {
    fn on_status(&self, status: SyncStatus, reason: Option<&str>) {
        match reason {
            Some(reason) => info!("Sync status {:?}: {}", status, reason),
            None => info!("Sync status {:?}", status),
        }
    }

    fn on_remote_applied(&self, ops: &[Operation]) {
        info!("Applied {} remote operations", ops.len());
    }

    fn on_alert(&self, alert: &Alert) {
        match alert {
            Alert::Critical(message) => error!("{}", message),
            other => warn!("{:?}", other),
        }
    }
}

/// Keeps every event, for assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    statuses: Mutex<Vec<SyncStatus>>,
    applied: Mutex<Vec<Operation>>,
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingObserver {
    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.statuses.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Every remote op reported as applied, in report order.
    pub fn applied(&self) -> Vec<Operation> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_status(&self, status: SyncStatus, _reason: Option<&str>) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push(status);
        }
    }

    fn on_remote_applied(&self, ops: &[Operation]) {
        if let Ok(mut applied) = self.applied.lock() {
            applied.extend_from_slice(ops);
        }
    }

    fn on_alert(&self, alert: &Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
    }
}

//! TaskSync Sync Engine
//!
//! This crate drives replication of the local operation log against a
//! remote sync provider, including:
//! - Single-flight sync cycles with trigger coalescing
//! - Chunked uploads with rejection classification and 413 back-off
//! - Paged downloads with full-batch decryption and schema migration
//! - Full-state imports: server migration, forced uploads, backups
//! - Import conflict resolution through a pluggable handler
//! - Enabling and disabling payload encryption (manual and automatic)
//! - On-demand and periodic scheduling

mod cipher;
pub mod classifier;
pub mod config;
pub mod conflict;
mod encryption;
pub mod engine;
mod import;
pub mod observer;
pub mod retry;
pub mod scheduler;
mod snapshot;
pub mod status;
pub mod write_guard;

#[cfg(test)]
mod scenarios;

pub use classifier::{classify_failure, classify_rejection, FailureAction, RejectionAction};
pub use config::{ConfigStore, FileConfigStore, MemoryConfigStore, Settings, SyncConfig};
pub use conflict::{
    ImportConflict, ImportConflictHandler, ImportConflictScenario, ImportResolution,
    StaticConflictHandler,
};
pub use engine::SyncEngine;
pub use observer::{Alert, LogObserver, NoopObserver, RecordingObserver, SyncObserver};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use status::{StatusReport, SyncOutcome, SyncStatus, TriggerOutcome};
pub use write_guard::{BeingWrittenSet, WriteGuard};

//! Sync provider abstraction for TaskSync.
//!
//! A provider is the uniform protocol surface over a remote sync backend:
//! upload and download of operations, full-state snapshots, remote data
//! deletion and the server-derived encryption key. [`HttpProvider`] speaks
//! the JSON-over-HTTPS protocol; [`MemoryServer`] is an in-process reference
//! server used to run several clients against one remote.

pub mod config;
pub mod http;
pub mod memory;
pub mod provider;
pub mod registry;

pub use config::SyncProviderPrivateCfg;
pub use http::HttpProvider;
pub use memory::{MemoryProvider, MemoryServer};
pub use provider::{
    error_codes, DownloadResponse, RemoteOp, SnapshotResponse, SnapshotUpload, SyncProvider,
    UploadRequest, UploadResponse,
};
pub use registry::{create_default_registry, ActiveProvider, ProviderFactory, ProviderRegistry};

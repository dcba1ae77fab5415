//! Operation log, materialized state and backup documents.

pub mod backup;
pub mod migration;
pub mod snapshot;
pub mod state;
pub mod store;

pub use backup::{
    backup_from_state, is_legacy_backup, migrate_legacy_backup, state_from_backup,
    INBOX_PROJECT_ID, REQUIRED_SECTIONS,
};
pub use migration::{migrate_operation, validate_operation, Migrated};
pub use snapshot::StateSnapshot;
pub use state::{AppState, EntityRecord, FieldRegister, WriteStamp};
pub use store::{CompactionReport, OpLogStore, OpStatus};

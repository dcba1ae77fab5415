//! Operations: the durable, clock-stamped mutation records that are synced.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::clock::{detect_duplicate, VectorClock};
use crate::types::{ClientId, OpId};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Oldest schema version that can still be migrated forward.
pub const MIN_SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Entity type used by full-state `SyncImport` operations.
pub const ENTITY_TYPE_ALL: &str = "ALL";

/// Kind of mutation an operation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Create,
    Update,
    Delete,
    /// Full-state replacement; payload is the whole materialized state.
    SyncImport,
}

impl OpType {
    /// Stable textual form, matching the wire encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Create => "CREATE",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::SyncImport => "SYNC_IMPORT",
        }
    }
}

/// Why a full-state import happened. Selects the conflict prompt wording and
/// which resolutions are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncImportReason {
    PasswordChanged,
    FileImport,
    BackupRestore,
    ForceUpload,
    ServerMigration,
    Repair,
}

impl SyncImportReason {
    /// Human readable explanation shown next to an import conflict.
    pub fn describe(&self) -> &'static str {
        match self {
            SyncImportReason::PasswordChanged => "the encryption password was changed",
            SyncImportReason::FileImport => "data was imported from a file",
            SyncImportReason::BackupRestore => "a backup was restored",
            SyncImportReason::ForceUpload => "a full upload was forced",
            SyncImportReason::ServerMigration => "data was migrated to a new sync server",
            SyncImportReason::Repair => "local data was repaired",
        }
    }
}

impl fmt::Display for SyncImportReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// One immutable mutation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OpId,
    pub entity_type: String,
    pub entity_id: String,
    pub op_type: OpType,
    /// Opaque to the engine. A base64 string when `is_payload_encrypted`.
    pub payload: Value,
    /// Snapshot of the creating client's clock, already advanced.
    pub vector_clock: VectorClock,
    /// Creation time, unix milliseconds.
    pub timestamp: i64,
    pub schema_version: u32,
    pub client_id: ClientId,
    #[serde(default)]
    pub is_payload_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_import_reason: Option<SyncImportReason>,
}

impl Operation {
    /// Build a new operation at the current schema version.
    ///
    /// # Preconditions
    /// - `vector_clock` has already been advanced for `client_id`
    pub fn new(
        client_id: ClientId,
        vector_clock: VectorClock,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        op_type: OpType,
        payload: Value,
    ) -> Self {
        Self {
            id: OpId::generate(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            op_type,
            payload,
            vector_clock,
            timestamp: Utc::now().timestamp_millis(),
            schema_version: CURRENT_SCHEMA_VERSION,
            client_id,
            is_payload_encrypted: false,
            sync_import_reason: None,
        }
    }

    /// Build a full-state import operation.
    pub fn sync_import(
        client_id: ClientId,
        vector_clock: VectorClock,
        state: Value,
        reason: SyncImportReason,
    ) -> Self {
        let mut op = Self::new(
            client_id,
            vector_clock,
            ENTITY_TYPE_ALL,
            "",
            OpType::SyncImport,
            state,
        );
        op.sync_import_reason = Some(reason);
        op
    }

    /// Whether this is a full-state replacement.
    pub fn is_full_state(&self) -> bool {
        self.op_type == OpType::SyncImport
    }

    /// Whether this op has already been reflected in `local_clock`.
    pub fn is_duplicate_of(&self, local_clock: &VectorClock) -> bool {
        detect_duplicate(&self.vector_clock, local_clock)
    }
}

/// An operation the remote refused, reported once per upload response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOp {
    pub op_id: OpId,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

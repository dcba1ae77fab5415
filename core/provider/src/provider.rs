//! Sync provider trait and wire types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tasksync_common::{ClientId, OpId, Operation, RejectedOp, Result, SyncImportReason, VectorClock};

/// Known `RejectedOp::error_code` values.
pub mod error_codes {
    /// The op is structurally invalid; resending it cannot succeed.
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    /// The op id is already stored remotely.
    pub const DUPLICATE_OPERATION: &str = "DUPLICATE_OPERATION";
}

/// An operation as stored remotely, tagged with its server sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOp {
    pub server_seq: u64,
    pub op: Operation,
}

/// Body of `POST /api/sync/ops`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub ops: Vec<Operation>,
    pub client_id: ClientId,
    /// Ops from other clients past this sequence are piggybacked back.
    pub last_known_server_seq: u64,
}

/// Response of `POST /api/sync/ops`. Ops not listed in `rejected_ops` were
/// accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    #[serde(default)]
    pub piggybacked: Vec<RemoteOp>,
    #[serde(default)]
    pub rejected_ops: Vec<RejectedOp>,
    pub latest_seq: u64,
}

/// Response of `GET /api/sync/ops?since=<seq>&limit=<n>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub ops: Vec<RemoteOp>,
    pub latest_seq: u64,
    #[serde(default)]
    pub has_more: bool,
}

/// Body of `POST /api/sync/snapshot`: a full-state replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpload {
    pub op_id: OpId,
    /// Serialized state, or a base64 string when encrypted.
    pub state: Value,
    pub client_id: ClientId,
    pub vector_clock: VectorClock,
    pub timestamp: i64,
    pub schema_version: u32,
    pub is_payload_encrypted: bool,
    pub reason: SyncImportReason,
}

impl SnapshotUpload {
    /// Wrap a prepared SyncImport operation.
    pub fn from_operation(op: &Operation, reason: SyncImportReason) -> Self {
        Self {
            op_id: op.id.clone(),
            state: op.payload.clone(),
            client_id: op.client_id.clone(),
            vector_clock: op.vector_clock.clone(),
            timestamp: op.timestamp,
            schema_version: op.schema_version,
            is_payload_encrypted: op.is_payload_encrypted,
            reason,
        }
    }

    /// The operation other clients will download for this snapshot.
    pub fn to_operation(&self) -> Operation {
        let mut op = Operation::sync_import(
            self.client_id.clone(),
            self.vector_clock.clone(),
            self.state.clone(),
            self.reason,
        );
        op.id = self.op_id.clone();
        op.timestamp = self.timestamp;
        op.schema_version = self.schema_version;
        op.is_payload_encrypted = self.is_payload_encrypted;
        op
    }
}

/// Response of `POST /api/sync/snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub accepted: bool,
    #[serde(default)]
    pub server_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Uniform protocol surface over a remote sync backend.
///
/// Implementations translate transport outcomes into the common error type:
/// HTTP 413 is [`Error::PayloadTooLarge`](tasksync_common::Error::PayloadTooLarge),
/// 401 is `Unauthorized`, connection failures are `Network`.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Provider kind (e.g. "http", "memory").
    fn id(&self) -> &str;

    /// Identity of the remote store and account. Changes when the user
    /// switches server or account.
    fn account_key(&self) -> String;

    /// Upload a batch of operations.
    ///
    /// # Postconditions
    /// - Every op is either stored or listed in `rejected_ops`
    /// - Re-sending an already stored op id yields `DUPLICATE_OPERATION`
    ///
    /// # Errors
    /// - Whole batch too large (`PayloadTooLarge`)
    /// - Network/authentication errors
    async fn upload_ops(&self, request: &UploadRequest) -> Result<UploadResponse>;

    /// Download operations with `server_seq > since_seq`, at most `limit`.
    async fn download_ops(&self, since_seq: u64, limit: usize) -> Result<DownloadResponse>;

    /// Upload a full-state snapshot. Other clients receive it as a
    /// SyncImport op at the returned sequence.
    async fn upload_snapshot(&self, snapshot: &SnapshotUpload) -> Result<SnapshotResponse>;

    /// Delete every stored op for the account.
    async fn delete_all_data(&self) -> Result<()>;

    /// Fetch the server-derived encryption key (base64, 32 bytes).
    ///
    /// # Errors
    /// - `NotSupported` when the remote has no key endpoint
    async fn fetch_auto_encryption_key(&self) -> Result<String>;
}

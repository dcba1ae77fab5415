//! In-memory sync server and provider.
//!
//! `MemoryServer` implements the remote protocol the way the production
//! server does: per-account op storage with monotonically increasing
//! sequence numbers, duplicate detection by op id, validation, piggybacking,
//! snapshots and HMAC-derived encryption keys. Several `MemoryProvider`s can
//! share one server to simulate multiple devices. Fault hooks let tests
//! inject rejections, payload limits, transport failures and latency.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use tasksync_common::{Error, OpId, OpType, Operation, RejectedOp, Result};
use tasksync_crypto::derive_auto_encryption_key;

use crate::provider::{
    error_codes, DownloadResponse, RemoteOp, SnapshotResponse, SnapshotUpload, SyncProvider,
    UploadRequest, UploadResponse,
};

#[derive(Default)]
struct Account {
    ops: Vec<RemoteOp>,
    ids: HashSet<OpId>,
    last_seq: u64,
}

impl Account {
    fn push(&mut self, op: Operation) -> u64 {
        self.last_seq += 1;
        self.ids.insert(op.id.clone());
        self.ops.push(RemoteOp {
            server_seq: self.last_seq,
            op,
        });
        self.last_seq
    }
}

#[derive(Default)]
struct Faults {
    /// entity id -> error code returned for every op touching it
    entity_rejections: HashMap<String, String>,
    max_payload_bytes: Option<usize>,
    failing_requests: usize,
    fail_snapshots: bool,
    key_endpoint_missing: bool,
    latency: Option<Duration>,
}

#[derive(Default)]
struct ServerState {
    accounts: HashMap<String, Account>,
    faults: Faults,
    upload_batches: Vec<Vec<OpId>>,
}

/// Shared in-memory remote.
pub struct MemoryServer {
    name: String,
    secret: Vec<u8>,
    state: Mutex<ServerState>,
}

impl MemoryServer {
    /// Create an empty server. `name` distinguishes servers in account keys.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            secret: format!("memory-server-secret:{}", name).into_bytes(),
            name,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Provider acting for `user_id` on this server.
    pub fn provider(self: &Arc<Self>, user_id: impl Into<String>) -> MemoryProvider {
        MemoryProvider {
            server: Arc::clone(self),
            user_id: user_id.into(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("Memory server lock poisoned".to_string()))
    }

    fn check_transport(state: &mut ServerState) -> Result<()> {
        if state.faults.failing_requests > 0 {
            state.faults.failing_requests -= 1;
            return Err(Error::Network("Injected transport failure".to_string()));
        }
        Ok(())
    }

    fn check_size<T: serde::Serialize>(state: &ServerState, body: &T) -> Result<()> {
        if let Some(max) = state.faults.max_payload_bytes {
            let size = serde_json::to_vec(body)?.len();
            if size > max {
                return Err(Error::PayloadTooLarge(format!(
                    "{} bytes exceeds limit of {}",
                    size, max
                )));
            }
        }
        Ok(())
    }

    fn validate(op: &Operation) -> Option<&'static str> {
        let needs_entity = op.op_type != OpType::SyncImport;
        if op.entity_type.is_empty() || (needs_entity && op.entity_id.is_empty()) {
            Some("entityId is required")
        } else {
            None
        }
    }

    fn handle_upload(&self, user: &str, request: &UploadRequest) -> Result<UploadResponse> {
        let mut state = self.lock()?;
        Self::check_transport(&mut state)?;
        Self::check_size(&state, request)?;

        state
            .upload_batches
            .push(request.ops.iter().map(|op| op.id.clone()).collect());

        let ServerState {
            accounts, faults, ..
        } = &mut *state;
        let account = accounts.entry(user.to_string()).or_default();
        let mut rejected_ops = Vec::new();
        let mut stored = HashSet::new();

        for op in &request.ops {
            let rejection = if account.ids.contains(&op.id) {
                Some((error_codes::DUPLICATE_OPERATION.to_string(), "Duplicate op id"))
            } else if let Some(code) = faults.entity_rejections.get(&op.entity_id) {
                Some((code.clone(), "Rejected by server"))
            } else {
                Self::validate(op).map(|msg| (error_codes::VALIDATION_ERROR.to_string(), msg))
            };

            match rejection {
                Some((code, message)) => rejected_ops.push(RejectedOp {
                    op_id: op.id.clone(),
                    error: message.to_string(),
                    error_code: Some(code),
                }),
                None => {
                    stored.insert(op.id.clone());
                    account.push(op.clone());
                }
            }
        }

        let piggybacked = account
            .ops
            .iter()
            .filter(|r| r.server_seq > request.last_known_server_seq)
            .filter(|r| r.op.client_id != request.client_id && !stored.contains(&r.op.id))
            .cloned()
            .collect();

        Ok(UploadResponse {
            piggybacked,
            rejected_ops,
            latest_seq: account.last_seq,
        })
    }

    fn handle_download(&self, user: &str, since_seq: u64, limit: usize) -> Result<DownloadResponse> {
        let mut state = self.lock()?;
        Self::check_transport(&mut state)?;

        let Some(account) = state.accounts.get(user) else {
            return Ok(DownloadResponse::default());
        };
        let mut newer = account.ops.iter().filter(|r| r.server_seq > since_seq);
        let ops: Vec<RemoteOp> = newer.by_ref().take(limit.max(1)).cloned().collect();
        let has_more = newer.next().is_some();

        Ok(DownloadResponse {
            ops,
            latest_seq: account.last_seq,
            has_more,
        })
    }

    fn handle_snapshot(&self, user: &str, snapshot: &SnapshotUpload) -> Result<SnapshotResponse> {
        let mut state = self.lock()?;
        Self::check_transport(&mut state)?;
        Self::check_size(&state, snapshot)?;
        if state.faults.fail_snapshots {
            return Ok(SnapshotResponse {
                accepted: false,
                server_seq: 0,
                error: Some("Injected snapshot failure".to_string()),
            });
        }

        let account = state.accounts.entry(user.to_string()).or_default();
        if account.ids.contains(&snapshot.op_id) {
            return Ok(SnapshotResponse {
                accepted: true,
                server_seq: account.last_seq,
                error: None,
            });
        }
        let server_seq = account.push(snapshot.to_operation());
        debug!("Stored snapshot {} for {} at seq {}", snapshot.op_id, user, server_seq);
        Ok(SnapshotResponse {
            accepted: true,
            server_seq,
            error: None,
        })
    }

    fn handle_delete(&self, user: &str) -> Result<()> {
        let mut state = self.lock()?;
        Self::check_transport(&mut state)?;
        if let Some(account) = state.accounts.get_mut(user) {
            // Sequence numbers keep increasing so existing cursors stay valid.
            account.ops.clear();
            account.ids.clear();
        }
        Ok(())
    }

    fn handle_key(&self, user: &str) -> Result<String> {
        let mut state = self.lock()?;
        Self::check_transport(&mut state)?;
        if state.faults.key_endpoint_missing {
            return Err(Error::NotSupported(
                "Server does not provide encryption keys".to_string(),
            ));
        }
        derive_auto_encryption_key(&self.secret, user)
    }

    fn latency(&self) -> Option<Duration> {
        self.lock().ok().and_then(|s| s.faults.latency)
    }

    fn with_faults(&self, f: impl FnOnce(&mut Faults)) {
        if let Ok(mut state) = self.lock() {
            f(&mut state.faults);
        }
    }

    /// Reject every op touching `entity_id` with `code`.
    pub fn reject_entity(&self, entity_id: &str, code: &str) {
        self.with_faults(|f| {
            f.entity_rejections
                .insert(entity_id.to_string(), code.to_string());
        });
    }

    /// Refuse request bodies larger than `max` bytes with HTTP 413.
    pub fn set_max_payload_bytes(&self, max: Option<usize>) {
        self.with_faults(|f| f.max_payload_bytes = max);
    }

    /// Fail the next `count` requests with a transport error.
    pub fn fail_next_requests(&self, count: usize) {
        self.with_faults(|f| f.failing_requests = count);
    }

    /// Refuse snapshot uploads.
    pub fn fail_snapshots(&self, fail: bool) {
        self.with_faults(|f| f.fail_snapshots = fail);
    }

    /// Behave like a server without the encryption-key endpoint.
    pub fn remove_key_endpoint(&self, missing: bool) {
        self.with_faults(|f| f.key_endpoint_missing = missing);
    }

    /// Delay every request.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.with_faults(|f| f.latency = latency);
    }

    /// Store an op directly, bypassing validation.
    pub fn inject_op(&self, user: &str, op: Operation) -> u64 {
        match self.lock() {
            Ok(mut state) => state.accounts.entry(user.to_string()).or_default().push(op),
            Err(_) => 0,
        }
    }

    /// Ops currently stored for `user`.
    pub fn ops(&self, user: &str) -> Vec<RemoteOp> {
        self.lock()
            .ok()
            .and_then(|s| s.accounts.get(user).map(|a| a.ops.clone()))
            .unwrap_or_default()
    }

    /// Op ids of the most recent upload batch.
    pub fn last_upload_batch(&self) -> Option<Vec<OpId>> {
        self.lock().ok().and_then(|s| s.upload_batches.last().cloned())
    }

    /// Number of upload requests received.
    pub fn upload_count(&self) -> usize {
        self.lock().map(|s| s.upload_batches.len()).unwrap_or(0)
    }
}

/// One device's view of a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryProvider {
    server: Arc<MemoryServer>,
    user_id: String,
}

impl MemoryProvider {
    async fn delay(&self) {
        if let Some(latency) = self.server.latency() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SyncProvider for MemoryProvider {
    fn id(&self) -> &str {
        "memory"
    }

    fn account_key(&self) -> String {
        format!("memory://{}/{}", self.server.name, self.user_id)
    }

    async fn upload_ops(&self, request: &UploadRequest) -> Result<UploadResponse> {
        self.delay().await;
        self.server.handle_upload(&self.user_id, request)
    }

    async fn download_ops(&self, since_seq: u64, limit: usize) -> Result<DownloadResponse> {
        self.delay().await;
        self.server.handle_download(&self.user_id, since_seq, limit)
    }

    async fn upload_snapshot(&self, snapshot: &SnapshotUpload) -> Result<SnapshotResponse> {
        self.delay().await;
        self.server.handle_snapshot(&self.user_id, snapshot)
    }

    async fn delete_all_data(&self) -> Result<()> {
        self.delay().await;
        self.server.handle_delete(&self.user_id)
    }

    async fn fetch_auto_encryption_key(&self) -> Result<String> {
        self.delay().await;
        self.server.handle_key(&self.user_id)
    }
}

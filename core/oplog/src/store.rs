//! SQLite-backed operation log.
//!
//! Holds every local and downloaded operation, the compacted state snapshot,
//! and the client's sync bookkeeping (identity, clocks, server cursor).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use tasksync_common::{
    ClientId, Error, OpId, OpType, Operation, Result, SyncImportReason, VectorClock,
};

use crate::snapshot::StateSnapshot;
use crate::state::AppState;

const META_CLIENT_ID: &str = "client_id";
/// Clock new local operations are issued from.
const META_LOCAL_CLOCK: &str = "local_clock";
/// Merge of every operation reflected in the current state.
const META_APPLIED_CLOCK: &str = "applied_clock";
const META_LAST_SERVER_SEQ: &str = "last_server_seq";
const META_SYNC_TARGET: &str = "sync_target";
const META_HAS_SYNCED: &str = "has_synced";

/// Upload state of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Synced,
    Rejected,
}

impl OpStatus {
    fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Synced => "synced",
            OpStatus::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OpStatus::Pending),
            "synced" => Ok(OpStatus::Synced),
            "rejected" => Ok(OpStatus::Rejected),
            other => Err(Error::Storage(format!("Unknown op status: {}", other))),
        }
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub folded: usize,
    pub pruned: usize,
    pub last_applied_op_seq: i64,
}

fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Durable operation log.
pub struct OpLogStore {
    conn: Mutex<Connection>,
    client_id: ClientId,
}

impl OpLogStore {
    /// Create or open an operation log.
    ///
    /// A client id is generated on first open and kept for the life of the
    /// database.
    ///
    /// # Errors
    /// - Database creation or schema failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(storage)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ops (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                is_local INTEGER NOT NULL,
                status TEXT NOT NULL,
                rejection TEXT,
                op_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS state_cache (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                snapshot_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ops_status ON ops(status);
            "#,
        )
        .map_err(storage)?;

        let client_id = match get_meta(&conn, META_CLIENT_ID)? {
            Some(id) => ClientId::new(id)?,
            None => {
                let id = ClientId::generate();
                set_meta(&conn, META_CLIENT_ID, id.as_str())?;
                info!("Generated client id {}", id);
                id
            }
        };

        debug!("Operation log opened for client {}", client_id);
        Ok(Self {
            conn: Mutex::new(conn),
            client_id,
        })
    }

    /// Create an in-memory log (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Operation log lock poisoned".to_string()))
    }

    /// This replica's identity.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Clock that the next local operation will advance.
    pub fn local_clock(&self) -> Result<VectorClock> {
        let conn = self.lock()?;
        get_clock(&conn, META_LOCAL_CLOCK)
    }

    /// Clock of everything reflected in the current state. Remote operations
    /// it already covers are duplicates.
    pub fn applied_clock(&self) -> Result<VectorClock> {
        let conn = self.lock()?;
        get_clock(&conn, META_APPLIED_CLOCK)
    }

    /// Build a local operation on the next clock tick and append it.
    pub fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        op_type: OpType,
        payload: Value,
    ) -> Result<Operation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        let clock = get_clock(&tx, META_LOCAL_CLOCK)?.increment(&self.client_id);
        let op = Operation::new(
            self.client_id.clone(),
            clock,
            entity_type,
            entity_id,
            op_type,
            payload,
        );
        self.append_local(&tx, &op)?;
        tx.commit().map_err(storage)?;
        Ok(op)
    }

    /// Record a full-state import of `state`.
    pub fn record_import(&self, state: &AppState, reason: SyncImportReason) -> Result<Operation> {
        let payload = state.to_value()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        let clock = get_clock(&tx, META_LOCAL_CLOCK)?.increment(&self.client_id);
        let op = Operation::sync_import(self.client_id.clone(), clock, payload, reason);
        self.append_local(&tx, &op)?;
        tx.commit().map_err(storage)?;
        info!("Recorded full-state import {} ({})", op.id, reason);
        Ok(op)
    }

    /// Persist a local operation and queue it for upload.
    ///
    /// # Preconditions
    /// - `op.vector_clock` has already been advanced past the local clock
    ///
    /// # Errors
    /// - Clock not advanced, or op id already logged
    /// - Backing store unavailable
    pub fn append_operation(&self, op: &Operation) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        let seq = self.append_local(&tx, op)?;
        tx.commit().map_err(storage)?;
        Ok(seq)
    }

    fn append_local(&self, tx: &Transaction<'_>, op: &Operation) -> Result<i64> {
        let local = get_clock(tx, META_LOCAL_CLOCK)?;
        if op.vector_clock.get(&op.client_id) <= local.get(&op.client_id) {
            return Err(Error::InvalidInput(format!(
                "Op {} clock was not advanced for {}",
                op.id, op.client_id
            )));
        }

        let op_json = serde_json::to_string(op)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO ops (op_id, is_local, status, op_json) VALUES (?1, 1, ?2, ?3)",
                params![op.id.as_str(), OpStatus::Pending.as_str(), op_json],
            )
            .map_err(storage)?;
        if inserted == 0 {
            return Err(Error::InvalidInput(format!("Op {} is already logged", op.id)));
        }
        let seq = tx.last_insert_rowid();

        set_clock(tx, META_LOCAL_CLOCK, &local.merge(&op.vector_clock))?;
        let applied = get_clock(tx, META_APPLIED_CLOCK)?;
        set_clock(tx, META_APPLIED_CLOCK, &applied.merge(&op.vector_clock))?;

        debug!("Appended local op {} ({} {}) at seq {}", op.id, op.op_type.as_str(), op.entity_type, seq);
        Ok(seq)
    }

    /// Log a downloaded operation as applied.
    ///
    /// Returns `None` when the operation is already reflected locally, either
    /// because the applied clock covers it or its id is already logged.
    pub fn append_remote(&self, op: &Operation) -> Result<Option<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let applied = get_clock(&tx, META_APPLIED_CLOCK)?;
        if op.is_duplicate_of(&applied) {
            debug!("Skipping duplicate remote op {}", op.id);
            return Ok(None);
        }

        let op_json = serde_json::to_string(op)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO ops (op_id, is_local, status, op_json) VALUES (?1, 0, ?2, ?3)",
                params![op.id.as_str(), OpStatus::Synced.as_str(), op_json],
            )
            .map_err(storage)?;
        if inserted == 0 {
            debug!("Remote op {} already logged", op.id);
            return Ok(None);
        }
        let seq = tx.last_insert_rowid();

        set_clock(&tx, META_APPLIED_CLOCK, &applied.merge(&op.vector_clock))?;
        let local = get_clock(&tx, META_LOCAL_CLOCK)?;
        set_clock(&tx, META_LOCAL_CLOCK, &local.merge(&op.vector_clock))?;
        set_meta(&tx, META_HAS_SYNCED, "1")?;

        tx.commit().map_err(storage)?;
        Ok(Some(seq))
    }

    /// Fold a clock seen remotely into both local clocks without applying
    /// anything, so the next local op supersedes it.
    pub fn observe_clock(&self, clock: &VectorClock) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        for key in [META_LOCAL_CLOCK, META_APPLIED_CLOCK] {
            let merged = get_clock(&tx, key)?.merge(clock);
            set_clock(&tx, key, &merged)?;
        }
        tx.commit().map_err(storage)
    }

    /// Local operations awaiting upload, oldest first.
    pub fn pending_ops(&self, limit: usize) -> Result<Vec<Operation>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT op_json FROM ops WHERE is_local = 1 AND status = ?1 ORDER BY seq LIMIT ?2",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![OpStatus::Pending.as_str(), limit], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(serde_json::from_str(&row.map_err(storage)?)?);
        }
        Ok(ops)
    }

    /// Local operations not yet folded into the snapshot, pending or
    /// synced, oldest first.
    pub fn unfolded_local_ops(&self) -> Result<Vec<Operation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT op_json FROM ops WHERE is_local = 1 AND status != ?1 ORDER BY seq")
            .map_err(storage)?;
        let rows = stmt
            .query_map([OpStatus::Rejected.as_str()], |row| row.get::<_, String>(0))
            .map_err(storage)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(serde_json::from_str(&row.map_err(storage)?)?);
        }
        Ok(ops)
    }

    /// Number of local operations awaiting upload.
    pub fn pending_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM ops WHERE is_local = 1 AND status = ?1",
                [OpStatus::Pending.as_str()],
                |row| row.get(0),
            )
            .map_err(storage)?;
        Ok(count as usize)
    }

    /// Status of a logged operation, `None` once pruned or never logged.
    pub fn op_status(&self, op_id: &OpId) -> Result<Option<OpStatus>> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM ops WHERE op_id = ?1",
                [op_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?;
        status.as_deref().map(OpStatus::parse).transpose()
    }

    /// Mark operations as accepted by the remote.
    pub fn mark_synced(&self, op_ids: &[OpId]) -> Result<()> {
        if op_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        {
            let mut stmt = tx
                .prepare("UPDATE ops SET status = ?1 WHERE op_id = ?2 AND status = ?3")
                .map_err(storage)?;
            for id in op_ids {
                stmt.execute(params![
                    OpStatus::Synced.as_str(),
                    id.as_str(),
                    OpStatus::Pending.as_str()
                ])
                .map_err(storage)?;
            }
        }
        set_meta(&tx, META_HAS_SYNCED, "1")?;
        tx.commit().map_err(storage)
    }

    /// Mark an operation as permanently refused. It is never uploaded again.
    pub fn mark_rejected(&self, op_id: &OpId, reason: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE ops SET status = ?1, rejection = ?2 WHERE op_id = ?3",
            params![OpStatus::Rejected.as_str(), reason, op_id.as_str()],
        )
        .map_err(storage)?;
        warn!("Op {} permanently rejected: {}", op_id, reason);
        Ok(())
    }

    /// Permanently rejected operations with their reasons.
    pub fn rejected_ops(&self) -> Result<Vec<(Operation, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT op_json, rejection FROM ops WHERE status = ?1 ORDER BY seq")
            .map_err(storage)?;
        let rows = stmt
            .query_map([OpStatus::Rejected.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(storage)?;

        let mut out = Vec::new();
        for row in rows {
            let (json, reason) = row.map_err(storage)?;
            out.push((serde_json::from_str(&json)?, reason.unwrap_or_default()));
        }
        Ok(out)
    }

    /// Drop local operations that were never uploaded. Returns how many.
    pub fn discard_pending(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM ops WHERE is_local = 1 AND status = ?1",
                [OpStatus::Pending.as_str()],
            )
            .map_err(storage)?;
        if removed > 0 {
            warn!("Discarded {} pending local ops", removed);
        }
        Ok(removed)
    }

    /// Read the compacted snapshot.
    pub fn load_state_cache(&self) -> Result<StateSnapshot> {
        let conn = self.lock()?;
        load_snapshot(&conn)
    }

    /// Replace the compacted snapshot.
    pub fn save_state_cache(&self, snapshot: &StateSnapshot) -> Result<()> {
        let conn = self.lock()?;
        save_snapshot(&conn, snapshot)
    }

    /// Materialized state: the snapshot with every newer logged op replayed.
    pub fn current_state(&self) -> Result<AppState> {
        let conn = self.lock()?;
        let mut snapshot = load_snapshot(&conn)?;
        for (_, op, _) in ops_after(&conn, snapshot.last_applied_op_seq)? {
            apply_logged(&mut snapshot.state, &op);
        }
        Ok(snapshot.state)
    }

    /// Fold settled operations into the snapshot and prune the synced ones.
    ///
    /// Folding stops at the first pending operation so the snapshot never
    /// reflects anything the remote has not confirmed. Rejected ops are
    /// folded but kept in the log for reporting.
    pub fn compact(&self) -> Result<CompactionReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let mut snapshot = load_snapshot(&tx)?;
        let mut folded = 0;
        for (seq, op, status) in ops_after(&tx, snapshot.last_applied_op_seq)? {
            if status == OpStatus::Pending {
                break;
            }
            apply_logged(&mut snapshot.state, &op);
            snapshot.vector_clock = snapshot.vector_clock.merge(&op.vector_clock);
            snapshot.last_applied_op_seq = seq;
            folded += 1;
        }

        let pruned = tx
            .execute(
                "DELETE FROM ops WHERE seq <= ?1 AND status = ?2",
                params![snapshot.last_applied_op_seq, OpStatus::Synced.as_str()],
            )
            .map_err(storage)?;

        if folded > 0 {
            snapshot.compacted_at = Utc::now();
            save_snapshot(&tx, &snapshot)?;
        }
        tx.commit().map_err(storage)?;

        if folded > 0 {
            debug!(
                "Compacted {} ops, pruned {}, snapshot at seq {}",
                folded, pruned, snapshot.last_applied_op_seq
            );
        }
        Ok(CompactionReport {
            folded,
            pruned,
            last_applied_op_seq: snapshot.last_applied_op_seq,
        })
    }

    /// Highest server sequence fully applied.
    pub fn last_server_seq(&self) -> Result<u64> {
        let conn = self.lock()?;
        match get_meta(&conn, META_LAST_SERVER_SEQ)? {
            Some(v) => v
                .parse()
                .map_err(|_| Error::Storage(format!("Corrupt server cursor: {}", v))),
            None => Ok(0),
        }
    }

    /// Advance (or reset) the server cursor.
    pub fn set_last_server_seq(&self, seq: u64) -> Result<()> {
        let conn = self.lock()?;
        set_meta(&conn, META_LAST_SERVER_SEQ, &seq.to_string())
    }

    /// Identity of the remote this log last synced with.
    pub fn sync_target(&self) -> Result<Option<String>> {
        let conn = self.lock()?;
        get_meta(&conn, META_SYNC_TARGET)
    }

    /// Remember `target` as the remote this log is now in sync with. A later
    /// cycle against a different target starts the server switch check.
    pub fn set_sync_target(&self, target: &str) -> Result<()> {
        let conn = self.lock()?;
        set_meta(&conn, META_SYNC_TARGET, target)
    }

    /// Whether any operation ever made it to or came from a remote.
    pub fn has_synced_ops(&self) -> Result<bool> {
        let conn = self.lock()?;
        Ok(get_meta(&conn, META_HAS_SYNCED)?.is_some())
    }

    /// Forget all state and history so it can be rebuilt from a full remote
    /// download. The local clock and client id are kept, so operations issued
    /// afterwards still supersede everything issued before.
    pub fn reset_for_remote_rebuild(&self) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage)?;
        tx.execute("DELETE FROM ops", []).map_err(storage)?;
        tx.execute("DELETE FROM state_cache", []).map_err(storage)?;
        set_clock(&tx, META_APPLIED_CLOCK, &VectorClock::new())?;
        set_meta(&tx, META_LAST_SERVER_SEQ, "0")?;
        tx.commit().map_err(storage)?;
        warn!("Operation log reset for a full remote rebuild");
        Ok(())
    }
}

fn apply_logged(state: &mut AppState, op: &Operation) {
    if let Err(e) = state.apply(op) {
        warn!("Skipping unappliable logged op {}: {}", op.id, e);
    }
}

fn ops_after(conn: &Connection, seq: i64) -> Result<Vec<(i64, Operation, OpStatus)>> {
    let mut stmt = conn
        .prepare("SELECT seq, op_json, status FROM ops WHERE seq > ?1 ORDER BY seq")
        .map_err(storage)?;
    let rows = stmt
        .query_map([seq], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(storage)?;

    let mut out = Vec::new();
    for row in rows {
        let (seq, json, status) = row.map_err(storage)?;
        out.push((seq, serde_json::from_str(&json)?, OpStatus::parse(&status)?));
    }
    Ok(out)
}

fn load_snapshot(conn: &Connection) -> Result<StateSnapshot> {
    let json: Option<String> = conn
        .query_row("SELECT snapshot_json FROM state_cache WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(storage)?;
    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(StateSnapshot::default()),
    }
}

fn save_snapshot(conn: &Connection, snapshot: &StateSnapshot) -> Result<()> {
    let json = serde_json::to_string(snapshot)?;
    conn.execute(
        "INSERT OR REPLACE INTO state_cache (id, snapshot_json) VALUES (1, ?1)",
        [json],
    )
    .map_err(storage)?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
    .map_err(storage)
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
    .map_err(storage)?;
    Ok(())
}

fn get_clock(conn: &Connection, key: &str) -> Result<VectorClock> {
    match get_meta(conn, key)? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(VectorClock::new()),
    }
}

fn set_clock(conn: &Connection, key: &str, clock: &VectorClock) -> Result<()> {
    set_meta(conn, key, &serde_json::to_string(clock)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn remote_op(client: &str, counter: u64, entity_id: &str, payload: Value) -> Operation {
        let id = ClientId::new(client).unwrap();
        let clock: VectorClock = [(id.clone(), counter)].into_iter().collect();
        Operation::new(id, clock, "task", entity_id, OpType::Create, payload)
    }

    #[test]
    fn test_record_advances_clock() {
        let store = OpLogStore::in_memory().unwrap();
        let me = store.client_id().clone();

        let first = store.record("task", "t1", OpType::Create, json!({"title": "X"})).unwrap();
        let second = store.record("task", "t1", OpType::Update, json!({"isDone": true})).unwrap();

        assert_eq!(first.vector_clock.get(&me), 1);
        assert_eq!(second.vector_clock.get(&me), 2);
        assert_eq!(store.local_clock().unwrap().get(&me), 2);
        assert_eq!(store.pending_count().unwrap(), 2);
        assert_eq!(
            store.current_state().unwrap().get("task", "t1"),
            Some(json!({"title": "X", "isDone": true}))
        );
    }

    #[test]
    fn test_append_requires_advanced_clock() {
        let store = OpLogStore::in_memory().unwrap();
        let me = store.client_id().clone();
        store.record("task", "t1", OpType::Create, json!({})).unwrap();

        let stale = Operation::new(
            me.clone(),
            VectorClock::new().increment(&me),
            "task",
            "t2",
            OpType::Create,
            json!({}),
        );
        assert!(matches!(store.append_operation(&stale), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_append_fails_when_store_unavailable() {
        let store = OpLogStore::in_memory().unwrap();
        store.lock().unwrap().execute_batch("DROP TABLE ops").unwrap();
        let result = store.record("task", "t1", OpType::Create, json!({}));
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[test]
    fn test_duplicate_remote_op_is_skipped() {
        let store = OpLogStore::in_memory().unwrap();
        let op = remote_op("b", 1, "t1", json!({"title": "X"}));

        assert!(store.append_remote(&op).unwrap().is_some());
        assert!(store.append_remote(&op).unwrap().is_none());
        // dominated by what we already applied
        assert!(store.append_remote(&remote_op("b", 1, "t2", json!({}))).unwrap().is_none());
        assert_eq!(store.current_state().unwrap().visible_count(), 1);
        assert!(store.has_synced_ops().unwrap());
    }

    #[test]
    fn test_remote_ops_feed_next_local_clock() {
        let store = OpLogStore::in_memory().unwrap();
        store.append_remote(&remote_op("b", 3, "t1", json!({}))).unwrap();
        let op = store.record("task", "t1", OpType::Update, json!({"x": 1})).unwrap();
        assert_eq!(op.vector_clock.get(&ClientId::new("b").unwrap()), 3);
    }

    #[test]
    fn test_unfolded_local_ops_until_compaction() {
        let store = OpLogStore::in_memory().unwrap();
        let a = store.record("task", "t1", OpType::Create, json!({})).unwrap();
        let b = store.record("task", "t2", OpType::Create, json!({})).unwrap();
        store.append_remote(&remote_op("b", 1, "t3", json!({}))).unwrap();
        store.mark_synced(&[a.id.clone()]).unwrap();
        store.mark_rejected(&b.id, "invalid").unwrap();

        let unfolded = store.unfolded_local_ops().unwrap();
        assert_eq!(unfolded.len(), 1);
        assert_eq!(unfolded[0].id, a.id);

        store.compact().unwrap();
        assert!(store.unfolded_local_ops().unwrap().is_empty());
    }

    #[test]
    fn test_compaction_stops_at_pending() {
        let store = OpLogStore::in_memory().unwrap();
        let a = store.record("task", "t1", OpType::Create, json!({"title": "A"})).unwrap();
        let b = store.record("task", "t2", OpType::Create, json!({"title": "B"})).unwrap();
        store.record("task", "t3", OpType::Create, json!({"title": "C"})).unwrap();
        store.mark_synced(&[a.id.clone()]).unwrap();

        let report = store.compact().unwrap();
        assert_eq!(report.folded, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(store.op_status(&a.id).unwrap(), None);
        assert_eq!(store.op_status(&b.id).unwrap(), Some(OpStatus::Pending));

        let snapshot = store.load_state_cache().unwrap();
        assert_eq!(snapshot.state.visible_count(), 1);
        assert_eq!(store.current_state().unwrap().visible_count(), 3);
    }

    #[test]
    fn test_rejected_ops_are_folded_but_kept() {
        let store = OpLogStore::in_memory().unwrap();
        let op = store.record("task", "", OpType::Create, json!({"title": "bad"})).unwrap();
        store.mark_rejected(&op.id, "VALIDATION_ERROR").unwrap();

        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(store.compact().unwrap().folded, 1);
        let rejected = store.rejected_ops().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].1, "VALIDATION_ERROR");
    }

    #[test]
    fn test_state_cache_roundtrip() {
        let store = OpLogStore::in_memory().unwrap();
        let mut snapshot = StateSnapshot::default();
        let op = remote_op("b", 1, "t1", json!({"title": "X"}));
        snapshot.state.apply(&op).unwrap();
        snapshot.vector_clock = op.vector_clock.clone();
        snapshot.last_applied_op_seq = 7;

        store.save_state_cache(&snapshot).unwrap();
        assert_eq!(store.load_state_cache().unwrap(), snapshot);
    }

    #[test]
    fn test_import_replaces_state() {
        let store = OpLogStore::in_memory().unwrap();
        store.record("task", "t1", OpType::Create, json!({"title": "X"})).unwrap();

        let mut imported = AppState::new();
        imported.apply(&remote_op("b", 1, "t9", json!({"title": "Y"}))).unwrap();
        store.record_import(&imported, SyncImportReason::FileImport).unwrap();

        let state = store.current_state().unwrap();
        assert_eq!(state.get("task", "t1"), None);
        assert!(state.get("task", "t9").is_some());
    }

    #[test]
    fn test_discard_pending() {
        let store = OpLogStore::in_memory().unwrap();
        store.append_remote(&remote_op("b", 1, "t1", json!({"title": "X"}))).unwrap();
        store.record("task", "t2", OpType::Create, json!({"title": "Y"})).unwrap();

        assert_eq!(store.discard_pending().unwrap(), 1);
        let state = store.current_state().unwrap();
        assert!(state.get("task", "t1").is_some());
        assert!(state.get("task", "t2").is_none());
    }

    #[test]
    fn test_reset_keeps_local_clock() {
        let store = OpLogStore::in_memory().unwrap();
        let me = store.client_id().clone();
        store.record("task", "t1", OpType::Create, json!({})).unwrap();
        store.set_last_server_seq(12).unwrap();

        store.reset_for_remote_rebuild().unwrap();
        assert_eq!(store.last_server_seq().unwrap(), 0);
        assert!(store.applied_clock().unwrap().is_empty());
        assert_eq!(store.local_clock().unwrap().get(&me), 1);
        assert!(store.current_state().unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oplog.db");

        let client_id = {
            let store = OpLogStore::open(&path).unwrap();
            store.record("task", "t1", OpType::Create, json!({"title": "X"})).unwrap();
            store.set_last_server_seq(4).unwrap();
            store.set_sync_target("https://sync.example/alice").unwrap();
            store.client_id().clone()
        };

        let store = OpLogStore::open(&path).unwrap();
        assert_eq!(store.client_id(), &client_id);
        assert_eq!(store.last_server_seq().unwrap(), 4);
        assert_eq!(store.pending_count().unwrap(), 1);
        assert_eq!(
            store.sync_target().unwrap().as_deref(),
            Some("https://sync.example/alice")
        );
    }
}

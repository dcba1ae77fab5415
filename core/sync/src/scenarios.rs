//! Multi-device scenarios against one in-memory server.

use serde_json::{json, Value};
use std::sync::Arc;

use tasksync_common::{ClientId, Error, OpType, Operation, SyncImportReason, VectorClock};
use tasksync_crypto::{EncryptionSecret, KdfParams, PayloadCipher};
use tasksync_oplog::{OpLogStore, OpStatus};
use tasksync_provider::{MemoryProvider, MemoryServer, SyncProvider, SyncProviderPrivateCfg};

use crate::cipher::encrypt_op;
use crate::config::{ConfigStore, MemoryConfigStore, Settings, SyncConfig};
use crate::conflict::{ImportConflictScenario, ImportResolution, StaticConflictHandler};
use crate::engine::SyncEngine;
use crate::observer::{Alert, RecordingObserver};
use crate::status::SyncStatus;

struct Device {
    engine: SyncEngine,
    observer: Arc<RecordingObserver>,
    conflicts: Arc<StaticConflictHandler>,
    settings: Arc<MemoryConfigStore>,
}

impl Device {
    fn new(provider: MemoryProvider, cfg: SyncProviderPrivateCfg) -> Self {
        Self::with(provider, cfg, ImportResolution::UseRemote, config())
    }

    fn with(
        provider: MemoryProvider,
        cfg: SyncProviderPrivateCfg,
        resolution: ImportResolution,
        config: SyncConfig,
    ) -> Self {
        let mut settings = Settings::default();
        settings.select("memory", cfg);
        let settings = Arc::new(MemoryConfigStore::new(settings));
        let observer = Arc::new(RecordingObserver::default());
        let conflicts = Arc::new(StaticConflictHandler::new(resolution));
        let engine = SyncEngine::new(
            Arc::new(OpLogStore::in_memory().unwrap()),
            Arc::new(provider),
            settings.clone(),
            config,
        )
        .with_observer(observer.clone())
        .with_conflict_handler(conflicts.clone());
        Self {
            engine,
            observer,
            conflicts,
            settings,
        }
    }

    fn add(&self, id: &str, title: &str) -> Operation {
        self.engine
            .record("task", id, OpType::Create, json!({ "title": title }))
            .unwrap()
    }

    fn title(&self, id: &str) -> Option<Value> {
        self.engine
            .state()
            .unwrap()
            .get("task", id)
            .and_then(|v| v.get("title").cloned())
    }

    fn view(&self) -> Value {
        self.engine.state().unwrap().view()
    }

    async fn cfg(&self) -> SyncProviderPrivateCfg {
        let settings = self.settings.load().await.unwrap();
        settings.active().unwrap().1.clone()
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        kdf: KdfParams::insecure_fast(),
        retry_initial_delay_ms: 1,
        ..SyncConfig::default()
    }
}

fn plain() -> SyncProviderPrivateCfg {
    SyncProviderPrivateCfg::new("memory://sync", "token")
}

fn foreign_op(client: &str, entity_id: &str, schema_version: u32) -> Operation {
    let id = ClientId::new(client).unwrap();
    let mut op = Operation::new(
        id.clone(),
        VectorClock::new().increment(&id),
        "task",
        entity_id,
        OpType::Create,
        json!({"title": entity_id}),
    );
    op.schema_version = schema_version;
    op
}

fn sealed(op: Operation, passphrase: &str) -> Operation {
    let cipher = PayloadCipher::new(
        EncryptionSecret::passphrase(passphrase),
        KdfParams::insecure_fast(),
    );
    encrypt_op(&op, Some(&cipher)).unwrap()
}

#[tokio::test]
async fn test_two_devices_exchange_edits() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let b = Device::new(server.provider("u1"), plain());

    a.add("t1", "Buy milk");
    assert_eq!(a.engine.sync().await.unwrap().status, SyncStatus::InSync);
    let outcome = b.engine.sync().await.unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(b.title("t1"), Some(json!("Buy milk")));
    assert_eq!(b.observer.applied().len(), 1);

    b.engine
        .record("task", "t1", OpType::Update, json!({"title": "Buy oat milk"}))
        .unwrap();
    b.engine.sync().await.unwrap();
    a.engine.sync().await.unwrap();
    assert_eq!(a.title("t1"), Some(json!("Buy oat milk")));
    assert_eq!(a.view(), b.view());
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let b = Device::new(server.provider("u1"), plain());
    a.add("t1", "Draft");
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    a.engine
        .record("task", "t1", OpType::Update, json!({"title": "From A"}))
        .unwrap();
    b.engine
        .record("task", "t1", OpType::Update, json!({"isDone": true, "title": "From B"}))
        .unwrap();
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();
    a.engine.sync().await.unwrap();

    assert_eq!(a.view(), b.view());
    assert_eq!(
        a.engine.state().unwrap().get("task", "t1").unwrap()["isDone"],
        json!(true)
    );
}

#[tokio::test]
async fn test_delete_propagates() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let b = Device::new(server.provider("u1"), plain());
    a.add("t1", "Temp");
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    b.engine
        .record("task", "t1", OpType::Delete, Value::Null)
        .unwrap();
    b.engine.sync().await.unwrap();
    a.engine.sync().await.unwrap();
    assert_eq!(a.title("t1"), None);
}

#[tokio::test]
async fn test_server_switch_migrates_full_state() {
    let first = MemoryServer::new("s1");
    let second = MemoryServer::new("s2");
    let a = Device::new(first.provider("u1"), plain());
    a.add("t1", "Keep me");
    a.add("t2", "Me too");
    a.engine.sync().await.unwrap();

    a.engine
        .set_provider(Arc::new(second.provider("u1")))
        .await;
    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert!(outcome.import_uploaded);

    let stored = second.ops("u1");
    assert_eq!(stored.len(), 1);
    assert!(stored[0].op.is_full_state());
    assert_eq!(
        stored[0].op.sync_import_reason,
        Some(SyncImportReason::ServerMigration)
    );

    let c = Device::new(second.provider("u1"), plain());
    c.engine.sync().await.unwrap();
    assert_eq!(c.title("t1"), Some(json!("Keep me")));
    assert_eq!(c.view(), a.view());

    // Already migrated: a second cycle uploads nothing new.
    let again = a.engine.sync().await.unwrap();
    assert!(!again.import_uploaded);
    assert_eq!(second.ops("u1").len(), 1);
}

#[tokio::test]
async fn test_server_switch_to_populated_remote_syncs_incrementally() {
    let first = MemoryServer::new("s1");
    let second = MemoryServer::new("s2");
    let a = Device::new(first.provider("u1"), plain());
    a.add("t1", "Old server");
    a.engine.sync().await.unwrap();

    let b = Device::new(second.provider("u1"), plain());
    b.add("t9", "New server");
    b.engine.sync().await.unwrap();

    a.engine
        .set_provider(Arc::new(second.provider("u1")))
        .await;
    let outcome = a.engine.sync().await.unwrap();
    assert!(!outcome.import_uploaded);
    assert!(second.ops("u1").iter().all(|r| !r.op.is_full_state()));
    assert_eq!(a.title("t9"), Some(json!("New server")));
}

#[tokio::test]
async fn test_fresh_client_does_not_migrate() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    a.add("t1", "Local only");
    let outcome = a.engine.sync().await.unwrap();
    assert!(!outcome.import_uploaded);
    assert_eq!(outcome.uploaded, 1);
}

#[tokio::test]
async fn test_validation_rejection_is_never_resent() {
    let server = MemoryServer::new("s");
    server.reject_entity("bad", "VALIDATION_ERROR");
    let a = Device::new(server.provider("u1"), plain());
    let bad = a.add("bad", "Broken");
    a.add("good", "Fine");

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::Error);
    assert_eq!(outcome.rejected, 1);
    assert_eq!(outcome.uploaded, 1);
    assert_eq!(
        a.engine.store().op_status(&bad.id).unwrap(),
        Some(OpStatus::Rejected)
    );

    let uploads = server.upload_count();
    let next = a.engine.sync().await.unwrap();
    assert_eq!(next.status, SyncStatus::InSync);
    assert_eq!(server.upload_count(), uploads);
    assert_eq!(a.engine.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_rejection_marks_synced() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let op = a.add("t1", "Acked twice");
    // The remote stored it but the response was lost.
    server.inject_op("u1", op.clone());

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert_eq!(outcome.rejected, 0);
    assert_eq!(
        a.engine.store().op_status(&op.id).unwrap().unwrap_or(OpStatus::Synced),
        OpStatus::Synced
    );
    assert_eq!(server.ops("u1").len(), 1);
}

#[tokio::test]
async fn test_unknown_rejection_code_is_retried() {
    let server = MemoryServer::new("s");
    server.reject_entity("t1", "RATE_LIMITED");
    let a = Device::new(server.provider("u1"), plain());
    a.add("t1", "Later");

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert_eq!(a.engine.store().pending_count().unwrap(), 1);
}

#[tokio::test]
async fn test_payload_too_large_shrinks_batch() {
    let server = MemoryServer::new("s");
    server.set_max_payload_bytes(Some(2000));
    let config = SyncConfig {
        max_ops_per_upload: 4,
        ..config()
    };
    let a = Device::with(
        server.provider("u1"),
        plain(),
        ImportResolution::UseRemote,
        config,
    );
    let long = "x".repeat(400);
    for i in 0..4 {
        a.add(&format!("t{}", i), &long);
    }

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::Error);
    assert!(a
        .observer
        .alerts()
        .contains(&Alert::PayloadTooLarge { pending_ops: 4 }));
    assert_eq!(a.engine.store().pending_count().unwrap(), 4);

    let retry = a.engine.sync().await.unwrap();
    assert_eq!(retry.status, SyncStatus::InSync);
    assert_eq!(retry.uploaded, 4);
    assert_eq!(server.last_upload_batch().map(|b| b.len()), Some(2));
    assert_eq!(server.ops("u1").len(), 4);
    assert_eq!(a.engine.upload_chunk_size(), 4);

    server.set_max_payload_bytes(None);
    for i in 4..8 {
        a.add(&format!("t{}", i), "short");
    }
    assert_eq!(a.engine.sync().await.unwrap().status, SyncStatus::InSync);
    assert_eq!(server.last_upload_batch().map(|b| b.len()), Some(4));
}

#[tokio::test]
async fn test_newer_schema_and_corrupt_ops_are_skipped() {
    let server = MemoryServer::new("s");
    server.inject_op("u1", foreign_op("future", "t1", 99));
    server.inject_op("u1", foreign_op("ancient", "t2", 0));
    server.inject_op("u1", foreign_op("peer", "t3", 1));
    let a = Device::new(server.provider("u1"), plain());

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert_eq!(outcome.skipped, 2);
    assert_eq!(outcome.applied, 1);
    assert_eq!(a.title("t3"), Some(json!("t3")));
    assert_eq!(a.engine.store().last_server_seq().unwrap(), 3);

    let again = a.engine.sync().await.unwrap();
    assert_eq!(again.downloaded, 0);
}

#[tokio::test]
async fn test_undecryptable_batch_applies_nothing() {
    let server = MemoryServer::new("s");
    server.inject_op("u1", sealed(foreign_op("peer", "t1", 2), "other"));
    server.inject_op("u1", foreign_op("peer2", "t2", 2));
    let a = Device::new(server.provider("u1"), plain().with_manual_key("pw"));

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::Error);
    assert_eq!(outcome.applied, 0);
    assert_eq!(a.title("t2"), None);
    assert_eq!(a.engine.store().last_server_seq().unwrap(), 0);
}

#[tokio::test]
async fn test_enable_encryption_reuploads_sealed_state() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    a.add("t1", "Secret");
    a.engine.sync().await.unwrap();

    a.engine.enable_encryption("correct horse").await.unwrap();
    let cfg = a.cfg().await;
    assert!(cfg.is_encryption_enabled);
    let stored = server.ops("u1");
    assert_eq!(stored.len(), 1);
    assert!(stored.iter().all(|r| r.op.is_payload_encrypted));
    assert!(!serde_json::to_string(&stored).unwrap().contains("Secret"));
    assert_eq!(a.engine.sync().await.unwrap().status, SyncStatus::InSync);

    let b = Device::new(server.provider("u1"), plain().with_manual_key("correct horse"));
    b.engine.sync().await.unwrap();
    assert_eq!(b.title("t1"), Some(json!("Secret")));

    let stranger = Device::new(server.provider("u1"), plain().with_manual_key("wrong"));
    let outcome = stranger.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::Error);
    assert_eq!(stranger.title("t1"), None);
}

#[tokio::test]
async fn test_failed_enable_restores_previous_config() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    a.add("t1", "Precious");
    a.engine.sync().await.unwrap();
    let before = a.settings.load().await.unwrap();

    server.fail_snapshots(true);
    let result = a.engine.enable_encryption("pw").await;
    match result {
        Err(Error::Critical(message)) => assert!(message.contains("Sync Now")),
        other => panic!("expected critical error, got {:?}", other),
    }
    assert_eq!(a.settings.load().await.unwrap(), before);
    assert!(matches!(a.observer.alerts().last(), Some(Alert::Critical(_))));
    assert_eq!(a.title("t1"), Some(json!("Precious")));

    server.fail_snapshots(false);
    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert!(outcome.import_uploaded);
    let stored = server.ops("u1");
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].op.is_payload_encrypted);
}

#[tokio::test]
async fn test_missing_crypto_aborts_before_remote_delete() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let engine = a.engine.with_crypto_probe(Arc::new(|| false));
    engine
        .record("task", "t1", OpType::Create, json!({"title": "Stay"}))
        .unwrap();
    engine.sync().await.unwrap();
    let before = a.settings.load().await.unwrap();

    let result = engine.enable_encryption("pw").await;
    assert!(matches!(result, Err(Error::CryptoUnavailable(_))));
    assert_eq!(server.ops("u1").len(), 1);
    assert_eq!(a.settings.load().await.unwrap(), before);
}

#[tokio::test]
async fn test_disable_encryption_reuploads_plaintext() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain().with_manual_key("pw"));
    a.add("t1", "Open");
    a.engine.sync().await.unwrap();
    assert!(server.ops("u1")[0].op.is_payload_encrypted);

    a.engine.disable_encryption().await.unwrap();
    assert!(!a.cfg().await.is_encrypted());
    let stored = server.ops("u1");
    assert_eq!(stored.len(), 1);
    assert!(stored[0].op.is_full_state());
    assert!(!stored[0].op.is_payload_encrypted);

    let b = Device::new(server.provider("u1"), plain());
    b.engine.sync().await.unwrap();
    assert_eq!(b.title("t1"), Some(json!("Open")));
}

#[tokio::test]
async fn test_failed_disable_keeps_encryption_config() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain().with_manual_key("pw"));
    a.add("t1", "Sealed");
    a.engine.sync().await.unwrap();

    server.fail_snapshots(true);
    let result = a.engine.disable_encryption().await;
    assert!(matches!(result, Err(Error::Critical(_))));
    assert!(a.cfg().await.is_encryption_enabled);
}

#[tokio::test]
async fn test_auto_encryption_key_is_shared_per_user() {
    let server = MemoryServer::new("s");
    let auto = SyncConfig {
        auto_encryption_enabled: true,
        ..config()
    };
    let a = Device::with(
        server.provider("u1"),
        plain(),
        ImportResolution::UseRemote,
        auto.clone(),
    );
    a.add("t1", "Auto");
    assert_eq!(a.engine.sync().await.unwrap().status, SyncStatus::InSync);

    let expected = server.provider("u1").fetch_auto_encryption_key().await.unwrap();
    let a_cfg = a.cfg().await;
    assert!(a_cfg.is_auto_encryption_enabled);
    assert_eq!(a_cfg.auto_encryption_key.as_deref(), Some(expected.as_str()));
    assert!(server.ops("u1").iter().all(|r| r.op.is_payload_encrypted));

    let b = Device::with(
        server.provider("u1"),
        plain(),
        ImportResolution::UseRemote,
        auto,
    );
    b.engine.sync().await.unwrap();
    assert_eq!(b.cfg().await.auto_encryption_key, a_cfg.auto_encryption_key);
    assert_eq!(b.title("t1"), Some(json!("Auto")));
    // Adopting the key does not wipe the remote again.
    assert_eq!(server.ops("u1").len(), 1);
}

#[tokio::test]
async fn test_auto_encryption_skipped_without_key_endpoint() {
    let server = MemoryServer::new("s");
    server.remove_key_endpoint(true);
    let auto = SyncConfig {
        auto_encryption_enabled: true,
        ..config()
    };
    let a = Device::with(
        server.provider("u1"),
        plain(),
        ImportResolution::UseRemote,
        auto,
    );
    a.add("t1", "Plain");
    assert_eq!(a.engine.sync().await.unwrap().status, SyncStatus::InSync);
    assert!(!a.cfg().await.is_encrypted());
    assert!(!server.ops("u1")[0].op.is_payload_encrypted);
}

/// A and B share t1; B writes t2 while A forces its state over the remote.
async fn incoming_import(resolution: ImportResolution) -> (Arc<MemoryServer>, Device, Device) {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let b = Device::with(server.provider("u1"), plain(), resolution, config());
    a.add("t1", "Shared");
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    b.add("t2", "Written on B");
    a.add("t3", "Written on A");
    a.add("t4", "Also on A");
    a.engine.sync().await.unwrap();
    a.engine.force_upload().await.unwrap();
    (server, a, b)
}

#[tokio::test]
async fn test_incoming_import_use_remote_drops_local_work() {
    let (_server, a, b) = incoming_import(ImportResolution::UseRemote).await;

    b.engine.sync().await.unwrap();
    let asked = b.conflicts.asked();
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].scenario, ImportConflictScenario::IncomingImport);
    assert_eq!(asked[0].reason, SyncImportReason::ForceUpload);
    assert_eq!(asked[0].affected_ops, 1);

    assert_eq!(b.title("t2"), None);
    a.engine.sync().await.unwrap();
    assert_eq!(a.view(), b.view());
}

#[tokio::test]
async fn test_incoming_import_use_local_keeps_local_work() {
    let (_server, a, b) = incoming_import(ImportResolution::UseLocal).await;

    let outcome = b.engine.sync().await.unwrap();
    assert!(outcome.import_uploaded);
    assert_eq!(b.title("t2"), Some(json!("Written on B")));
    assert_eq!(b.title("t3"), Some(json!("Written on A")));

    a.engine.sync().await.unwrap();
    assert_eq!(a.title("t2"), Some(json!("Written on B")));
    assert_eq!(a.view(), b.view());
}

#[tokio::test]
async fn test_incoming_import_cancel_disables_sync() {
    let (_server, _a, b) = incoming_import(ImportResolution::Cancel).await;

    let outcome = b.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::Error);
    assert!(b.engine.is_sync_disabled());
    assert!(matches!(
        b.observer.alerts().last(),
        Some(Alert::SyncDisabled(_))
    ));
    assert!(matches!(b.engine.sync().await, Err(Error::Config(_))));

    b.engine.enable_sync();
    assert!(b.engine.sync().await.is_ok());
}

fn backup(title: &str) -> Value {
    json!({
        "task": {
            "ids": ["b1"],
            "entities": {"b1": {"id": "b1", "title": title}}
        }
    })
}

/// B syncs t2 while A restores a backup it has not reconciled yet.
async fn local_import(resolution: ImportResolution) -> (Device, Device) {
    let server = MemoryServer::new("s");
    let a = Device::with(server.provider("u1"), plain(), resolution, config());
    let b = Device::new(server.provider("u1"), plain());
    a.add("t1", "Shared");
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    b.add("t2", "Remote change");
    b.engine.sync().await.unwrap();

    a.add("t3", "Local scratch");
    a.add("t4", "More scratch");
    a.engine
        .import_backup(&backup("Restored"), SyncImportReason::BackupRestore)
        .unwrap();
    (a, b)
}

#[tokio::test]
async fn test_local_import_use_local_supersedes_remote() {
    let (a, b) = local_import(ImportResolution::UseLocal).await;

    let outcome = a.engine.sync().await.unwrap();
    assert!(outcome.import_uploaded);
    let asked = a.conflicts.asked();
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].scenario, ImportConflictScenario::LocalImportFiltersRemote);
    assert_eq!(asked[0].affected_ops, 1);
    assert_eq!(a.title("b1"), Some(json!("Restored")));
    assert_eq!(a.title("t2"), None);

    b.engine.sync().await.unwrap();
    assert_eq!(b.title("b1"), Some(json!("Restored")));
    assert_eq!(a.view(), b.view());
}

#[tokio::test]
async fn test_local_import_use_remote_rebuilds_from_remote() {
    let (a, b) = local_import(ImportResolution::UseRemote).await;

    let outcome = a.engine.sync().await.unwrap();
    assert!(!outcome.import_uploaded);
    assert_eq!(a.title("b1"), None);
    assert_eq!(a.title("t2"), Some(json!("Remote change")));
    assert_eq!(a.view(), b.view());
}

#[tokio::test]
async fn test_backup_export_then_import_on_new_device() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    a.add("t1", "Backed up");
    let document = a.engine.export_backup().unwrap();

    let c = Device::new(server.provider("u2"), plain());
    let op = c
        .engine
        .import_backup(&document, SyncImportReason::FileImport)
        .unwrap();
    assert!(op.is_full_state());
    assert_eq!(c.title("t1"), Some(json!("Backed up")));

    let outcome = c.engine.sync().await.unwrap();
    assert!(outcome.import_uploaded);
    assert_eq!(server.ops("u2").len(), 1);
}

#[tokio::test]
async fn test_repaired_state_replaces_remote_copy() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let b = Device::new(server.provider("u1"), plain());
    a.add("t1", "Broken");
    a.engine.sync().await.unwrap();
    b.engine.sync().await.unwrap();

    let op = a.engine.queue_repair(&backup("Repaired")).unwrap();
    assert_eq!(op.sync_import_reason, Some(SyncImportReason::Repair));
    assert!(a.engine.sync().await.unwrap().import_uploaded);
    assert!(a.conflicts.asked().is_empty());

    b.engine.sync().await.unwrap();
    assert!(b.conflicts.asked().is_empty());
    assert_eq!(b.title("b1"), Some(json!("Repaired")));
    assert_eq!(b.title("t1"), None);
    assert_eq!(a.view(), b.view());
}

#[tokio::test]
async fn test_damaged_op_is_skipped_among_good_ones() {
    let server = MemoryServer::new("s");
    server.inject_op("u1", sealed(foreign_op("peer", "t1", 2), "pw"));
    let mut damaged = foreign_op("peer", "t9", 2);
    damaged.payload = json!("bm90IGEgcmVhbCBjaXBoZXJ0ZXh0");
    damaged.is_payload_encrypted = true;
    server.inject_op("u1", damaged);
    server.inject_op("u1", sealed(foreign_op("peer2", "t2", 2), "pw"));
    let a = Device::new(server.provider("u1"), plain().with_manual_key("pw"));

    let outcome = a.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(a.title("t1"), Some(json!("t1")));
    assert_eq!(a.title("t2"), Some(json!("t2")));
    assert_eq!(a.title("t9"), None);
    assert_eq!(a.engine.store().last_server_seq().unwrap(), 3);

    server.inject_op("u1", sealed(foreign_op("peer3", "t3", 2), "pw"));
    let next = a.engine.sync().await.unwrap();
    assert_eq!(next.status, SyncStatus::InSync);
    assert_eq!(a.title("t3"), Some(json!("t3")));
}

#[tokio::test]
async fn test_auto_encryption_leaves_passphrase_remote_alone() {
    let server = MemoryServer::new("s");
    let b = Device::new(server.provider("u1"), plain().with_manual_key("pw"));
    b.add("t1", "Manual");
    assert_eq!(b.engine.sync().await.unwrap().status, SyncStatus::InSync);

    let auto = SyncConfig {
        auto_encryption_enabled: true,
        ..config()
    };
    let a = Device::with(
        server.provider("u1"),
        plain(),
        ImportResolution::UseRemote,
        auto,
    );
    a.add("t2", "Plain");
    a.engine.sync().await.unwrap();
    assert!(!a.cfg().await.is_encrypted());

    let stored = server.ops("u1");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].op.entity_id, "t1");
    assert!(!stored[1].op.is_payload_encrypted);

    let outcome = b.engine.sync().await.unwrap();
    assert_eq!(outcome.status, SyncStatus::InSync);
    assert_eq!(b.title("t2"), Some(json!("Plain")));
    assert_eq!(b.title("t1"), Some(json!("Manual")));
}

#[tokio::test]
async fn test_remote_change_to_held_record_is_reported_after_release() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let b = Device::new(server.provider("u1"), plain());
    a.add("t1", "Remote edit");
    a.engine.sync().await.unwrap();

    let guard = b.engine.being_written().begin("t1").unwrap();
    b.engine.sync().await.unwrap();
    assert_eq!(b.title("t1"), Some(json!("Remote edit")));
    assert!(b.observer.applied().is_empty());

    drop(guard);
    b.engine.sync().await.unwrap();
    let applied = b.observer.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].entity_id, "t1");

    b.engine.sync().await.unwrap();
    assert_eq!(b.observer.applied().len(), 1);
}

#[tokio::test]
async fn test_record_under_caller_guard_still_writes() {
    let server = MemoryServer::new("s");
    let a = Device::new(server.provider("u1"), plain());
    let guard = a.engine.being_written().begin("t1").unwrap();
    a.add("t1", "Typed");
    assert!(a.engine.being_written().contains("t1"));
    drop(guard);
    assert!(a.engine.being_written().is_empty());
    assert_eq!(a.title("t1"), Some(json!("Typed")));
}

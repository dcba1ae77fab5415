//! TaskSync CLI - Command line client for the task sync engine.
//!
//! Records task operations into the local operation log and syncs them
//! with a remote sync server over HTTP.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use tasksync_common::{OpType, SyncImportReason};
use tasksync_oplog::{backup_from_state, OpLogStore};
use tasksync_provider::{create_default_registry, SyncProviderPrivateCfg};
use tasksync_sync::{ConfigStore, FileConfigStore, LogObserver, SyncEngine, SyncStatus};

const PROVIDER_ID: &str = "http";
const TASK: &str = "task";

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "TaskSync - Offline-first task list with encrypted sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Directory for the operation log (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Settings file (default: platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the sync server.
    Login {
        /// Base URL of the sync server.
        #[arg(short, long)]
        url: String,
    },

    /// Add a task.
    Add {
        /// Task title.
        title: String,
    },

    /// Mark a task as done.
    Done {
        /// Task id.
        id: String,
    },

    /// Remove a task.
    Remove {
        /// Task id.
        id: String,
    },

    /// List tasks.
    List,

    /// Run one sync cycle.
    Sync,

    /// Show sync state.
    Status,

    /// Manage payload encryption.
    Encryption {
        #[command(subcommand)]
        action: EncryptionAction,
    },

    /// Replace local data with a backup file and queue it for upload.
    ImportBackup {
        /// Backup JSON file.
        file: PathBuf,
    },

    /// Write local data to a backup file.
    ExportBackup {
        /// Destination JSON file.
        file: PathBuf,
    },

    /// Overwrite the remote with local data.
    ForceUpload,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum EncryptionAction {
    /// Encrypt with a passphrase, or with the server-provided key.
    Enable {
        /// Use the key provided by the server instead of a passphrase.
        #[arg(long)]
        auto: bool,
    },
    /// Stop encrypting.
    Disable,
}

/// Where the CLI keeps its files.
struct Paths {
    data_dir: PathBuf,
    config_file: PathBuf,
}

impl Paths {
    fn resolve(data_dir: Option<PathBuf>, config: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::data_dir()
                .context("No platform data directory")?
                .join("tasksync"),
        };
        let config_file = match config {
            Some(file) => file,
            None => dirs::config_dir()
                .context("No platform config directory")?
                .join("tasksync")
                .join("settings.json"),
        };
        Ok(Self {
            data_dir,
            config_file,
        })
    }

    fn open_store(&self) -> Result<Arc<OpLogStore>> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("Failed to create data directory {}", self.data_dir.display())
        })?;
        let store = OpLogStore::open(self.data_dir.join("oplog.db"))
            .context("Failed to open operation log")?;
        Ok(Arc::new(store))
    }

    fn config_store(&self) -> Arc<FileConfigStore> {
        Arc::new(FileConfigStore::new(&self.config_file))
    }

    /// Engine wired to the configured remote.
    async fn engine(&self) -> Result<SyncEngine> {
        let config_store = self.config_store();
        let settings = config_store
            .load()
            .await
            .context("Failed to load settings")?;
        let (active, cfg) = settings
            .active()
            .context("No sync server configured; run `tasksync login` first")?;
        let registry = create_default_registry(settings.sync.request_timeout());
        let provider = registry
            .resolve(active, cfg)
            .context("Failed to create sync provider")?;

        Ok(SyncEngine::new(
            self.open_store()?,
            provider,
            config_store,
            settings.sync.clone(),
        )
        .with_observer(Arc::new(LogObserver)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let paths = Paths::resolve(cli.data_dir, cli.config)?;

    match cli.command {
        Commands::Login { url } => cmd_login(&paths, url).await,
        Commands::Add { title } => cmd_add(&paths, &title),
        Commands::Done { id } => cmd_done(&paths, &id),
        Commands::Remove { id } => cmd_remove(&paths, &id),
        Commands::List => cmd_list(&paths),
        Commands::Sync => cmd_sync(&paths).await,
        Commands::Status => cmd_status(&paths).await,
        Commands::Encryption { action } => cmd_encryption(&paths, action).await,
        Commands::ImportBackup { file } => cmd_import_backup(&paths, &file).await,
        Commands::ExportBackup { file } => cmd_export_backup(&paths, &file).await,
        Commands::ForceUpload => cmd_force_upload(&paths).await,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tasksync", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Prompt for a secret without echo.
fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read input")?;
    Ok(Zeroizing::new(secret))
}

/// Store the server URL and access token, keeping encryption settings when
/// the server stays the same.
async fn cmd_login(paths: &Paths, url: String) -> Result<()> {
    let token = prompt_secret("Access token: ")?;
    if token.is_empty() {
        anyhow::bail!("Access token cannot be empty");
    }

    let store = paths.config_store();
    let mut settings = store.load().await.context("Failed to load settings")?;
    let cfg = match settings.providers.get(PROVIDER_ID) {
        Some(existing) if existing.base_url == url => SyncProviderPrivateCfg {
            access_token: token.to_string(),
            ..existing.clone()
        },
        _ => SyncProviderPrivateCfg::new(url, token.as_str()),
    };
    settings.select(PROVIDER_ID, cfg);
    store.save(&settings).await.context("Failed to save settings")?;

    println!("Sync server configured.");
    println!("  Settings: {}", paths.config_file.display());
    Ok(())
}

fn cmd_add(paths: &Paths, title: &str) -> Result<()> {
    let store = paths.open_store()?;
    let id = uuid::Uuid::new_v4().simple().to_string();
    store
        .record(TASK, &id, OpType::Create, json!({"title": title, "isDone": false}))
        .context("Failed to record task")?;
    println!("Added {}", id);
    Ok(())
}

fn cmd_done(paths: &Paths, id: &str) -> Result<()> {
    let store = paths.open_store()?;
    ensure_task(&store, id)?;
    store
        .record(TASK, id, OpType::Update, json!({"isDone": true}))
        .context("Failed to record update")?;
    println!("Done: {}", id);
    Ok(())
}

fn cmd_remove(paths: &Paths, id: &str) -> Result<()> {
    let store = paths.open_store()?;
    ensure_task(&store, id)?;
    store
        .record(TASK, id, OpType::Delete, serde_json::Value::Null)
        .context("Failed to record delete")?;
    println!("Removed: {}", id);
    Ok(())
}

fn ensure_task(store: &OpLogStore, id: &str) -> Result<()> {
    let state = store.current_state().context("Failed to read state")?;
    if state.get(TASK, id).is_none() {
        anyhow::bail!("No task with id {}", id);
    }
    Ok(())
}

fn cmd_list(paths: &Paths) -> Result<()> {
    let store = paths.open_store()?;
    let state = store.current_state().context("Failed to read state")?;
    let tasks = state.entities(TASK);
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for (id, task) in tasks {
        let done = task.get("isDone").and_then(|v| v.as_bool()).unwrap_or(false);
        let title = task.get("title").and_then(|v| v.as_str()).unwrap_or("");
        println!("  [{}] {}  {}", if done { "x" } else { " " }, id, title);
    }
    Ok(())
}

async fn cmd_sync(paths: &Paths) -> Result<()> {
    let engine = paths.engine().await?;
    let outcome = engine.sync().await.context("Sync failed")?;

    println!("Sync finished: {:?}", outcome.status);
    println!("  Uploaded: {}", outcome.uploaded);
    println!("  Downloaded: {}", outcome.downloaded);
    println!("  Applied: {}", outcome.applied);
    if outcome.rejected > 0 {
        println!("  Rejected: {}", outcome.rejected);
    }
    if outcome.skipped > 0 {
        println!("  Skipped (newer or unreadable): {}", outcome.skipped);
    }
    if let Some(reason) = outcome.reason {
        println!("  Reason: {}", reason);
    }
    if outcome.status == SyncStatus::Error {
        anyhow::bail!("Sync ended with an error");
    }
    Ok(())
}

async fn cmd_status(paths: &Paths) -> Result<()> {
    let store = paths.open_store()?;
    let settings = paths
        .config_store()
        .load()
        .await
        .context("Failed to load settings")?;

    println!("TaskSync status:");
    println!("  Client: {}", store.client_id());
    match settings.active() {
        Ok((active, cfg)) => {
            println!("  Provider: {} ({})", active.provider_id, cfg.base_url);
            let encryption = if cfg.is_auto_encryption_enabled {
                "server key"
            } else if cfg.is_encryption_enabled {
                "passphrase"
            } else {
                "off"
            };
            println!("  Encryption: {}", encryption);
        }
        Err(_) => println!("  Provider: not configured"),
    }
    println!("  Pending ops: {}", store.pending_count()?);
    println!("  Last server seq: {}", store.last_server_seq()?);
    let rejected = store.rejected_ops()?;
    if !rejected.is_empty() {
        println!("  Rejected ops:");
        for (op, reason) in rejected {
            println!("    {} {} {}: {}", op.id, op.entity_type, op.entity_id, reason);
        }
    }
    Ok(())
}

async fn cmd_encryption(paths: &Paths, action: EncryptionAction) -> Result<()> {
    let engine = paths.engine().await?;
    match action {
        EncryptionAction::Enable { auto: true } => {
            info!("Enabling encryption with the server key");
            engine
                .enable_auto_encryption()
                .await
                .context("Failed to enable encryption")?;
        }
        EncryptionAction::Enable { auto: false } => {
            let passphrase = prompt_secret("Encryption passphrase: ")?;
            let confirm = prompt_secret("Confirm passphrase: ")?;
            if *passphrase != *confirm {
                anyhow::bail!("Passphrases do not match");
            }
            engine
                .enable_encryption(&passphrase)
                .await
                .context("Failed to enable encryption")?;
        }
        EncryptionAction::Disable => {
            engine
                .disable_encryption()
                .await
                .context("Failed to disable encryption")?;
        }
    }
    println!("Encryption settings updated; remote data was re-uploaded.");
    Ok(())
}

async fn cmd_import_backup(paths: &Paths, file: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let document: serde_json::Value =
        serde_json::from_str(&raw).context("Backup is not valid JSON")?;

    let engine = paths.engine().await?;
    let op = engine
        .import_backup(&document, SyncImportReason::BackupRestore)
        .context("Failed to import backup")?;
    println!("Backup imported as {}; run `tasksync sync` to upload it.", op.id);
    Ok(())
}

async fn cmd_export_backup(paths: &Paths, file: &Path) -> Result<()> {
    let store = paths.open_store()?;
    let state = store.current_state().context("Failed to read state")?;
    let document = backup_from_state(&state);
    let json = serde_json::to_vec_pretty(&document)?;
    tokio::fs::write(file, json)
        .await
        .with_context(|| format!("Failed to write {}", file.display()))?;
    println!("Backup written to {}", file.display());
    Ok(())
}

async fn cmd_force_upload(paths: &Paths) -> Result<()> {
    let engine = paths.engine().await?;
    let seq = engine.force_upload().await.context("Force upload failed")?;
    println!("Local data uploaded at server seq {}", seq);
    Ok(())
}

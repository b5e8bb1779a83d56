//! pxv: PixVault command-line interface
//!
//! Import commands:
//!   import <paths...>   - encrypt photos and videos into the store (Ctrl-C pauses)
//!   tasks               - list import tasks
//!   resume <task>       - continue a paused import
//!   cancel <task>       - stop an import, keeping what was saved
//!   remove <task>       - forget a finished import
//!   clear               - forget all finished imports
//!   cleanup <task>      - delete the originals of a finished import
//!
//! Store commands:
//!   ls                  - list stored media for the active key
//!   export <id> <dest>  - decrypt one item to a file
//!   rm <id>             - delete one item
//!
//! Setup:
//!   key generate <file> - write fresh key material
//!   config show         - display current configuration

mod keyfile;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use pxv_core::config::{PxvConfig, RemoteConfig};
use pxv_core::{EncryptedMedia, LoadPhase, MediaSource, MediaType};
use pxv_import::{
    collect_media, CollectConfig, EngineOptions, FsLibrary, ImportEngine, ImportTask,
    JsonTaskStore, Provenance, TaskId, TaskState,
};
use pxv_storage::{
    build_operator, check_health, LoadProgress, LocalOnly, Materializer, OperatorMaterializer, StorageBackend,
    StorageLayout, StorageOptions,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::keyfile::{generate_key_file, FileKeyManager};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "pxv",
    version,
    about = "PixVault encrypted media store",
    long_about = "pxv: import photos and videos into an encrypted, key-scoped store and manage import tasks"
)]
struct Cli {
    /// Path to pixvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "PXV_CONFIG",
        default_value = "~/.config/pixvault/config.toml"
    )]
    config: PathBuf,

    /// Key file (overrides keys.key_file)
    #[arg(long, short = 'k', env = "PXV_KEY_FILE")]
    key: Option<PathBuf>,

    /// Log level filter (overrides [log] level)
    #[arg(long, env = "PXV_LOG")]
    log: Option<String>,

    /// Log format (overrides [log] format)
    #[arg(long, value_enum, env = "PXV_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, PartialEq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt photos and videos into the store
    ///
    /// Directories are walked recursively. A photo and a video sharing a
    /// name in the same directory are imported together as a live photo.
    /// Press Ctrl-C to pause; continue later with `pxv resume`.
    Import {
        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Simultaneous saves (1-3, overrides import.max_concurrent_saves)
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
        /// Delete the originals of imported items once the import completes
        #[arg(long)]
        delete_originals: bool,
    },

    /// List import tasks
    Tasks {
        /// Print tasks as JSON
        #[arg(long)]
        json: bool,
    },

    /// Continue a paused import task
    Resume { task: TaskId },

    /// Stop an import task; items already saved stay saved
    Cancel { task: TaskId },

    /// Forget a finished import task
    Remove { task: TaskId },

    /// Forget every finished import task
    Clear,

    /// Delete the originals of a completed or cancelled import
    Cleanup { task: TaskId },

    /// List stored media for the active key
    Ls {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decrypt a stored item to a local file
    Export {
        /// Media identifier (see `pxv ls`)
        media: String,
        /// Destination file or directory
        dest: PathBuf,
        /// Export the motion clip of a live photo instead of the still
        #[arg(long)]
        motion: bool,
    },

    /// Delete a stored item (all of its parts)
    Rm { media: String },

    /// Key file management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Write a fresh random key to a new file
    Generate { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (mut config, from_file) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.log.format));
    init_logging(&level, &format);

    if !from_file {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, from_file),
        Commands::Key {
            action: KeyAction::Generate { path },
        } => cmd_key_generate(&expand_tilde(&path)),
        command => {
            if let Commands::Import {
                concurrency: Some(n),
                ..
            } = &command
            {
                config.import.max_concurrent_saves = *n;
            }
            let app = App::open(config, cli.key.as_deref())?;
            app.run(command).await
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(PxvConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((PxvConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand a leading `~` to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Build the remote operator from environment credentials.
///
/// Reads AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY (standard S3 env vars),
/// falling back to PXV_ACCESS_KEY_ID and PXV_SECRET_ACCESS_KEY.
fn build_operator_from_env(remote: &RemoteConfig) -> Result<opendal::Operator> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("PXV_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set for storage.remote\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
        )?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("PXV_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;

    build_operator(remote, &access_key, &secret_key).context("building remote operator")
}

// ── Opened store ──────────────────────────────────────────────────────────────

struct App {
    config: PxvConfig,
    keys: Arc<FileKeyManager>,
    storage: Arc<StorageBackend>,
    engine: ImportEngine<StorageBackend>,
    library: Arc<FsLibrary>,
    remote: Option<opendal::Operator>,
}

impl App {
    fn open(config: PxvConfig, key_override: Option<&Path>) -> Result<Self> {
        let key_path = key_override
            .map(Path::to_path_buf)
            .or_else(|| config.keys.key_file.clone())
            .context(
                "no key file configured\n\
                 Set keys.key_file in the config or pass --key.\n\
                 Create one with: pxv key generate <file>",
            )?;
        let keys = Arc::new(FileKeyManager::load(
            &expand_tilde(&key_path),
            config.keys.key_name.as_deref(),
        )?);

        let layout = StorageLayout::new(
            expand_tilde(&config.storage.root),
            expand_tilde(&config.storage.preview_dir),
            expand_tilde(&config.storage.scratch_dir),
        );
        let remote = config
            .storage
            .remote
            .as_ref()
            .map(|remote| {
                let op = build_operator_from_env(remote)?;
                info!(endpoint = %remote.endpoint, bucket = %remote.bucket, "remote store configured");
                Ok::<_, anyhow::Error>(op)
            })
            .transpose()?;
        let materializer: Arc<dyn Materializer> = match &remote {
            Some(op) => Arc::new(OperatorMaterializer::new(op.clone(), layout.root.clone())),
            None => Arc::new(LocalOnly::new(layout.root.clone())),
        };

        let scratch_dir = layout.scratch_dir.clone();
        let storage = StorageBackend::open(
            layout,
            keys.clone(),
            materializer,
            StorageOptions::from_config(&config),
        )
        .context("opening media store")?;
        let storage = Arc::new(storage);

        let library = Arc::new(FsLibrary::new(scratch_dir.clone()));
        let state_file = expand_tilde(&config.import.state_file);
        let engine = ImportEngine::open(
            storage.clone(),
            keys.clone(),
            Arc::new(JsonTaskStore::new(&state_file)),
            EngineOptions::new(scratch_dir)
                .with_concurrency(config.import.effective_concurrency())
                .with_library(library.clone()),
        )
        .with_context(|| format!("loading import tasks: {}", state_file.display()))?;

        Ok(Self {
            config,
            keys,
            storage,
            engine,
            library,
            remote,
        })
    }

    async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Import {
                paths,
                delete_originals,
                ..
            } => self.cmd_import(&paths, delete_originals).await,
            Commands::Tasks { json } => self.cmd_tasks(json),
            Commands::Resume { task } => self.cmd_resume(task).await,
            Commands::Cancel { task } => {
                self.engine.cancel(task).await?;
                println!("Cancelled import task {task}");
                Ok(())
            }
            Commands::Remove { task } => {
                self.engine.remove_task(task).await?;
                println!("Removed import task {task}");
                Ok(())
            }
            Commands::Clear => {
                let removed = self.engine.clear_finished().await?;
                println!("Removed {removed} finished import tasks");
                Ok(())
            }
            Commands::Cleanup { task } => {
                let removed = self.engine.remove_side_resources(task, self.library.as_ref()).await?;
                println!("Deleted {removed} originals of import task {task}");
                Ok(())
            }
            Commands::Ls { json } => self.cmd_ls(json).await,
            Commands::Export {
                media,
                dest,
                motion,
            } => self.cmd_export(&media, &dest, motion).await,
            Commands::Rm { media } => self.cmd_rm(&media).await,
            Commands::Key { .. } | Commands::Config { .. } => Ok(()),
        }
    }

    // ── `pxv import` ──────────────────────────────────────────────────────────

    async fn cmd_import(&self, paths: &[PathBuf], delete_originals: bool) -> Result<()> {
        let roots: Vec<PathBuf> = paths.iter().map(|p| expand_tilde(p)).collect();
        let assets = collect_media(&roots, &CollectConfig::from(&self.config.import))
            .context("collecting media")?;
        if assets.is_empty() {
            println!("No photos or videos found.");
            return Ok(());
        }

        // Originals are copied into scratch one unit at a time as the task runs.
        let count = assets.len();
        let id = self
            .engine
            .submit_from_library(assets, Provenance::Files)
            .await?;
        println!(
            "Importing {count} files under key '{}' (task {id})",
            self.keys.key_id()
        );

        let task = follow(&self.engine, id).await?;
        print_outcome(&task);

        if delete_originals && task.state == TaskState::Completed {
            let removed = self.engine.remove_side_resources(id, self.library.as_ref()).await?;
            println!("  deleted: {removed} originals");
        }
        Ok(())
    }

    // ── `pxv tasks` / `pxv resume` ────────────────────────────────────────────

    fn cmd_tasks(&self, json: bool) -> Result<()> {
        let tasks = self.engine.list_tasks();
        if json {
            let rendered = serde_json::to_string_pretty(&tasks).context("serializing tasks")?;
            println!("{rendered}");
            return Ok(());
        }
        if tasks.is_empty() {
            println!("No import tasks.");
            return Ok(());
        }
        for task in &tasks {
            println!(
                "{}  {:<6} {:<10} {:>5.1}%  {}/{} saved, {} failed  ({}, {} ago)",
                task.id,
                task.kind,
                state_label(&task.state),
                task.progress.overall_progress * 100.0,
                task.saved_count(),
                task.units.len(),
                task.failed_count(),
                task.provenance,
                fmt_duration(pxv_core::types::unix_now().saturating_sub(task.created_at) as f64),
            );
            if let TaskState::Failed { reason } = &task.state {
                println!("    {reason}");
            }
        }
        if let Some(progress) = self.engine.aggregate_progress() {
            println!();
            println!("Active imports: {:.1}% overall", progress * 100.0);
        }
        Ok(())
    }

    async fn cmd_resume(&self, id: TaskId) -> Result<()> {
        self.engine.resume(id).await?;
        println!("Resuming import task {id}");
        let task = follow(&self.engine, id).await?;
        print_outcome(&task);
        Ok(())
    }

    // ── `pxv ls` / `pxv export` / `pxv rm` ────────────────────────────────────

    async fn cmd_ls(&self, json: bool) -> Result<()> {
        let records = self
            .storage
            .enumerate(self.keys.key_id())
            .await
            .context("listing media")?;

        let rows: Vec<MediaRow> = records
            .iter()
            .map(|r| MediaRow {
                id: r.id.to_string(),
                media_type: r.media_type,
                file_name: r.file_name.clone(),
                captured_at: r.captured_at,
                bytes: r.ciphertext_len,
                state: self.storage.status(r).to_string(),
            })
            .collect();

        if json {
            let rendered = serde_json::to_string_pretty(&rows).context("serializing media list")?;
            println!("{rendered}");
            return Ok(());
        }
        println!("Key '{}': {} items", self.keys.key_id(), rows.len());
        if let Some(line) = remote_status_line(self.remote.as_ref()).await {
            println!("{line}");
        }
        for row in &rows {
            println!(
                "  {:<36}  {:<6} {:>10}  {:<12} {}",
                row.id,
                row.media_type.to_string(),
                fmt_bytes(row.bytes),
                row.state,
                row.file_name.as_deref().unwrap_or("")
            );
        }
        Ok(())
    }

    async fn records_for(&self, media: &str) -> Result<Vec<EncryptedMedia>> {
        let records: Vec<EncryptedMedia> = self
            .storage
            .enumerate(self.keys.key_id())
            .await
            .context("listing media")?
            .into_iter()
            .filter(|r| r.id.as_str() == media)
            .collect();
        if records.is_empty() {
            anyhow::bail!("no media '{media}' under key '{}'", self.keys.key_id());
        }
        Ok(records)
    }

    async fn cmd_export(&self, media: &str, dest: &Path, motion: bool) -> Result<()> {
        let records = self.records_for(media).await?;
        let record = records
            .iter()
            .find(|r| (r.media_type == MediaType::LivePhotoComponent) == motion)
            .with_context(|| {
                if motion {
                    format!("'{media}' is not a live photo")
                } else {
                    format!("'{media}' has no still or video part")
                }
            })?;

        let (progress, mut phases) = LoadProgress::new();
        let pb = make_spinner("export");
        let watcher = {
            let pb = pb.clone();
            tokio::spawn(async move {
                while phases.changed().await.is_ok() {
                    let phase = *phases.borrow_and_update();
                    pb.set_message(phase_label(&phase));
                }
            })
        };
        let loaded = self.storage.load_full(record, &progress).await;
        watcher.abort();
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                pb.abandon_with_message("failed");
                if e.is_damaged() {
                    return Err(e).with_context(|| {
                        format!("{media} failed verification; the stored copy is damaged or sealed under another key")
                    });
                }
                return Err(e).with_context(|| format!("loading {media}"));
            }
        };

        let target = if dest.is_dir() {
            dest.join(loaded.display_name())
        } else {
            dest.to_path_buf()
        };
        match &loaded.source {
            MediaSource::Scratch(path) => move_file(path, &target).await?,
            MediaSource::Memory(bytes) => tokio::fs::write(&target, bytes)
                .await
                .with_context(|| format!("writing {}", target.display()))?,
        }
        pb.finish_with_message("done");
        println!("Exported {media} → {}", target.display());
        Ok(())
    }

    async fn cmd_rm(&self, media: &str) -> Result<()> {
        for record in self.records_for(media).await? {
            self.storage
                .delete(&record)
                .await
                .with_context(|| format!("deleting {media} ({})", record.media_type))?;
            println!("Deleted {media} ({})", record.media_type);
        }
        Ok(())
    }
}

/// One line on whether remote-only items can currently be fetched.
async fn remote_status_line(remote: Option<&opendal::Operator>) -> Option<String> {
    let op = remote?;
    Some(match check_health(op).await {
        Ok(()) => "Remote: reachable".to_string(),
        Err(e) => format!("Remote: unreachable ({e:#}); remote-only items cannot be exported"),
    })
}

#[derive(Serialize)]
struct MediaRow {
    id: String,
    media_type: MediaType,
    file_name: Option<String>,
    captured_at: Option<u64>,
    bytes: u64,
    state: String,
}

/// Rename, falling back to copy + delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("writing {}", to.display()))?;
    let _ = tokio::fs::remove_file(from).await;
    Ok(())
}

// ── Task progress ─────────────────────────────────────────────────────────────

/// Render a task's progress until it finishes or parks. Ctrl-C asks it to pause.
async fn follow(engine: &ImportEngine<StorageBackend>, id: TaskId) -> Result<ImportTask> {
    let mut rx = engine
        .subscribe(id)
        .with_context(|| format!("import task {id} not found"))?;
    let pb = make_progress_bar(0, "import");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut pausing = false;

    loop {
        let task = rx.borrow_and_update().clone();
        render_task(&pb, &task);
        if task.is_terminal() || task.state == TaskState::Paused {
            pb.finish_and_clear();
            return Ok(task);
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    pb.abandon();
                    anyhow::bail!("import task {id} disappeared");
                }
            }
            signal = &mut ctrl_c, if !pausing => {
                signal.context("listening for Ctrl-C")?;
                engine.pause(id).await?;
                pausing = true;
                pb.println("Pausing once the items in progress are saved...");
            }
        }
    }
}

fn render_task(pb: &ProgressBar, task: &ImportTask) {
    let progress = &task.progress;
    pb.set_length(progress.total_files as u64);
    pb.set_position(progress.current_file_index as u64);

    let mut message = format!("{:.1}%", progress.overall_progress * 100.0);
    if let Some(name) = &progress.current_file_name {
        message.push(' ');
        message.push_str(name);
    }
    if let Some(eta) = progress.estimated_time_remaining_secs {
        message.push_str(&format!(" (~{} left)", fmt_duration(eta)));
    }
    pb.set_message(message);
}

fn print_outcome(task: &ImportTask) {
    println!();
    match &task.state {
        TaskState::Completed => println!("Import complete:"),
        TaskState::Paused => println!("Import paused. Continue with: pxv resume {}", task.id),
        TaskState::Cancelled => println!("Import cancelled:"),
        TaskState::Failed { reason } => println!("Import failed: {reason}"),
        other => println!("Import {other}:"),
    }
    println!("  saved:   {}", task.saved_count());
    println!("  failed:  {}", task.failed_count());
    if task.pending_count() > 0 {
        println!("  pending: {}", task.pending_count());
    }
    for (media, reason) in task.failures() {
        println!("    {media}: {reason}");
    }
}

fn state_label(state: &TaskState) -> &'static str {
    match state {
        TaskState::Idle => "idle",
        TaskState::Running => "running",
        TaskState::Paused => "paused",
        TaskState::Completed => "completed",
        TaskState::Cancelled => "cancelled",
        TaskState::Failed { .. } => "failed",
    }
}

fn phase_label(phase: &LoadPhase) -> String {
    match phase {
        LoadPhase::NotLoaded => "waiting".to_string(),
        LoadPhase::Downloading { progress } => format!("downloading {:.0}%", progress * 100.0),
        LoadPhase::Decrypting { progress } => format!("decrypting {:.0}%", progress * 100.0),
        LoadPhase::Loaded => "decrypted".to_string(),
    }
}

// ── `pxv key generate` / `pxv config show` ───────────────────────────────────

fn cmd_key_generate(path: &Path) -> Result<()> {
    generate_key_file(path)?;
    println!("Wrote a new key to {}", path.display());
    println!("Keep a copy somewhere safe: media sealed under it cannot be recovered without it.");
    Ok(())
}

fn cmd_config_show(config: &PxvConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Formatting helpers ────────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn fmt_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        assert_eq!(expand_tilde(Path::new("~/media")), home.join("media"));
        assert_eq!(expand_tilde(Path::new("/srv/media")), PathBuf::from("/srv/media"));
        assert_eq!(expand_tilde(Path::new("~user/x")), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_log_format_from_config() {
        assert_eq!(LogFormat::from_config("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("text"), LogFormat::Text);
        assert_eq!(LogFormat::from_config("bogus"), LogFormat::Text);
    }

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(4.4), "4s");
        assert_eq!(fmt_duration(125.0), "2m05s");
        assert_eq!(fmt_duration(7260.0), "2h01m");
        assert_eq!(fmt_duration(-3.0), "0s");
    }

    #[test]
    fn test_cli_parses_task_ids() {
        let id = TaskId::generate();
        let cli = Cli::try_parse_from(["pxv", "resume", &id.to_string()]).unwrap();
        assert!(matches!(cli.command, Commands::Resume { task } if task == id));
        assert!(Cli::try_parse_from(["pxv", "resume", "not-a-uuid"]).is_err());
        assert!(Cli::try_parse_from(["pxv", "import"]).is_err());
    }

    #[tokio::test]
    async fn test_remote_status_line() {
        assert_eq!(remote_status_line(None).await, None);
        let op = opendal::Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        assert_eq!(
            remote_status_line(Some(&op)).await.as_deref(),
            Some("Remote: reachable")
        );
    }

    #[tokio::test]
    async fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, from_file) = load_config(&dir.path().join("none.toml")).await.unwrap();
        assert!(!from_file);
        assert_eq!(config.crypto.format_version, 2);

        let path = dir.path().join("pixvault.toml");
        std::fs::write(&path, "[import]\nmax_concurrent_saves = 2\n").unwrap();
        let (config, from_file) = load_config(&path).await.unwrap();
        assert!(from_file);
        assert_eq!(config.import.effective_concurrency(), 2);
    }
}

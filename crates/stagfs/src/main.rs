//! # StagFS CLI
//!
//! Command-line interface for StagFS, a filesystem that presents media
//! collections as browsable tag trees.
//!
//! Manifests (`*.stag`, `*.stag.toml`) placed beside media files describe
//! their tags. StagFS scans the configured source roots, builds a tag
//! forest, keeps it in sync with manifest changes, and mounts it through
//! FUSE.
//!
//! ## Commands
//!
//! - `stagfs mount <MOUNTPOINT>` - Scan, watch and mount
//! - `stagfs scan` - Rebuild the persisted forest
//! - `stagfs ls <VIRTUAL_PATH>` - Resolve a path without mounting
//! - `stagfs status` - Show forest statistics
//! - `stagfs config show|init|path` - Manage configuration
//!
//! ## Examples
//!
//! ```bash
//! # Mount in the foreground
//! stagfs mount /mnt/stagfs -s /media/movies -f
//!
//! # Inspect the forest
//! stagfs scan -s /media/movies
//! stagfs ls /movie/genre -s /media/movies --format json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daemonize::Daemonize;
use serde::Serialize;
use stagfs_core::{IngestStats, Resolved, StoreStats, TagStore, ViewError};
use stagfs_fuse::{FsOptions, StagFs};
use stagfs_index::{IngestUpdate, IngestionManager};
use stagfs_store::{MemoryStore, SqliteStore};
use stagfs_view::ViewDispatcher;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::{Config, StoreBackend, cache_dir, canonical_roots, check_mountpoint, roots_hash};

#[derive(Parser)]
#[command(name = "stagfs")]
#[command(about = "A FUSE filesystem exposing media as tag trees")]
#[command(version)]
struct Cli {
    /// Path to config file (default: ~/.config/stagfs/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the tag forest
    Mount {
        /// Mount point
        mountpoint: PathBuf,

        /// Source root (repeatable; default: [sources] roots)
        #[arg(short, long = "source")]
        sources: Vec<PathBuf>,

        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Present leaves as symbolic links
        #[arg(long)]
        symlinks: bool,

        /// Serve the initial scan only
        #[arg(long)]
        no_watch: bool,
    },

    /// Rebuild the forest from the source roots
    Scan {
        /// Source root (repeatable; default: [sources] roots)
        #[arg(short, long = "source")]
        sources: Vec<PathBuf>,
    },

    /// Resolve a virtual path
    Ls {
        /// Virtual path, e.g. /movie/genre
        #[arg(default_value = "/")]
        path: String,

        /// Source root (repeatable; default: [sources] roots)
        #[arg(short, long = "source")]
        sources: Vec<PathBuf>,
    },

    /// Show forest statistics
    Status {
        /// Source root (repeatable; default: [sources] roots)
        #[arg(short, long = "source")]
        sources: Vec<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Print sample configuration file
    Init,
    /// Show config file path
    Path,
}

/// Output structure for scan and status.
#[derive(Serialize)]
struct StatusOutput {
    roots: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(flatten)]
    stats: StoreStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingest: Option<IngestStats>,
}

/// Output structure for `ls`.
#[derive(Serialize)]
struct LsOutput<'a> {
    path: &'a str,
    #[serde(flatten)]
    resolved: &'a Resolved,
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let config = Config::load_from(cli.config.clone()).context("Failed to load config")?;

    if let Commands::Mount {
        mountpoint,
        sources,
        foreground,
        ..
    } = &mut cli.command
    {
        // The daemon runs from `/`
        *mountpoint = std::path::absolute(&*mountpoint)?;
        for source in sources.iter_mut() {
            *source = std::path::absolute(&*source)?;
        }

        // Fork before any runtime threads exist
        if !*foreground {
            daemonize(&config, mountpoint)?;
        }
    }

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::from_str(&config.logging.level).unwrap_or(Level::INFO)
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Mount {
            mountpoint,
            sources,
            foreground: _,
            allow_other,
            symlinks,
            no_watch,
        } => {
            check_mountpoint(&mountpoint)?;
            let roots = resolve_roots(&config, &sources)?;
            info!("Mounting {} source roots at {:?}", roots.len(), mountpoint);

            let store = open_store(&config, &roots)?;
            let manager = Arc::new(IngestionManager::new(
                Arc::clone(&store),
                Arc::new(config.loader_registry()?),
                config.ingest_config(roots, !no_watch),
            ));
            let reporter = spawn_reporter(&manager);

            manager
                .start()
                .await
                .context("Failed to start ingestion")?;

            let dispatcher = Arc::new(ViewDispatcher::new(store));
            let fs = StagFs::new(
                dispatcher,
                tokio::runtime::Handle::current(),
                FsOptions {
                    symlinks: symlinks || config.mount.symlinks,
                },
            );

            let mut options = vec![
                fuser::MountOption::FSName("stagfs".to_string()),
                fuser::MountOption::DefaultPermissions,
            ];
            if allow_other || config.mount.allow_other {
                options.push(fuser::MountOption::AllowOther);
                options.push(fuser::MountOption::AutoUnmount);
            }

            info!("Unmount with: fusermount -u {}", mountpoint.display());

            // The session blocks on the runtime from its own thread
            let session = tokio::task::spawn_blocking(move || {
                fuser::mount2(fs, &mountpoint, &options)
            })
            .await
            .context("FUSE session panicked")?;

            manager.stop().await;
            reporter.abort();
            session.context("FUSE session failed")?;
        }

        Commands::Scan { sources } => {
            let roots = resolve_roots(&config, &sources)?;
            let store = open_store(&config, &roots)?;
            let manager = IngestionManager::new(
                Arc::clone(&store),
                Arc::new(config.loader_registry()?),
                config.ingest_config(roots.clone(), false),
            );
            let reporter = spawn_reporter_for(manager.subscribe());

            let manifests = manager
                .scan_initial()
                .await
                .context("Initial scan failed")?;
            info!("Loaded {} manifests", manifests);
            reporter.abort();

            let stats = store.stats().await?;
            print_status(
                cli.format,
                &roots,
                database(&config, &roots),
                stats,
                Some(manager.stats().await),
            )?;
        }

        Commands::Ls { path, sources } => {
            let roots = resolve_roots(&config, &sources)?;
            let store = ready_store(&config, &roots).await?;
            let dispatcher = ViewDispatcher::new(store);

            let resolved = match dispatcher.resolve(&path).await {
                Ok(resolved) => resolved,
                Err(ViewError::NotFound(p)) => anyhow::bail!("No such entry: {p}"),
                Err(e) => return Err(e).context("Resolution failed"),
            };

            match cli.format {
                OutputFormat::Json => {
                    let output = LsOutput {
                        path: &path,
                        resolved: &resolved,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Text => match &resolved {
                    Resolved::Directory(entries) => {
                        for entry in entries {
                            match &entry.backing_path {
                                Some(target) => {
                                    println!("{} -> {}", entry.name, target.display());
                                }
                                None => println!("{}/", entry.name),
                            }
                        }
                    }
                    Resolved::File(target) => println!("{}", target.display()),
                },
            }
        }

        Commands::Status { sources } => {
            let roots = resolve_roots(&config, &sources)?;

            if config.store.backend == StoreBackend::Sqlite {
                let db_path = config.db_path(&roots)?;
                if !db_path.exists() {
                    match cli.format {
                        OutputFormat::Json => {
                            println!(r#"{{"error": "Forest not found"}}"#);
                        }
                        OutputFormat::Text => {
                            println!("No forest at {}", db_path.display());
                            println!("Run 'stagfs scan' to create it.");
                        }
                    }
                    return Ok(());
                }
            }

            let store = ready_store(&config, &roots).await?;
            let stats = store.stats().await?;
            print_status(cli.format, &roots, database(&config, &roots), stats, None)?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => match cli.format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&config)
                            .context("Failed to serialize config")?
                    );
                }
                OutputFormat::Text => {
                    println!(
                        "{}",
                        toml::to_string_pretty(&config).context("Failed to serialize config")?
                    );
                }
            },
            ConfigAction::Init => {
                println!("{}", Config::sample_toml());
            }
            ConfigAction::Path => {
                if let Some(path) = Config::config_path() {
                    println!("{}", path.display());
                } else {
                    println!("Could not determine config directory");
                }
            }
        },
    }

    Ok(())
}

/// Roots from the command line, else from the config file.
fn resolve_roots(config: &Config, cli_roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let roots = if cli_roots.is_empty() {
        &config.sources.roots
    } else {
        cli_roots
    };
    if roots.is_empty() {
        anyhow::bail!("No source roots: pass --source or set [sources] roots");
    }
    Ok(canonical_roots(roots))
}

/// Open the configured store backend. Failure here is fatal.
fn open_store(config: &Config, roots: &[PathBuf]) -> Result<Arc<dyn TagStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = config.db_path(roots)?;
            info!("Opening forest at {:?}", path);
            let store = SqliteStore::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// A store ready for reading: the persisted forest, or a fresh scan when
/// the backend keeps nothing between runs.
async fn ready_store(config: &Config, roots: &[PathBuf]) -> Result<Arc<dyn TagStore>> {
    let store = open_store(config, roots)?;
    if config.store.backend == StoreBackend::Memory {
        let manager = IngestionManager::new(
            Arc::clone(&store),
            Arc::new(config.loader_registry()?),
            config.ingest_config(roots.to_vec(), false),
        );
        manager.scan_initial().await.context("Scan failed")?;
    } else {
        store.init().await.context("Failed to initialize store")?;
    }
    Ok(store)
}

fn database(config: &Config, roots: &[PathBuf]) -> Option<String> {
    match config.store.backend {
        StoreBackend::Sqlite => config
            .db_path(roots)
            .ok()
            .map(|p| p.to_string_lossy().into_owned()),
        StoreBackend::Memory => None,
    }
}

fn spawn_reporter(manager: &IngestionManager) -> JoinHandle<()> {
    spawn_reporter_for(manager.subscribe())
}

/// Log ingestion progress as it happens.
fn spawn_reporter_for(
    mut updates: tokio::sync::broadcast::Receiver<IngestUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                IngestUpdate::ManifestLoaded { path, summary } => {
                    info!(
                        "Loaded {:?}: {} tags, {} references, {} skipped",
                        path, summary.tags, summary.references, summary.skipped
                    );
                }
                IngestUpdate::ManifestRemoved { path, nodes } => {
                    info!("Removed {:?} ({} nodes)", path, nodes);
                }
                IngestUpdate::ManifestError { path, error } => {
                    warn!("Error: {:?}: {}", path, error);
                }
                IngestUpdate::WatchFailed { path, error } => {
                    warn!("Not watching {:?}: {}", path, error);
                }
                IngestUpdate::ScanStarted { .. } | IngestUpdate::ScanCompleted { .. } => {}
            }
        }
    })
}

fn print_status(
    format: OutputFormat,
    roots: &[PathBuf],
    database: Option<String>,
    stats: StoreStats,
    ingest: Option<IngestStats>,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let output = StatusOutput {
                roots: roots
                    .iter()
                    .map(|r| r.to_string_lossy().into_owned())
                    .collect(),
                database,
                stats,
                ingest,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Forest for {} roots", roots.len());
            for root in roots {
                println!("  {}", root.display());
            }
            if let Some(database) = database {
                println!("  Database:    {database}");
            }
            println!("  Nodes:       {}", stats.total_nodes);
            println!("  Directories: {}", stats.directories);
            println!("  References:  {}", stats.references);
            println!("  Datatypes:   {}", stats.datatypes);
            println!("  Manifests:   {}", stats.origins);
            if let Some(ingest) = ingest {
                println!("  Errors:      {}", ingest.errors);
            }
        }
    }
    Ok(())
}

/// Fork into the background, redirecting output to the log file.
fn daemonize(config: &Config, mountpoint: &Path) -> Result<()> {
    let key = roots_hash(&[mountpoint.to_path_buf()]);
    let run_dir = match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir).join("stagfs"),
        Err(_) => cache_dir()
            .context("Failed to get cache directory")?
            .join("run"),
    };
    std::fs::create_dir_all(&run_dir).context("Failed to create PID directory")?;
    let pid_path = run_dir.join(format!("{key}.pid"));

    let log_path = match &config.logging.file {
        Some(path) => path.clone(),
        None => {
            let dir = cache_dir()
                .context("Failed to get cache directory")?
                .join("logs");
            std::fs::create_dir_all(&dir).context("Failed to create log directory")?;
            dir.join(format!("{key}.log"))
        }
    };

    // Printed before the fork; invisible afterwards
    println!("Mounting in background...");
    println!("PID file: {}", pid_path.display());
    println!("Log file: {}", log_path.display());
    println!("Unmount: fusermount -u {}", mountpoint.display());

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .pid_file(&pid_path)
        .chown_pid_file(true)
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to daemonize: {e}"))
}

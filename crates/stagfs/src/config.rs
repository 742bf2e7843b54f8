//! Configuration handling for StagFS.
//!
//! Loaded from `~/.config/stagfs/config.toml` (or `--config`). Every key has
//! a default, so an absent or partial file is valid.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use stagfs_index::IngestConfig;
use stagfs_loader::LoaderRegistry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Manifest sources
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Tag store
    #[serde(default)]
    pub store: StoreConfig,

    /// Change watching
    #[serde(default)]
    pub watch: WatchConfig,

    /// Mount configuration
    #[serde(default)]
    pub mount: MountConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where manifests come from and how they are parsed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourcesConfig {
    /// Directories to scan and watch
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Extra file-name suffix → loader name mappings
    #[serde(default)]
    pub loaders: BTreeMap<String, String>,
}

/// Tag store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database path (default: derived from the source roots)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Watch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Keep the forest in sync after the initial scan
    #[serde(default = "default_watch_enabled")]
    pub enabled: bool,

    /// Debounce duration for file watcher (ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Wait for an event per loop iteration (ms)
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,

    /// Sleep between loop iterations (ms)
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
}

fn default_watch_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_poll_wait_ms() -> u64 {
    250
}

fn default_idle_sleep_ms() -> u64 {
    100
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_watch_enabled(),
            debounce_ms: default_debounce_ms(),
            poll_wait_ms: default_poll_wait_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
        }
    }
}

/// Mount-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountConfig {
    /// Allow other users to access the mount
    #[serde(default)]
    pub allow_other: bool,

    /// Present leaves as symbolic links
    #[serde(default)]
    pub symlinks: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path for background mounts (optional)
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

const SAMPLE_TOML: &str = r#"# StagFS configuration

[sources]
# Directories scanned for manifests (*.stag, *.stag.toml)
roots = ["/media/movies", "/media/music"]

# Extra suffixes routed to a loader ("json" or "toml")
[sources.loaders]
# "manifest" = "json"

[store]
# "sqlite" persists the forest; "memory" rebuilds it on every start
backend = "sqlite"
# path = "/var/lib/stagfs/stagfs.sqlite"

[watch]
enabled = true
debounce_ms = 500
poll_wait_ms = 250
idle_sleep_ms = 100

[mount]
allow_other = false
symlinks = false

[logging]
level = "info"
# file = "/var/log/stagfs.log"
"#;

impl Config {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path`, or the default location when `None`.
    ///
    /// An explicit path must exist.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => match Self::config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Default config file path.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn sample_toml() -> &'static str {
        SAMPLE_TOML
    }

    /// Loader registry with the built-in formats plus configured suffixes.
    pub fn loader_registry(&self) -> Result<LoaderRegistry> {
        let mut registry = LoaderRegistry::with_defaults();
        for (suffix, loader) in &self.sources.loaders {
            registry
                .map_suffix(suffix, loader)
                .with_context(|| format!("Invalid loader mapping {suffix} = {loader}"))?;
        }
        Ok(registry)
    }

    /// Ingestion settings for `roots`.
    pub fn ingest_config(&self, roots: Vec<PathBuf>, watch: bool) -> IngestConfig {
        IngestConfig {
            roots,
            watch: watch && self.watch.enabled,
            debounce: Duration::from_millis(self.watch.debounce_ms),
            poll_wait: Duration::from_millis(self.watch.poll_wait_ms),
            idle_sleep: Duration::from_millis(self.watch.idle_sleep_ms),
        }
    }

    /// SQLite database for `roots`: the configured path, or one per distinct
    /// set of roots under the data directory.
    pub fn db_path(&self, roots: &[PathBuf]) -> Result<PathBuf> {
        if let Some(path) = &self.store.path {
            return Ok(path.clone());
        }
        let data = data_dir().context("Failed to get data directory")?;
        Ok(data
            .join("indices")
            .join(roots_hash(roots))
            .join("stagfs.sqlite"))
    }
}

/// Short stable hash of a set of roots, independent of their order.
pub fn roots_hash(roots: &[PathBuf]) -> String {
    let mut names: Vec<String> = roots
        .iter()
        .map(|root| root.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.dedup();
    let hash = blake3::hash(names.join("\n").as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Canonicalize roots that exist, keeping the others as given.
pub fn canonical_roots(roots: &[PathBuf]) -> Vec<PathBuf> {
    roots
        .iter()
        .map(|root| root.canonicalize().unwrap_or_else(|_| root.clone()))
        .collect()
}

/// Get the XDG data directory for StagFS.
pub fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("STAGFS_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from("", "", "stagfs").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the XDG config directory for StagFS.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("STAGFS_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from("", "", "stagfs").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the XDG cache directory for StagFS.
pub fn cache_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "stagfs").map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Whether `path` looks like a mount point we can use.
pub fn check_mountpoint(path: &Path) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("Mount point is not a directory: {}", path.display());
    }
    Ok(())
}

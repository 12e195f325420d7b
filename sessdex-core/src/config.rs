//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/sessdex/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sessdex/` (~/.config/sessdex/)
//! - Data: `$XDG_DATA_HOME/sessdex/` (~/.local/share/sessdex/)
//! - State/Logs: `$XDG_STATE_HOME/sessdex/` (~/.local/state/sessdex/)
//!
//! ```toml
//! database_path = "/tmp/index.db"
//!
//! [[roots]]
//! path = "~/.claude"
//! source = "claude_code"
//!
//! [[roots]]
//! path = "/mnt/devbox/.codex"
//! source = "codex"
//! remote_host = "devbox"
//!
//! [index]
//! workers = 4
//! heavy_sources = ["codex"]
//! heavy_source_workers = 1
//!
//! [parse]
//! max_scan_bytes = 67108864
//! ```

use crate::error::{Error, Result};
use crate::types::Source;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Expand a leading `~/` against the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Watched log roots
    #[serde(default = "default_roots")]
    pub roots: Vec<RootConfig>,

    /// Coordinator and pool settings
    #[serde(default)]
    pub index: IndexConfig,

    /// Record parser settings
    #[serde(default)]
    pub parse: ParseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Store file override (defaults to the XDG data dir)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            index: IndexConfig::default(),
            parse: ParseConfig::default(),
            logging: LoggingConfig::default(),
            database_path: None,
        }
    }
}

/// One watched directory and the source that writes into it
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RootConfig {
    pub path: PathBuf,
    pub source: Source,
    /// Host the logs were mirrored from, if not local
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RootConfig {
    pub fn new(path: impl Into<PathBuf>, source: Source) -> Self {
        Self {
            path: path.into(),
            source,
            remote_host: None,
            enabled: true,
        }
    }

    /// Root path with `~` expanded
    pub fn resolved_path(&self) -> PathBuf {
        expand_tilde(&self.path)
    }
}

fn default_roots() -> Vec<RootConfig> {
    vec![
        RootConfig::new("~/.claude", Source::ClaudeCode),
        RootConfig::new("~/.codex", Source::Codex),
    ]
}

fn default_true() -> bool {
    true
}

/// Coordinator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Parse pool size; defaults to max(2, cores / 2)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Sources known to write very large logs
    #[serde(default = "default_heavy_sources")]
    pub heavy_sources: Vec<Source>,

    /// Parse slots available to heavy sources
    #[serde(default = "default_heavy_source_workers")]
    pub heavy_source_workers: usize,

    /// Records per store transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// File-watch coalescing window
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Insert fingerprint-only rows before the full parse lands
    #[serde(default = "default_true")]
    pub insert_stubs: bool,

    #[serde(default = "default_store_retry_initial_ms")]
    pub store_retry_initial_ms: u64,

    #[serde(default = "default_store_retry_max_ms")]
    pub store_retry_max_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            workers: None,
            heavy_sources: default_heavy_sources(),
            heavy_source_workers: default_heavy_source_workers(),
            batch_size: default_batch_size(),
            debounce_ms: default_debounce_ms(),
            insert_stubs: true,
            store_retry_initial_ms: default_store_retry_initial_ms(),
            store_retry_max_ms: default_store_retry_max_ms(),
        }
    }
}

impl IndexConfig {
    /// Effective parse pool size
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(2)
        })
    }

    pub fn is_heavy(&self, source: Source) -> bool {
        self.heavy_sources.contains(&source)
    }
}

fn default_heavy_sources() -> Vec<Source> {
    vec![Source::Codex]
}

fn default_heavy_source_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    64
}

fn default_debounce_ms() -> u64 {
    750
}

fn default_store_retry_initial_ms() -> u64 {
    500
}

fn default_store_retry_max_ms() -> u64 {
    30_000
}

/// Record parser configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ParseConfig {
    /// Read buffer per parse, in KiB
    #[serde(default = "default_read_buffer_kb")]
    pub read_buffer_kb: usize,

    /// Stop scanning a file after this many bytes
    #[serde(default)]
    pub max_scan_bytes: Option<u64>,

    /// Gaps longer than this do not count toward active time
    #[serde(default = "default_idle_gap_secs")]
    pub idle_gap_secs: u64,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            read_buffer_kb: default_read_buffer_kb(),
            max_scan_bytes: None,
            idle_gap_secs: default_idle_gap_secs(),
        }
    }
}

fn default_read_buffer_kb() -> usize {
    64
}

fn default_idle_gap_secs() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Configuration with explicit roots and store file, defaults elsewhere
    pub fn with_roots(roots: Vec<RootConfig>, database_path: impl Into<PathBuf>) -> Self {
        Self {
            roots,
            database_path: Some(database_path.into()),
            ..Default::default()
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.index.batch_size == 0 {
            return Err(Error::Config("index.batch_size must be at least 1".to_string()));
        }
        if self.index.workers == Some(0) {
            return Err(Error::Config("index.workers must be at least 1".to_string()));
        }
        if self.index.heavy_source_workers == 0 {
            return Err(Error::Config(
                "index.heavy_source_workers must be at least 1".to_string(),
            ));
        }
        if self.index.store_retry_initial_ms > self.index.store_retry_max_ms {
            return Err(Error::Config(
                "index.store_retry_initial_ms must not exceed index.store_retry_max_ms"
                    .to_string(),
            ));
        }
        if self.parse.read_buffer_kb == 0 {
            return Err(Error::Config("parse.read_buffer_kb must be at least 1".to_string()));
        }
        if let Some(root) = self.roots.iter().find(|r| r.path.as_os_str().is_empty()) {
            return Err(Error::Config(format!(
                "root for {} has an empty path",
                root.source
            )));
        }
        Ok(())
    }

    /// Enabled roots, in configuration order
    pub fn enabled_roots(&self) -> Vec<RootConfig> {
        self.roots.iter().filter(|r| r.enabled).cloned().collect()
    }

    /// Store file this configuration points at
    pub fn store_path(&self) -> PathBuf {
        self.database_path
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sessdex/config.toml` (~/.config/sessdex/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sessdex").join("config.toml")
    }

    /// Returns the data directory path (for the store file)
    ///
    /// `$XDG_DATA_HOME/sessdex/` (~/.local/share/sessdex/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("sessdex")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/sessdex/` (~/.local/state/sessdex/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sessdex")
    }

    /// Returns the default store file path
    ///
    /// `$XDG_DATA_HOME/sessdex/index.db` (~/.local/share/sessdex/index.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("index.db")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// For CLI binaries that want stable path behavior before other
    /// components read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

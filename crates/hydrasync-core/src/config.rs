//! Configuration module for HydraSync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::errors::DomainError;
use crate::domain::newtypes::{RemoteLocator, SyncPath};
use crate::domain::path_mapper::PathMapper;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for HydraSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub locking: LockingConfig,
    pub filters: FiltersConfig,
    pub logging: LoggingConfig,
    pub remote: RemoteConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the local placeholder tree. A leading `~` is expanded.
    pub local_root: PathBuf,
    /// Folder locator of the remote root. Defaults to the `file://` URL of
    /// `remote.store_dir` when unset.
    pub remote_root: Option<String>,
    /// Seconds between full reconciliation passes.
    pub reconcile_interval: u64,
    /// Seconds between remote polls when the store has no push channel.
    pub poll_interval: u64,
    /// Milliseconds an unclaimed suppression registration stays active.
    pub suppression_grace_ms: u64,
}

/// Remote lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Lock a file on the remote when a write handle is opened.
    pub autolock: bool,
    /// Seconds to wait for a remote lock call.
    pub lock_timeout: u64,
}

/// Noise filters applied by both monitors and the walker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    /// Glob patterns matched against the file name.
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

/// Folder-backed remote store used by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub store_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/hydrasync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("hydrasync")
            .join("config.yaml")
    }

    /// Build the path mapper for the configured roots.
    pub fn path_mapper(&self) -> Result<PathMapper, DomainError> {
        let local_root = SyncPath::new(expand_home(&self.sync.local_root))?;
        PathMapper::new(local_root, self.remote_root()?)
    }

    /// The configured remote root, or the URL of the store directory.
    pub fn remote_root(&self) -> Result<RemoteLocator, DomainError> {
        match &self.sync.remote_root {
            Some(root) => RemoteLocator::parse(root),
            None => {
                let dir = expand_home(&self.remote.store_dir);
                let url = Url::from_directory_path(&dir).map_err(|()| {
                    DomainError::InvalidRemoteLocator(format!(
                        "store directory must be absolute: {}",
                        dir.display()
                    ))
                })?;
                RemoteLocator::from_url(url)
            }
        }
    }
}

impl SyncConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn suppression_grace(&self) -> Duration {
        Duration::from_millis(self.suppression_grace_ms)
    }
}

impl LockingConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("~/HydraSync"),
            remote_root: None,
            reconcile_interval: 300,
            poll_interval: 30,
            suppression_grace_ms: 5000,
        }
    }
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            autolock: true,
            lock_timeout: 30,
        }
    }
}

/// Temporary files and editor lock artifacts.
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    "~$*",
    ".~lock.*#",
    "*.tmp",
    "*.swp",
    ".#*",
    "*~",
    ".DS_Store",
    "Thumbs.db",
];

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("~/.local/share/hydrasync/remote"),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut positive = |field: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        };

        // --- sync ---
        positive("sync.reconcile_interval", self.sync.reconcile_interval);
        positive("sync.poll_interval", self.sync.poll_interval);
        positive("sync.suppression_grace_ms", self.sync.suppression_grace_ms);
        // --- locking ---
        positive("locking.lock_timeout", self.locking.lock_timeout);

        if !expand_home(&self.sync.local_root).is_absolute() {
            errors.push(ValidationError {
                field: "sync.local_root".into(),
                message: format!("must be absolute: {}", self.sync.local_root.display()),
            });
        }
        match self.remote_root() {
            Ok(root) => {
                if self.sync.remote_root.is_some() && !root.is_folder() {
                    errors.push(ValidationError {
                        field: "sync.remote_root".into(),
                        message: format!("folder locator must end with '/': {root}"),
                    });
                }
            }
            Err(e) => errors.push(ValidationError {
                field: if self.sync.remote_root.is_some() {
                    "sync.remote_root".into()
                } else {
                    "remote.store_dir".into()
                },
                message: e.to_string(),
            }),
        }

        // --- filters ---
        for pattern in &self.filters.exclude_patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ValidationError {
                    field: "filters.exclude_patterns".into(),
                    message: format!("invalid pattern '{pattern}': {e}"),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use hydrasync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .local_root(PathBuf::from("/home/user/HydraSync"))
///     .remote_root("https://dav.example.com/files/user/")
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn local_root(mut self, root: PathBuf) -> Self {
        self.config.sync.local_root = root;
        self
    }

    pub fn remote_root(mut self, root: impl Into<String>) -> Self {
        self.config.sync.remote_root = Some(root.into());
        self
    }

    pub fn reconcile_interval(mut self, seconds: u64) -> Self {
        self.config.sync.reconcile_interval = seconds;
        self
    }

    pub fn poll_interval(mut self, seconds: u64) -> Self {
        self.config.sync.poll_interval = seconds;
        self
    }

    pub fn suppression_grace_ms(mut self, ms: u64) -> Self {
        self.config.sync.suppression_grace_ms = ms;
        self
    }

    // --- locking ---

    pub fn autolock(mut self, enabled: bool) -> Self {
        self.config.locking.autolock = enabled;
        self
    }

    pub fn lock_timeout(mut self, seconds: u64) -> Self {
        self.config.locking.lock_timeout = seconds;
        self
    }

    // --- filters ---

    pub fn exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.filters.exclude_patterns.push(pattern.into());
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- remote ---

    pub fn store_dir(mut self, dir: PathBuf) -> Self {
        self.config.remote.store_dir = dir;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

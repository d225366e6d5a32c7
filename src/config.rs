//! Importer configuration and TOML loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Complete configuration of one import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Target SQLite database.
    pub database: PathBuf,
    /// Conversion worker pool bounds.
    pub workers: WorkerBounds,
    /// Top-level features converted before a worker commits its batch.
    pub commit_after: usize,
    /// Records a resolver stages before executing them inside the open
    /// category transaction.
    pub resolver_batch_size: usize,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout_ms: u64,
    /// Identity cache settings.
    pub cache: CacheConfig,
    /// Deferred reference store settings.
    pub xlink: XlinkConfig,
    /// Index handling around a run.
    pub indexes: IndexConfig,
    /// Duplicate handling.
    pub duplicates: DuplicateConfig,
    /// Global stop conditions.
    pub limits: LimitConfig,
}

/// Lower and upper bound of a worker pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerBounds {
    /// Core threads started before the first unit of work.
    pub min: usize,
    /// Maximum number of threads the pool may grow to.
    pub max: usize,
}

/// Identity cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of independently locked partitions.
    pub partitions: usize,
    /// Entries held in memory per partition before paging to the spill store.
    pub capacity_per_partition: usize,
    /// Directory for spill files; the system temp directory when unset.
    pub spill_dir: Option<PathBuf>,
}

/// Deferred reference store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XlinkConfig {
    /// Directory for the staging database; the system temp directory when unset.
    pub store_dir: Option<PathBuf>,
    /// Rows fetched per read while scanning a snapshot.
    pub scan_chunk: usize,
}

/// Index handling around an import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Drop secondary indexes before the first file and rebuild them after the last.
    pub deactivate_during_import: bool,
}

/// What to do with top-level features that already exist in the target.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateMode {
    /// Import without checking.
    #[default]
    Ignore,
    /// Filter existing features out of the import.
    Skip,
    /// Delete existing features before importing the new ones.
    Delete,
}

/// Duplicate handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    /// Action taken after a positive duplicate check.
    pub mode: DuplicateMode,
}

/// Global stop conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Stop reading once this many top-level features were handed to the pool.
    pub max_features: Option<u64>,
}

impl Default for WorkerBounds {
    fn default() -> Self {
        let max = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self { min: 1, max }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partitions: 16,
            capacity_per_partition: 100_000,
            spill_dir: None,
        }
    }
}

impl Default for XlinkConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            scan_chunk: 1_000,
        }
    }
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("city.db"),
            workers: WorkerBounds::default(),
            commit_after: 20,
            resolver_batch_size: 500,
            busy_timeout_ms: 30_000,
            cache: CacheConfig::default(),
            xlink: XlinkConfig::default(),
            indexes: IndexConfig::default(),
            duplicates: DuplicateConfig::default(),
            limits: LimitConfig::default(),
        }
    }
}

impl ImporterConfig {
    /// Creates a default configuration targeting `database`.
    pub fn for_database(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from `explicit`, or from the default location when
    /// it exists, falling back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit.map(Path::to_path_buf).or_else(default_config_path);
        let config = match path {
            Some(path) if path.exists() => read_file(&path)?,
            Some(path) if explicit.is_some() => return Err(ConfigError::Missing { path }),
            _ => ImporterConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.min == 0 || self.workers.min > self.workers.max {
            return Err(ConfigError::Invalid(format!(
                "worker bounds {}..{} are invalid",
                self.workers.min, self.workers.max
            )));
        }
        if self.commit_after == 0 {
            return Err(ConfigError::Invalid("commit_after must be > 0".into()));
        }
        if self.resolver_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "resolver_batch_size must be > 0".into(),
            ));
        }
        if self.cache.partitions == 0 || self.cache.capacity_per_partition == 0 {
            return Err(ConfigError::Invalid(
                "cache partitions and capacity must be > 0".into(),
            ));
        }
        if self.xlink.scan_chunk == 0 {
            return Err(ConfigError::Invalid("xlink.scan_chunk must be > 0".into()));
        }
        Ok(())
    }

    /// Capacity of the conversion queue; twice the pool's upper bound.
    pub fn queue_capacity(&self) -> usize {
        self.workers.max.saturating_mul(2).max(1)
    }
}

/// Default configuration file location (`<config dir>/cityload/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("CITYLOAD_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("cityload").join("config.toml"))
}

fn read_file(path: &Path) -> Result<ImporterConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// An explicitly requested file does not exist.
    #[error("config file {path} does not exist")]
    Missing {
        /// Requested file.
        path: PathBuf,
    },
    /// A setting is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

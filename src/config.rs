//! Configuration module for the ingestion service.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `SHEETDEX_` and use double underscores
//! to separate nested levels:
//! - `SHEETDEX_INTAKE__CHUNK_THRESHOLD_BYTES=10485760` sets `intake.chunk_threshold_bytes`
//! - `SHEETDEX_EMBEDDING__MODEL=hash` sets `embedding.model`
//! - `SHEETDEX_INDEX__MAX_RETRIES=2` sets `index.max_retries`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory for staging files and the status snapshot
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Path to the search index directory
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    #[serde(default)]
    pub intake: IntakeConfig,

    #[serde(default)]
    pub parsing: ParsingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IntakeConfig {
    /// Uploads at or above this size must use chunked transfer
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold_bytes: u64,

    /// Largest chunk accepted in a chunked session
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Hard upper bound on a declared upload size
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: u64,

    /// Idle time after which an upload session is discarded
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// How often the session reaper runs
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ParsingConfig {
    /// Records per batch handed to the embed/index stage
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows between progress reports to the status tracker
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// Cells longer than this mark the row as malformed
    #[serde(default = "default_max_cell_chars")]
    pub max_cell_chars: usize,

    /// Batches buffered between the parser thread and the consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// Model name (`AllMiniLML6V2`, `BGESmallENV15`, ...) or `hash`
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Number of model instances serving inference concurrently
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Vector length produced by the `hash` generator
    #[serde(default = "default_hash_dimension")]
    pub hash_dimension: usize,

    /// Attempts per batch before the batch is treated as failed
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,

    #[serde(default = "default_embed_backoff")]
    pub retry_backoff_ms: u64,

    /// Model cache directory (defaults to `<data_dir>/models`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_false")]
    pub show_download_progress: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    /// Memory budget for the index writer
    #[serde(default = "default_writer_heap")]
    pub writer_heap_bytes: usize,

    /// Attempts per batch write before the file is failed
    #[serde(default = "default_index_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Remove partially written documents of a failed file
    #[serde(default = "default_true")]
    pub purge_on_failure: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Deepest offset a search may page to
    #[serde(default = "default_max_offset")]
    pub max_offset: usize,
}

/// Logging configuration.
///
/// `default` applies to every target; `modules` overrides individual targets.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub default: String,

    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".sheetdex")
}
fn default_index_path() -> PathBuf {
    PathBuf::from(".sheetdex/index")
}
fn default_chunk_threshold() -> u64 {
    20 * MIB
}
fn default_max_chunk_size() -> u64 {
    5 * MIB
}
fn default_max_upload() -> u64 {
    2048 * MIB
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_reap_interval() -> u64 {
    60
}
fn default_batch_size() -> usize {
    1000
}
fn default_progress_interval() -> u64 {
    5000
}
fn default_max_cell_chars() -> usize {
    4000
}
fn default_channel_capacity() -> usize {
    4
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_pool_size() -> usize {
    2
}
fn default_hash_dimension() -> usize {
    384
}
fn default_embed_retries() -> u32 {
    3
}
fn default_embed_backoff() -> u64 {
    200
}
fn default_writer_heap() -> usize {
    50_000_000
}
fn default_index_retries() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    5000
}
fn default_page_size() -> usize {
    20
}
fn default_max_page_size() -> usize {
    100
}
fn default_max_offset() -> usize {
    10_000
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            index_path: default_index_path(),
            intake: IntakeConfig::default(),
            parsing: ParsingConfig::default(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            query: QueryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_bytes: default_chunk_threshold(),
            max_chunk_size: default_max_chunk_size(),
            max_upload_bytes: default_max_upload(),
            session_ttl_secs: default_session_ttl(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            progress_interval: default_progress_interval(),
            max_cell_chars: default_max_cell_chars(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            pool_size: default_pool_size(),
            hash_dimension: default_hash_dimension(),
            max_retries: default_embed_retries(),
            retry_backoff_ms: default_embed_backoff(),
            cache_dir: None,
            show_download_progress: false,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            writer_heap_bytes: default_writer_heap(),
            max_retries: default_index_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            purge_on_failure: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_offset: default_max_offset(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl EmbeddingConfig {
    /// Directory where downloaded models are cached.
    pub fn cache_dir_or(&self, data_dir: &Path) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("models"))
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(".sheetdex/settings.toml"));

        Self::figment(config_path).extract().map_err(Box::new)
    }

    /// Load configuration from a specific file (env overrides still apply)
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref().to_path_buf())
            .extract()
            .map_err(Box::new)
    }

    fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore separates nested levels; single underscores stay in field names
            .merge(Env::prefixed("SHEETDEX_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find `.sheetdex/settings.toml` searching from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(".sheetdex");
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Path of the status snapshot file
    pub fn status_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("files.json")
    }

    /// Directory for staged uploads and chunk spools
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(".sheetdex/settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.index_path, PathBuf::from(".sheetdex/index"));
        assert_eq!(settings.intake.chunk_threshold_bytes, 20 * MIB);
        assert!(settings.embedding.pool_size >= 1);
        assert!(settings.index.purge_on_failure);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
version = 2

[intake]
chunk_threshold_bytes = 1024
max_chunk_size = 256

[embedding]
model = "hash"
hash_dimension = 64

[logging]
default = "debug"

[logging.modules]
index = "trace"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.version, 2);
        assert_eq!(settings.intake.chunk_threshold_bytes, 1024);
        assert_eq!(settings.intake.max_chunk_size, 256);
        assert_eq!(settings.embedding.model, "hash");
        assert_eq!(settings.embedding.hash_dimension, 64);
        assert_eq!(settings.logging.default, "debug");
        assert_eq!(settings.logging.modules["index"], "trace");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        fs::write(&config_path, "[parsing]\nbatch_size = 250\n").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.parsing.batch_size, 250);
        assert_eq!(settings.parsing.progress_interval, 5000);
        assert_eq!(settings.query.max_page_size, 100);
        assert_eq!(settings.index.max_retries, 5);
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.parsing.batch_size = 42;
        settings.query.max_page_size = 7;
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.parsing.batch_size, 42);
        assert_eq!(loaded.query.max_page_size, 7);
    }
}

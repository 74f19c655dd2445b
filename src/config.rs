use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the platform data directory for tracking records
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Byte budget for the record directory, unlimited when unset
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    #[serde(default = "default_cache_flush_delay_ms")]
    pub cache_flush_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_title_search_delay_ms")]
    pub title_search_delay_ms: u64,
    #[serde(default = "default_auto_stop_days")]
    pub auto_stop_days: u32,
}

fn default_base_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_region() -> String {
    "US".to_string()
}

fn default_max_concurrent_requests() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_cache_ttl_days() -> u32 {
    7
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_cache_flush_delay_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    5
}

fn default_title_search_delay_ms() -> u64 {
    250
}

fn default_auto_stop_days() -> u32 {
    365
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            language: default_language(),
            region: default_region(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_retries: default_max_retries(),
            cache_ttl_days: default_cache_ttl_days(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            quota_bytes: None,
            cache_flush_delay_ms: default_cache_flush_delay_ms(),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            title_search_delay_ms: default_title_search_delay_ms(),
            auto_stop_days: default_auto_stop_days(),
        }
    }
}

impl MetadataConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_ttl_days) * 24 * 60 * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl StorageConfig {
    pub fn cache_flush_delay(&self) -> Duration {
        Duration::from_millis(self.cache_flush_delay_ms)
    }

    /// Record directory, falling back to the platform data dir
    pub fn records_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("records")),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "tvcine").ok_or(Error::NoConfigDir)
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn data_dir() -> Result<PathBuf> {
    ProjectDirs::from("", "", "tvcine")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(Error::NoDataDir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load from an explicit path, writing defaults if the file is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

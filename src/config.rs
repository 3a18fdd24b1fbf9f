use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub archive: ArchiveConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the private upstream API, e.g. `https://xos.example.org/api`.
    pub endpoint: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_page_size() -> u32 {
    10
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Public base URL assets are served from, e.g.
    /// `https://public-bucket.s3.amazonaws.com`.
    pub public_base_url: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_asset_timeout_secs")]
    pub asset_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_asset_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Directory holding one `<id>.json` per work, the watermark, and
    /// the run lock.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_search_page_size")]
    pub page_size: u32,
    #[serde(default = "default_search_max_page_size")]
    pub max_page_size: u32,
}

fn default_search_page_size() -> u32 {
    20
}
fn default_search_max_page_size() -> u32 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_relocation_workers")]
    pub relocation_workers: usize,
}

// A missing [sync] table must yield the same values as an empty one; the
// derived Default would zero relocation_workers and fail validation.
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relocation_workers: default_relocation_workers(),
        }
    }
}

fn default_relocation_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Public base URL of this API, used to build pagination links,
    /// e.g. `https://api.example.org`.
    pub base_url: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.upstream.page_size == 0 {
        anyhow::bail!("upstream.page_size must be > 0");
    }
    if config.upstream.max_retries == 0 {
        anyhow::bail!("upstream.max_retries must be >= 1");
    }
    if config.upstream.endpoint.trim().is_empty() {
        anyhow::bail!("upstream.endpoint must be set");
    }

    if config.storage.public_base_url.trim().is_empty() {
        anyhow::bail!("storage.public_base_url must be set");
    }

    if config.search.page_size == 0 || config.search.page_size > config.search.max_page_size {
        anyhow::bail!(
            "search.page_size must be in 1..={}",
            config.search.max_page_size
        );
    }

    if config.sync.relocation_workers == 0 {
        anyhow::bail!("sync.relocation_workers must be >= 1");
    }

    Ok(config)
}

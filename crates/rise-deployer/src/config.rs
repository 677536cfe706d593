//! Configuration for the deploy worker.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use rise_store::{BucketConfig, StoreConfig};

use crate::error::{DeployError, DeployResult};

/// Top-level configuration for the deploy worker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeployerConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object storage backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Deployment bucket.
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Worker limits and timeouts.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Analytics collector.
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

impl DeployerConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources
    /// override earlier):
    /// 1. Default values
    /// 2. `rise-deployer.toml` in the current directory (if present)
    /// 3. Environment variables with `RISE_DEPLOYER_` prefix
    pub fn load() -> DeployResult<Self> {
        Figment::new()
            .merge(Toml::file("rise-deployer.toml"))
            .merge(Env::prefixed("RISE_DEPLOYER_").split("__"))
            .extract()
            .map_err(|e| DeployError::Config(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "postgres://localhost/rise".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Worker limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Deadline for the per-entry upload phase, in seconds.
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    /// HTML files larger than this are uploaded without a watermark,
    /// in bytes.
    #[serde(default = "default_max_file_size_to_watermark")]
    pub max_file_size_to_watermark: u64,

    /// How many extracted entries may wait for upload at once.
    #[serde(default = "default_extract_buffer")]
    pub extract_buffer: usize,

    /// Visibility timeout for received deploy jobs, in seconds.
    #[serde(default = "default_job_visibility_secs")]
    pub job_visibility_secs: u64,
}

const fn default_upload_timeout_secs() -> u64 {
    180
}

const fn default_max_file_size_to_watermark() -> u64 {
    5_000_000
}

const fn default_extract_buffer() -> usize {
    16
}

const fn default_job_visibility_secs() -> u64 {
    600
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            upload_timeout_secs: default_upload_timeout_secs(),
            max_file_size_to_watermark: default_max_file_size_to_watermark(),
            extract_buffer: default_extract_buffer(),
            job_visibility_secs: default_job_visibility_secs(),
        }
    }
}

/// Analytics collector configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnalyticsConfig {
    /// Collector endpoint URL; tracking is disabled when unset.
    pub endpoint: Option<String>,
}

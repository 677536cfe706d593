//! Configuration for the ingress API.

use std::net::SocketAddr;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use rise_deployer::config::DatabaseConfig;
use rise_store::{BucketConfig, StoreConfig};

/// Top-level configuration for the API service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object storage backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Deployment bucket.
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Upload limits.
    #[serde(default)]
    pub uploads: UploadConfig,
}

impl ApiConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources
    /// override earlier):
    /// 1. Default values
    /// 2. `rise-api.toml` in the current directory (if present)
    /// 3. Environment variables with `RISE_API_` prefix
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("rise-api.toml"))
            .merge(Env::prefixed("RISE_API_").split("__"))
            .extract()
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Upload limits.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted bundle, in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
}

const fn default_max_upload_size() -> usize {
    1 << 30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ApiConfig::default();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.uploads.max_upload_size, 1 << 30);
    }
}

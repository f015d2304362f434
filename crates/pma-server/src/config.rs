//! Gateway configuration
//!
//! A small YAML file with defaults for every field; a missing file means
//! a default configuration. The path comes from `PMA_CONFIG` or falls
//! back to `gateway.yaml` in the working directory.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address for the HTTP surface
    pub http_addr: String,

    /// SQLite database path
    pub database_path: String,

    /// Secret for JWT signing and credential sealing
    pub secret: Option<String>,

    /// Period between background full syncs, in seconds
    pub sync_interval_secs: u64,

    /// Register the built-in virtual source with generated devices
    pub virtual_source: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3001".to_string(),
            database_path: "pma-gateway.db".to_string(),
            secret: None,
            sync_interval_secs: 60,
            virtual_source: false,
        }
    }
}

impl GatewayConfig {
    /// Load from the given path, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Resolve the config path from the environment.
    pub fn path_from_env() -> String {
        std::env::var("PMA_CONFIG").unwrap_or_else(|_| "gateway.yaml".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_defaults() {
        let config = GatewayConfig::load("/nonexistent/gateway.yaml").unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:3001");
        assert_eq!(config.sync_interval_secs, 60);
        assert!(!config.virtual_source);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "http_addr: \"127.0.0.1:8080\"\nvirtual_source: true\n").unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:8080");
        assert!(config.virtual_source);
        assert_eq!(config.database_path, "pma-gateway.db");
    }
}

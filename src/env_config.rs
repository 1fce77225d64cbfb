//! Environment configuration.
//!
//! Deployment scripts describe the pool a host should run in a small JSON
//! file; the runtime reads it at startup so binaries need no baked-in
//! topology.
//!
//! # Configuration File Locations
//!
//! Searched in order:
//! 1. `PKTGRAPH_ENV_CONFIG` environment variable (if set)
//! 2. `./config/pktgraph-env.json` (project-local)
//! 3. `/etc/pktgraph/env.json` (system-wide)
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "threads": 4,
//!   "cores": [2, 3, 4, 5],
//!   "burst": 64,
//!   "thread_name": "edge-router"
//! }
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

/// Default configuration file paths (searched in order).
pub(crate) const DEFAULT_CONFIG_PATHS: &[&str] =
    &["./config/pktgraph-env.json", "/etc/pktgraph/env.json"];

/// Pool configuration loaded from the environment. Every field is
/// optional; absent fields leave the builder's defaults untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvConfig {
    /// Worker thread count.
    #[serde(default)]
    pub threads: Option<usize>,

    /// Maximum tasks per dispatch round.
    #[serde(default)]
    pub burst: Option<usize>,

    /// CPU cores to pin workers to, one per worker.
    #[serde(default)]
    pub cores: Vec<usize>,

    /// Worker thread name prefix.
    #[serde(default)]
    pub thread_name: Option<String>,
}

impl EnvConfig {
    /// Checks the configuration is usable for building a pool.
    pub fn validate(&self) -> io::Result<()> {
        if self.threads == Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "env config sets \"threads\": 0; at least one worker is required",
            ));
        }
        if self.burst == Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "env config sets \"burst\": 0; at least one task per round is required",
            ));
        }
        if let (Some(threads), false) = (self.threads, self.cores.is_empty()) {
            if self.cores.len() != threads {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "env config lists {} cores for {} threads; \
                         give one core per worker or omit \"cores\"",
                        self.cores.len(),
                        threads
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Load configuration from the default search paths.
    pub fn load() -> io::Result<Self> {
        if let Ok(path) = std::env::var("PKTGRAPH_ENV_CONFIG") {
            return Self::load_from_file(&path);
        }

        for path in DEFAULT_CONFIG_PATHS {
            if Path::new(path).exists() {
                return Self::load_from_file(path);
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "pktgraph environment config not found. Searched: {:?}. \
                 Set PKTGRAPH_ENV_CONFIG or create one of those files.",
                DEFAULT_CONFIG_PATHS
            ),
        ))
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &str) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse_json(&content).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse {}: {}", path, e),
            )
        })
    }

    /// Parse configuration from a JSON string.
    pub fn parse_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "threads": 4,
            "cores": [2, 3, 4, 5],
            "burst": 64,
            "thread_name": "edge-router"
        }"#;

        let config = EnvConfig::parse_json(json).unwrap();
        assert_eq!(config.threads, Some(4));
        assert_eq!(config.cores, vec![2, 3, 4, 5]);
        assert_eq!(config.burst, Some(64));
        assert_eq!(config.thread_name.as_deref(), Some("edge-router"));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = EnvConfig::parse_json("{}").unwrap();
        assert_eq!(config.threads, None);
        assert_eq!(config.burst, None);
        assert!(config.cores.is_empty());
        assert!(config.thread_name.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config_with_extra_fields() {
        // Extra fields (version, platform) are ignored.
        let json = r#"{
            "version": 1,
            "platform": "bare-metal",
            "threads": 2
        }"#;

        let config = EnvConfig::parse_json(json).unwrap();
        assert_eq!(config.threads, Some(2));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let config = EnvConfig::parse_json(r#"{ "threads": 0 }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_core_mismatch() {
        let config = EnvConfig::parse_json(r#"{ "threads": 2, "cores": [1] }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cores_without_threads_is_valid() {
        let config = EnvConfig::parse_json(r#"{ "cores": [1, 2] }"#).unwrap();
        config.validate().unwrap();
    }
}

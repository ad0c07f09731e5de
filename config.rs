//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating s3bu settings
//! from JSON files and environment variables.
//!
//! ## Environment Variables
//!
//! - `S3BU_CONFIG`: Override config file path
//! - `S3BU_STORAGE_DIR`: Override storage directory path
//! - `S3BU_BUCKET`: Override target bucket
//! - `S3BU_METADATA_PREFIX`: Override the metadata attribute prefix
//!
//! Passphrase secrets never live in the config file; see
//! [`crate::key_manager::PassphraseStore::from_env`].

use crate::encryptor::{DEFAULT_SCRYPT_LOG_N, MAX_SCRYPT_LOG_N};
use crate::metadata::DEFAULT_PREFIX;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "S3BU_CONFIG";
pub const ENV_STORAGE_DIR: &str = "S3BU_STORAGE_DIR";
pub const ENV_BUCKET: &str = "S3BU_BUCKET";
pub const ENV_METADATA_PREFIX: &str = "S3BU_METADATA_PREFIX";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage_dir: String,
    pub bucket: String,
    pub metadata_prefix: String,
    /// Paths of 32-byte recipient key files
    pub recipient_keys: Vec<String>,
    /// Passphrase ids in the order they were added; the last one encrypts
    pub passphrase_ids: Vec<String>,
    pub scrypt_log_n: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: "./storage".to_string(),
            bucket: "backup".to_string(),
            metadata_prefix: DEFAULT_PREFIX.to_string(),
            recipient_keys: Vec::new(),
            passphrase_ids: Vec::new(),
            scrypt_log_n: DEFAULT_SCRYPT_LOG_N,
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }

        if let Ok(bucket) = env::var(ENV_BUCKET) {
            debug!(bucket = %bucket, "overriding bucket from environment");
            self.bucket = bucket;
        }

        if let Ok(prefix) = env::var(ENV_METADATA_PREFIX) {
            debug!(prefix = %prefix, "overriding metadata_prefix from environment");
            self.metadata_prefix = prefix;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("storage_dir cannot be empty");
        }

        if self.bucket.trim().is_empty() {
            anyhow::bail!("bucket cannot be empty");
        }
        if self.bucket.contains('/') || self.bucket.contains("..") {
            anyhow::bail!("bucket '{}' must be a single path component", self.bucket);
        }

        if self.metadata_prefix.trim().is_empty() {
            anyhow::bail!("metadata_prefix cannot be empty");
        }

        if self.scrypt_log_n == 0 || self.scrypt_log_n > MAX_SCRYPT_LOG_N {
            anyhow::bail!(
                "scrypt_log_n must be between 1 and {}, got {}",
                MAX_SCRYPT_LOG_N,
                self.scrypt_log_n
            );
        }

        // Warn if a key path looks like it might be in a public directory
        for key_path in &self.recipient_keys {
            if let Some(parent) = Path::new(key_path).parent() {
                let parent_str = parent.to_string_lossy().to_lowercase();
                if parent_str.contains("public")
                    || parent_str.contains("www")
                    || parent_str.contains("htdocs")
                {
                    warn!(
                        path = %key_path,
                        "key file path appears to be in a public directory - this is a security risk"
                    );
                }
            }
        }

        if self.scrypt_log_n < 15 {
            warn!(log_n = self.scrypt_log_n, "scrypt work factor is low");
        }

        Ok(())
    }

    /// Create a new config with explicit storage location and bucket
    pub fn new(storage_dir: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            bucket: bucket.into(),
            ..Self::default()
        }
    }
}

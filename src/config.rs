//! Configuration for gated-press

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::entitlement::EntitlementConfig;
use crate::error::Result;
use crate::retry::RetryPolicy;

/// Thirty days
pub const DEFAULT_SUBSCRIPTION_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

/// Read tokens and sessions both default to one day
pub const DEFAULT_READ_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gated-press")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for blobs and the owner key
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Length of one subscription period in seconds
    #[serde(default = "default_subscription_period")]
    pub subscription_period_secs: u64,

    /// Lifetime of a pay-per-article read token in seconds
    #[serde(default = "default_read_token_ttl")]
    pub read_token_ttl_secs: u64,

    /// Lifetime of a reader decryption session in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Storage epochs a registered blob is paid for
    #[serde(default = "default_storage_epochs")]
    pub storage_epochs: u32,

    /// Register blobs as deletable by their owner
    #[serde(default)]
    pub deletable_blobs: bool,

    /// Retry policy for storage node calls (upload, fetch)
    #[serde(default = "default_storage_retry")]
    pub storage_retry: RetryPolicy,

    /// Polling policy for ledger objects that are not yet visible
    #[serde(default = "default_visibility_retry")]
    pub visibility_retry: RetryPolicy,

    /// Key servers that must release a share before decryption can proceed
    #[serde(default = "default_key_threshold")]
    pub key_threshold: usize,

    /// Attempts to gather key shares before giving up
    #[serde(default = "default_key_retry")]
    pub key_retry: RetryPolicy,
}

fn default_subscription_period() -> u64 {
    DEFAULT_SUBSCRIPTION_PERIOD_SECS
}

fn default_read_token_ttl() -> u64 {
    DEFAULT_READ_TOKEN_TTL_SECS
}

fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_storage_epochs() -> u32 {
    5
}

fn default_storage_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_delay_ms: 200,
        max_delay_ms: 5_000,
    }
}

fn default_visibility_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        initial_delay_ms: 250,
        max_delay_ms: 2_000,
    }
}

fn default_key_threshold() -> usize {
    2
}

fn default_key_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 500,
        max_delay_ms: 4_000,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            subscription_period_secs: default_subscription_period(),
            read_token_ttl_secs: default_read_token_ttl(),
            session_ttl_secs: default_session_ttl(),
            storage_epochs: default_storage_epochs(),
            deletable_blobs: false,
            storage_retry: default_storage_retry(),
            visibility_retry: default_visibility_retry(),
            key_threshold: default_key_threshold(),
            key_retry: default_key_retry(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would make entitlements meaningless
    pub fn validate(&self) -> Result<()> {
        use crate::error::PressError;

        if self.subscription_period_secs == 0 {
            return Err(PressError::Config("subscription_period_secs must be positive".into()));
        }
        if self.read_token_ttl_secs == 0 || self.read_token_ttl_secs > self.subscription_period_secs {
            return Err(PressError::Config(
                "read_token_ttl_secs must be positive and shorter than a subscription period".into(),
            ));
        }
        if self.session_ttl_secs == 0 {
            return Err(PressError::Config("session_ttl_secs must be positive".into()));
        }
        if self.key_threshold == 0 {
            return Err(PressError::Config("key_threshold must be at least 1".into()));
        }
        Ok(())
    }

    /// Entitlement periods derived from this config
    pub fn entitlement(&self) -> EntitlementConfig {
        EntitlementConfig {
            subscription_period_secs: self.subscription_period_secs,
            read_token_ttl_secs: self.read_token_ttl_secs,
        }
    }

    /// Get blobs directory
    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }

    /// Get owner key path
    pub fn owner_key_path(&self) -> PathBuf {
        self.storage_dir.join("owner.key")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.subscription_period_secs, 2_592_000);
        assert_eq!(config.read_token_ttl_secs, 86_400);
        assert_eq!(config.session_ttl_secs, 86_400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "session_ttl_secs = 3600\nkey_threshold = 3\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.session_ttl_secs, 3600);
        assert_eq!(config.key_threshold, 3);
        assert_eq!(config.subscription_period_secs, DEFAULT_SUBSCRIPTION_PERIOD_SECS);
        assert_eq!(config.storage_retry, default_storage_retry());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            storage_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.storage_dir, config.storage_dir);
        assert_eq!(loaded.visibility_retry, config.visibility_retry);
    }

    #[test]
    fn test_rejects_token_longer_than_period() {
        let config = Config {
            read_token_ttl_secs: DEFAULT_SUBSCRIPTION_PERIOD_SECS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

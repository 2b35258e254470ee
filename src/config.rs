use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NovaError, NovaResult};

/// Chrome's `storage.sync.QUOTA_BYTES`.
pub const SYNC_QUOTA_BYTES: usize = 102_400;
/// Chrome's `storage.sync.QUOTA_BYTES_PER_ITEM`.
pub const SYNC_QUOTA_BYTES_PER_ITEM: usize = 8_192;
/// Chrome's `storage.sync.MAX_ITEMS`.
pub const SYNC_MAX_ITEMS: usize = 512;
/// Chrome's `storage.session.QUOTA_BYTES`.
pub const SESSION_QUOTA_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a request stays open after a listener asked to keep the
    /// channel open and nobody has responded yet.
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where the file provider keeps persisted areas. `None` means the
    /// platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Total byte limit for `storage.local`. `None` is unbounded.
    pub local_quota_bytes: Option<usize>,
    /// Total byte limit for `storage.session`. `None` is unbounded.
    pub session_quota_bytes: Option<usize>,
    pub sync_quota_bytes: usize,
    pub sync_quota_bytes_per_item: usize,
    pub sync_max_items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    pub level: String,
    pub ansi: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl RouterConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            local_quota_bytes: None,
            session_quota_bytes: Some(SESSION_QUOTA_BYTES),
            sync_quota_bytes: SYNC_QUOTA_BYTES,
            sync_quota_bytes_per_item: SYNC_QUOTA_BYTES_PER_ITEM,
            sync_max_items: SYNC_MAX_ITEMS,
        }
    }
}

impl StorageConfig {
    /// Directory used by the JSON file provider.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nova")
                .join("webext")
                .join("storage")
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

impl Config {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                // Fallback: ~ is not expanded by PathBuf, so use dirs::home_dir
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("nova")
            .join("webext.toml")
    }

    /// Load config from the default path, or return defaults if it is
    /// missing or unreadable.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to load config: {}", e);
                Self::default()
            }
        }
    }

    /// Load and validate config from a specific file.
    pub fn load_from(path: &Path) -> NovaResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate();
        Ok(config)
    }

    /// Validate and clamp config values to acceptable ranges
    pub fn validate(&mut self) {
        // 10ms - 1h
        self.router.response_timeout_ms = self.router.response_timeout_ms.clamp(10, 3_600_000);

        self.storage.sync_quota_bytes = self.storage.sync_quota_bytes.max(1);
        self.storage.sync_quota_bytes_per_item = self
            .storage
            .sync_quota_bytes_per_item
            .clamp(1, self.storage.sync_quota_bytes);
        self.storage.sync_max_items = self.storage.sync_max_items.max(1);

        let level = self.logging.level.trim().to_ascii_lowercase();
        self.logging.level = if LOG_LEVELS.contains(&level.as_str()) {
            level
        } else {
            tracing::warn!(level = %self.logging.level, "unknown log level, using info");
            "info".to_string()
        };
    }

    /// Save config to the default path
    pub fn save(&self) -> NovaResult<()> {
        self.save_to(&Self::config_path())
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> NovaResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_chrome_quotas() {
        let config = Config::default();
        assert_eq!(config.storage.sync_quota_bytes, 102_400);
        assert_eq!(config.storage.sync_quota_bytes_per_item, 8_192);
        assert_eq!(config.storage.sync_max_items, 512);
        assert_eq!(config.storage.session_quota_bytes, Some(10_485_760));
        assert_eq!(config.storage.local_quota_bytes, None);
        assert_eq!(config.router.response_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("webext.toml");
        fs::write(
            &path,
            r#"
[router]
response_timeout_ms = 250

[storage]
local_quota_bytes = 4096
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.router.response_timeout_ms, 250);
        assert_eq!(config.storage.local_quota_bytes, Some(4096));
        assert_eq!(config.storage.sync_max_items, SYNC_MAX_ITEMS);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = Config::default();
        config.router.response_timeout_ms = 0;
        config.storage.sync_quota_bytes = 100;
        config.storage.sync_quota_bytes_per_item = 1000;
        config.logging.level = "LOUD".to_string();
        config.validate();

        assert_eq!(config.router.response_timeout_ms, 10);
        assert_eq!(config.storage.sync_quota_bytes_per_item, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("webext.toml");

        let mut config = Config::default();
        config.storage.data_dir = Some(dir.path().join("data"));
        config.logging.level = "debug".to_string();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_from_rejects_bad_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("webext.toml");
        fs::write(&path, "router = 3").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(NovaError::TomlParse(_))
        ));
    }
}

//! TOML-based configuration system for Draftline.
//!
//! Sensitive values (API tokens) are stored as `_env` fields that reference
//! environment variable names. The actual secrets are resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Where proposal repositories and the database live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Tracing output settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External collaborators notified after publish and revert.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `draftline.db` and `repos/<id>.git`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".draftline")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("draftline.db")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Collaborator endpoints and the delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Base URL of the search index (e.g. `http://localhost:9200`).
    #[serde(default)]
    pub search_index_url: Option<String>,

    /// Index that proposal documents are written to.
    #[serde(default = "default_index_name")]
    pub search_index_name: String,

    /// Endpoint of the content-analysis service.
    #[serde(default)]
    pub analysis_url: Option<String>,

    /// Environment variable holding the analysis service bearer token.
    #[serde(default)]
    pub analysis_token_env: Option<String>,

    /// Attempts per delivery, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts; doubled after each failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Resolved analysis token.
    #[serde(skip)]
    pub analysis_token: Option<String>,
}

fn default_index_name() -> String {
    "proposals".into()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            search_index_url: None,
            search_index_name: default_index_name(),
            analysis_url: None,
            analysis_token_env: None,
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            analysis_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning and leaves the resolved field unset;
    /// deliveries to that collaborator then go out unauthenticated.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.notifications.analysis_token_env {
            self.notifications.analysis_token =
                resolve_optional_env(env_name, "notifications.analysis_token_env");
        }
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.data_dir".into(),
                detail: "data directory must not be empty".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }

        let n = &self.notifications;
        for (field, url) in [
            ("notifications.search_index_url", &n.search_index_url),
            ("notifications.analysis_url", &n.analysis_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidValue {
                        field: field.into(),
                        detail: format!("'{url}' is not an http(s) URL"),
                    });
                }
            }
        }
        if n.search_index_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "notifications.search_index_name".into(),
                detail: "index name must not be empty".into(),
            });
        }
        if n.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notifications.max_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if n.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notifications.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[storage]
data_dir = "/tmp/draftline"

[logging]
level = "debug"
json = true

[notifications]
search_index_url = "http://localhost:9200"
search_index_name = "civic-proposals"
analysis_url = "https://analysis.example.org/v1/score"
analysis_token_env = "DRAFTLINE_TEST_ANALYSIS_TOKEN"
max_attempts = 5
retry_backoff_ms = 100
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/draftline"));
        assert_eq!(
            config.storage.database_path(),
            PathBuf::from("/tmp/draftline/draftline.db")
        );
        assert!(config.logging.json);
        assert_eq!(config.notifications.search_index_name, "civic-proposals");
        assert_eq!(config.notifications.max_attempts, 5);
        assert_eq!(config.notifications.timeout_secs, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draftline.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_and_resolve_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draftline.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"/srv/draftline\"\n").unwrap();
        let config = AppConfig::load_and_resolve(&path).unwrap();
        assert_eq!(config.storage.repos_dir(), PathBuf::from("/srv/draftline/repos"));

        std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(matches!(
            AppConfig::load_and_resolve(&path),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "logging.level"
        ));
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/draftline.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from(".draftline"));
        assert_eq!(config.logging.level, "info");
        assert!(config.notifications.search_index_url.is_none());
        assert_eq!(config.notifications.max_attempts, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "logging.level"
        ));

        let mut config = AppConfig::default();
        config.notifications.analysis_url = Some("ftp://nope".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "notifications.analysis_url"
        ));

        let mut config = AppConfig::default();
        config.notifications.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("DRAFTLINE_TEST_ANALYSIS_TOKEN", "tok_123");
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.notifications.analysis_token.as_deref(), Some("tok_123"));
        std::env::remove_var("DRAFTLINE_TEST_ANALYSIS_TOKEN");
    }
}

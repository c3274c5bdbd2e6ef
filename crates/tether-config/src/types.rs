//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [api]          # API base URL and endpoint names
//! [session]      # idle timeout, refresh lookahead, default session horizon
//! [activity]     # heartbeat and touch throttling
//! [retry]        # bounded retry with exponential backoff
//! [cache]        # response cache TTL
//! [storage]      # durable session storage
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Environment variable overriding `[api] base_url`.
pub const API_BASE_ENV: &str = "TETHER_API_BASE";

/// Environment variable overriding `[storage] dir`.
pub const STORAGE_DIR_ENV: &str = "TETHER_STORAGE_DIR";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged. Use the accessor methods to get a
/// section with defaults applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// API connection settings.
    pub api: Option<ApiConfig>,

    /// Session timing.
    pub session: Option<SessionConfig>,

    /// User activity tracking.
    pub activity: Option<ActivityConfig>,

    /// Request retry policy.
    pub retry: Option<RetryConfig>,

    /// Response cache.
    pub cache: Option<CacheConfig>,

    /// Durable storage.
    pub storage: Option<StorageConfig>,
}

impl TetherConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A config with every section filled in with defaults, for `config init`.
    pub fn default_template() -> Self {
        Self {
            api: Some(ApiConfig::default()),
            session: Some(SessionConfig::default()),
            activity: Some(ActivityConfig::default()),
            retry: Some(RetryConfig::default()),
            cache: Some(CacheConfig::default()),
            storage: Some(StorageConfig::default()),
        }
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Merging is per section: a section present in `other` replaces the
    /// whole section here.
    pub fn merge(&mut self, other: TetherConfig) {
        if other.api.is_some() {
            self.api = other.api;
        }

        if other.session.is_some() {
            self.session = other.session;
        }

        if other.activity.is_some() {
            self.activity = other.activity;
        }

        if other.retry.is_some() {
            self.retry = other.retry;
        }

        if other.cache.is_some() {
            self.cache = other.cache;
        }

        if other.storage.is_some() {
            self.storage = other.storage;
        }
    }

    /// API settings with defaults applied.
    pub fn api(&self) -> ApiConfig {
        self.api.clone().unwrap_or_default()
    }

    /// Session timing with defaults applied.
    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    /// Activity settings with defaults applied.
    pub fn activity(&self) -> ActivityConfig {
        self.activity.clone().unwrap_or_default()
    }

    /// Retry settings with defaults applied.
    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// Cache settings with defaults applied.
    pub fn cache(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }

    /// Storage settings with defaults applied.
    pub fn storage(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let session = self.session();
        let activity = self.activity();

        if session.default_session_secs == 0 {
            return Err(invalid(
                "session.default_session_secs",
                "must be greater than zero",
            ));
        }
        if session.refresh_lookahead_secs >= session.default_session_secs {
            return Err(invalid(
                "session.refresh_lookahead_secs",
                "must be shorter than session.default_session_secs",
            ));
        }
        if session.idle_timeout_secs == 0 {
            return Err(invalid("session.idle_timeout_secs", "must be greater than zero"));
        }
        if activity.heartbeat_secs == 0 {
            return Err(invalid("activity.heartbeat_secs", "must be greater than zero"));
        }
        if activity.touch_throttle_secs >= session.idle_timeout_secs {
            return Err(invalid(
                "activity.touch_throttle_secs",
                "must be shorter than session.idle_timeout_secs",
            ));
        }
        let retry = self.retry();
        if retry.max_retries > 0 {
            if retry.base_delay_ms == 0 {
                return Err(invalid("retry.base_delay_ms", "must be greater than zero"));
            }
            // Backoff has to keep growing up to the last retry.
            let last = 2u64
                .checked_pow(retry.max_retries - 1)
                .and_then(|factor| retry.base_delay_ms.checked_mul(factor));
            if last.is_none_or(|last| last > retry.max_delay_ms) {
                return Err(invalid(
                    "retry.max_delay_ms",
                    "must be at least base_delay_ms * 2^(max_retries - 1)",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API
// ─────────────────────────────────────────────────────────────────────────────

/// API connection settings.
///
/// ```toml
/// [api]
/// base_url = "https://app.example.com/api"
/// runtime_config_url = "https://app.example.com/runtime-config.json"
/// request_timeout_secs = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL prepended to every endpoint. Also the fallback when the
    /// runtime config document cannot be fetched.
    pub base_url: String,

    /// Optional document (`{ "apiBaseUrl": "..." }`) fetched once at startup.
    pub runtime_config_url: Option<String>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Endpoint used to log in.
    pub login_endpoint: String,

    /// Endpoint used to rotate the token.
    pub refresh_endpoint: String,

    /// Endpoint notified on user-initiated logout.
    pub logout_endpoint: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            runtime_config_url: None,
            request_timeout_secs: 30,
            login_endpoint: "/login".to_string(),
            refresh_endpoint: "/refresh-token".to_string(),
            logout_endpoint: "/logout".to_string(),
        }
    }
}

impl ApiConfig {
    /// Base URL, checking `TETHER_API_BASE` first.
    pub fn effective_base_url(&self) -> String {
        match std::env::var(API_BASE_ENV) {
            Ok(url) if !url.is_empty() => url,
            _ => self.base_url.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session / Activity
// ─────────────────────────────────────────────────────────────────────────────

/// Session timing.
///
/// ```toml
/// [session]
/// idle_timeout_secs = 7200
/// default_session_secs = 3600
/// refresh_lookahead_secs = 300
/// refresh_retry_secs = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity after which the session is terminated.
    pub idle_timeout_secs: u64,
    /// Session lifetime used when the server's expiry is missing or unusable.
    pub default_session_secs: u64,
    /// How long before expiry the proactive refresh fires.
    pub refresh_lookahead_secs: u64,
    /// Delay before retrying a proactive refresh that failed transiently.
    pub refresh_retry_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 2 * 60 * 60,
            default_session_secs: 60 * 60,
            refresh_lookahead_secs: 5 * 60,
            refresh_retry_secs: 30,
        }
    }
}

/// Activity tracking.
///
/// ```toml
/// [activity]
/// heartbeat_secs = 60
/// touch_throttle_secs = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Heartbeat interval while the application is visible.
    pub heartbeat_secs: u64,
    /// Minimum spacing between durable activity writes.
    pub touch_throttle_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 60,
            touch_throttle_secs: 5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry / Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded retry with exponential backoff.
///
/// ```toml
/// [retry]
/// max_retries = 2
/// base_delay_ms = 500
/// max_delay_ms = 8000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

/// Response cache.
///
/// ```toml
/// [cache]
/// enabled = true
/// ttl_secs = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether idempotent reads are cached at all.
    pub enabled: bool,
    /// Lifetime of a cached response.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 30,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

/// Durable storage for the session record and activity timestamp.
///
/// ```toml
/// [storage]
/// dir = "~/.local/share/tether"
/// watch = true
/// ```
///
/// # Environment Variables
///
/// - `TETHER_STORAGE_DIR` - Override the storage directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage directory. Default: platform data dir + `tether`.
    pub dir: Option<PathBuf>,
    /// Watch the directory for writes from other processes.
    pub watch: bool,
    /// Debounce for filesystem notifications, in milliseconds.
    pub debounce_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            watch: true,
            debounce_ms: 200,
        }
    }
}

impl StorageConfig {
    /// Get the effective storage directory.
    ///
    /// Resolution order:
    /// 1. `TETHER_STORAGE_DIR` environment variable
    /// 2. Configured `dir` value
    /// 3. Platform data dir (`~/.local/share/tether` on Linux)
    pub fn effective_dir(&self) -> PathBuf {
        if let Ok(env_dir) = std::env::var(STORAGE_DIR_ENV)
            && !env_dir.is_empty()
        {
            return PathBuf::from(env_dir);
        }

        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tether")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = TetherConfig::from_toml("").unwrap();
        assert!(config.api.is_none());
        assert_eq!(config.retry().max_retries, 2);
        assert_eq!(config.session().refresh_lookahead_secs, 300);
        assert_eq!(config.api().refresh_endpoint, "/refresh-token");
        assert!(config.cache().enabled);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let config = TetherConfig::from_toml(
            r#"
            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        let retry = config.retry();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.base_delay_ms, 500);
    }

    #[test]
    fn test_merge_replaces_sections() {
        let mut base = TetherConfig::from_toml(
            r#"
            [api]
            base_url = "https://one.example/api"

            [cache]
            ttl_secs = 10
            "#,
        )
        .unwrap();

        let overlay = TetherConfig::from_toml(
            r#"
            [api]
            base_url = "https://two.example/api"
            "#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.api().base_url, "https://two.example/api");
        assert_eq!(base.cache().ttl_secs, 10);
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = TetherConfig::new();
        config.session = Some(SessionConfig {
            idle_timeout_secs: 600,
            ..Default::default()
        });

        let text = config.to_toml().unwrap();
        let parsed = TetherConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.session().idle_timeout_secs, 600);
    }

    #[test]
    fn test_validate_rejects_lookahead_past_session() {
        let config = TetherConfig {
            session: Some(SessionConfig {
                default_session_secs: 60,
                refresh_lookahead_secs: 120,
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refresh_lookahead_secs"));
    }

    #[test]
    fn test_default_template_roundtrips() {
        let toml = TetherConfig::default_template().to_toml().unwrap();
        assert!(toml.contains("[session]"));
        assert!(toml.contains("refresh_endpoint"));

        let parsed = TetherConfig::from_toml(&toml).unwrap();
        assert!(parsed.cache.is_some());
        assert_eq!(parsed.session().idle_timeout_secs, 7200);
    }

    #[test]
    fn test_validate_rejects_flat_backoff() {
        let config = TetherConfig {
            retry: Some(RetryConfig {
                max_retries: 6,
                base_delay_ms: 500,
                max_delay_ms: 8_000,
            }),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.max_delay_ms"));

        let config = TetherConfig {
            retry: Some(RetryConfig {
                max_retries: 5,
                base_delay_ms: 500,
                max_delay_ms: 8_000,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_defaults_ok() {
        assert!(TetherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_storage_dir_configured() {
        let storage = StorageConfig {
            dir: Some(PathBuf::from("/tmp/tether-test")),
            ..Default::default()
        };
        if std::env::var(STORAGE_DIR_ENV).is_err() {
            assert_eq!(storage.effective_dir(), PathBuf::from("/tmp/tether-test"));
        }
    }
}

//! Runtime settings for the session components.

use std::time::Duration;

use tether_config::TetherConfig;

use crate::retry::RetryPolicy;

/// Timing and policy knobs shared by the session components.
///
/// Built from a [`TetherConfig`] (seconds/millis in TOML) or tuned directly
/// with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base URL prepended to every endpoint.
    pub api_base: String,
    /// Endpoint used to log in.
    pub login_endpoint: String,
    /// Endpoint used to rotate the token.
    pub refresh_endpoint: String,
    /// Endpoint notified on user-initiated logout.
    pub logout_endpoint: String,
    /// Per-request timeout.
    pub request_timeout: Duration,

    /// Inactivity after which the session is terminated.
    pub idle_timeout: Duration,
    /// Lifetime used when the server's expiry is missing or unusable.
    pub default_session: Duration,
    /// How long before expiry the proactive refresh fires.
    pub refresh_lookahead: Duration,
    /// Delay before retrying a proactive refresh that failed transiently.
    pub refresh_retry: Duration,

    /// Heartbeat interval while visible.
    pub heartbeat_interval: Duration,
    /// Minimum spacing between durable activity writes.
    pub touch_throttle: Duration,

    /// Bounded retry policy for every request.
    pub retry: RetryPolicy,

    /// Whether idempotent reads are cached.
    pub cache_enabled: bool,
    /// Lifetime of a cached response.
    pub cache_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&TetherConfig::default())
    }
}

impl From<&TetherConfig> for SessionSettings {
    fn from(config: &TetherConfig) -> Self {
        let api = config.api();
        let session = config.session();
        let activity = config.activity();
        let retry = config.retry();
        let cache = config.cache();

        Self {
            api_base: api.effective_base_url(),
            login_endpoint: api.login_endpoint,
            refresh_endpoint: api.refresh_endpoint,
            logout_endpoint: api.logout_endpoint,
            request_timeout: Duration::from_secs(api.request_timeout_secs),
            idle_timeout: Duration::from_secs(session.idle_timeout_secs),
            default_session: Duration::from_secs(session.default_session_secs),
            refresh_lookahead: Duration::from_secs(session.refresh_lookahead_secs),
            refresh_retry: Duration::from_secs(session.refresh_retry_secs),
            heartbeat_interval: Duration::from_secs(activity.heartbeat_secs),
            touch_throttle: Duration::from_secs(activity.touch_throttle_secs),
            retry: RetryPolicy {
                max_retries: retry.max_retries,
                base_delay: Duration::from_millis(retry.base_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
            },
            cache_enabled: cache.enabled,
            cache_ttl: Duration::from_secs(cache.ttl_secs),
        }
    }
}

impl SessionSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API base URL.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the default session lifetime.
    pub fn with_default_session(mut self, lifetime: Duration) -> Self {
        self.default_session = lifetime;
        self
    }

    /// Set the proactive refresh lookahead.
    pub fn with_refresh_lookahead(mut self, lookahead: Duration) -> Self {
        self.refresh_lookahead = lookahead;
        self
    }

    /// Set the retry delay after a transient proactive refresh failure.
    pub fn with_refresh_retry(mut self, delay: Duration) -> Self {
        self.refresh_retry = delay;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the activity write throttle.
    pub fn with_touch_throttle(mut self, throttle: Duration) -> Self {
        self.touch_throttle = throttle;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Disable response caching entirely.
    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    /// Whether an endpoint is one of the auth endpoints, which never
    /// trigger a refresh on 401.
    pub fn is_auth_endpoint(&self, endpoint: &str) -> bool {
        let path = endpoint.split(['?', '#']).next().unwrap_or(endpoint);
        let path = path.trim_end_matches('/');
        [&self.login_endpoint, &self.refresh_endpoint]
            .iter()
            .any(|auth| path == auth.trim_end_matches('/'))
    }
}

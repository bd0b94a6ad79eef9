//! Proxy Configuration Settings
//!
//! Configuration types for the LTP proxy, loaded from environment variables.
//! Every option has a default; only enabling the primary feed requires a
//! token or a fixed feed URL.

use std::time::Duration;

use crate::application::ports::FeedMode;
use crate::application::services::registry::RegistryConfig;
use crate::application::services::retry::RetryConfig;

/// Bearer token for the primary feed's authorisation endpoint.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the raw token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AccessToken").field(&"[REDACTED]").finish()
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Port serving `/ws/ltp`, health and metrics.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8090 }
    }
}

/// Primary push feed settings.
#[derive(Debug, Clone)]
pub struct PrimaryFeedSettings {
    /// Whether to run the primary feed at all.
    pub enabled: bool,
    /// Fixed socket URL; skips authorisation when set.
    pub feed_url: Option<String>,
    /// Authorisation endpoint returning a one-time socket URL.
    pub authorize_url: String,
    /// Bearer token for authorisation.
    pub access_token: Option<AccessToken>,
    /// Subscription mode.
    pub mode: FeedMode,
    /// Reconnect attempts after a disconnect before degrading.
    pub reconnect_attempts: u32,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Silence before the connection is treated as dead.
    pub idle_timeout: Duration,
}

impl Default for PrimaryFeedSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            feed_url: None,
            authorize_url: "https://api.upstox.com/v3/feed/market-data-feed/authorize".to_string(),
            access_token: None,
            mode: FeedMode::Ltpc,
            reconnect_attempts: 3,
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Fallback source and poller settings.
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    /// Secondary source base URL.
    pub base_url: String,
    /// Per-lookup timeout.
    pub timeout: Duration,
    /// Delay between poll cycles.
    pub poll_interval: Duration,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            base_url: "https://groww.in".to_string(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Poller supervision settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Interval between liveness checks.
    pub health_check_interval: Duration,
    /// Wait before restarting a stopped poller.
    pub restart_delay: Duration,
    /// Consecutive restarts before the feed is marked down.
    pub max_restart_attempts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            restart_delay: Duration::from_secs(3),
            max_restart_attempts: 5,
        }
    }
}

/// Subscription registry settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Attempts per upstream subscribe/unsubscribe.
    pub subscribe_attempts: u32,
    /// Delay between those attempts.
    pub subscribe_retry_delay: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            subscribe_attempts: 3,
            subscribe_retry_delay: Duration::from_millis(2000),
        }
    }
}

impl RegistrySettings {
    /// Registry tuning derived from these settings.
    #[must_use]
    pub const fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            forward_retry: RetryConfig::fixed(self.subscribe_retry_delay, self.subscribe_attempts),
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Primary feed settings.
    pub primary: PrimaryFeedSettings,
    /// Fallback settings.
    pub fallback: FallbackSettings,
    /// Supervisor settings.
    pub supervisor: SupervisorSettings,
    /// Registry settings.
    pub registry: RegistrySettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the primary feed is enabled without a token or
    /// feed URL, or the token is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`ProxyConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let server = ServerSettings {
            http_port: env.parse("LTP_PROXY_HTTP_PORT", ServerSettings::default().http_port),
        };

        let primary_defaults = PrimaryFeedSettings::default();
        let access_token = match env.string("UPSTOX_ACCESS_TOKEN") {
            Some(token) if token.is_empty() => {
                return Err(ConfigError::EmptyValue("UPSTOX_ACCESS_TOKEN".to_string()));
            }
            Some(token) => Some(AccessToken::new(token)),
            None => None,
        };
        let primary = PrimaryFeedSettings {
            enabled: env.flag("LTP_PROXY_PRIMARY_ENABLED", primary_defaults.enabled),
            feed_url: env.string("UPSTOX_FEED_URL").filter(|u| !u.is_empty()),
            authorize_url: env
                .string("UPSTOX_AUTHORIZE_URL")
                .unwrap_or(primary_defaults.authorize_url),
            access_token,
            mode: env
                .string("LTP_PROXY_FEED_MODE")
                .map_or(primary_defaults.mode, |m| FeedMode::from_str_case_insensitive(&m)),
            reconnect_attempts: env.parse(
                "LTP_PROXY_RECONNECT_ATTEMPTS",
                primary_defaults.reconnect_attempts,
            ),
            reconnect_delay_initial: env.millis(
                "LTP_PROXY_RECONNECT_DELAY_INITIAL_MS",
                primary_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.secs(
                "LTP_PROXY_RECONNECT_DELAY_MAX_SECS",
                primary_defaults.reconnect_delay_max,
            ),
            idle_timeout: env.secs(
                "LTP_PROXY_PRIMARY_IDLE_TIMEOUT_SECS",
                primary_defaults.idle_timeout,
            ),
        };

        if primary.enabled && primary.feed_url.is_none() && primary.access_token.is_none() {
            return Err(ConfigError::MissingEnvVar("UPSTOX_ACCESS_TOKEN".to_string()));
        }

        let fallback_defaults = FallbackSettings::default();
        let fallback = FallbackSettings {
            base_url: env
                .string("GROWW_BASE_URL")
                .unwrap_or(fallback_defaults.base_url),
            timeout: env.secs("GROWW_TIMEOUT_SECS", fallback_defaults.timeout),
            poll_interval: env.millis(
                "LTP_PROXY_POLL_INTERVAL_MS",
                fallback_defaults.poll_interval,
            ),
        };

        let supervisor_defaults = SupervisorSettings::default();
        let supervisor = SupervisorSettings {
            health_check_interval: env.secs(
                "LTP_PROXY_HEALTH_CHECK_INTERVAL_SECS",
                supervisor_defaults.health_check_interval,
            ),
            restart_delay: env.secs(
                "LTP_PROXY_RESTART_DELAY_SECS",
                supervisor_defaults.restart_delay,
            ),
            max_restart_attempts: env.parse(
                "LTP_PROXY_MAX_RESTART_ATTEMPTS",
                supervisor_defaults.max_restart_attempts,
            ),
        };

        let registry_defaults = RegistrySettings::default();
        let registry = RegistrySettings {
            subscribe_attempts: env.parse(
                "LTP_PROXY_SUBSCRIBE_ATTEMPTS",
                registry_defaults.subscribe_attempts,
            ),
            subscribe_retry_delay: env.millis(
                "LTP_PROXY_SUBSCRIBE_RETRY_DELAY_MS",
                registry_defaults.subscribe_retry_delay,
            ),
        };

        Ok(Self {
            server,
            primary,
            fallback,
            supervisor,
            registry,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

/// Tolerant typed reads over a key lookup; unparsable values fall back.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key).map_or(default, |v| {
            matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

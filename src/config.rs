use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{PacekeeperError, Result};
use crate::session::GraceReusePolicy;
use crate::utils::{get_env_parsed, get_env_with_prefix};

/// Minimum accepted length of the server secret in bytes.
pub const MIN_SECRET_KEY_LENGTH: usize = 32;

/// Upper bound for every TTL, timeout and interval (10 years).
pub const MAX_DURATION_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main configuration for the security engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Tunables for rotation, ephemeral state and MFA.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Server-only key for the refresh-token HMAC. Rotating it orphans every
    /// outstanding tombstone.
    #[serde(skip)]
    pub secret_key: SecretString,

    /// Lifetime of a refresh token (and its session) after each rotation.
    #[serde(default = "default_refresh_token_ttl_seconds")]
    pub refresh_token_ttl_seconds: u64,

    /// How long a superseded refresh token is tolerated as a benign retry.
    #[serde(default = "default_reuse_grace_seconds")]
    pub reuse_grace_seconds: u64,

    /// What a refresh inside the grace window does.
    #[serde(default)]
    pub grace_policy: GraceReusePolicy,

    #[serde(default = "default_oauth_state_ttl_seconds")]
    pub oauth_state_ttl_seconds: u64,

    #[serde(default = "default_link_token_ttl_seconds")]
    pub link_token_ttl_seconds: u64,

    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,

    /// Sessions without activity for this long are rejected and swept.
    #[serde(default)]
    pub session_idle_timeout_seconds: Option<u64>,

    /// Sessions older than this are rejected regardless of activity.
    #[serde(default)]
    pub session_absolute_timeout_seconds: Option<u64>,

    /// Pending MFA logins and idle attempt records older than this are swept.
    #[serde(default = "default_pending_login_max_age_seconds")]
    pub pending_login_max_age_seconds: u64,

    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Mark refresh cookies `Secure`.
    #[serde(default = "default_secure_cookies")]
    pub secure_cookies: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: SecretString::default(),
            refresh_token_ttl_seconds: default_refresh_token_ttl_seconds(),
            reuse_grace_seconds: default_reuse_grace_seconds(),
            grace_policy: GraceReusePolicy::default(),
            oauth_state_ttl_seconds: default_oauth_state_ttl_seconds(),
            link_token_ttl_seconds: default_link_token_ttl_seconds(),
            backup_code_count: default_backup_code_count(),
            session_idle_timeout_seconds: None,
            session_absolute_timeout_seconds: None,
            pending_login_max_age_seconds: default_pending_login_max_age_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            secure_cookies: default_secure_cookies(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_refresh_token_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_reuse_grace_seconds() -> u64 {
    60
}

fn default_oauth_state_ttl_seconds() -> u64 {
    10 * 60
}

fn default_link_token_ttl_seconds() -> u64 {
    60
}

fn default_backup_code_count() -> usize {
    10
}

fn default_pending_login_max_age_seconds() -> u64 {
    15 * 60
}

fn default_sweep_interval_seconds() -> u64 {
    5 * 60
}

fn default_secure_cookies() -> bool {
    true
}

// Clamped so a config that skipped `build()` cannot overflow chrono.
fn seconds(value: u64) -> Duration {
    let secs = i64::try_from(value.min(MAX_DURATION_SECONDS)).unwrap_or(i64::MAX);
    Duration::try_seconds(secs).unwrap_or(Duration::MAX)
}

impl SecurityConfig {
    /// Load from `PACEKEEPER_*` environment variables, keeping defaults for
    /// anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secret) = get_env_with_prefix("SECRET_KEY") {
            config.secret_key = SecretString::from(secret);
        }
        if let Some(ttl) = get_env_parsed("REFRESH_TOKEN_TTL_SECONDS") {
            config.refresh_token_ttl_seconds = ttl;
        }
        if let Some(grace) = get_env_parsed("REUSE_GRACE_SECONDS") {
            config.reuse_grace_seconds = grace;
        }
        if let Some(policy) = get_env_parsed("GRACE_POLICY") {
            config.grace_policy = policy;
        }
        if let Some(ttl) = get_env_parsed("OAUTH_STATE_TTL_SECONDS") {
            config.oauth_state_ttl_seconds = ttl;
        }
        if let Some(ttl) = get_env_parsed("LINK_TOKEN_TTL_SECONDS") {
            config.link_token_ttl_seconds = ttl;
        }
        if let Some(count) = get_env_parsed("BACKUP_CODE_COUNT") {
            config.backup_code_count = count;
        }
        if let Some(idle) = get_env_parsed("SESSION_IDLE_TIMEOUT_SECONDS") {
            config.session_idle_timeout_seconds = Some(idle);
        }
        if let Some(absolute) = get_env_parsed("SESSION_ABSOLUTE_TIMEOUT_SECONDS") {
            config.session_absolute_timeout_seconds = Some(absolute);
        }
        if let Some(max_age) = get_env_parsed("PENDING_LOGIN_MAX_AGE_SECONDS") {
            config.pending_login_max_age_seconds = max_age;
        }
        if let Some(interval) = get_env_parsed("SWEEP_INTERVAL_SECONDS") {
            config.sweep_interval_seconds = interval;
        }
        if let Some(secure) = get_env_parsed("SECURE_COOKIES") {
            config.secure_cookies = secure;
        }

        config
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        seconds(self.refresh_token_ttl_seconds)
    }

    pub fn reuse_grace(&self) -> Duration {
        seconds(self.reuse_grace_seconds)
    }

    pub fn oauth_state_ttl(&self) -> Duration {
        seconds(self.oauth_state_ttl_seconds)
    }

    pub fn link_token_ttl(&self) -> Duration {
        seconds(self.link_token_ttl_seconds)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_seconds.map(seconds)
    }

    pub fn session_absolute_timeout(&self) -> Option<Duration> {
        self.session_absolute_timeout_seconds.map(seconds)
    }

    pub fn pending_login_max_age(&self) -> Duration {
        seconds(self.pending_login_max_age_seconds)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.config.security = security;
        self
    }

    pub fn with_secret_key(mut self, secret: impl Into<String>) -> Self {
        self.config.security.secret_key = SecretString::from(secret.into());
        self
    }

    pub fn with_reuse_grace_seconds(mut self, seconds: u64) -> Self {
        self.config.security.reuse_grace_seconds = seconds;
        self
    }

    pub fn with_grace_policy(mut self, policy: GraceReusePolicy) -> Self {
        self.config.security.grace_policy = policy;
        self
    }

    pub fn with_session_idle_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.security.session_idle_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_session_absolute_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.security.session_absolute_timeout_seconds = Some(seconds);
        self
    }

    /// Load configuration from environment variables with PACEKEEPER_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self.config.security = SecurityConfig::from_env();

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns [`PacekeeperError::Config`] when:
    /// - the log level is unknown
    /// - the secret key is missing or shorter than 32 bytes
    /// - any TTL, the grace period or the sweep interval is zero
    /// - any TTL, timeout or interval exceeds [`MAX_DURATION_SECONDS`]
    /// - the backup code count is outside 1..=100
    pub fn build(self) -> Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(PacekeeperError::config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        let security = &self.config.security;

        if security.secret_key.expose_secret().is_empty() {
            return Err(PacekeeperError::config("SECRET_KEY must be set"));
        }
        if security.secret_key.expose_secret().len() < MIN_SECRET_KEY_LENGTH {
            return Err(PacekeeperError::config(format!(
                "SECRET_KEY must be at least {} bytes",
                MIN_SECRET_KEY_LENGTH
            )));
        }

        let required_positive = [
            ("refresh_token_ttl_seconds", security.refresh_token_ttl_seconds),
            ("reuse_grace_seconds", security.reuse_grace_seconds),
            ("oauth_state_ttl_seconds", security.oauth_state_ttl_seconds),
            ("link_token_ttl_seconds", security.link_token_ttl_seconds),
            ("pending_login_max_age_seconds", security.pending_login_max_age_seconds),
            ("sweep_interval_seconds", security.sweep_interval_seconds),
        ];
        for (name, value) in required_positive {
            if value == 0 {
                return Err(PacekeeperError::config(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        let optional = [
            ("session_idle_timeout_seconds", security.session_idle_timeout_seconds),
            ("session_absolute_timeout_seconds", security.session_absolute_timeout_seconds),
        ];
        let bounded = required_positive
            .iter()
            .copied()
            .chain(optional.iter().filter_map(|(name, v)| v.map(|v| (*name, v))));
        for (name, value) in bounded {
            if value > MAX_DURATION_SECONDS {
                return Err(PacekeeperError::config(format!(
                    "{} must be at most {} seconds",
                    name, MAX_DURATION_SECONDS
                )));
            }
        }

        if security.link_token_ttl_seconds > security.oauth_state_ttl_seconds {
            tracing::warn!(
                link_token_ttl = security.link_token_ttl_seconds,
                oauth_state_ttl = security.oauth_state_ttl_seconds,
                "Link tokens outlive OAuth state; they only need to survive one redirect"
            );
        }

        if !(1..=100).contains(&security.backup_code_count) {
            return Err(PacekeeperError::config(
                "backup_code_count must be between 1 and 100",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

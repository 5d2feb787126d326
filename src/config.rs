//! Daemon configuration.
//!
//! Loaded from a YAML file at startup. Every field has a documented default,
//! so a missing file yields a fully usable configuration. Limits and
//! thresholds are validated once at startup; invalid values fail fast rather
//! than degrade silently at runtime.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub coalesce: CoalesceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Upstream providers by name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the default configuration. The result is
    /// validated; invalid limits or thresholds are startup errors.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);
        let config: Config = match fs::read_to_string(path) {
            Ok(contents) => serde_saphyr::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(name: &str, value: usize) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
            Ok(())
        }

        nonzero(
            "admission.max_global_connections",
            self.admission.max_global_connections,
        )?;
        nonzero(
            "admission.max_connections_per_source",
            self.admission.max_connections_per_source,
        )?;
        nonzero("limits.global", self.limits.global)?;
        nonzero("limits.per_provider", self.limits.per_provider)?;
        nonzero("limits.per_session", self.limits.per_session)?;
        nonzero("retry.max_attempts", self.retry.max_attempts as usize)?;
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        self.breaker.validate("breaker")?;
        for (name, provider) in &self.providers {
            if let Some(breaker) = &provider.breaker {
                breaker.validate(&format!("providers.{name}.breaker"))?;
            }
        }
        nonzero(
            "session.timeout_seconds",
            self.session.timeout_seconds as usize,
        )?;
        nonzero(
            "session.cleanup_interval_seconds",
            self.session.cleanup_interval_seconds as usize,
        )?;
        Ok(())
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

// ============================================================================
// AdmissionConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum concurrently admitted connections across all sources.
    #[serde(default = "default_max_global_connections")]
    pub max_global_connections: usize,
    /// Maximum concurrently admitted connections per source address.
    #[serde(default = "default_max_connections_per_source")]
    pub max_connections_per_source: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_global_connections: default_max_global_connections(),
            max_connections_per_source: default_max_connections_per_source(),
        }
    }
}

fn default_max_global_connections() -> usize {
    1024
}

fn default_max_connections_per_source() -> usize {
    16
}

// ============================================================================
// LimitsConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Simultaneous provider-bound requests across the whole process.
    #[serde(default = "default_global_limit")]
    pub global: usize,
    /// Simultaneous requests per upstream provider.
    #[serde(default = "default_per_provider_limit")]
    pub per_provider: usize,
    /// Simultaneous requests per session.
    #[serde(default = "default_per_session_limit")]
    pub per_session: usize,
    /// How long an acquire may wait for capacity before timing out.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
    /// Age after which an unreleased acquisition is reported as a leak.
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold_seconds: u64,
    /// Inactivity after which an unused session scope is garbage-collected.
    #[serde(default = "default_idle_scope")]
    pub idle_scope_seconds: u64,
}

impl LimitsConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }

    pub fn leak_threshold(&self) -> Duration {
        Duration::from_secs(self.leak_threshold_seconds)
    }

    pub fn idle_scope_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_scope_seconds)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: default_global_limit(),
            per_provider: default_per_provider_limit(),
            per_session: default_per_session_limit(),
            acquire_timeout_seconds: default_acquire_timeout(),
            leak_threshold_seconds: default_leak_threshold(),
            idle_scope_seconds: default_idle_scope(),
        }
    }
}

fn default_global_limit() -> usize {
    256
}

fn default_per_provider_limit() -> usize {
    32
}

fn default_per_session_limit() -> usize {
    4
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_leak_threshold() -> u64 {
    300
}

fn default_idle_scope() -> u64 {
    600
}

// ============================================================================
// RetryConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> bool {
    true
}

// ============================================================================
// BreakerConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_seconds: u64,
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_seconds)
    }

    fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(format!(
                "{prefix}.failure_threshold must be > 0"
            )));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid(format!(
                "{prefix}.success_threshold must be > 0"
            )));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_seconds: default_open_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout() -> u64 {
    30
}

// ============================================================================
// CoalesceConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CoalesceConfig {
    /// How long a resolved entry stays servable to duplicate submissions.
    #[serde(default = "default_coalesce_ttl")]
    pub ttl_seconds: u64,
}

impl CoalesceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_coalesce_ttl(),
        }
    }
}

fn default_coalesce_ttl() -> u64 {
    5
}

// ============================================================================
// SessionConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Directory for persisted session records.
    #[serde(default = "default_session_path")]
    pub path: PathBuf,
    /// Inactivity after which a session expires.
    #[serde(default = "default_session_timeout")]
    pub timeout_seconds: u64,
    /// Interval of the expired-session sweep.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Bounded retries for optimistic-lock conflicts on activity updates.
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: default_session_path(),
            timeout_seconds: default_session_timeout(),
            cleanup_interval_seconds: default_cleanup_interval(),
            update_retries: default_update_retries(),
        }
    }
}

fn default_session_path() -> PathBuf {
    PathBuf::from(".modelmux/sessions")
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_update_retries() -> u32 {
    3
}

// ============================================================================
// ProviderConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL the generic HTTP provider posts tool calls to.
    pub base_url: String,
    /// Per-provider breaker override; falls back to the global `breaker`.
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.per_session, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.coalesce.ttl_seconds, 5);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = Config::load("/nonexistent/modelmux.yaml").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
server:
  port: 9090
limits:
  per_session: 8
providers:
  openai:
    base_url: "https://api.openai.example/v1"
    breaker:
      failure_threshold: 3
"#;
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.limits.per_session, 8);
        // Unspecified fields keep their defaults
        assert_eq!(config.limits.global, 256);
        let provider = &config.providers["openai"];
        assert_eq!(provider.breaker.as_ref().unwrap().failure_threshold, 3);
        assert_eq!(provider.breaker.as_ref().unwrap().success_threshold, 2);
    }

    #[test]
    fn zero_limit_fails_validation() {
        let yaml = "limits:\n  per_session: 0\n";
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per_session"));
    }

    #[test]
    fn zero_breaker_threshold_fails_validation() {
        let yaml = "breaker:\n  failure_threshold: 0\n";
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn sub_one_multiplier_fails_validation() {
        let yaml = "retry:\n  multiplier: 0.5\n";
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}

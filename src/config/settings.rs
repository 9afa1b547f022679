use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use super::defaults;

/// Top-level configuration for the Palisade security gateway.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_admin_api_config")]
    pub admin_api: AdminApiConfig,

    #[serde(default = "defaults::default_storage_config")]
    pub storage: StorageConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,

    #[serde(default = "defaults::default_rate_limit_config")]
    pub rate_limits: RateLimitConfig,

    #[serde(default = "defaults::default_reputation_config")]
    pub reputation: ReputationConfig,

    #[serde(default = "defaults::default_lockout_config")]
    pub lockout: LockoutConfig,

    #[serde(default = "defaults::default_csrf_config")]
    pub csrf: CsrfConfig,

    #[serde(default = "defaults::default_scanner_config")]
    pub scanner: ScannerConfig,

    #[serde(default = "defaults::default_behavior_config")]
    pub behavior: BehaviorConfig,

    #[serde(default = "defaults::default_blacklist_config")]
    pub blacklist: BlacklistConfig,

    #[serde(default = "defaults::default_audit_config")]
    pub audit: AuditConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: defaults::default_server_config(),
            admin_api: defaults::default_admin_api_config(),
            storage: defaults::default_storage_config(),
            logging: defaults::default_logging_config(),
            rate_limits: defaults::default_rate_limit_config(),
            reputation: defaults::default_reputation_config(),
            lockout: defaults::default_lockout_config(),
            csrf: defaults::default_csrf_config(),
            scanner: defaults::default_scanner_config(),
            behavior: defaults::default_behavior_config(),
            blacklist: defaults::default_blacklist_config(),
            audit: defaults::default_audit_config(),
        }
    }
}

/// HTTP gateway server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Hard cap on request body size in bytes. Requests above this are
    /// rejected with 413 before any further inspection.
    #[serde(default = "defaults::default_max_body_bytes")]
    pub max_body_bytes: u64,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminApiConfig {
    #[serde(default = "defaults::default_admin_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_api_key")]
    pub api_key: String,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::default_sqlite_path")]
    pub sqlite_path: String,

    /// SQLite busy timeout; bounds how long any store call may block.
    #[serde(default = "defaults::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_dir")]
    pub dir: String,
}

/// A single fixed-window rate limit policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RatePolicyConfig {
    pub window_secs: u64,
    pub max: u64,
}

/// Rate limiter configuration: one bucket family per policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Default policy for ordinary API traffic, keyed by identity-or-address.
    #[serde(default = "defaults::default_general_policy")]
    pub general: RatePolicyConfig,

    /// Tight policy for authentication endpoints.
    #[serde(default = "defaults::default_strict_policy")]
    pub strict: RatePolicyConfig,

    /// Per-address ceiling applied to all traffic regardless of identity.
    #[serde(default = "defaults::default_global_ip_policy")]
    pub global_ip: RatePolicyConfig,

    /// Daily allowance for authenticated users (keyed by identity only).
    #[serde(default = "defaults::default_daily_user_policy")]
    pub daily_user: RatePolicyConfig,

    /// Per-feature policies keyed by path prefix, e.g. `/api/reports`.
    #[serde(default)]
    pub per_feature: Vec<FeaturePolicyConfig>,

    #[serde(default = "defaults::default_adaptive_config")]
    pub adaptive: AdaptiveConfig,

    /// Roles exempt from rate limiting; exempted calls never consume quota.
    #[serde(default = "defaults::default_exempt_roles")]
    pub exempt_roles: Vec<String>,
}

/// A rate policy bound to a path prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct FeaturePolicyConfig {
    pub prefix: String,
    pub window_secs: u64,
    pub max: u64,
}

/// Reputation-tiered ceilings for the adaptive policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "defaults::default_adaptive_enabled")]
    pub enabled: bool,

    /// Callers above this score get an elevated ceiling.
    #[serde(default = "defaults::default_elevated_score")]
    pub elevated_score: i64,

    #[serde(default = "defaults::default_elevated_multiplier")]
    pub elevated_multiplier: f64,

    /// Callers below this score get the near-zero ceiling.
    #[serde(default = "defaults::default_degraded_score")]
    pub degraded_score: i64,

    #[serde(default = "defaults::default_degraded_max")]
    pub degraded_max: u64,
}

/// Reputation tracker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReputationConfig {
    #[serde(default = "defaults::default_reputation_min")]
    pub min_score: i64,

    #[serde(default = "defaults::default_reputation_max")]
    pub max_score: i64,

    /// Rolling expiry re-armed on every adjustment.
    #[serde(default = "defaults::default_reputation_expiry_secs")]
    pub expiry_secs: u64,

    /// Applied on a legitimate successful outcome.
    #[serde(default = "defaults::default_pass_delta")]
    pub pass_delta: i64,

    /// Applied on a rate-limit violation or suspicious action.
    #[serde(default = "defaults::default_violation_delta")]
    pub violation_delta: i64,
}

/// Account lockout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    /// Consecutive failed attempts before locking.
    #[serde(default = "defaults::default_lockout_threshold")]
    pub threshold: u32,

    #[serde(default = "defaults::default_lockout_duration_secs")]
    pub duration_secs: u64,
}

/// CSRF token manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "defaults::default_csrf_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "defaults::default_csrf_cookie_name")]
    pub cookie_name: String,

    #[serde(default = "defaults::default_csrf_header_name")]
    pub header_name: String,

    /// Paths excluded from CSRF validation (webhooks, login, health).
    #[serde(default = "defaults::default_csrf_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Path prefixes checked with the stateless double-submit-cookie
    /// variant instead of the server-side token store.
    #[serde(default)]
    pub double_submit_prefixes: Vec<String>,

    /// HMAC secret for signing double-submit cookies.
    #[serde(default = "defaults::default_csrf_secret")]
    pub secret: String,
}

/// Payload risk scanner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Scores at or above this reject the request outright.
    #[serde(default = "defaults::default_block_threshold")]
    pub block_threshold: u32,

    /// Recursion bound when walking structured payloads.
    #[serde(default = "defaults::default_max_depth")]
    pub max_depth: u32,

    /// Sanitization profile for request payloads: "text", "html", "markdown".
    #[serde(default = "defaults::default_sanitize_profile")]
    pub sanitize_profile: String,
}

/// Behavior analyzer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorConfig {
    /// Trailing window horizon in seconds.
    #[serde(default = "defaults::default_behavior_window_secs")]
    pub window_secs: u64,

    #[serde(default = "defaults::default_rapid_max")]
    pub rapid_max: usize,

    #[serde(default = "defaults::default_rapid_window_secs")]
    pub rapid_window_secs: u64,

    /// Distinct paths within the window before the scan signal fires.
    #[serde(default = "defaults::default_max_distinct_paths")]
    pub max_distinct_paths: usize,

    /// Distinct HTTP methods within the window before the fuzzing signal fires.
    #[serde(default = "defaults::default_max_distinct_methods")]
    pub max_distinct_methods: usize,

    /// Suspicious-activity count above which requests are rejected.
    #[serde(default = "defaults::default_suspicion_threshold")]
    pub suspicion_threshold: u32,
}

/// Blacklist configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default = "defaults::default_blacklist_ttl_secs")]
    pub default_ttl_secs: u64,
}

/// Audit sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "defaults::default_ring_capacity")]
    pub ring_capacity: usize,

    /// Retention for security events.
    #[serde(default = "defaults::default_event_ttl_secs")]
    pub event_ttl_secs: u64,

    /// Retention for plain request-log events.
    #[serde(default = "defaults::default_request_log_ttl_secs")]
    pub request_log_ttl_secs: u64,
}

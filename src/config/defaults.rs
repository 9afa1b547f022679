use super::settings::{
    AdaptiveConfig, AdminApiConfig, AuditConfig, BehaviorConfig, BlacklistConfig, CsrfConfig,
    LockoutConfig, LoggingConfig, RateLimitConfig, RatePolicyConfig, ReputationConfig,
    ScannerConfig, ServerConfig, StorageConfig,
};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
        request_timeout_secs: default_request_timeout_secs(),
        max_body_bytes: default_max_body_bytes(),
    }
}

pub fn default_admin_api_config() -> AdminApiConfig {
    AdminApiConfig {
        bind: default_admin_bind(),
        api_key: default_api_key(),
    }
}

pub fn default_storage_config() -> StorageConfig {
    StorageConfig {
        sqlite_path: default_sqlite_path(),
        busy_timeout_ms: default_busy_timeout_ms(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        dir: default_log_dir(),
    }
}

pub fn default_rate_limit_config() -> RateLimitConfig {
    RateLimitConfig {
        general: default_general_policy(),
        strict: default_strict_policy(),
        global_ip: default_global_ip_policy(),
        daily_user: default_daily_user_policy(),
        per_feature: Vec::new(),
        adaptive: default_adaptive_config(),
        exempt_roles: default_exempt_roles(),
    }
}

pub fn default_reputation_config() -> ReputationConfig {
    ReputationConfig {
        min_score: default_reputation_min(),
        max_score: default_reputation_max(),
        expiry_secs: default_reputation_expiry_secs(),
        pass_delta: default_pass_delta(),
        violation_delta: default_violation_delta(),
    }
}

pub fn default_lockout_config() -> LockoutConfig {
    LockoutConfig {
        threshold: default_lockout_threshold(),
        duration_secs: default_lockout_duration_secs(),
    }
}

pub fn default_csrf_config() -> CsrfConfig {
    CsrfConfig {
        ttl_secs: default_csrf_ttl_secs(),
        cookie_name: default_csrf_cookie_name(),
        header_name: default_csrf_header_name(),
        exempt_paths: default_csrf_exempt_paths(),
        double_submit_prefixes: Vec::new(),
        secret: default_csrf_secret(),
    }
}

pub fn default_scanner_config() -> ScannerConfig {
    ScannerConfig {
        block_threshold: default_block_threshold(),
        max_depth: default_max_depth(),
        sanitize_profile: default_sanitize_profile(),
    }
}

pub fn default_behavior_config() -> BehaviorConfig {
    BehaviorConfig {
        window_secs: default_behavior_window_secs(),
        rapid_max: default_rapid_max(),
        rapid_window_secs: default_rapid_window_secs(),
        max_distinct_paths: default_max_distinct_paths(),
        max_distinct_methods: default_max_distinct_methods(),
        suspicion_threshold: default_suspicion_threshold(),
    }
}

pub fn default_blacklist_config() -> BlacklistConfig {
    BlacklistConfig {
        default_ttl_secs: default_blacklist_ttl_secs(),
    }
}

pub fn default_audit_config() -> AuditConfig {
    AuditConfig {
        ring_capacity: default_ring_capacity(),
        event_ttl_secs: default_event_ttl_secs(),
        request_log_ttl_secs: default_request_log_ttl_secs(),
    }
}

pub fn default_adaptive_config() -> AdaptiveConfig {
    AdaptiveConfig {
        enabled: default_adaptive_enabled(),
        elevated_score: default_elevated_score(),
        elevated_multiplier: default_elevated_multiplier(),
        degraded_score: default_degraded_score(),
        degraded_max: default_degraded_max(),
    }
}

// ---------------------------------------------------------------------------
// Leaf defaults
// ---------------------------------------------------------------------------

pub fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

pub fn default_request_timeout_secs() -> u64 {
    30
}

pub fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

pub fn default_admin_bind() -> String {
    "127.0.0.1:9090".to_string()
}

pub fn default_api_key() -> String {
    "change-me".to_string()
}

pub fn default_sqlite_path() -> String {
    "/var/lib/palisade/palisade.db".to_string()
}

pub fn default_busy_timeout_ms() -> u64 {
    250
}

pub fn default_log_dir() -> String {
    "/var/log/palisade".to_string()
}

pub fn default_general_policy() -> RatePolicyConfig {
    RatePolicyConfig {
        window_secs: 60,
        max: 60,
    }
}

pub fn default_strict_policy() -> RatePolicyConfig {
    RatePolicyConfig {
        window_secs: 900,
        max: 5,
    }
}

pub fn default_global_ip_policy() -> RatePolicyConfig {
    RatePolicyConfig {
        window_secs: 60,
        max: 300,
    }
}

pub fn default_daily_user_policy() -> RatePolicyConfig {
    RatePolicyConfig {
        window_secs: 86_400,
        max: 10_000,
    }
}

pub fn default_adaptive_enabled() -> bool {
    true
}

pub fn default_elevated_score() -> i64 {
    50
}

pub fn default_elevated_multiplier() -> f64 {
    2.0
}

pub fn default_degraded_score() -> i64 {
    -10
}

pub fn default_degraded_max() -> u64 {
    3
}

pub fn default_exempt_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

pub fn default_reputation_min() -> i64 {
    -100
}

pub fn default_reputation_max() -> i64 {
    100
}

pub fn default_reputation_expiry_secs() -> u64 {
    86_400
}

pub fn default_pass_delta() -> i64 {
    1
}

pub fn default_violation_delta() -> i64 {
    -5
}

pub fn default_lockout_threshold() -> u32 {
    5
}

pub fn default_lockout_duration_secs() -> u64 {
    30 * 60
}

pub fn default_csrf_ttl_secs() -> u64 {
    4 * 3600
}

pub fn default_csrf_cookie_name() -> String {
    "palisade_csrf".to_string()
}

pub fn default_csrf_header_name() -> String {
    "x-csrf-token".to_string()
}

pub fn default_csrf_exempt_paths() -> Vec<String> {
    vec![
        "/api/auth/login".to_string(),
        "/api/auth/register".to_string(),
        "/api/health".to_string(),
        "/api/webhook".to_string(),
    ]
}

pub fn default_csrf_secret() -> String {
    "palisade-dev-secret-change-in-production".to_string()
}

pub fn default_block_threshold() -> u32 {
    80
}

pub fn default_max_depth() -> u32 {
    10
}

pub fn default_sanitize_profile() -> String {
    "text".to_string()
}

pub fn default_behavior_window_secs() -> u64 {
    300
}

pub fn default_rapid_max() -> usize {
    100
}

pub fn default_rapid_window_secs() -> u64 {
    60
}

pub fn default_max_distinct_paths() -> usize {
    50
}

pub fn default_max_distinct_methods() -> usize {
    4
}

pub fn default_suspicion_threshold() -> u32 {
    5
}

pub fn default_blacklist_ttl_secs() -> u64 {
    7 * 86_400
}

pub fn default_ring_capacity() -> usize {
    1000
}

pub fn default_event_ttl_secs() -> u64 {
    86_400
}

pub fn default_request_log_ttl_secs() -> u64 {
    3600
}

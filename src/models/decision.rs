use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable rejection codes. Stable: clients branch on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCode {
    RateLimitExceeded,
    CsrfTokenMissing,
    CsrfTokenInvalid,
    MaliciousPayloadDetected,
    IpBlacklisted,
    AccountLocked,
    RequestTooLarge,
    AnomalyDetected,
    /// Internal stage failure; logged, never user-visible as a rejection.
    AuditError,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            RejectCode::CsrfTokenMissing => "CSRF_TOKEN_MISSING",
            RejectCode::CsrfTokenInvalid => "CSRF_TOKEN_INVALID",
            RejectCode::MaliciousPayloadDetected => "MALICIOUS_PAYLOAD_DETECTED",
            RejectCode::IpBlacklisted => "IP_BLACKLISTED",
            RejectCode::AccountLocked => "ACCOUNT_LOCKED",
            RejectCode::RequestTooLarge => "REQUEST_TOO_LARGE",
            RejectCode::AnomalyDetected => "ANOMALY_DETECTED",
            RejectCode::AuditError => "AUDIT_ERROR",
        }
    }

    /// HTTP status the rejection is surfaced with.
    pub fn status(&self) -> u16 {
        match self {
            RejectCode::MaliciousPayloadDetected => 400,
            RejectCode::AccountLocked => 401,
            RejectCode::CsrfTokenMissing | RejectCode::CsrfTokenInvalid => 403,
            RejectCode::IpBlacklisted => 403,
            RejectCode::RequestTooLarge => 413,
            RejectCode::RateLimitExceeded | RejectCode::AnomalyDetected => 429,
            RejectCode::AuditError => 500,
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal stage rejection.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: RejectCode,
    /// Generic human-readable message; never names the specific pattern
    /// that tripped a scanner.
    pub message: String,
    /// Seconds until the caller may retry (rate limiting, lockout).
    pub retry_after: Option<u64>,
}

impl Rejection {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn status(&self) -> u16 {
        self.code.status()
    }
}

/// What a single stage decided for the current request.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Pass,
    Reject(Rejection),
}

/// Final verdict of the pipeline: the first rejection wins.
#[derive(Debug, Clone)]
pub enum Decision {
    Pass,
    Reject(Rejection),
}

impl Decision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Decision::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RejectCode::MaliciousPayloadDetected.status(), 400);
        assert_eq!(RejectCode::AccountLocked.status(), 401);
        assert_eq!(RejectCode::CsrfTokenInvalid.status(), 403);
        assert_eq!(RejectCode::IpBlacklisted.status(), 403);
        assert_eq!(RejectCode::RequestTooLarge.status(), 413);
        assert_eq!(RejectCode::RateLimitExceeded.status(), 429);
        assert_eq!(RejectCode::AnomalyDetected.status(), 429);
    }

    #[test]
    fn test_machine_codes_are_stable() {
        assert_eq!(RejectCode::RateLimitExceeded.as_str(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(RejectCode::CsrfTokenMissing.as_str(), "CSRF_TOKEN_MISSING");
        assert_eq!(
            RejectCode::MaliciousPayloadDetected.as_str(),
            "MALICIOUS_PAYLOAD_DETECTED"
        );
    }

    #[test]
    fn test_retry_after_builder() {
        let r = Rejection::new(RejectCode::RateLimitExceeded, "slow down").with_retry_after(900);
        assert_eq!(r.retry_after, Some(900));
        assert_eq!(r.status(), 429);
    }
}

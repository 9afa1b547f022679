use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::settings::LockoutConfig;
use crate::models::request::RequestContext;

/// Account identifier for lockout tracking: credential from the payload
/// when present, otherwise identity, otherwise the network address.
pub fn account_identifier(ctx: &RequestContext) -> String {
    let from_body = ctx.body.as_ref().and_then(|b| {
        b.get("email")
            .or_else(|| b.get("username"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });
    from_body
        .or_else(|| ctx.identity.clone())
        .unwrap_or_else(|| ctx.client_ip.to_string())
}

/// Per-account failed-attempt record. `locked_until` present means the
/// account is in the `Locked` state.
#[derive(Debug, Clone)]
struct LockoutRecord {
    attempts: u32,
    last_attempt: Instant,
    locked_until: Option<Instant>,
}

/// Failed-attempt lockout state machine per account identifier.
///
/// `Open -> Locked` on the Nth consecutive failure (no windowing; the
/// count persists until a success). `Locked -> Open` lazily once the
/// lockout duration has elapsed, or explicitly on a successful
/// authentication. Checking a locked account never extends the lockout.
pub struct LockoutRegistry {
    records: DashMap<String, LockoutRecord>,
    config: LockoutConfig,
}

impl LockoutRegistry {
    pub fn new(config: &LockoutConfig) -> Self {
        Self {
            records: DashMap::new(),
            config: config.clone(),
        }
    }

    /// Remaining lockout time for `identifier`, if currently locked.
    /// Clears an elapsed lock as a side effect (lazy transition to Open).
    pub fn check(&self, identifier: &str) -> Option<Duration> {
        let mut record = self.records.get_mut(identifier)?;
        let locked_until = record.locked_until?;

        let now = Instant::now();
        if now >= locked_until {
            record.locked_until = None;
            debug!(identifier = identifier, "Lockout elapsed; account reopened");
            return None;
        }

        Some(locked_until - now)
    }

    /// Record a failed attempt. Returns true when this failure crossed the
    /// threshold and locked the account. Attempts against an already
    /// locked account are not counted, so retries cannot extend the lock.
    pub fn record_failure(&self, identifier: &str) -> bool {
        let mut record = self
            .records
            .entry(identifier.to_string())
            .or_insert(LockoutRecord {
                attempts: 0,
                last_attempt: Instant::now(),
                locked_until: None,
            });

        if let Some(locked_until) = record.locked_until {
            if Instant::now() < locked_until {
                return false;
            }
            record.locked_until = None;
        }

        record.attempts += 1;
        record.last_attempt = Instant::now();

        if record.attempts >= self.config.threshold {
            record.locked_until =
                Some(Instant::now() + Duration::from_secs(self.config.duration_secs));
            warn!(
                identifier = identifier,
                attempts = record.attempts,
                "Account locked after repeated failures"
            );
            return true;
        }

        false
    }

    /// Clear the record on a successful authentication.
    pub fn record_success(&self, identifier: &str) {
        if self.records.remove(identifier).is_some() {
            debug!(identifier = identifier, "Failed-attempt record cleared");
        }
    }

    pub fn attempts(&self, identifier: &str) -> u32 {
        self.records
            .get(identifier)
            .map(|r| r.attempts)
            .unwrap_or(0)
    }

    /// Drop stale records: expired locks and attempt counts with no
    /// activity for twice the lockout duration.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let stale = Duration::from_secs(self.config.duration_secs * 2);
        self.records.retain(|_, r| {
            if let Some(locked_until) = r.locked_until {
                return now < locked_until;
            }
            now.duration_since(r.last_attempt) < stale
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(duration_secs: u64) -> LockoutRegistry {
        LockoutRegistry::new(&LockoutConfig {
            threshold: 5,
            duration_secs,
        })
    }

    #[test]
    fn test_five_failures_lock_the_account() {
        let reg = registry(1800);
        for _ in 0..4 {
            assert!(!reg.record_failure("user@example.com"));
            assert!(reg.check("user@example.com").is_none());
        }
        assert!(reg.record_failure("user@example.com"));
        let remaining = reg.check("user@example.com").expect("must be locked");
        assert!(remaining <= Duration::from_secs(1800));
    }

    #[test]
    fn test_success_clears_counter() {
        let reg = registry(1800);
        for _ in 0..4 {
            reg.record_failure("user@example.com");
        }
        reg.record_success("user@example.com");
        assert_eq!(reg.attempts("user@example.com"), 0);

        // Counter restarted from zero: four more failures do not lock.
        for _ in 0..4 {
            assert!(!reg.record_failure("user@example.com"));
        }
        assert!(reg.check("user@example.com").is_none());
    }

    #[test]
    fn test_lock_expires_without_intervention() {
        let reg = registry(0);
        for _ in 0..5 {
            reg.record_failure("user@example.com");
        }
        // Zero-duration lock has already elapsed at check time.
        assert!(reg.check("user@example.com").is_none());
    }

    #[test]
    fn test_locked_rejections_do_not_extend_lock() {
        let reg = registry(1800);
        for _ in 0..5 {
            reg.record_failure("user@example.com");
        }
        assert_eq!(reg.attempts("user@example.com"), 5);

        // Retries while locked are rejected upstream; even if a failure
        // is recorded, the counter must not move.
        reg.record_failure("user@example.com");
        reg.record_failure("user@example.com");
        assert_eq!(reg.attempts("user@example.com"), 5);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let reg = registry(1800);
        for _ in 0..5 {
            reg.record_failure("a@example.com");
        }
        assert!(reg.check("a@example.com").is_some());
        assert!(reg.check("b@example.com").is_none());
    }
}

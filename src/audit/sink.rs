use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::settings::AuditConfig;
use crate::storage::sqlite::SqliteStore;

/// Event kind for plain request logging (short retention).
pub const KIND_REQUEST_LOG: &str = "REQUEST_LOG";

/// An immutable security event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    /// Fingerprint or address of the actor involved.
    pub actor: String,
    pub details: Value,
}

/// Append-only security event sink.
///
/// Keeps a bounded in-memory ring for recent-event queries and hourly
/// count buckets for aggregates; events are mirrored to the durable
/// store best-effort with category retention. A sink failure never
/// blocks the request that produced the event.
pub struct AuditSink {
    ring: RwLock<VecDeque<AuditEvent>>,
    /// (kind, hour bucket) -> count.
    counts: DashMap<(String, i64), u64>,
    sqlite: Option<Arc<SqliteStore>>,
    config: AuditConfig,
}

impl AuditSink {
    pub fn new(sqlite: Option<Arc<SqliteStore>>, config: &AuditConfig) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(config.ring_capacity)),
            counts: DashMap::new(),
            sqlite,
            config: config.clone(),
        }
    }

    /// Record an event. Best-effort everywhere: the ring and counters
    /// cannot fail, the durable write is logged-and-ignored on error.
    pub fn log_event(&self, kind: &str, actor: &str, details: Value) {
        let event = AuditEvent {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            details,
        };

        let hour_bucket = event.timestamp.timestamp() / 3600;
        *self
            .counts
            .entry((event.kind.clone(), hour_bucket))
            .or_insert(0) += 1;

        {
            let mut ring = self.ring.write();
            if ring.len() >= self.config.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if let Some(sqlite) = &self.sqlite {
            let ttl = self.ttl_for(kind);
            let details = event.details.to_string();
            if let Err(e) = sqlite.insert_audit_event(kind, actor, &details, ttl) {
                warn!(kind = kind, error = %e, "Failed to persist audit event");
            }
        }
    }

    /// Number of events of `kind` within the trailing `since_hours`.
    pub fn count_events(&self, kind: &str, since_hours: i64) -> u64 {
        let current_hour = Utc::now().timestamp() / 3600;
        let floor = current_hour - since_hours;
        self.counts
            .iter()
            .filter(|entry| entry.key().0 == kind && entry.key().1 > floor)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let ring = self.ring.read();
        ring.iter().rev().take(limit).cloned().collect()
    }

    /// Event kinds currently present in the hourly buckets.
    pub fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.counts.iter().map(|e| e.key().0.clone()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Drop hourly buckets older than the event retention and purge the
    /// durable mirror. Called from the cleanup task.
    pub fn cleanup(&self) {
        let retention_hours = (self.config.event_ttl_secs / 3600).max(1) as i64;
        let floor = Utc::now().timestamp() / 3600 - retention_hours;
        self.counts.retain(|(_, bucket), _| *bucket > floor);

        if let Some(sqlite) = &self.sqlite {
            if let Err(e) = sqlite.purge_expired() {
                warn!(error = %e, "Failed to purge expired audit rows");
            }
        }
    }

    fn ttl_for(&self, kind: &str) -> Duration {
        if kind == KIND_REQUEST_LOG {
            Duration::from_secs(self.config.request_log_ttl_secs)
        } else {
            Duration::from_secs(self.config.event_ttl_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;
    use serde_json::json;

    fn sink() -> AuditSink {
        AuditSink::new(None, &defaults::default_audit_config())
    }

    #[test]
    fn test_counts_by_kind() {
        let s = sink();
        s.log_event("RATE_LIMIT_EXCEEDED", "203.0.113.1", json!({}));
        s.log_event("RATE_LIMIT_EXCEEDED", "203.0.113.2", json!({}));
        s.log_event("IP_BLACKLISTED", "203.0.113.3", json!({}));

        assert_eq!(s.count_events("RATE_LIMIT_EXCEEDED", 1), 2);
        assert_eq!(s.count_events("IP_BLACKLISTED", 1), 1);
        assert_eq!(s.count_events("CSRF_TOKEN_INVALID", 1), 0);
    }

    #[test]
    fn test_recent_returns_newest_first() {
        let s = sink();
        s.log_event("A", "x", json!({"n": 1}));
        s.log_event("B", "x", json!({"n": 2}));
        s.log_event("C", "x", json!({"n": 3}));

        let recent = s.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "C");
        assert_eq!(recent[1].kind, "B");
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut config = defaults::default_audit_config();
        config.ring_capacity = 3;
        let s = AuditSink::new(None, &config);
        for i in 0..10 {
            s.log_event("A", "x", json!({"n": i}));
        }
        let recent = s.recent(100);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].details["n"], 9);
    }

    #[test]
    fn test_durable_mirror_receives_events() {
        let sqlite = Arc::new(
            SqliteStore::new(":memory:", Duration::from_millis(250)).unwrap(),
        );
        let s = AuditSink::new(Some(sqlite.clone()), &defaults::default_audit_config());
        s.log_event("MALICIOUS_PAYLOAD_DETECTED", "fp-1", json!({"score": 95}));

        let hour_ago = Utc::now().timestamp() - 3600;
        assert_eq!(
            sqlite
                .count_audit_events("MALICIOUS_PAYLOAD_DETECTED", hour_ago)
                .unwrap(),
            1
        );
    }
}

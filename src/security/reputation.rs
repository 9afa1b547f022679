use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::settings::ReputationConfig;
use crate::storage::counter::CounterStore;

/// Numeric trust score per network address.
///
/// Incremented on legitimate successful outcomes, decremented on
/// rate-limit violations and suspicious actions. Scores are clamped to
/// the configured bounds and carry a rolling 24h expiry that is re-armed
/// on every adjustment. Reads degrade to the neutral score when the
/// store has no answer.
pub struct ReputationTracker {
    store: Arc<CounterStore>,
    config: ReputationConfig,
}

impl ReputationTracker {
    pub fn new(store: Arc<CounterStore>, config: &ReputationConfig) -> Self {
        Self {
            store,
            config: config.clone(),
        }
    }

    /// Apply `delta` to the address score and return the clamped result.
    pub fn adjust(&self, address: &IpAddr, delta: i64) -> i64 {
        let key = Self::key(address);
        let raw = self.store.increment(&key, delta);

        let clamped = raw.clamp(self.config.min_score, self.config.max_score);
        if clamped != raw {
            self.store.set_ex(
                &key,
                &clamped.to_string(),
                Duration::from_secs(self.config.expiry_secs),
            );
        } else {
            self.store
                .expire(&key, Duration::from_secs(self.config.expiry_secs));
        }

        debug!(address = %address, delta = delta, score = clamped, "Reputation adjusted");
        clamped
    }

    /// Current score for an address; unknown addresses are neutral (0).
    pub fn get(&self, address: &IpAddr) -> i64 {
        self.store
            .get(&Self::key(address))
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v.clamp(self.config.min_score, self.config.max_score))
            .unwrap_or(0)
    }

    /// Convenience delta for a legitimate successful outcome.
    pub fn record_pass(&self, address: &IpAddr) -> i64 {
        self.adjust(address, self.config.pass_delta)
    }

    /// Convenience delta for a rate-limit violation or suspicious action.
    pub fn record_violation(&self, address: &IpAddr) -> i64 {
        self.adjust(address, self.config.violation_delta)
    }

    fn key(address: &IpAddr) -> String {
        format!("reputation:{}", address)
    }
}

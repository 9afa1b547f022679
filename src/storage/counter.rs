use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::kv::KvStore;
use super::memory::MemoryKv;

/// Increment/expire primitive over the durable store with an in-process
/// fallback.
///
/// Every operation is best-effort: a durable-store failure switches the
/// call to the memory fallback, narrowing protection to this process
/// instead of failing the request. The degraded/recovered transition is
/// logged once per flip.
pub struct CounterStore {
    primary: Option<Arc<dyn KvStore>>,
    fallback: Arc<MemoryKv>,
    degraded: AtomicBool,
}

impl CounterStore {
    pub fn new(primary: Option<Arc<dyn KvStore>>, fallback: Arc<MemoryKv>) -> Self {
        if primary.is_none() {
            warn!("No durable store configured; counters are process-local only");
        }
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// True while the durable store is unreachable and the in-process
    /// fallback is serving.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn increment(&self, key: &str, delta: i64) -> i64 {
        if let Some(primary) = &self.primary {
            match primary.increment(key, delta) {
                Ok(v) => {
                    self.mark_healthy();
                    return v;
                }
                Err(e) => self.mark_degraded(&e.to_string()),
            }
        }
        self.fallback.increment(key, delta).unwrap_or(delta)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(primary) = &self.primary {
            match primary.get(key) {
                Ok(v) => {
                    self.mark_healthy();
                    return v;
                }
                Err(e) => self.mark_degraded(&e.to_string()),
            }
        }
        self.fallback.get(key).unwrap_or(None)
    }

    pub fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(primary) = &self.primary {
            match primary.set_ex(key, value, ttl) {
                Ok(()) => {
                    self.mark_healthy();
                    return;
                }
                Err(e) => self.mark_degraded(&e.to_string()),
            }
        }
        let _ = self.fallback.set_ex(key, value, ttl);
    }

    pub fn expire(&self, key: &str, ttl: Duration) {
        if let Some(primary) = &self.primary {
            match primary.expire(key, ttl) {
                Ok(()) => {
                    self.mark_healthy();
                    return;
                }
                Err(e) => self.mark_degraded(&e.to_string()),
            }
        }
        let _ = self.fallback.expire(key, ttl);
    }

    pub fn delete(&self, key: &str) {
        if let Some(primary) = &self.primary {
            match primary.delete(key) {
                Ok(()) => {
                    self.mark_healthy();
                    return;
                }
                Err(e) => self.mark_degraded(&e.to_string()),
            }
        }
        let _ = self.fallback.delete(key);
    }

    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        if let Some(primary) = &self.primary {
            match primary.ttl_remaining(key) {
                Ok(v) => {
                    self.mark_healthy();
                    return v;
                }
                Err(e) => self.mark_degraded(&e.to_string()),
            }
        }
        self.fallback.ttl_remaining(key).unwrap_or(None)
    }

    /// Evict expired fallback entries; called from the cleanup task.
    pub fn sweep_fallback(&self) {
        self.fallback.sweep();
    }

    fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                reason = reason,
                "Durable store unavailable; falling back to in-process counters"
            );
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("Durable store recovered; counters durable again");
        }
    }
}

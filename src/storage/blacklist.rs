use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use ipnet::IpNet;
use tracing::{info, warn};

use super::sqlite::SqliteStore;

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub reason: String,
    pub expires_at: Option<Instant>,
}

/// Binary block list keyed by address or CIDR network.
///
/// Lookups are served from memory; every mutation is mirrored to the
/// durable store, and `load_from_db` re-hydrates the memory view at
/// startup so blocks survive restarts.
pub struct BlacklistManager {
    addresses: DashMap<IpAddr, BlacklistEntry>,
    cidrs: DashMap<String, BlacklistEntry>,
    sqlite: Option<Arc<SqliteStore>>,
    default_ttl: Duration,
}

impl BlacklistManager {
    pub fn new(sqlite: Option<Arc<SqliteStore>>, default_ttl: Duration) -> Self {
        Self {
            addresses: DashMap::new(),
            cidrs: DashMap::new(),
            sqlite,
            default_ttl,
        }
    }

    /// Re-hydrate the in-memory view from the durable store, skipping
    /// entries that expired while the process was down.
    pub fn load_from_db(&self) -> anyhow::Result<usize> {
        let Some(sqlite) = &self.sqlite else {
            return Ok(0);
        };

        let now_epoch = Utc::now().timestamp();
        let mut loaded = 0;
        for row in sqlite.get_blacklist_entries()? {
            let remaining = match row.expires_at {
                Some(exp) if exp <= now_epoch => continue,
                Some(exp) => Some(Duration::from_secs((exp - now_epoch) as u64)),
                None => None,
            };
            let entry = BlacklistEntry {
                reason: row.reason.clone(),
                expires_at: remaining.map(|d| Instant::now() + d),
            };
            if row.cidr.is_some() {
                self.cidrs.insert(row.address.clone(), entry);
            } else if let Ok(ip) = IpAddr::from_str(&row.address) {
                self.addresses.insert(ip, entry);
            }
            loaded += 1;
        }

        info!(entries = loaded, "Blacklist loaded from durable store");
        Ok(loaded)
    }

    /// Add an address or CIDR to the block list. `ttl` defaults to the
    /// configured retention (7 days).
    pub fn add(&self, value: &str, reason: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = BlacklistEntry {
            reason: reason.to_string(),
            expires_at: Some(Instant::now() + ttl),
        };

        let is_cidr = value.contains('/');
        if is_cidr {
            // Validate before storing so lookups never parse garbage.
            value
                .parse::<IpNet>()
                .map_err(|e| anyhow::anyhow!("invalid CIDR {}: {}", value, e))?;
            self.cidrs.insert(value.to_string(), entry);
        } else {
            let ip = IpAddr::from_str(value)
                .map_err(|e| anyhow::anyhow!("invalid address {}: {}", value, e))?;
            self.addresses.insert(ip, entry);
        }

        if let Some(sqlite) = &self.sqlite {
            let expires_at = Some(Utc::now().timestamp() + ttl.as_secs() as i64);
            let cidr = if is_cidr { Some(value) } else { None };
            if let Err(e) = sqlite.add_blacklist_entry(value, cidr, reason, expires_at) {
                warn!(value = value, error = %e, "Failed to persist blacklist entry");
            }
        }

        info!(value = value, reason = reason, "Blacklist entry added");
        Ok(())
    }

    pub fn remove(&self, value: &str) {
        if value.contains('/') {
            self.cidrs.remove(value);
        } else if let Ok(ip) = IpAddr::from_str(value) {
            self.addresses.remove(&ip);
        }

        if let Some(sqlite) = &self.sqlite {
            if let Err(e) = sqlite.remove_blacklist_entry(value) {
                warn!(value = value, error = %e, "Failed to remove persisted blacklist entry");
            }
        }

        info!(value = value, "Blacklist entry removed");
    }

    /// Presence alone is the block signal. Returns the recorded reason.
    pub fn is_blocked(&self, ip: &IpAddr) -> Option<String> {
        if let Some(entry) = self.addresses.get(ip) {
            if entry.expires_at.map_or(true, |exp| Instant::now() < exp) {
                return Some(entry.reason.clone());
            }
            drop(entry);
            self.addresses.remove(ip);
        }

        for entry in self.cidrs.iter() {
            if let Ok(net) = entry.key().parse::<IpNet>() {
                if net.contains(ip)
                    && entry.value().expires_at.map_or(true, |exp| Instant::now() < exp)
                {
                    return Some(entry.value().reason.clone());
                }
            }
        }

        None
    }

    /// Current entries as `(value, reason)` pairs, for the admin API.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .addresses
            .iter()
            .map(|e| (e.key().to_string(), e.value().reason.clone()))
            .collect();
        out.extend(
            self.cidrs
                .iter()
                .map(|e| (e.key().clone(), e.value().reason.clone())),
        );
        out.sort();
        out
    }

    /// Evict expired entries; called from the cleanup task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.addresses
            .retain(|_, e| e.expires_at.map_or(true, |exp| now < exp));
        self.cidrs
            .retain(|_, e| e.expires_at.map_or(true, |exp| now < exp));
    }
}

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::settings::{RateLimitConfig, RatePolicyConfig};
use crate::models::request::{RequestContext, RouteClass};
use crate::security::reputation::ReputationTracker;
use crate::storage::counter::CounterStore;

/// How a policy derives its bucket key from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// Identity when authenticated, address otherwise.
    Client,
    /// Always the network address.
    Address,
    /// Identity only; the policy is skipped for anonymous callers.
    Identity,
}

/// A named fixed-window counting policy.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    pub name: String,
    pub window: Duration,
    pub max: u64,
    pub scope: KeyScope,
    /// Reputation tiers apply to this policy's ceiling.
    pub adaptive: bool,
}

impl RatePolicy {
    fn from_config(name: &str, cfg: &RatePolicyConfig, scope: KeyScope, adaptive: bool) -> Self {
        Self {
            name: name.to_string(),
            window: Duration::from_secs(cfg.window_secs),
            max: cfg.max,
            scope,
            adaptive,
        }
    }
}

/// A policy violation carrying everything the rejection needs.
#[derive(Debug, Clone)]
pub struct RateViolation {
    pub policy: String,
    pub limit: u64,
    pub retry_after_secs: u64,
}

/// Fixed-window rate limiting over the counter store.
///
/// Buckets reset implicitly when their window TTL lapses. The adaptive
/// tier table widens or collapses a policy's ceiling from the caller's
/// reputation before the same fixed-window check is applied.
pub struct RateLimiter {
    store: Arc<CounterStore>,
    reputation: Arc<ReputationTracker>,
    config: RateLimitConfig,
    general: RatePolicy,
    strict: RatePolicy,
    global_ip: RatePolicy,
    daily_user: RatePolicy,
    per_feature: Vec<(String, RatePolicy)>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<CounterStore>,
        reputation: Arc<ReputationTracker>,
        config: &RateLimitConfig,
    ) -> Self {
        let per_feature = config
            .per_feature
            .iter()
            .map(|f| {
                let cfg = RatePolicyConfig {
                    window_secs: f.window_secs,
                    max: f.max,
                };
                let name = format!("feature:{}", f.prefix.trim_start_matches('/').replace('/', "_"));
                (
                    f.prefix.clone(),
                    RatePolicy::from_config(&name, &cfg, KeyScope::Client, false),
                )
            })
            .collect();

        Self {
            store,
            reputation,
            config: config.clone(),
            general: RatePolicy::from_config("general", &config.general, KeyScope::Client, true),
            strict: RatePolicy::from_config("strict", &config.strict, KeyScope::Client, false),
            global_ip: RatePolicy::from_config(
                "global_ip",
                &config.global_ip,
                KeyScope::Address,
                false,
            ),
            daily_user: RatePolicy::from_config(
                "daily_user",
                &config.daily_user,
                KeyScope::Identity,
                false,
            ),
            per_feature,
        }
    }

    /// Evaluate every policy applicable to this request, in ceiling order
    /// (global address cap, then route policy, then daily allowance).
    /// Exempt roles never consume quota.
    pub fn check(&self, ctx: &RequestContext) -> Option<RateViolation> {
        if self.is_exempt(ctx) {
            debug!(key = %ctx.client_key(), "Rate limit exempt role");
            return None;
        }

        if let Some(v) = self.check_policy(&self.global_ip, ctx) {
            return Some(v);
        }

        let route_policy = match ctx.route_class {
            RouteClass::Auth => &self.strict,
            RouteClass::General => self
                .per_feature
                .iter()
                .find(|(prefix, _)| ctx.path.starts_with(prefix.as_str()))
                .map(|(_, p)| p)
                .unwrap_or(&self.general),
        };
        if let Some(v) = self.check_policy(route_policy, ctx) {
            return Some(v);
        }

        if ctx.identity.is_some() {
            if let Some(v) = self.check_policy(&self.daily_user, ctx) {
                return Some(v);
            }
        }

        None
    }

    /// Run one fixed-window check: increment, arm the window TTL on the
    /// first hit, compare against the (possibly adaptive) ceiling.
    fn check_policy(&self, policy: &RatePolicy, ctx: &RequestContext) -> Option<RateViolation> {
        let bucket_key = match policy.scope {
            KeyScope::Client => ctx.client_key(),
            KeyScope::Address => ctx.client_ip.to_string(),
            KeyScope::Identity => ctx.identity.clone()?,
        };
        let key = format!("rl:{}:{}", policy.name, bucket_key);

        let max = self.effective_max(policy, ctx);
        let count = self.store.increment(&key, 1) as u64;
        if count == 1 {
            self.store.expire(&key, policy.window);
        }

        if count > max {
            let retry_after = self
                .store
                .ttl_remaining(&key)
                .map(|d| d.as_secs())
                .filter(|s| *s > 0)
                .unwrap_or(policy.window.as_secs());
            debug!(
                policy = %policy.name,
                key = %bucket_key,
                count = count,
                limit = max,
                "Rate limit exceeded"
            );
            return Some(RateViolation {
                policy: policy.name.clone(),
                limit: max,
                retry_after_secs: retry_after,
            });
        }

        None
    }

    /// Reputation-tiered ceiling. A store miss reads as the neutral score,
    /// which lands in the conservative base tier.
    fn effective_max(&self, policy: &RatePolicy, ctx: &RequestContext) -> u64 {
        let adaptive = &self.config.adaptive;
        if !policy.adaptive || !adaptive.enabled {
            return policy.max;
        }

        let score = self.reputation.get(&ctx.client_ip);
        if score > adaptive.elevated_score {
            (policy.max as f64 * adaptive.elevated_multiplier) as u64
        } else if score < adaptive.degraded_score {
            adaptive.degraded_max.min(policy.max)
        } else {
            policy.max
        }
    }

    fn is_exempt(&self, ctx: &RequestContext) -> bool {
        self.config
            .exempt_roles
            .iter()
            .any(|role| ctx.has_role(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;
    use crate::config::settings::FeaturePolicyConfig;
    use crate::storage::memory::MemoryKv;

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        let store = Arc::new(CounterStore::new(None, Arc::new(MemoryKv::new())));
        let reputation = Arc::new(ReputationTracker::new(
            store.clone(),
            &defaults::default_reputation_config(),
        ));
        RateLimiter::new(store, reputation, &config)
    }

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new("203.0.113.20".parse().unwrap(), "POST".to_string(), path.to_string())
    }

    #[test]
    fn test_rejects_max_plus_one_within_window() {
        let mut config = defaults::default_rate_limit_config();
        config.strict.window_secs = 900;
        config.strict.max = 5;
        let limiter = limiter_with(config);

        let c = ctx("/api/auth/login");
        for _ in 0..5 {
            assert!(limiter.check(&c).is_none());
        }
        let violation = limiter.check(&c).expect("6th request must be rejected");
        assert_eq!(violation.policy, "strict");
        assert!(violation.retry_after_secs <= 900);
        assert!(violation.retry_after_secs > 0);
    }

    #[test]
    fn test_window_lapse_resets_bucket() {
        let mut config = defaults::default_rate_limit_config();
        config.general.window_secs = 1;
        config.general.max = 2;
        // Keep the address cap out of the way.
        config.global_ip.max = 1000;
        let limiter = limiter_with(config);

        let c = ctx("/api/items");
        assert!(limiter.check(&c).is_none());
        assert!(limiter.check(&c).is_none());
        assert!(limiter.check(&c).is_some());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check(&c).is_none());
    }

    #[test]
    fn test_exempt_role_never_consumes_quota() {
        let mut config = defaults::default_rate_limit_config();
        config.general.max = 1;
        config.global_ip.max = 1;
        let limiter = limiter_with(config);

        let mut c = ctx("/api/items");
        c.roles.push("admin".to_string());
        for _ in 0..10 {
            assert!(limiter.check(&c).is_none());
        }

        // The quota is untouched: a non-exempt caller from the same address
        // still has its full allowance.
        let plain = ctx("/api/items");
        assert!(limiter.check(&plain).is_none());
        assert!(limiter.check(&plain).is_some());
    }

    #[test]
    fn test_per_feature_policy_selected_by_prefix() {
        let mut config = defaults::default_rate_limit_config();
        config.per_feature.push(FeaturePolicyConfig {
            prefix: "/api/reports".to_string(),
            window_secs: 60,
            max: 1,
        });
        let limiter = limiter_with(config);

        let c = ctx("/api/reports/daily");
        assert!(limiter.check(&c).is_none());
        let violation = limiter.check(&c).unwrap();
        assert_eq!(violation.policy, "feature:api_reports");
    }

    #[test]
    fn test_adaptive_degraded_tier_collapses_ceiling() {
        let config = defaults::default_rate_limit_config();
        let store = Arc::new(CounterStore::new(None, Arc::new(MemoryKv::new())));
        let reputation = Arc::new(ReputationTracker::new(
            store.clone(),
            &defaults::default_reputation_config(),
        ));
        let limiter = RateLimiter::new(store, reputation.clone(), &config);

        let c = ctx("/api/items");
        reputation.adjust(&c.client_ip, -50);

        // Degraded ceiling is 3, well under the general max of 60.
        for _ in 0..3 {
            assert!(limiter.check(&c).is_none());
        }
        assert!(limiter.check(&c).is_some());
    }

    #[test]
    fn test_adaptive_elevated_tier_raises_ceiling() {
        let mut config = defaults::default_rate_limit_config();
        config.general.max = 2;
        config.global_ip.max = 1000;
        let store = Arc::new(CounterStore::new(None, Arc::new(MemoryKv::new())));
        let reputation = Arc::new(ReputationTracker::new(
            store.clone(),
            &defaults::default_reputation_config(),
        ));
        let limiter = RateLimiter::new(store, reputation.clone(), &config);

        let c = ctx("/api/items");
        reputation.adjust(&c.client_ip, 60);

        // Elevated multiplier doubles the ceiling to 4.
        for _ in 0..4 {
            assert!(limiter.check(&c).is_none());
        }
        assert!(limiter.check(&c).is_some());
    }

    #[test]
    fn test_identity_and_address_buckets_are_distinct() {
        let mut config = defaults::default_rate_limit_config();
        config.general.max = 1;
        config.global_ip.max = 100;
        let limiter = limiter_with(config);

        let mut alice = ctx("/api/items");
        alice.identity = Some("alice".to_string());
        let mut bob = ctx("/api/items");
        bob.identity = Some("bob".to_string());

        assert!(limiter.check(&alice).is_none());
        assert!(limiter.check(&bob).is_none());
        assert!(limiter.check(&alice).is_some());
    }
}

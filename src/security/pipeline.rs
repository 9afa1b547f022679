use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::sink::AuditSink;
use crate::config::settings::Settings;
use crate::models::decision::{Decision, RejectCode, Rejection, StageOutcome};
use crate::models::request::{RequestContext, RouteClass};
use crate::security::behavior::BehaviorAnalyzer;
use crate::security::csrf::{CsrfOutcome, CsrfTokenManager};
use crate::security::fingerprint;
use crate::security::lockout::LockoutRegistry;
use crate::security::rate_limiter::RateLimiter;
use crate::security::reputation::ReputationTracker;
use crate::security::sanitizer::{Profile, Sanitizer};
use crate::security::scanner::RiskScanner;
use crate::storage::blacklist::BlacklistManager;

/// One inspection stage in the security pipeline.
///
/// A stage either passes (optionally refining the context, e.g. the
/// sanitized payload) or rejects with a status and machine code. A stage
/// that cannot do its job returns `Err`, which the orchestrator treats as
/// a pass for that stage only: protection degrades, traffic keeps
/// flowing.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome>;
}

/// Ordered middleware chain producing the pass/block decision.
///
/// Stages run in a fixed order; the first rejection short-circuits the
/// chain. Every rejection and every internal stage error produces exactly
/// one audit event.
pub struct SecurityPipeline {
    stages: Vec<Arc<dyn Stage>>,
    audit: Arc<AuditSink>,
}

impl SecurityPipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, audit: Arc<AuditSink>) -> Self {
        Self { stages, audit }
    }

    /// Evaluate all stages against the request.
    pub fn process(&self, ctx: &mut RequestContext) -> Decision {
        for stage in &self.stages {
            match stage.evaluate(ctx) {
                Ok(StageOutcome::Pass) => {}
                Ok(StageOutcome::Reject(rejection)) => {
                    info!(
                        stage = stage.name(),
                        code = %rejection.code,
                        ip = %ctx.client_ip,
                        path = %ctx.path,
                        "Request rejected"
                    );
                    self.audit.log_event(
                        rejection.code.as_str(),
                        actor(ctx),
                        json!({
                            "stage": stage.name(),
                            "method": ctx.method.as_str(),
                            "path": ctx.path.as_str(),
                            "ip": ctx.client_ip.to_string(),
                        }),
                    );
                    return Decision::Reject(rejection);
                }
                Err(e) => {
                    // Fail open: a broken stage narrows protection, it
                    // must not take the service down with it.
                    warn!(stage = stage.name(), error = %e, "Stage failed; passing through");
                    self.audit.log_event(
                        RejectCode::AuditError.as_str(),
                        actor(ctx),
                        json!({ "stage": stage.name(), "error": e.to_string() }),
                    );
                }
            }
        }
        Decision::Pass
    }
}

fn actor(ctx: &RequestContext) -> &str {
    if ctx.fingerprint.is_empty() {
        // The fingerprint stage has not run yet; fall back to identity.
        ctx.identity.as_deref().unwrap_or("unknown")
    } else {
        &ctx.fingerprint
    }
}

/// Assemble the standard stage order:
/// fingerprint -> blacklist -> size limit -> payload scan/sanitize ->
/// rate limit -> CSRF -> behavior -> lockout.
pub struct PipelineBuilder {
    pub settings: Arc<Settings>,
    pub blacklist: Arc<BlacklistManager>,
    pub scanner: Arc<RiskScanner>,
    pub sanitizer: Arc<Sanitizer>,
    pub rate_limiter: Arc<RateLimiter>,
    pub reputation: Arc<ReputationTracker>,
    pub csrf: Arc<CsrfTokenManager>,
    pub behavior: Arc<BehaviorAnalyzer>,
    pub lockout: Arc<LockoutRegistry>,
    pub audit: Arc<AuditSink>,
}

impl PipelineBuilder {
    pub fn build(self) -> SecurityPipeline {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(FingerprintStage),
            Arc::new(BlacklistStage {
                blacklist: self.blacklist,
            }),
            Arc::new(SizeLimitStage {
                max_bytes: self.settings.server.max_body_bytes,
            }),
            Arc::new(PayloadStage {
                scanner: self.scanner,
                sanitizer: self.sanitizer,
                profile: Profile::from_name(&self.settings.scanner.sanitize_profile),
            }),
            Arc::new(RateLimitStage {
                limiter: self.rate_limiter,
                reputation: self.reputation.clone(),
            }),
            Arc::new(CsrfStage { csrf: self.csrf }),
            Arc::new(BehaviorStage {
                behavior: self.behavior,
                reputation: self.reputation,
                audit: self.audit.clone(),
            }),
            Arc::new(LockoutStage {
                lockout: self.lockout,
            }),
        ];
        SecurityPipeline::new(stages, self.audit)
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Derives the request and session fingerprints. Pure; cannot reject.
struct FingerprintStage;

impl Stage for FingerprintStage {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        ctx.fingerprint =
            fingerprint::request_fingerprint(ctx.client_ip, &ctx.headers, &ctx.method, &ctx.path);
        ctx.session_key = fingerprint::session_fingerprint(ctx.client_ip, &ctx.headers);
        Ok(StageOutcome::Pass)
    }
}

/// Rejects addresses on the block list.
struct BlacklistStage {
    blacklist: Arc<BlacklistManager>,
}

impl Stage for BlacklistStage {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        if let Some(reason) = self.blacklist.is_blocked(&ctx.client_ip) {
            debug!(ip = %ctx.client_ip, reason = %reason, "Blocked by blacklist");
            return Ok(StageOutcome::Reject(Rejection::new(
                RejectCode::IpBlacklisted,
                "Request blocked for security reasons",
            )));
        }
        Ok(StageOutcome::Pass)
    }
}

/// Rejects oversized requests before any body inspection.
struct SizeLimitStage {
    max_bytes: u64,
}

impl Stage for SizeLimitStage {
    fn name(&self) -> &'static str {
        "size_limit"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        if ctx.content_length > self.max_bytes {
            return Ok(StageOutcome::Reject(Rejection::new(
                RejectCode::RequestTooLarge,
                "Request too large",
            )));
        }
        Ok(StageOutcome::Pass)
    }
}

/// Scores the payload for injection patterns; rejects outright above the
/// block threshold, otherwise replaces the body with its sanitized form.
struct PayloadStage {
    scanner: Arc<RiskScanner>,
    sanitizer: Arc<Sanitizer>,
    profile: Profile,
}

impl Stage for PayloadStage {
    fn name(&self) -> &'static str {
        "payload_scan"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        let mut score = self.scanner.score_str(&ctx.path);
        for value in ctx.query.values() {
            score += self.scanner.score_str(value);
        }
        if let Some(body) = &ctx.body {
            score += self.scanner.score_value(body);
        }

        if self.scanner.is_malicious(score) {
            debug!(ip = %ctx.client_ip, score = score, "Malicious payload rejected");
            // Generic message only; which pattern tripped stays internal.
            return Ok(StageOutcome::Reject(Rejection::new(
                RejectCode::MaliciousPayloadDetected,
                "Request contains disallowed content",
            )));
        }

        if let Some(body) = ctx.body.take() {
            ctx.body = Some(self.sanitizer.sanitize_value(&body, self.profile));
        }
        Ok(StageOutcome::Pass)
    }
}

/// Fixed-window rate limiting with reputation-tiered ceilings.
struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    reputation: Arc<ReputationTracker>,
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        if let Some(violation) = self.limiter.check(ctx) {
            // Address reputation only reflects anonymous abuse; an
            // authenticated caller is already constrained by its
            // identity-scoped buckets.
            if ctx.identity.is_none() {
                self.reputation.record_violation(&ctx.client_ip);
            }
            return Ok(StageOutcome::Reject(
                Rejection::new(RejectCode::RateLimitExceeded, "Too many requests")
                    .with_retry_after(violation.retry_after_secs),
            ));
        }
        Ok(StageOutcome::Pass)
    }
}

/// Anti-forgery token validation for mutating requests.
struct CsrfStage {
    csrf: Arc<CsrfTokenManager>,
}

impl Stage for CsrfStage {
    fn name(&self) -> &'static str {
        "csrf"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        if self.csrf.is_exempt(&ctx.path) {
            return Ok(StageOutcome::Pass);
        }

        if !ctx.is_mutating() {
            // Safe methods mint (or reuse) the token; the gateway echoes
            // it via cookie and header.
            ctx.issued_csrf = Some(self.csrf.issue_or_reuse(&ctx.session_key));
            return Ok(StageOutcome::Pass);
        }

        if self.csrf.uses_double_submit(&ctx.path) {
            let cookie = ctx.cookies.get(self.csrf.cookie_name()).cloned();
            let header = ctx.header(self.csrf.header_name()).map(str::to_string);
            return Ok(match (cookie, header) {
                (Some(c), Some(h)) if self.csrf.double_submit_check(&c, &h) => StageOutcome::Pass,
                (None, _) | (_, None) => StageOutcome::Reject(Rejection::new(
                    RejectCode::CsrfTokenMissing,
                    "CSRF token required",
                )),
                _ => StageOutcome::Reject(Rejection::new(
                    RejectCode::CsrfTokenInvalid,
                    "CSRF token invalid",
                )),
            });
        }

        match self.csrf.validate(&ctx.session_key, ctx) {
            CsrfOutcome::Valid { rotated } => {
                ctx.issued_csrf = Some(rotated);
                Ok(StageOutcome::Pass)
            }
            CsrfOutcome::Missing => Ok(StageOutcome::Reject(Rejection::new(
                RejectCode::CsrfTokenMissing,
                "CSRF token required",
            ))),
            CsrfOutcome::Invalid => Ok(StageOutcome::Reject(Rejection::new(
                RejectCode::CsrfTokenInvalid,
                "CSRF token invalid",
            ))),
        }
    }
}

/// Sliding-window anomaly detection per fingerprint.
struct BehaviorStage {
    behavior: Arc<BehaviorAnalyzer>,
    reputation: Arc<ReputationTracker>,
    audit: Arc<AuditSink>,
}

impl Stage for BehaviorStage {
    fn name(&self) -> &'static str {
        "behavior"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        let observation = self.behavior.observe(&ctx.fingerprint, &ctx.path, &ctx.method);

        for anomaly in &observation.anomalies {
            self.audit.log_event(
                &anomaly.to_string(),
                &ctx.fingerprint,
                json!({
                    "ip": ctx.client_ip.to_string(),
                    "path": ctx.path.as_str(),
                    "suspicious_activity": observation.suspicious_activity,
                }),
            );
        }

        if observation.should_block {
            if ctx.identity.is_none() {
                self.reputation.record_violation(&ctx.client_ip);
            }
            return Ok(StageOutcome::Reject(Rejection::new(
                RejectCode::AnomalyDetected,
                "Abnormal activity detected",
            )));
        }
        Ok(StageOutcome::Pass)
    }
}

/// Rejects attempts against locked accounts on authentication routes.
struct LockoutStage {
    lockout: Arc<LockoutRegistry>,
}

impl Stage for LockoutStage {
    fn name(&self) -> &'static str {
        "lockout"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
        if ctx.route_class != RouteClass::Auth {
            return Ok(StageOutcome::Pass);
        }

        let identifier = crate::security::lockout::account_identifier(ctx);
        if let Some(remaining) = self.lockout.check(&identifier) {
            let minutes = (remaining.as_secs() + 59) / 60;
            return Ok(StageOutcome::Reject(
                Rejection::new(
                    RejectCode::AccountLocked,
                    format!("Account locked. Try again in {} minute(s)", minutes),
                )
                .with_retry_after(remaining.as_secs()),
            ));
        }
        Ok(StageOutcome::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;
    use crate::storage::counter::CounterStore;
    use crate::storage::memory::MemoryKv;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn build_pipeline(settings: Arc<Settings>) -> (SecurityPipeline, Arc<AuditSink>, Arc<BlacklistManager>) {
        let store = Arc::new(CounterStore::new(None, Arc::new(MemoryKv::new())));
        let reputation = Arc::new(ReputationTracker::new(store.clone(), &settings.reputation));
        let audit = Arc::new(AuditSink::new(None, &settings.audit));
        let blacklist = Arc::new(BlacklistManager::new(
            None,
            Duration::from_secs(settings.blacklist.default_ttl_secs),
        ));

        let pipeline = PipelineBuilder {
            settings: settings.clone(),
            blacklist: blacklist.clone(),
            scanner: Arc::new(RiskScanner::new(&settings.scanner)),
            sanitizer: Arc::new(Sanitizer::new()),
            rate_limiter: Arc::new(RateLimiter::new(
                store.clone(),
                reputation.clone(),
                &settings.rate_limits,
            )),
            reputation,
            csrf: Arc::new(CsrfTokenManager::new(&settings.csrf)),
            behavior: Arc::new(BehaviorAnalyzer::new(&settings.behavior)),
            lockout: Arc::new(LockoutRegistry::new(&settings.lockout)),
            audit: audit.clone(),
        }
        .build();

        (pipeline, audit, blacklist)
    }

    fn get_ctx(ip: &str, path: &str) -> RequestContext {
        RequestContext::new(ip.parse::<IpAddr>().unwrap(), "GET".to_string(), path.to_string())
    }

    #[test]
    fn test_clean_get_passes_and_issues_csrf() {
        let (pipeline, _, _) = build_pipeline(settings());
        let mut ctx = get_ctx("203.0.113.40", "/api/items");
        let decision = pipeline.process(&mut ctx);
        assert!(decision.is_pass());
        assert!(!ctx.fingerprint.is_empty());
        assert!(ctx.issued_csrf.is_some());
    }

    #[test]
    fn test_blacklisted_ip_short_circuits() {
        let (pipeline, audit, blacklist) = build_pipeline(settings());
        blacklist.add("203.0.113.41", "manual", None).unwrap();

        let mut ctx = get_ctx("203.0.113.41", "/api/items");
        match pipeline.process(&mut ctx) {
            Decision::Reject(r) => assert_eq!(r.code, RejectCode::IpBlacklisted),
            Decision::Pass => panic!("blacklisted IP must be rejected"),
        }
        // Short-circuit before the CSRF stage: no token was issued.
        assert!(ctx.issued_csrf.is_none());
        assert_eq!(audit.count_events("IP_BLACKLISTED", 1), 1);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let (pipeline, _, _) = build_pipeline(settings());
        let mut ctx = get_ctx("203.0.113.42", "/api/items");
        ctx.content_length = 100 * 1024 * 1024;
        match pipeline.process(&mut ctx) {
            Decision::Reject(r) => {
                assert_eq!(r.code, RejectCode::RequestTooLarge);
                assert_eq!(r.status(), 413);
            }
            Decision::Pass => panic!("oversized request must be rejected"),
        }
    }

    #[test]
    fn test_malicious_payload_rejected_before_rate_limit() {
        let (pipeline, audit, _) = build_pipeline(settings());
        let mut ctx = get_ctx("203.0.113.43", "/api/items");
        ctx.body = Some(serde_json::json!({
            "comment": "<script>document.cookie</script>"
        }));
        match pipeline.process(&mut ctx) {
            Decision::Reject(r) => {
                assert_eq!(r.code, RejectCode::MaliciousPayloadDetected);
                assert_eq!(r.status(), 400);
                // The message must not leak which pattern matched.
                assert!(!r.message.contains("script"));
            }
            Decision::Pass => panic!("script payload must be rejected"),
        }
        assert_eq!(audit.count_events("MALICIOUS_PAYLOAD_DETECTED", 1), 1);
    }

    #[test]
    fn test_benign_payload_is_sanitized_in_place() {
        let (pipeline, _, _) = build_pipeline(settings());
        let mut ctx = get_ctx("203.0.113.44", "/api/items");
        ctx.body = Some(serde_json::json!({ "bio": "<b>hello</b>" }));
        assert!(pipeline.process(&mut ctx).is_pass());
        assert_eq!(ctx.body.unwrap()["bio"], "hello");
    }

    #[test]
    fn test_mutating_request_without_token_rejected() {
        let (pipeline, _, _) = build_pipeline(settings());
        let mut ctx = get_ctx("203.0.113.45", "/api/items");
        ctx.method = "POST".to_string();
        match pipeline.process(&mut ctx) {
            Decision::Reject(r) => assert_eq!(r.code, RejectCode::CsrfTokenMissing),
            Decision::Pass => panic!("token-less mutation must be rejected"),
        }
    }

    #[test]
    fn test_csrf_token_roundtrip_through_pipeline() {
        let (pipeline, _, _) = build_pipeline(settings());

        // GET issues the token for the session.
        let mut get = get_ctx("203.0.113.46", "/api/items");
        assert!(pipeline.process(&mut get).is_pass());
        let token = get.issued_csrf.expect("GET must issue a token");

        // The following mutation with that token passes and rotates it.
        let mut post = get_ctx("203.0.113.46", "/api/items");
        post.method = "POST".to_string();
        post.headers.insert("x-csrf-token".to_string(), token.clone());
        assert!(pipeline.process(&mut post).is_pass());
        let rotated = post.issued_csrf.expect("validation must rotate");
        assert_ne!(rotated, token);

        // Replaying the consumed token fails.
        let mut replay = get_ctx("203.0.113.46", "/api/items");
        replay.method = "POST".to_string();
        replay.headers.insert("x-csrf-token".to_string(), token);
        match pipeline.process(&mut replay) {
            Decision::Reject(r) => assert_eq!(r.code, RejectCode::CsrfTokenInvalid),
            Decision::Pass => panic!("replayed token must be rejected"),
        }
    }

    #[test]
    fn test_rate_limit_rejection_carries_retry_after() {
        let mut settings = Settings::default();
        settings.rate_limits.strict.window_secs = 900;
        settings.rate_limits.strict.max = 5;
        let (pipeline, audit, _) = build_pipeline(Arc::new(settings));

        for _ in 0..5 {
            let mut ctx = get_ctx("203.0.113.47", "/api/auth/login");
            assert!(pipeline.process(&mut ctx).is_pass());
        }
        let mut ctx = get_ctx("203.0.113.47", "/api/auth/login");
        match pipeline.process(&mut ctx) {
            Decision::Reject(r) => {
                assert_eq!(r.code, RejectCode::RateLimitExceeded);
                assert_eq!(r.status(), 429);
                let retry = r.retry_after.expect("retry hint required");
                assert!(retry > 0 && retry <= 900);
            }
            Decision::Pass => panic!("6th request must be rejected"),
        }
        assert_eq!(audit.count_events("RATE_LIMIT_EXCEEDED", 1), 1);
    }

    #[test]
    fn test_locked_account_rejected_on_auth_route() {
        let settings = settings();
        let store = Arc::new(CounterStore::new(None, Arc::new(MemoryKv::new())));
        let reputation = Arc::new(ReputationTracker::new(store.clone(), &settings.reputation));
        let audit = Arc::new(AuditSink::new(None, &settings.audit));
        let lockout = Arc::new(LockoutRegistry::new(&settings.lockout));

        let pipeline = PipelineBuilder {
            settings: settings.clone(),
            blacklist: Arc::new(BlacklistManager::new(None, Duration::from_secs(60))),
            scanner: Arc::new(RiskScanner::new(&settings.scanner)),
            sanitizer: Arc::new(Sanitizer::new()),
            rate_limiter: Arc::new(RateLimiter::new(
                store.clone(),
                reputation.clone(),
                &settings.rate_limits,
            )),
            reputation,
            csrf: Arc::new(CsrfTokenManager::new(&settings.csrf)),
            behavior: Arc::new(BehaviorAnalyzer::new(&settings.behavior)),
            lockout: lockout.clone(),
            audit,
        }
        .build();

        for _ in 0..5 {
            lockout.record_failure("victim@example.com");
        }

        // Login path is CSRF-exempt, so the lockout stage is reached.
        let mut ctx = get_ctx("203.0.113.48", "/api/auth/login");
        ctx.method = "POST".to_string();
        ctx.body = Some(serde_json::json!({ "email": "victim@example.com" }));
        match pipeline.process(&mut ctx) {
            Decision::Reject(r) => {
                assert_eq!(r.code, RejectCode::AccountLocked);
                assert_eq!(r.status(), 401);
                assert!(r.retry_after.is_some());
            }
            Decision::Pass => panic!("locked account must be rejected"),
        }
    }

    #[test]
    fn test_failing_stage_fails_open() {
        struct BrokenStage;
        impl Stage for BrokenStage {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn evaluate(&self, _ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
                anyhow::bail!("backing service unreachable")
            }
        }

        let settings = settings();
        let audit = Arc::new(AuditSink::new(None, &settings.audit));
        let pipeline = SecurityPipeline::new(vec![Arc::new(BrokenStage)], audit.clone());

        let mut ctx = get_ctx("203.0.113.49", "/api/items");
        assert!(pipeline.process(&mut ctx).is_pass());
        assert_eq!(audit.count_events("AUDIT_ERROR", 1), 1);
    }

    #[test]
    fn test_no_stage_runs_after_rejection() {
        struct AlwaysReject;
        impl Stage for AlwaysReject {
            fn name(&self) -> &'static str {
                "always_reject"
            }
            fn evaluate(&self, _ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
                Ok(StageOutcome::Reject(Rejection::new(
                    RejectCode::IpBlacklisted,
                    "no",
                )))
            }
        }

        struct CountingStage(Arc<AtomicUsize>);
        impl Stage for CountingStage {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn evaluate(&self, _ctx: &mut RequestContext) -> anyhow::Result<StageOutcome> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(StageOutcome::Pass)
            }
        }

        let settings = settings();
        let audit = Arc::new(AuditSink::new(None, &settings.audit));
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = SecurityPipeline::new(
            vec![
                Arc::new(AlwaysReject),
                Arc::new(CountingStage(counter.clone())),
            ],
            audit,
        );

        let mut ctx = get_ctx("203.0.113.50", "/api/items");
        assert!(!pipeline.process(&mut ctx).is_pass());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

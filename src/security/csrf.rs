use std::time::{Duration, Instant};

use base64::Engine;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tracing::debug;

use crate::config::settings::CsrfConfig;
use crate::models::request::RequestContext;

type HmacSha256 = Hmac<Sha256>;

/// Result of validating a mutating request's token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrfOutcome {
    /// Token matched; carries the rotated replacement to echo back.
    Valid { rotated: String },
    Missing,
    Invalid,
}

#[derive(Debug, Clone)]
struct TokenRecord {
    token: String,
    expires_at: Instant,
}

/// Per-session anti-forgery token manager.
///
/// Safe methods mint a token (or reuse the unexpired one) for the
/// session key; unsafe methods must present it via header, body, or
/// query. A successful validation immediately rotates the record, so
/// tokens are single-use per mutation. A stateless double-submit-cookie
/// variant is available for routes that do not need the server-side
/// store.
pub struct CsrfTokenManager {
    tokens: DashMap<String, TokenRecord>,
    config: CsrfConfig,
}

impl CsrfTokenManager {
    pub fn new(config: &CsrfConfig) -> Self {
        Self {
            tokens: DashMap::new(),
            config: config.clone(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config.exempt_paths.iter().any(|p| p == path)
    }

    pub fn uses_double_submit(&self, path: &str) -> bool {
        self.config
            .double_submit_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    /// Mint a token for `key`, or return the existing unexpired one.
    /// Called on safe (read-only) requests.
    pub fn issue_or_reuse(&self, key: &str) -> String {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        let mut record = self
            .tokens
            .entry(key.to_string())
            .or_insert_with(|| TokenRecord {
                token: generate_token(),
                expires_at: Instant::now() + ttl,
            });

        if Instant::now() >= record.expires_at {
            record.token = generate_token();
            record.expires_at = Instant::now() + ttl;
            debug!(key = key, "Expired token replaced");
        }

        record.token.clone()
    }

    /// Validate the token supplied with a mutating request and rotate it
    /// on success. Lookup order: header, then body, then query.
    pub fn validate(&self, key: &str, ctx: &RequestContext) -> CsrfOutcome {
        let supplied = match self.extract_token(ctx) {
            Some(t) => t,
            None => return CsrfOutcome::Missing,
        };

        let matches = match self.tokens.get(key) {
            Some(record) if Instant::now() < record.expires_at => {
                constant_time_eq(record.token.as_bytes(), supplied.as_bytes())
            }
            _ => false,
        };

        if !matches {
            return CsrfOutcome::Invalid;
        }

        // Single-use per mutation: overwrite the record immediately.
        let rotated = generate_token();
        self.tokens.insert(
            key.to_string(),
            TokenRecord {
                token: rotated.clone(),
                expires_at: Instant::now() + Duration::from_secs(self.config.ttl_secs),
            },
        );
        CsrfOutcome::Valid { rotated }
    }

    /// Stateless double-submit check: the cookie carries
    /// `value.signature`; the header must echo `value` and the signature
    /// must verify. No server-side record is consulted.
    pub fn double_submit_check(&self, cookie_value: &str, header_value: &str) -> bool {
        let Some((value, signature)) = cookie_value.rsplit_once('.') else {
            return false;
        };
        if !constant_time_eq(value.as_bytes(), header_value.as_bytes()) {
            return false;
        }
        constant_time_eq(self.sign(value).as_bytes(), signature.as_bytes())
    }

    /// Build a signed double-submit cookie value.
    pub fn double_submit_cookie(&self) -> String {
        let value = generate_token();
        let signature = self.sign(&value);
        format!("{}.{}", value, signature)
    }

    /// Evict expired token records; called from the cleanup task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.tokens.retain(|_, r| now < r.expires_at);
    }

    fn extract_token<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        if let Some(token) = ctx.header(&self.config.header_name) {
            return Some(token);
        }
        if let Some(token) = ctx
            .body
            .as_ref()
            .and_then(|b| b.get("_csrf"))
            .and_then(|v| v.as_str())
        {
            return Some(token);
        }
        ctx.query.get("_csrf").map(|s| s.as_str())
    }

    fn sign(&self, value: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(value.as_bytes());
        let result = mac.finalize().into_bytes();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result)
    }
}

/// 32 random bytes, base64url: comfortably past the 128-bit floor.
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time byte comparison so token validation leaks no timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults;

    fn manager() -> CsrfTokenManager {
        CsrfTokenManager::new(&defaults::default_csrf_config())
    }

    fn mutating_ctx(token: Option<&str>) -> RequestContext {
        let mut ctx = RequestContext::new(
            "203.0.113.30".parse().unwrap(),
            "POST".to_string(),
            "/api/items".to_string(),
        );
        if let Some(t) = token {
            ctx.headers.insert("x-csrf-token".to_string(), t.to_string());
        }
        ctx
    }

    #[test]
    fn test_issue_then_reuse_is_stable() {
        let m = manager();
        let a = m.issue_or_reuse("sess-1");
        let b = m.issue_or_reuse("sess-1");
        assert_eq!(a, b);
        assert!(a.len() >= 43); // 32 bytes base64url
    }

    #[test]
    fn test_token_validates_exactly_once() {
        let m = manager();
        let token = m.issue_or_reuse("sess-1");

        let first = m.validate("sess-1", &mutating_ctx(Some(&token)));
        let rotated = match first {
            CsrfOutcome::Valid { rotated } => rotated,
            other => panic!("expected valid, got {:?}", other),
        };
        assert_ne!(rotated, token);

        // Reusing the consumed token must fail post-rotation.
        assert_eq!(
            m.validate("sess-1", &mutating_ctx(Some(&token))),
            CsrfOutcome::Invalid
        );

        // The rotated token is the one that now validates.
        assert!(matches!(
            m.validate("sess-1", &mutating_ctx(Some(&rotated))),
            CsrfOutcome::Valid { .. }
        ));
    }

    #[test]
    fn test_missing_token_is_distinguished() {
        let m = manager();
        m.issue_or_reuse("sess-1");
        assert_eq!(
            m.validate("sess-1", &mutating_ctx(None)),
            CsrfOutcome::Missing
        );
    }

    #[test]
    fn test_body_and_query_fallbacks() {
        let m = manager();
        let token = m.issue_or_reuse("sess-1");

        let mut ctx = mutating_ctx(None);
        ctx.body = Some(serde_json::json!({ "_csrf": token }));
        assert!(matches!(
            m.validate("sess-1", &ctx),
            CsrfOutcome::Valid { .. }
        ));

        let token = m.issue_or_reuse("sess-1");
        let mut ctx = mutating_ctx(None);
        ctx.query.insert("_csrf".to_string(), token);
        assert!(matches!(
            m.validate("sess-1", &ctx),
            CsrfOutcome::Valid { .. }
        ));
    }

    #[test]
    fn test_tokens_are_scoped_per_key() {
        let m = manager();
        let token = m.issue_or_reuse("sess-1");
        assert_eq!(
            m.validate("sess-2", &mutating_ctx(Some(&token))),
            CsrfOutcome::Invalid
        );
    }

    #[test]
    fn test_double_submit_roundtrip() {
        let m = manager();
        let cookie = m.double_submit_cookie();
        let value = cookie.rsplit_once('.').unwrap().0;
        assert!(m.double_submit_check(&cookie, value));
        assert!(!m.double_submit_check(&cookie, "different-value"));
        assert!(!m.double_submit_check("forged.signature", "forged"));
    }

    #[test]
    fn test_exempt_paths() {
        let m = manager();
        assert!(m.is_exempt("/api/auth/login"));
        assert!(!m.is_exempt("/api/items"));
    }
}

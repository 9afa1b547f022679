use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

/// Coarse request classification used to select the stage set and the
/// applicable rate-limit policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Ordinary application traffic.
    General,
    /// Authentication endpoints (login, register, password reset).
    Auth,
}

/// Mutable per-request state carried through the security pipeline.
///
/// Built once by the gateway from the raw HTTP request; stages may refine
/// it (fingerprint, sanitized payload, freshly issued CSRF token) but never
/// replace it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Resolved client address (x-forwarded-for / x-real-ip aware).
    pub client_ip: IpAddr,

    /// Authenticated identity attached earlier in the chain, if any.
    pub identity: Option<String>,

    /// Roles attached to the identity (used for rate-limit exemptions).
    pub roles: Vec<String>,

    pub method: String,

    pub path: String,

    /// Parsed query parameters.
    pub query: HashMap<String, String>,

    /// Lowercase header name -> value.
    pub headers: HashMap<String, String>,

    /// Parsed request cookies.
    pub cookies: HashMap<String, String>,

    /// Declared request body size in bytes.
    pub content_length: u64,

    /// Parsed JSON payload, if the request carried one. The payload stage
    /// replaces this with its sanitized form.
    pub body: Option<serde_json::Value>,

    /// Full request fingerprint; set by the fingerprint stage.
    pub fingerprint: String,

    /// Narrow session fingerprint used as the CSRF token key.
    pub session_key: String,

    pub route_class: RouteClass,

    /// Token minted or rotated during this request, echoed in the response.
    pub issued_csrf: Option<String>,

    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(client_ip: IpAddr, method: String, path: String) -> Self {
        let route_class = classify_route(&path);
        Self {
            client_ip,
            identity: None,
            roles: Vec::new(),
            method,
            path,
            query: HashMap::new(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            content_length: 0,
            body: None,
            fingerprint: String::new(),
            session_key: String::new(),
            route_class,
            issued_csrf: None,
            received_at: Instant::now(),
        }
    }

    /// State-changing methods require CSRF validation.
    pub fn is_mutating(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
    }

    /// Identity-or-address key for rate-limit buckets.
    pub fn client_key(&self) -> String {
        match &self.identity {
            Some(id) => id.clone(),
            None => self.client_ip.to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Map a path onto its route class.
fn classify_route(path: &str) -> RouteClass {
    if path.starts_with("/api/auth/") || path == "/api/auth" {
        RouteClass::Auth
    } else {
        RouteClass::General
    }
}

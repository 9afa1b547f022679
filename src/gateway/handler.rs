use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response};
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::sink::{AuditSink, KIND_REQUEST_LOG};
use crate::config::settings::Settings;
use crate::models::decision::{Decision, RejectCode, Rejection};
use crate::models::request::{RequestContext, RouteClass};
use crate::security::csrf::CsrfTokenManager;
use crate::security::lockout::{account_identifier, LockoutRegistry};
use crate::security::pipeline::SecurityPipeline;
use crate::security::reputation::ReputationTracker;
use crate::security::sanitizer::{Profile, Sanitizer};

/// Response produced by the business handler behind the pipeline.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl HandlerResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: Bytes::from(body.to_string()),
        }
    }
}

/// The business request handler invoked only when every stage passes.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &RequestContext) -> HandlerResponse;
}

/// Core HTTP entry point of the gateway.
///
/// For every inbound request the gateway:
///
/// 1. Extracts metadata (client IP, headers, cookies, query, body).
/// 2. Constructs a [`RequestContext`].
/// 3. Runs the pre-handler [`SecurityPipeline`].
/// 4. Invokes the business [`Handler`] on pass, or renders the rejection.
/// 5. Runs the explicit post-handler transform: outbound sanitization,
///    security headers, CSRF token echo, lockout bookkeeping.
pub struct HttpGateway {
    pipeline: Arc<SecurityPipeline>,
    handler: Arc<dyn Handler>,
    csrf: Arc<CsrfTokenManager>,
    sanitizer: Arc<Sanitizer>,
    lockout: Arc<LockoutRegistry>,
    reputation: Arc<ReputationTracker>,
    audit: Arc<AuditSink>,
    settings: Arc<Settings>,
}

impl HttpGateway {
    pub fn new(
        pipeline: Arc<SecurityPipeline>,
        handler: Arc<dyn Handler>,
        csrf: Arc<CsrfTokenManager>,
        sanitizer: Arc<Sanitizer>,
        lockout: Arc<LockoutRegistry>,
        reputation: Arc<ReputationTracker>,
        audit: Arc<AuditSink>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            pipeline,
            handler,
            csrf,
            sanitizer,
            lockout,
            reputation,
            audit,
            settings,
        }
    }

    /// Process a single inbound HTTP request end-to-end.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer_ip: IpAddr,
    ) -> Response<Full<Bytes>> {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let query = parse_query(req.uri().query());

        let headers: HashMap<String, String> = req
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_lowercase(),
                    v.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let client_ip = resolve_client_ip(&headers, peer_ip);
        let cookies = parse_cookies(headers.get("cookie").map(|s| s.as_str()));
        let content_length: u64 = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        debug!(
            client_ip = %client_ip,
            method = %method,
            path = %path,
            "Incoming request"
        );

        // --- Read the body, hard-capped at the configured limit ---
        let max_body = self.settings.server.max_body_bytes as usize;
        let body_bytes = match Limited::new(req.into_body(), max_body).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => {
                let rejection =
                    Rejection::new(RejectCode::RequestTooLarge, "Request too large");
                self.audit.log_event(
                    rejection.code.as_str(),
                    &client_ip.to_string(),
                    json!({ "path": path.as_str(), "declared_length": content_length }),
                );
                return self.rejection_response(&rejection);
            }
        };

        let is_json = headers
            .get("content-type")
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        let body = if is_json && !body_bytes.is_empty() {
            match serde_json::from_slice(&body_bytes) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(client_ip = %client_ip, path = %path, "Invalid JSON payload");
                    return plain_error_response(400, "Invalid JSON payload");
                }
            }
        } else {
            None
        };

        // --- Build the context ---
        let mut ctx = RequestContext::new(client_ip, method, path);
        ctx.query = query;
        ctx.cookies = cookies;
        ctx.identity = headers.get("x-identity").cloned().filter(|s| !s.is_empty());
        ctx.roles = headers
            .get("x-identity-roles")
            .map(|v| v.split(',').map(|r| r.trim().to_string()).collect())
            .unwrap_or_default();
        ctx.headers = headers;
        ctx.content_length = content_length.max(body_bytes.len() as u64);
        ctx.body = body;

        // --- Pre-handler pipeline ---
        let decision = self.pipeline.process(&mut ctx);

        let response = match decision {
            Decision::Reject(rejection) => {
                // Lockout bookkeeping is response-driven; locked rejections
                // deliberately do not count as attempts.
                return self.finalize(self.rejection_response(&rejection), &ctx);
            }
            Decision::Pass => self.handler.handle(&ctx),
        };

        if ctx.route_class == RouteClass::Auth {
            self.track_auth_outcome(&ctx, response.status);
            self.audit.log_event(
                KIND_REQUEST_LOG,
                &ctx.fingerprint,
                json!({
                    "method": ctx.method.as_str(),
                    "path": ctx.path.as_str(),
                    "status": response.status,
                }),
            );
        }

        if (200..300).contains(&response.status) {
            self.reputation.record_pass(&ctx.client_ip);
        }

        // --- Post-handler transform ---
        let response = self.sanitize_outbound(response);
        self.finalize(self.render(response), &ctx)
    }

    /// Auth endpoints drive the lockout state machine from the handler's
    /// verdict: a success clears the record, a 401 counts as a failure.
    fn track_auth_outcome(&self, ctx: &RequestContext, status: u16) {
        let identifier = account_identifier(ctx);
        if (200..300).contains(&status) {
            self.lockout.record_success(&identifier);
        } else if status == 401 {
            self.lockout.record_failure(&identifier);
        }
    }

    /// Reflected markup gets the same treatment as inbound payloads.
    fn sanitize_outbound(&self, response: HandlerResponse) -> HandlerResponse {
        if !response.content_type.starts_with("text/html") {
            return response;
        }
        match std::str::from_utf8(&response.body) {
            Ok(text) => {
                let cleaned = self.sanitizer.sanitize_str(text, Profile::Html);
                HandlerResponse {
                    body: Bytes::from(cleaned),
                    ..response
                }
            }
            Err(_) => response,
        }
    }

    fn render(&self, response: HandlerResponse) -> Response<Full<Bytes>> {
        Response::builder()
            .status(response.status)
            .header("content-type", response.content_type)
            .body(Full::new(response.body))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(Full::new(Bytes::from("internal error")));
                *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }

    /// Render a pipeline rejection as the stable JSON error shape.
    fn rejection_response(&self, rejection: &Rejection) -> Response<Full<Bytes>> {
        let mut body = json!({
            "error": rejection.message,
            "code": rejection.code.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(retry) = rejection.retry_after {
            body["retryAfter"] = json!(retry);
        }

        let mut builder = Response::builder()
            .status(rejection.status())
            .header("content-type", "application/json");
        if let Some(retry) = rejection.retry_after {
            builder = builder.header("retry-after", retry.to_string());
        }
        builder
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
    }

    /// Attach security headers and the CSRF token echo to every response.
    fn finalize(
        &self,
        mut response: Response<Full<Bytes>>,
        ctx: &RequestContext,
    ) -> Response<Full<Bytes>> {
        use hyper::header::HeaderValue;

        let headers = response.headers_mut();
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert(
            "referrer-policy",
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        if let Ok(id) = random_request_id().parse() {
            headers.insert("x-request-id", id);
        }

        if let Some(token) = &ctx.issued_csrf {
            if let Ok(value) = token.parse() {
                headers.insert(
                    hyper::header::HeaderName::from_bytes(self.csrf.header_name().as_bytes())
                        .unwrap_or(hyper::header::HeaderName::from_static("x-csrf-token")),
                    value,
                );
            }
            let cookie = format!(
                "{}={}; Path=/; Max-Age={}; SameSite=Strict",
                self.csrf.cookie_name(),
                token,
                self.settings.csrf.ttl_secs
            );
            if let Ok(value) = cookie.parse() {
                headers.append("set-cookie", value);
            }
        }

        response
    }
}

fn plain_error_response(status: u16, message: &str) -> Response<Full<Bytes>> {
    let body = json!({
        "error": message,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Honor proxy-provided client addresses before the socket peer.
fn resolve_client_ip(headers: &HashMap<String, String>, peer_ip: IpAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| headers.get("x-real-ip").map(|s| s.as_str()));

    forwarded
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or(peer_ip)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(query) = query else {
        return out;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => out.insert(k.to_string(), v.to_string()),
            None => out.insert(pair.to_string(), String::new()),
        };
    }
    out
}

fn parse_cookies(header: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(header) = header else {
        return out;
    };
    for cookie in header.split(';') {
        if let Some((name, value)) = cookie.trim().split_once('=') {
            out.insert(name.to_string(), value.to_string());
        }
    }
    out
}

fn random_request_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

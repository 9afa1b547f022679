use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::audit::sink::AuditSink;
use crate::storage::blacklist::BlacklistManager;
use crate::storage::counter::CounterStore;

/// Shared state for all admin handlers.
#[derive(Clone)]
pub struct AppState {
    pub audit: Arc<AuditSink>,
    pub blacklist: Arc<BlacklistManager>,
    pub counters: Arc<CounterStore>,
    pub start_time: Instant,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub since_hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddBlacklistRequest {
    /// Address or CIDR network.
    pub value: String,
    pub reason: Option<String>,
    pub ttl_secs: Option<u64>,
}

/// Service status and liveness.
pub async fn get_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "store_degraded": state.counters.is_degraded(),
        "blacklist_entries": state.blacklist.list().len(),
    }))
}

/// Aggregate event counts per kind over the trailing window.
pub async fn get_security_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Json<Value> {
    let since_hours = params.since_hours.unwrap_or(24);
    let mut stats = serde_json::Map::new();
    for kind in state.audit.known_kinds() {
        let count = state.audit.count_events(&kind, since_hours);
        stats.insert(kind, json!(count));
    }
    Json(json!({
        "since_hours": since_hours,
        "events": Value::Object(stats),
    }))
}

/// Most recent security events, newest first.
pub async fn get_recent_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Json<Value> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let events: Vec<Value> = state
        .audit
        .recent(limit)
        .into_iter()
        .map(|e| {
            json!({
                "kind": e.kind,
                "timestamp": e.timestamp.to_rfc3339(),
                "actor": e.actor,
                "details": e.details,
            })
        })
        .collect();
    Json(json!({ "events": events }))
}

/// Current blacklist entries.
pub async fn get_blacklist(State(state): State<AppState>) -> Json<Value> {
    let entries: Vec<Value> = state
        .blacklist
        .list()
        .into_iter()
        .map(|(value, reason)| json!({ "value": value, "reason": reason }))
        .collect();
    Json(json!({ "entries": entries }))
}

/// Add an address or CIDR to the blacklist.
pub async fn add_to_blacklist(
    State(state): State<AppState>,
    Json(req): Json<AddBlacklistRequest>,
) -> impl IntoResponse {
    let reason = req.reason.as_deref().unwrap_or("manual block");
    let ttl = req.ttl_secs.map(Duration::from_secs);

    match state.blacklist.add(&req.value, reason, ttl) {
        Ok(()) => {
            state.audit.log_event(
                "IP_BLACKLISTED",
                &req.value,
                json!({ "reason": reason, "source": "admin" }),
            );
            (StatusCode::CREATED, Json(json!({ "ok": true }))).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Remove a blacklist entry.
pub async fn remove_from_blacklist(
    State(state): State<AppState>,
    Path(value): Path<String>,
) -> Json<Value> {
    state.blacklist.remove(&value);
    state
        .audit
        .log_event("IP_UNBLACKLISTED", &value, json!({ "source": "admin" }));
    Json(json!({ "ok": true }))
}

mod admin_api;
mod audit;
mod config;
mod gateway;
mod models;
mod security;
mod storage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admin_api::routes::AppState;
use crate::admin_api::server::AdminApiServer;
use crate::audit::sink::AuditSink;
use crate::config::settings::Settings;
use crate::gateway::handler::{Handler, HandlerResponse, HttpGateway};
use crate::gateway::server::GatewayServer;
use crate::models::request::RequestContext;
use crate::security::behavior::BehaviorAnalyzer;
use crate::security::csrf::CsrfTokenManager;
use crate::security::lockout::LockoutRegistry;
use crate::security::pipeline::PipelineBuilder;
use crate::security::rate_limiter::RateLimiter;
use crate::security::reputation::ReputationTracker;
use crate::security::sanitizer::Sanitizer;
use crate::security::scanner::RiskScanner;
use crate::storage::blacklist::BlacklistManager;
use crate::storage::counter::CounterStore;
use crate::storage::kv::KvStore;
use crate::storage::memory::MemoryKv;
use crate::storage::sqlite::SqliteStore;

/// Parse the `--config` CLI flag. Defaults to `/etc/palisade/palisade.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from("/etc/palisade/palisade.toml");

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            if let Some(path) = args.get(i + 1) {
                config_path = path.clone();
            }
            i += 2;
        } else {
            i += 1;
        }
    }

    config_path
}

/// Initialise the `tracing` subscriber with stdout and a daily-rotated
/// file layer.
fn init_tracing(log_dir: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, "palisade.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,palisade=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

/// Background task that periodically evicts expired entries from every
/// self-expiring structure. Runs on its own timer, decoupled from
/// request handling.
async fn cleanup_loop(
    counters: Arc<CounterStore>,
    blacklist: Arc<BlacklistManager>,
    lockout: Arc<LockoutRegistry>,
    csrf: Arc<CsrfTokenManager>,
    behavior: Arc<BehaviorAnalyzer>,
    audit: Arc<AuditSink>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        counters.sweep_fallback();
        blacklist.cleanup();
        lockout.cleanup();
        csrf.cleanup();
        behavior.cleanup();
        audit.cleanup();
    }
}

/// Placeholder business handler: acknowledges the request once the
/// security envelope has passed it. Real deployments substitute their
/// application here.
struct EchoHandler;

impl Handler for EchoHandler {
    fn handle(&self, ctx: &RequestContext) -> HandlerResponse {
        HandlerResponse::json(
            200,
            json!({
                "ok": true,
                "method": ctx.method.as_str(),
                "path": ctx.path.as_str(),
            }),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let config_path = parse_config_path();
    let settings = match Settings::load(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Config not loaded ({}); using defaults", e);
            Settings::default()
        }
    };
    let settings = Arc::new(settings);

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    let _log_guard = init_tracing(&settings.logging.dir);

    info!("Starting Palisade security gateway");
    info!("Config loaded from {}", config_path);

    // ---------------------------------------------------------------
    // 3. Storage
    // ---------------------------------------------------------------
    let sqlite = match SqliteStore::new(
        &settings.storage.sqlite_path,
        Duration::from_millis(settings.storage.busy_timeout_ms),
    ) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            // Degraded but alive: the pipeline falls back to in-process
            // state and keeps serving.
            warn!(
                path = %settings.storage.sqlite_path,
                error = %e,
                "Durable store unavailable; running memory-only"
            );
            None
        }
    };

    let counters = Arc::new(CounterStore::new(
        sqlite.clone().map(|s| s as Arc<dyn KvStore>),
        Arc::new(MemoryKv::new()),
    ));

    let blacklist = Arc::new(BlacklistManager::new(
        sqlite.clone(),
        Duration::from_secs(settings.blacklist.default_ttl_secs),
    ));
    if let Err(e) = blacklist.load_from_db() {
        warn!("Failed to load blacklist from durable store: {}", e);
    }

    info!("Storage layer initialised");

    // ---------------------------------------------------------------
    // 4. Security components
    // ---------------------------------------------------------------
    let reputation = Arc::new(ReputationTracker::new(
        counters.clone(),
        &settings.reputation,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        counters.clone(),
        reputation.clone(),
        &settings.rate_limits,
    ));
    let scanner = Arc::new(RiskScanner::new(&settings.scanner));
    let sanitizer = Arc::new(Sanitizer::new());
    let csrf = Arc::new(CsrfTokenManager::new(&settings.csrf));
    let behavior = Arc::new(BehaviorAnalyzer::new(&settings.behavior));
    let lockout = Arc::new(LockoutRegistry::new(&settings.lockout));
    let audit = Arc::new(AuditSink::new(sqlite.clone(), &settings.audit));

    let pipeline = Arc::new(
        PipelineBuilder {
            settings: settings.clone(),
            blacklist: blacklist.clone(),
            scanner,
            sanitizer: sanitizer.clone(),
            rate_limiter,
            reputation: reputation.clone(),
            csrf: csrf.clone(),
            behavior: behavior.clone(),
            lockout: lockout.clone(),
            audit: audit.clone(),
        }
        .build(),
    );

    info!("Security pipeline initialised");

    // ---------------------------------------------------------------
    // 5. Gateway
    // ---------------------------------------------------------------
    let handler: Arc<dyn Handler> = Arc::new(EchoHandler);
    let http_gateway = Arc::new(HttpGateway::new(
        pipeline,
        handler,
        csrf.clone(),
        sanitizer,
        lockout.clone(),
        reputation,
        audit.clone(),
        settings.clone(),
    ));

    let gateway_server = GatewayServer::new(settings.clone(), http_gateway);

    // ---------------------------------------------------------------
    // 6. Admin API
    // ---------------------------------------------------------------
    let admin_state = AppState {
        audit: audit.clone(),
        blacklist: blacklist.clone(),
        counters: counters.clone(),
        start_time: Instant::now(),
        api_key: settings.admin_api.api_key.clone(),
    };
    let admin_server = AdminApiServer::new(admin_state, settings.admin_api.bind.clone());

    // ---------------------------------------------------------------
    // 7. Spawn everything
    // ---------------------------------------------------------------
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway_server.run().await {
            error!("Gateway server error: {}", e);
        }
    });

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!("Admin API server error: {}", e);
        }
    });

    let cleanup_handle = tokio::spawn(cleanup_loop(
        counters, blacklist, lockout, csrf, behavior, audit,
    ));

    info!("Palisade is running. Press Ctrl+C to shut down.");

    // ---------------------------------------------------------------
    // 8. Wait for shutdown signal
    // ---------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Shutting down Palisade...");

    gateway_handle.abort();
    admin_handle.abort();
    cleanup_handle.abort();

    info!("Palisade shut down gracefully");
    Ok(())
}

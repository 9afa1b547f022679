use axum::{
    middleware,
    routing::{delete, get},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::admin_api::routes::AppState;
use crate::admin_api::{auth, routes};

/// Admin-facing query/command API: blacklist management, aggregate
/// security stats, recent events.
pub struct AdminApiServer {
    state: AppState,
    bind_addr: String,
}

impl AdminApiServer {
    pub fn new(state: AppState, bind_addr: String) -> Self {
        Self { state, bind_addr }
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let state = self.state.clone();
        let api_key = state.api_key.clone();

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/api/status", get(routes::get_status))
            .route("/api/security/stats", get(routes::get_security_stats))
            .route("/api/security/events", get(routes::get_recent_events))
            .route(
                "/api/blacklist",
                get(routes::get_blacklist).post(routes::add_to_blacklist),
            )
            .route("/api/blacklist/{value}", delete(routes::remove_from_blacklist))
            .layer(middleware::from_fn_with_state(
                api_key,
                auth::auth_middleware,
            ))
            .layer(cors)
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!("Admin API listening on {}", self.bind_addr);
        axum::serve(listener, app).await?;

        Ok(())
    }
}

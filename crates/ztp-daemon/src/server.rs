//! Web server setup and routing

use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/discovery",
            get(api::get_discovery).post(api::run_discovery),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server until it fails
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting web server");
    axum::serve(listener, app).await?;
    Ok(())
}

//! Router assembly and server startup.

use anyhow::Result;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::web::{handlers, AppState};

pub async fn start_web_server(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router(state: AppState) -> Router {
    Router::new()
        // === HOSTS ===
        .route(
            "/api/hosts",
            get(handlers::list_hosts).post(handlers::create_host),
        )
        .route(
            "/api/hosts/{host_id}",
            get(handlers::get_host)
                .put(handlers::update_host)
                .delete(handlers::delete_host),
        )
        .route("/api/hosts/{host_id}/status", get(handlers::host_status))
        // === OPERATIONS ===
        .route("/api/hosts/check-all", post(handlers::start_check_all))
        .route(
            "/api/hosts/upgrade-all",
            post(handlers::start_upgrade_all_hosts),
        )
        .route("/api/hosts/{host_id}/check", post(handlers::start_check))
        .route("/api/hosts/{host_id}/upgrade", post(handlers::start_upgrade))
        .route(
            "/api/hosts/{host_id}/full-upgrade",
            post(handlers::start_full_upgrade),
        )
        .route(
            "/api/hosts/{host_id}/packages/{package}/upgrade",
            post(handlers::start_package_upgrade),
        )
        .route("/api/hosts/{host_id}/reboot", post(handlers::start_reboot))
        .route("/api/jobs/{job_id}", get(handlers::get_job))
        // === UPDATES AND HISTORY ===
        .route("/api/updates", get(handlers::all_updates))
        .route("/api/hosts/{host_id}/updates", get(handlers::host_updates))
        .route("/api/hosts/{host_id}/history", get(handlers::host_history))
        // === NOTIFICATION CHANNELS ===
        .route(
            "/api/channels",
            get(handlers::list_channels).post(handlers::create_channel),
        )
        .route(
            "/api/channels/{channel_id}",
            put(handlers::update_channel).delete(handlers::delete_channel),
        )
        .route(
            "/api/channels/{channel_id}/test",
            post(handlers::test_channel),
        )
        // === LIVE OUTPUT ===
        .route("/api/hosts/{host_id}/live", get(handlers::live_output))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

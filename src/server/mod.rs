pub mod admin;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::state::App;

pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/v1/models", get(handlers::handle_list_models))
        .route("/v1/messages", post(handlers::handle_messages))
        .route(
            "/v1/chat/completions",
            post(handlers::handle_chat_completions),
        )
        .route("/account-limits", get(handlers::handle_account_limits))
        .route("/refresh-token", post(handlers::handle_refresh_token))
        .route(
            "/api/flows",
            get(admin::get_flows).delete(admin::delete_flows),
        )
        .route(
            "/api/admin/config",
            get(admin::get_config).post(admin::post_config),
        )
        .route("/api/admin/backup", post(admin::post_backup))
        .route("/api/admin/backups", get(admin::get_backups))
        .route("/api/admin/accounts/:email", delete(admin::delete_account))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Bind and serve until ctrl-c, then flush the flow writer.
pub async fn serve(app: Arc<App>, host: &str, port: u16) -> crate::error::AppResult<()> {
    let router = build_router(app.clone());
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    app.flows.flush().await;
    info!("Flow writer flushed, shutdown complete");
    Ok(())
}

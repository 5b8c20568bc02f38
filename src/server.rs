//! HTTP frontend adapters mapping routes onto the selector and the
//! update pipeline.

mod handlers;
mod ip;
mod pages;

pub use ip::client_ip;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::App;
use crate::types::MirrorsError;

const TARGET: &str = "mirrorlist::server";

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(handlers::mirrors_table))
        .route(
            "/mirrorlist/{version}/{repository}",
            get(handlers::mirrorlist),
        )
        .route("/isolist/{version}/{arch}", get(handlers::isolist))
        .route("/isos", get(handlers::isos_main))
        .route("/isos/{arch}/{version}", get(handlers::isos_listing))
        .route("/debug/json/ip_info", get(handlers::ip_info))
        .route(
            "/debug/json/nearest_mirrors",
            get(handlers::nearest_mirrors),
        )
        .route("/debug/json/all_mirrors", get(handlers::all_mirrors))
        .route("/update_mirrors", post(handlers::update_mirrors))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

pub async fn serve(app: Arc<App>, bind: SocketAddr) -> Result<(), MirrorsError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(MirrorsError::Io)?;
    tracing::info!(target: TARGET, "Listening on http://{bind}");
    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(MirrorsError::Io)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(target: TARGET, "Shutting down");
}

//! WebSocket transport for the training studio.
//!
//! A thin layer over the core: each connection gets a session with its own
//! coordinator; all outbound delivery happens on the session's event-pump
//! task, which alone owns the socket writer.

pub mod session;

use std::net::SocketAddr;

use axum::{routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::training::RunOptions;
use crate::VERSION;

/// Shared per-connection defaults handed to every new session.
#[derive(Clone)]
pub struct SessionConfig {
    pub options: RunOptions,
}

/// Build the application router.
pub fn router(options: RunOptions) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(session::ws_handler))
        .with_state(SessionConfig { options })
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Bind and serve until shutdown.
pub async fn serve(host: &str, port: u16, options: RunOptions) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Starting server on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(options)).await?;
    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
    }))
}

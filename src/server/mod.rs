//! HTTP surface for the carrier
//!
//! Two endpoints matter: the control webhook at `/twiml` and the media
//! WebSocket at `/media-stream`. Everything routes through the shared
//! [`SessionEngine`]; the server task owns no session state of its own.

pub mod media_stream;
pub mod webhook;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::session::SessionEngine;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
}

/// Build the router; split out so tests can drive it without a listener.
pub fn router(engine: Arc<SessionEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(webhook::health))
        .route("/twiml", post(webhook::twiml))
        .route("/media-stream", get(media_stream::upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Bind the local listener and serve until the process exits.
pub async fn start(engine: Arc<SessionEngine>) -> Result<()> {
    let port = engine.config().server.port;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let app = router(engine);

    info!(%addr, "webhook/media server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind webhook port")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

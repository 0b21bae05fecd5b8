//! External HTTP gateway — the authenticated proxy surface.
//!
//! Every route lives under a registration id and requires that
//! registration's bearer key:
//!
//! ```text
//! POST /v1/{registration_id}/chat                — proxy chat call
//! GET  /v1/{registration_id}/info                — registration metadata
//! GET  /v1/{registration_id}/metrics/summary     — windowed aggregate
//! GET  /v1/{registration_id}/metrics/timeseries  — bucketed series
//! GET  /v1/{registration_id}/metrics/recent      — newest raw calls
//! ```
//!
//! The chat route speaks the common chat-completion wire shape on both
//! sides (request body and response envelope), so existing SDK clients can
//! point at a registration URL unchanged.

mod api;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::store::DbPool;
use crate::vault::Vault;

/// Router state injected into every handler. Cheap to clone — the pool and
/// vault are reference-counted.
#[derive(Clone)]
pub struct GatewayState {
    pub pool: DbPool,
    pub dispatcher: Dispatcher,
}

impl GatewayState {
    pub fn new(pool: DbPool, vault: Arc<Vault>) -> Self {
        let dispatcher = Dispatcher::new(pool.clone(), vault);
        Self { pool, dispatcher }
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/{registration_id}/chat", post(api::chat))
        .route("/v1/{registration_id}/info", get(api::info))
        .route("/v1/{registration_id}/metrics/summary", get(api::metrics_summary))
        .route("/v1/{registration_id}/metrics/timeseries", get(api::metrics_timeseries))
        .route("/v1/{registration_id}/metrics/recent", get(api::metrics_recent))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn run(bind_addr: &str, state: GatewayState) -> Result<(), GatewayError> {
    let router = build_router(state);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("bind failed on {bind_addr}: {e}")))?;

    info!(%bind_addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {e}")))?;

    info!("gateway shut down");
    Ok(())
}

//! HTTP surface
//!
//! A thin axum adapter over the coordinator. Errors carry `{error, code}`
//! envelopes with statuses fixed per code. The census delete route is a
//! GET for wire compatibility.

pub mod handlers;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::pipeline::Sequencer;

/// Request timeout on every handler.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

pub fn router(sequencer: Arc<Sequencer>) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/processes", post(handlers::create_process))
        .route("/processes/:id", get(handlers::get_process))
        .route("/censuses", post(handlers::create_census))
        .route(
            "/censuses/:id/participants",
            post(handlers::add_participants).get(handlers::list_participants),
        )
        .route("/censuses/:id/root", get(handlers::census_root))
        .route("/censuses/:id/size", get(handlers::census_size))
        .route("/censuses/:id", get(handlers::delete_census))
        .route("/censuses/:id/proof", get(handlers::proof_by_root))
        .route("/votes", post(handlers::submit_vote))
        .route("/votes/:id/:nullifier", get(handlers::vote_status))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .with_state(sequencer)
}

/// Serve the API until the listener fails or the process stops.
pub async fn serve(sequencer: Arc<Sequencer>, port: u16) -> crate::errors::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| crate::errors::Error::Internal(format!("bind failed: {e}")))?;
    tracing::info!(port, "http api listening");
    axum::serve(listener, router(sequencer))
        .await
        .map_err(|e| crate::errors::Error::Internal(format!("server error: {e}")))
}

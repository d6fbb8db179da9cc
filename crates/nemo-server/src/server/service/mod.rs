//! HTTP surface of the pipeline.
//!
//! ## Structure
//!
//! - [`handler`] - one handler per endpoint.
//! - [`router`] - the axum [`Router`] wiring them to their paths, with a
//!   request body limit sized for inline images.

pub mod handler;

use crate::server::{config::DEFAULT_MAX_BODY_BYTES, pipeline::Pipeline};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Builds the application router around a running pipeline, accepting
/// bodies up to [`DEFAULT_MAX_BODY_BYTES`].
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    router_with_body_limit(pipeline, DEFAULT_MAX_BODY_BYTES)
}

/// Builds the application router with an explicit request body limit.
///
/// Cross-origin requests are allowed from anywhere so browser clients served
/// from another origin can poll the API.
pub fn router_with_body_limit(pipeline: Arc<Pipeline>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/ask", post(handler::ask))
        .route("/api/status/{id}", get(handler::status))
        .route("/api/responses", get(handler::responses))
        .route("/api/responses/clear", post(handler::clear))
        .route("/api/batch", post(handler::batch))
        .route("/health", get(handler::health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

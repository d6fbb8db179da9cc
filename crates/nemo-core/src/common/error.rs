//! Error types for the generation pipeline.
//!
//! This module defines the central `Error` enum, which captures all recoverable
//! and reportable error cases within the pipeline. It implements
//! [`IntoResponse`] so handlers can return `Result<_, Error>` directly and have
//! each case mapped onto an HTTP status code with a `{"error": ...}` body.
//!
//! ## Error Cases
//! - `InvalidRequest`: The client request was malformed (e.g. empty prompt).
//! - `PayloadTooLarge`: The request body exceeded the configured size limit.
//! - `QueueFull`: The bounded request queue has no free capacity.
//! - `ServiceShutdown`: A request arrived while the pipeline was stopping.
//! - `ChannelError`: An internal communication failure between stages.
//! - `InvalidImage`: An image payload could not be decoded or resolved.
//! - `Generation`: The external content generator failed.
//! - `GenerationTimeout`: The external content generator did not answer in
//!   time.
//! - `IdGeneration`: The request id generator failed.
//! - `WorkerSpawn`: A Stage-2 worker could not be started.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the generation pipeline.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The client request was invalid.
    #[error("{reason}")]
    InvalidRequest { reason: String },

    /// The request body is larger than the server accepts.
    #[error("{reason}")]
    PayloadTooLarge { reason: String },

    /// The request queue is bounded and currently full.
    #[error("Request queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pipeline is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Internal channel send/receive failure (e.g., closed channel or broken
    /// pipe to a worker process).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The image attached to a request is not a supported inline image and
    /// could not be resolved.
    #[error("invalid image format: {reason}")]
    InvalidImage { reason: String },

    /// The external generator returned an error.
    #[error("Generation failed: {message}")]
    Generation { message: String },

    /// The external generator exceeded the configured per-call timeout.
    #[error("Generation timed out after {secs}s")]
    GenerationTimeout { secs: u64 },

    /// The request id generator failed.
    #[error("ID error: {0}")]
    IdGeneration(String),

    /// A Stage-2 worker could not be spawned.
    #[error("Failed to spawn worker: {context}")]
    WorkerSpawn { context: String },
}

impl Error {
    /// HTTP status code reported to clients for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QueueFull { .. } | Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidImage { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ChannelError { .. }
            | Self::Generation { .. }
            | Self::IdGeneration(_)
            | Self::WorkerSpawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

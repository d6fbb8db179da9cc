//! HTTP handlers for the polling API.
//!
//! Every handler is a thin adapter over [`Pipeline`]: it validates the body,
//! calls one pipeline operation and serializes the result. Errors are
//! [`nemo_core::Error`] values, rendered as `{"error": ...}` with the status
//! code of their variant.

use crate::server::pipeline::Pipeline;
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use nemo_core::{Error, ResponseView, Result, StatusView};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

pub type AppState = Arc<Pipeline>;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

fn bad_request(reason: impl Into<String>) -> Error {
    Error::InvalidRequest {
        reason: reason.into(),
    }
}

/// Maps a body that could not be read as JSON onto the pipeline error.
/// Bodies over the size limit are 413; everything else is 400.
fn rejected(rejection: JsonRejection) -> Error {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge {
            reason: rejection.body_text(),
        }
    } else {
        bad_request(rejection.body_text())
    }
}

/// `POST /api/ask`
pub async fn ask(
    State(pipeline): State<AppState>,
    body: core::result::Result<Json<AskRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(request) = body.map_err(rejected)?;
    let image = request.image.filter(|raw| !raw.trim().is_empty());
    let has_image = image.is_some();

    let id = pipeline.submit(request.prompt.as_deref().unwrap_or_default(), image, None)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "id": id,
            "status": "processing",
            "has_image": has_image,
        })),
    ))
}

/// `GET /api/status/{id}`
pub async fn status(State(pipeline): State<AppState>, Path(id): Path<String>) -> Json<StatusView> {
    Json(pipeline.status(&id))
}

/// `GET /api/responses`
pub async fn responses(State(pipeline): State<AppState>) -> Json<Vec<ResponseView>> {
    Json(pipeline.list())
}

/// `POST /api/responses/clear`
pub async fn clear(State(pipeline): State<AppState>) -> Json<Value> {
    pipeline.clear();
    Json(json!({
        "status": "success",
        "message": "All responses cleared",
    }))
}

/// `POST /api/batch`
///
/// The body is taken as raw JSON so that a wrongly shaped `prompts` field is
/// reported as a 400 with an explanation rather than a generic rejection.
pub async fn batch(
    State(pipeline): State<AppState>,
    body: core::result::Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(body) = body.map_err(rejected)?;

    let entries = body
        .get("prompts")
        .and_then(Value::as_array)
        .ok_or_else(|| bad_request("Prompts must be a list"))?;

    let prompts = entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| bad_request("Every prompt must be a string"))
        })
        .collect::<Result<Vec<_>>>()?;

    let ids = pipeline.submit_batch(&prompts)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ids": ids,
            "status": "processing",
        })),
    ))
}

/// `GET /health`
pub async fn health(State(pipeline): State<AppState>) -> Json<Value> {
    let status = if pipeline.is_stopping() {
        "stopping"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "queue_size": pipeline.queue_size(),
        "results": pipeline.result_count(),
    }))
}

//! # Pipeline Record Types
//!
//! This module defines the records that flow through the two pipeline stages
//! and the views that are handed back to polling clients. Stage-1 and Stage-2
//! workers live on opposite sides of an isolation boundary, so every type that
//! crosses it is `Serialize + Deserialize` and travels as one JSON document per
//! line.
//!
//! ## Flow
//!
//! - [`RequestRecord`] - created on submission, consumed once by Stage 1
//! - [`BasicResult`] - produced by Stage 1 right after the external call
//! - [`Stage2Message`] - what crosses the boundary: a [`ForwardedResult`] or
//!   the stop token
//! - [`ProcessedResult`] - produced by Stage 2, drained once by `reconcile`
//! - [`ResultView`] / [`ResponseView`] - stored and client-visible views

use serde::{Deserialize, Serialize};

/// A submitted request waiting in the request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: String,
    pub prompt: String,
    /// Raw image payload as supplied by the client (data URL or path).
    pub image: Option<String>,
}

/// Resource usage measured around a single external call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Wall-clock seconds spent in the call, rounded to 2 decimals.
    pub time: f64,
    /// Average CPU usage in percent, rounded to 1 decimal.
    pub cpu: f64,
    /// Resident memory delta in MB, rounded to 2 decimals.
    pub memory: f64,
}

/// The untransformed record produced by a Stage-1 worker.
///
/// Failed calls are still represented as a `BasicResult`, distinguished only
/// by `error` and a human-readable message in `response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicResult {
    pub id: String,
    pub prompt: String,
    pub response: String,
    #[serde(rename = "thread")]
    pub worker_name: String,
    pub timestamp: String,
    pub has_image: bool,
    #[serde(rename = "imageData")]
    pub image_data: Option<String>,
    pub performance: Performance,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub error: bool,
}

/// The forwarding message Stage 1 hands to Stage 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedResult {
    pub id: String,
    pub prompt: String,
    pub text: String,
}

impl From<&BasicResult> for ForwardedResult {
    fn from(result: &BasicResult) -> Self {
        Self {
            id: result.id.clone(),
            prompt: result.prompt.clone(),
            text: result.response.clone(),
        }
    }
}

/// A message on the cross-boundary queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stage2Message {
    /// Transform this result.
    Work(ForwardedResult),
    /// Exit the worker loop. Exactly one is enqueued per Stage-2 worker.
    Stop,
}

/// The transformed record produced by a Stage-2 worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub id: String,
    pub prompt: String,
    pub processed_text: String,
    pub processor_id: usize,
}

/// A reconciled Stage-2 overlay, persisted next to its [`BasicResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedOverlay {
    pub text: String,
    pub processor_id: usize,
}

/// What the result store holds for one id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultView {
    pub basic: BasicResult,
    pub processed: Option<ProcessedOverlay>,
}

impl ResultView {
    pub const fn new(basic: BasicResult) -> Self {
        Self {
            basic,
            processed: None,
        }
    }

    pub const fn is_processed(&self) -> bool {
        self.processed.is_some()
    }

    /// Builds the client-visible view, overlaying the processed text when a
    /// Stage-2 result has been reconciled.
    pub fn merged(&self) -> ResponseView {
        let (response, processed, processor) = match &self.processed {
            Some(overlay) => (
                overlay.text.clone(),
                Some(true),
                Some(processor_label(overlay.processor_id)),
            ),
            None => (self.basic.response.clone(), None, None),
        };

        ResponseView {
            basic: BasicResult {
                response,
                ..self.basic.clone()
            },
            processed,
            processor,
        }
    }
}

/// Display name of a Stage-2 worker.
pub fn processor_label(processor_id: usize) -> String {
    format!("Process {processor_id}")
}

/// The merged view returned by the status and list endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseView {
    #[serde(flatten)]
    pub basic: BasicResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
}

/// Result of a status query for a single id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusView {
    /// The id is still queued or in flight.
    Processing { queue_size: usize },
    /// Stage 1 has finished; `processing_status` is set while Stage 2 has not
    /// been reconciled yet.
    Completed {
        data: ResponseView,
        #[serde(skip_serializing_if = "Option::is_none")]
        processing_status: Option<&'static str>,
    },
}

/// Marker reported while a completed id still waits for Stage 2.
pub const WAITING_FOR_PROCESS: &str = "waiting_for_process";

//! Server-side components of the `nemo` generation service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and its validation.
//! - [`generator`] - The external generator trait, the Gemini client and
//!   image resolution.
//! - [`queue`] - The request queue feeding Stage 1.
//! - [`store`] - The result store read by every status query.
//! - [`pool`] - Stage 1: workers issuing external calls.
//! - [`isolation`] - Stage 2: isolated workers transforming results.
//! - [`pipeline`] - Owns both stages and exposes submit / status / reconcile.
//! - [`service`] - The axum router and HTTP handlers.
//! - [`terminal`] - The one-shot `ask` command over an in-process pipeline.
//! - [`telemetry`] - Logging initialization and optional metrics.
//!
//! These components are wired together in the server's `main.rs`.

pub mod config;
pub mod generator;
pub mod isolation;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod terminal;

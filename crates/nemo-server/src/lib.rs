//! # `nemo-server`: asynchronous two-stage generation service
//!
//! Prompts submitted over HTTP are queued, answered by an external generator
//! in a pool of Stage-1 workers, then transformed by a pool of isolated
//! Stage-2 worker processes. Clients poll for results by id.
//!
//! ## Highlights
//!
//! - **Non-blocking submission**: `POST /api/ask` returns an id immediately.
//! - **Failure isolation**: generator errors, timeouts and invalid images
//!   become error results for their own id only.
//! - **Process isolation**: Stage 2 runs in child processes speaking
//!   line-delimited JSON, respawned if they crash and killed if they outlive
//!   the shutdown grace period.
//! - **Read-time reconciliation**: every read merges pending Stage-2 output
//!   into the result store first.
//!
//! ## Module Overview
//!
//! - [`server`] - Configuration, pipeline, worker pools and HTTP surface.

pub mod server;

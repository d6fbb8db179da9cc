//! Stage 2: isolated workers that transform Stage-1 results.
//!
//! - [`protocol`] - line-delimited JSON framing over the worker's pipes.
//! - [`child`] - the worker loop and the transformation itself.
//! - [`spawner`] - process and in-process task spawners.
//! - [`supervisor`] - the pool, its pumps and shutdown escalation.

pub mod child;
pub mod protocol;
pub mod spawner;
pub mod supervisor;

pub use child::{run_worker, transform};
pub use spawner::{ProcessSpawner, TaskSpawner, WorkerSpawner};
pub use supervisor::Stage2Pool;

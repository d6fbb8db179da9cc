//! Stage 1: the worker pool that calls the external generator.

pub mod manager;
pub mod resources;
pub mod worker;

pub use manager::Stage1Pool;
pub use resources::ResourceMonitor;
pub use worker::Stage1Shared;

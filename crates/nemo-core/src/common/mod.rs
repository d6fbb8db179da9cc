//! Types shared by the pipeline stages and the HTTP surface.

pub mod error;
pub mod id;
pub mod types;

pub use error::{Error, Result};
pub use id::RequestIdGenerator;
pub use types::*;

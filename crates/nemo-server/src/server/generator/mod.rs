//! External content generation.
//!
//! The pipeline treats generation as an opaque, slow and fallible call behind
//! the [`ContentGenerator`] trait. Implementations must tolerate concurrent
//! calls from every Stage-1 worker.
//!
//! - [`gemini`] - the production generator backed by the Gemini REST API.
//! - [`image`] - resolution of client image payloads into JPEG bytes.

pub mod gemini;
pub mod image;

use async_trait::async_trait;
use nemo_core::Result;

pub use self::gemini::GeminiGenerator;
pub use self::image::{PreparedImage, resolve_image};

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Backend name used in logs.
    fn name(&self) -> &str;

    /// Generates text for `prompt`, optionally grounded on an image.
    ///
    /// # Errors
    ///
    /// Any failure of the external service, reported as
    /// [`nemo_core::Error::Generation`].
    async fn generate(&self, prompt: &str, image: Option<&PreparedImage>) -> Result<String>;
}

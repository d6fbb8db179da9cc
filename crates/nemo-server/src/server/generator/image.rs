//! Image payload resolution.
//!
//! Clients attach images either inline as `data:image/<type>;base64,<data>`
//! URLs or, when the server is configured with an image root, as paths
//! relative to that directory. Whatever the source, the bytes are decoded to
//! validate them and re-encoded as JPEG, the only format handed to the
//! generator.

use base64::{Engine as _, engine::general_purpose};
use image::{DynamicImage, ImageFormat};
use nemo_core::{Error, Result};
use std::io::Cursor;
use std::path::Path;

const DATA_URL_PREFIX: &str = "data:image";

/// An image ready to be sent to the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub mime_type: &'static str,
    pub data: Vec<u8>,
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidImage {
        reason: reason.into(),
    }
}

/// Resolves a raw client payload into a JPEG image.
///
/// This decodes the whole image and is CPU bound; call it off the async
/// executor.
///
/// # Errors
///
/// Returns [`Error::InvalidImage`] if the payload is neither a decodable
/// inline image nor a readable image file inside `image_root`.
pub fn resolve_image(raw: &str, image_root: Option<&Path>) -> Result<PreparedImage> {
    let bytes = if raw.starts_with(DATA_URL_PREFIX) {
        decode_data_url(raw)?
    } else if let Some(root) = image_root {
        read_from_root(raw, root)?
    } else {
        return Err(invalid(
            "expected an inline data:image/...;base64 payload",
        ));
    };

    to_jpeg(&bytes)
}

fn decode_data_url(raw: &str) -> Result<Vec<u8>> {
    let (header, payload) = raw
        .split_once(',')
        .ok_or_else(|| invalid("data URL has no payload"))?;

    if !header.ends_with(";base64") {
        return Err(invalid("data URL is not base64 encoded"));
    }

    general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| invalid(format!("payload is not valid base64: {e}")))
}

fn read_from_root(raw: &str, root: &Path) -> Result<Vec<u8>> {
    let root = root
        .canonicalize()
        .map_err(|e| invalid(format!("image root is unavailable: {e}")))?;
    let candidate = root
        .join(raw)
        .canonicalize()
        .map_err(|_| invalid(format!("no image found at {raw:?}")))?;

    // Reject anything that escapes the root through `..` or symlinks.
    if !candidate.starts_with(&root) || !candidate.is_file() {
        return Err(invalid(format!("no image found at {raw:?}")));
    }

    std::fs::read(&candidate).map_err(|e| invalid(format!("failed to read {raw:?}: {e}")))
}

fn to_jpeg(bytes: &[u8]) -> Result<PreparedImage> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| invalid(format!("unsupported or corrupt image: {e}")))?;

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
    let mut data = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut data), ImageFormat::Jpeg)
        .map_err(|e| invalid(format!("failed to re-encode image: {e}")))?;

    Ok(PreparedImage {
        mime_type: "image/jpeg",
        data,
    })
}

//! Image attachments for user messages.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine;
use tracing::warn;

/// Largest local image accepted.
pub const MAX_IMAGE_FILE_SIZE: u64 = 5 * 1024 * 1024;
/// Images beyond this count are dropped.
pub const MAX_IMAGE_COUNT: usize = 10;

/// An image ready to be attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAttachment {
    Url(String),
    Base64 { media_type: String, data: String },
}

impl ImageAttachment {
    /// Remote URL as-is, local data as a `data:` URL (OpenAI form).
    pub fn to_url(&self) -> String {
        match self {
            ImageAttachment::Url(url) => url.clone(),
            ImageAttachment::Base64 { media_type, data } => {
                format!("data:{media_type};base64,{data}")
            }
        }
    }
}

/// Normalizes user-provided file paths.
///
/// Handles drag-and-drop shell escaping (`\ `, `\(`, `\)`) and expands `~/`.
pub fn normalize_input_path(path: &str) -> PathBuf {
    let unescaped = path
        .replace("\\ ", " ")
        .replace("\\(", "(")
        .replace("\\)", ")");

    if let Some(rest) = unescaped.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(unescaped)
}

/// MIME type for the supported image extensions.
pub fn mime_type_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension().and_then(|e| e.to_str())?;
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Resolves one image reference: an `https://` URL, a `file://` URL or a path.
///
/// # Errors
/// Returns an error for plain `http://` URLs, missing or oversized files and
/// unsupported formats.
pub async fn load_image(reference: &str) -> Result<ImageAttachment> {
    let reference = reference.trim();
    if reference.starts_with("https://") {
        return Ok(ImageAttachment::Url(reference.to_string()));
    }
    if reference.starts_with("http://") {
        bail!("only HTTPS URLs are supported for security: {reference}");
    }
    let path = match reference.strip_prefix("file://") {
        Some(path) => PathBuf::from(path),
        None => normalize_input_path(reference),
    };
    load_image_file(&path).await
}

async fn load_image_file(path: &Path) -> Result<ImageAttachment> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("image file not found: {}", path.display()))?;
    let media_type = mime_type_for_extension(path).with_context(|| {
        format!(
            "unsupported image format: {} (supported: .jpg, .jpeg, .png, .gif, .webp)",
            path.display()
        )
    })?;
    if metadata.len() > MAX_IMAGE_FILE_SIZE {
        bail!(
            "image file too large: {} bytes (max: {MAX_IMAGE_FILE_SIZE} bytes)",
            metadata.len()
        );
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(ImageAttachment::Base64 {
        media_type: media_type.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

/// Loads up to [`MAX_IMAGE_COUNT`] images, skipping failures with a warning.
pub async fn load_images(references: &[String]) -> Vec<ImageAttachment> {
    if references.len() > MAX_IMAGE_COUNT {
        warn!(
            provided = references.len(),
            max = MAX_IMAGE_COUNT,
            "too many images, only the first ones are attached"
        );
    }
    let mut images = Vec::new();
    for reference in references.iter().take(MAX_IMAGE_COUNT) {
        match load_image(reference).await {
            Ok(image) => images.push(image),
            Err(err) => warn!(image = %reference, error = %err, "failed to process image"),
        }
    }
    images
}

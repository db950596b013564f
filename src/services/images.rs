//! Image provider: fetches media bytes for a task, preferring the
//! optimised rendition and falling back to greyscale. Size and format
//! limits are enforced here so workers never hand oversized or exotic
//! payloads to the model runtime.

use async_trait::async_trait;
use reqwest::Client;
use uuid::Uuid;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const MIN_DIMENSION: u32 = 224;
const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("download failed for both optimised and greyscale paths: {0}")]
    AllSourcesFailed(String),

    #[error("image exceeds {MAX_IMAGE_BYTES} bytes ({0} bytes)")]
    TooLarge(usize),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("image below minimum resolution {MIN_DIMENSION}x{MIN_DIMENSION}")]
    TooSmall,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Fetch the raw bytes for a media item, preferring the optimised
    /// rendition.
    async fn fetch(
        &self,
        media_id: Uuid,
        optimised_url: &str,
        greyscale_url: Option<&str>,
    ) -> Result<Vec<u8>, ImageError>;
}

pub struct HttpImageProvider {
    http: Client,
}

impl HttpImageProvider {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    async fn fetch_one(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        check_extension(url)?;
        let response = self.http.get(url).send().await?;
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(ImageError::TooLarge(bytes.len()));
        }
        check_dimensions(&bytes)?;
        Ok(bytes.to_vec())
    }
}

impl Default for HttpImageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn fetch(
        &self,
        media_id: Uuid,
        optimised_url: &str,
        greyscale_url: Option<&str>,
    ) -> Result<Vec<u8>, ImageError> {
        match self.fetch_one(optimised_url).await {
            Ok(bytes) => Ok(bytes),
            Err(primary_err) => {
                let Some(fallback) = greyscale_url else {
                    return Err(ImageError::AllSourcesFailed(primary_err.to_string()));
                };
                tracing::warn!(
                    media_id = %media_id,
                    error = %primary_err,
                    "optimised image fetch failed, trying greyscale"
                );
                self.fetch_one(fallback)
                    .await
                    .map_err(|fallback_err| {
                        ImageError::AllSourcesFailed(format!(
                            "optimised: {primary_err}; greyscale: {fallback_err}"
                        ))
                    })
            }
        }
    }
}

fn check_extension(url: &str) -> Result<(), ImageError> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path.rsplit('.').next().unwrap_or_default().to_lowercase();
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ImageError::UnsupportedFormat(extension))
    }
}

/// Minimal header sniffing for width/height; formats whose dimensions we
/// cannot cheaply read are accepted and left to the model runtime.
fn check_dimensions(bytes: &[u8]) -> Result<(), ImageError> {
    if let Some((width, height)) = png_dimensions(bytes) {
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            return Err(ImageError::TooSmall);
        }
    }
    Ok(())
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    if bytes.len() < 24 || &bytes[..8] != PNG_MAGIC {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_allow_list_is_enforced() {
        assert!(check_extension("https://img.example/a/photo.jpg").is_ok());
        assert!(check_extension("https://img.example/a/photo.webp?sig=abc").is_ok());
        assert!(matches!(
            check_extension("https://img.example/a/clip.gif"),
            Err(ImageError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn undersized_png_is_rejected() {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        bytes.extend_from_slice(&[0, 0, 0, 13]); // IHDR length
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(&600u32.to_be_bytes());
        assert!(matches!(check_dimensions(&bytes), Err(ImageError::TooSmall)));

        let mut big = bytes.clone();
        big[16..20].copy_from_slice(&800u32.to_be_bytes());
        assert!(check_dimensions(&big).is_ok());
    }
}

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::S3Store;

use crate::config::SinkSettings;

pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

fn ext_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Objects are keyed `YYYY/MM/DD/{uuid}.{ext}` on every backend.
fn object_key(ext: &str) -> String {
    format!("{}/{}.{}", Utc::now().format("%Y/%m/%d"), Uuid::new_v4(), ext)
}

enum Backend {
    Local(LocalStore),
    S3(S3Store),
}

/// Re-publishes provider artifacts to owned storage. A failed image keeps
/// its original URL; the task outcome is never driven by storage.
pub struct ImageSink {
    backend: Backend,
    http: reqwest::Client,
}

impl ImageSink {
    pub fn from_settings(settings: &SinkSettings) -> Result<Self> {
        let backend = if settings.s3_enabled {
            info!("image sink using S3 bucket {}", settings.s3_bucket);
            Backend::S3(S3Store::new(settings)?)
        } else {
            info!("image sink using local root {}", settings.local_root);
            Backend::Local(LocalStore::new(&settings.local_root))
        };
        Ok(Self {
            backend,
            http: reqwest::Client::new(),
        })
    }

    pub async fn store_all(&self, images: Vec<String>) -> Vec<String> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            match self.store_one(&image).await {
                Ok(url) => results.push(url),
                Err(e) => {
                    warn!("failed to store image, passing original through: {}", e);
                    results.push(image);
                }
            }
        }
        results
    }

    async fn store_one(&self, image: &str) -> Result<String> {
        let (data, mime) = self.fetch(image).await?;
        if data.len() > MAX_IMAGE_SIZE {
            return Err(anyhow!("image size exceeds limit: {} bytes", data.len()));
        }
        let ext =
            ext_for_mime(&mime).ok_or_else(|| anyhow!("unsupported image type: {}", mime))?;

        let key = object_key(ext);
        match &self.backend {
            Backend::Local(store) => store.put(&key, &data).await,
            Backend::S3(store) => store.put(&key, &data, mime_for_ext(ext)).await,
        }
    }

    async fn fetch(&self, image: &str) -> Result<(Vec<u8>, String)> {
        if let Some(inline) = decode_inline(image)? {
            return Ok(inline);
        }

        // http(s) URL
        let response = self.http.get(image).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download image: status {}",
                response.status().as_u16()
            ));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "image/png".to_string());
        let data = response.bytes().await?.to_vec();
        Ok((data, mime))
    }
}

/// Decodes data-URLs and raw base64. Returns None for remote URLs.
pub(crate) fn decode_inline(image: &str) -> Result<Option<(Vec<u8>, String)>> {
    if image.starts_with("http://") || image.starts_with("https://") {
        return Ok(None);
    }

    if let Some(rest) = image.strip_prefix("data:") {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| anyhow!("invalid data URL format"))?;
        let mime = header.split(';').next().unwrap_or_default();
        let mime = if mime.is_empty() { "image/png" } else { mime };
        let data = BASE64
            .decode(payload)
            .map_err(|e| anyhow!("failed to decode base64: {}", e))?;
        return Ok(Some((data, mime.to_string())));
    }

    let data = BASE64
        .decode(image)
        .map_err(|e| anyhow!("failed to decode base64: {}", e))?;
    Ok(Some((data, "image/png".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_carries_its_mime() {
        let (data, mime) = decode_inline("data:image/webp;base64,aGVsbG8=")
            .unwrap()
            .unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(mime, "image/webp");
    }

    #[test]
    fn raw_base64_defaults_to_png() {
        let (data, mime) = decode_inline("aGVsbG8=").unwrap().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn remote_urls_are_not_inline() {
        assert!(decode_inline("https://x/1.png").unwrap().is_none());
    }

    #[test]
    fn malformed_data_url_is_rejected() {
        assert!(decode_inline("data:image/png;base64").is_err());
        assert!(decode_inline("not base64 at all!").is_err());
    }

    #[test]
    fn extension_mapping_covers_the_allowlist() {
        assert_eq!(ext_for_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_for_mime("image/png"), Some("png"));
        assert_eq!(ext_for_mime("image/gif"), Some("gif"));
        assert_eq!(ext_for_mime("image/webp"), Some("webp"));
        assert_eq!(ext_for_mime("image/tiff"), None);
    }

    #[test]
    fn object_keys_are_date_prefixed() {
        let key = object_key("png");
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 4);
        assert!(key.ends_with(".png"));
    }

    #[tokio::test]
    async fn unsupported_mime_passes_original_through() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SinkSettings {
            local_root: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let sink = ImageSink::from_settings(&settings).unwrap();

        // Unsupported MIME type keeps the original string.
        let original = format!("data:image/tiff;base64,{}", BASE64.encode(b"tiff"));
        let stored = sink.store_all(vec![original.clone()]).await;
        assert_eq!(stored, vec![original]);
    }

    #[tokio::test]
    async fn local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SinkSettings {
            local_root: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let sink = ImageSink::from_settings(&settings).unwrap();

        let image = format!("data:image/png;base64,{}", BASE64.encode(b"png-bytes"));
        let stored = sink.store_all(vec![image]).await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].starts_with("/api/v1/storage/images/"));
        assert!(stored[0].ends_with(".png"));

        // The file landed under the dated tree.
        let relative = stored[0]
            .strip_prefix("/api/v1/storage/images/")
            .unwrap();
        let on_disk = dir.path().join(relative);
        assert_eq!(std::fs::read(on_disk).unwrap(), b"png-bytes");
    }
}

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use feedsync_core::{sanitize_key, Clock};
use feedsync_storage::{ArtifactStore, CachePolicy, FetchError, HttpFetcher, StorageError};
use thiserror::Error;
use url::Url;

use crate::StoredAsset;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image url {0:?}")]
    InvalidUrl(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url} is not an image (content type {content_type:?})")]
    NotAnImage { url: String, content_type: Option<String> },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("image downloads are disabled")]
    Disabled,
}

/// Downloads a remote image and persists it as a local asset.
#[async_trait]
pub trait ImageMaterializer: Send + Sync {
    /// `scope` groups stored files, usually the feed id.
    async fn materialize(&self, url: &str, scope: &str) -> Result<StoredAsset, ImageError>;
}

pub struct HttpImageMaterializer {
    http: Arc<HttpFetcher>,
    artifacts: ArtifactStore,
    clock: Arc<dyn Clock>,
}

impl HttpImageMaterializer {
    pub fn new(http: Arc<HttpFetcher>, artifacts: ArtifactStore, clock: Arc<dyn Clock>) -> Self {
        Self { http, artifacts, clock }
    }
}

#[async_trait]
impl ImageMaterializer for HttpImageMaterializer {
    async fn materialize(&self, url: &str, scope: &str) -> Result<StoredAsset, ImageError> {
        let parsed = Url::parse(url).map_err(|_| ImageError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ImageError::InvalidUrl(url.to_string()));
        }
        let host = parsed.host_str().unwrap_or("unknown-host").to_string();

        let response = self.http.fetch_bytes(&host, url, CachePolicy::Bypass).await?;
        let mime_type = image_mime_type(response.content_type.as_deref(), parsed.path())
            .ok_or_else(|| ImageError::NotAnImage {
                url: url.to_string(),
                content_type: response.content_type.clone(),
            })?;

        let scope = match sanitize_key(scope) {
            key if key.is_empty() => "unscoped".to_string(),
            key => key,
        };
        let stored = self
            .artifacts
            .store_bytes(self.clock.now(), &scope, extension_for(&mime_type), &response.body)
            .await?;
        tracing::debug!(
            url,
            path = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "stored image"
        );

        Ok(StoredAsset {
            content_hash: stored.content_hash,
            relative_path: relative_path_string(&stored.relative_path),
            byte_size: stored.byte_size as u64,
            mime_type,
        })
    }
}

/// Refuses every download. Used when image handling is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopImageMaterializer;

#[async_trait]
impl ImageMaterializer for NoopImageMaterializer {
    async fn materialize(&self, _url: &str, _scope: &str) -> Result<StoredAsset, ImageError> {
        Err(ImageError::Disabled)
    }
}

/// Declared `image/*` type, or one inferred from the path when the server
/// sends a generic type.
fn image_mime_type(content_type: Option<&str>, path: &str) -> Option<String> {
    let declared = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match declared.as_deref() {
        Some(ct) if ct.starts_with("image/") => Some(ct.to_string()),
        None | Some("application/octet-stream") | Some("binary/octet-stream") => {
            mime_from_path(path)
        }
        Some(_) => None,
    }
}

fn mime_from_path(path: &str) -> Option<String> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(mime.to_string())
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/svg+xml" => "svg",
        _ => "img",
    }
}

fn relative_path_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

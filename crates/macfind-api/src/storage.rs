use std::path::{Component, Path as FsPath, PathBuf};

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use tokio::fs;
use tracing::{info, warn};

use macfind_types::models::Item;

use crate::error::ApiError;
use crate::state::AppState;

/// Bucket that holds item photos.
pub const IMAGE_BUCKET: &str = "item-images";

/// Object storage backed by a directory: `{dir}/{bucket}/{path}`, served
/// publicly under `{public_url}/storage/{bucket}/{path}`.
pub struct Storage {
    dir: PathBuf,
    public_url: String,
}

impl Storage {
    pub async fn new(dir: PathBuf, public_url: &str) -> std::io::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Object storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    /// On-disk location of an object. Paths that could escape the bucket are rejected.
    pub fn object_path(&self, bucket: &str, path: &str) -> Option<PathBuf> {
        if !is_plain_segment(bucket) || path.is_empty() {
            return None;
        }
        let relative = FsPath::new(path);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.dir.join(bucket).join(relative))
    }

    pub async fn save(&self, bucket: &str, path: &str, bytes: &[u8]) -> Result<(), ApiError> {
        let target = self
            .object_path(bucket, path)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid object path '{}'", path)))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::Internal(format!("create {}: {}", parent.display(), e)))?;
        }
        fs::write(&target, bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("write {}: {}", target.display(), e)))
    }

    pub async fn read(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        let target = self.object_path(bucket, path)?;
        fs::read(&target).await.ok()
    }

    /// Best-effort removal; failures are logged.
    pub async fn remove(&self, bucket: &str, path: &str) {
        let Some(target) = self.object_path(bucket, path) else {
            return;
        };
        if let Err(e) = fs::remove_file(&target).await {
            warn!("Failed to remove {}: {}", target.display(), e);
        }
    }

    /// Public URL for a stored path. Values that are already URLs pass through.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        if is_direct_src(path) {
            return path.to_string();
        }
        format!("{}/storage/{}/{}", self.public_url, bucket, path.trim_start_matches('/'))
    }

    /// Fill in `url` for every image of the item.
    pub fn resolve_images(&self, mut item: Item) -> Item {
        for image in &mut item.images {
            image.url = Some(self.public_url(IMAGE_BUCKET, &image.path));
        }
        item
    }
}

fn is_direct_src(path: &str) -> bool {
    ["http://", "https://", "data:", "blob:"]
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

fn is_plain_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extension for a stored image, from the upload's file name or content type.
pub fn image_extension(filename: Option<&str>, content_type: Option<&str>) -> &'static str {
    let from_name = filename
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    let ext = from_name.as_deref().or_else(|| {
        content_type
            .and_then(|ct| ct.strip_prefix("image/"))
    });
    match ext {
        Some("png") => "png",
        Some("webp") => "webp",
        Some("gif") => "gif",
        Some("heic") => "heic",
        _ => "jpg",
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        _ => "application/octet-stream",
    }
}

/// GET /storage/{bucket}/{*path}
pub async fn serve_object(
    State(state): State<AppState>,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state
        .storage
        .read(&bucket, &path)
        .await
        .ok_or(ApiError::NotFound("object"))?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&path))], bytes))
}

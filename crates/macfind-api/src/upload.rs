use std::collections::HashMap;
use std::io::Write;

use axum::{
    Extension, Json,
    extract::{Multipart, State},
    response::IntoResponse,
};
use tracing::{error, info, warn};

use macfind_db::NewItem;
use macfind_types::api::{Claims, UploadItemResponse};

use crate::error::ApiError;
use crate::state::{AppState, db_call_as_user};
use crate::vision::label_image;

/// 10 MB per image
pub const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;

pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// A parsed multipart form: the `image` part plus plain text fields.
#[derive(Default)]
pub struct UploadForm {
    pub image: Option<ImageUpload>,
    pub fields: HashMap<String, String>,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

pub async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("bad image part: {}", e)))?;
            if bytes.is_empty() {
                continue;
            }
            if bytes.len() > MAX_IMAGE_SIZE {
                return Err(ApiError::BadRequest("image too large".into()));
            }
            form.image = Some(ImageUpload {
                bytes: bytes.to_vec(),
                filename,
                content_type,
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("bad field '{}': {}", name, e)))?;
            form.fields.insert(name, value);
        }
    }

    Ok(form)
}

/// POST /api/upload-item — label a photo with the vision model and record the
/// result as a new item. The spooled upload is removed whatever the outcome.
pub async fn upload_item(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = read_form(multipart).await?;
    let Some(image) = form.image else {
        return Err(ApiError::BadRequest("Image is required".into()));
    };
    let Some(vision) = state.vision.clone() else {
        return Err(ApiError::Misconfigured(
            "vision model not configured (missing API key?)".into(),
        ));
    };

    // Spool to disk like any other upload; the TempPath is deleted on drop.
    let spooled = spool(&image.bytes).map_err(|e| {
        error!("Failed to spool upload: {}", e);
        ApiError::Internal("failed to store upload".into())
    })?;

    let mime_type = image.content_type.as_deref().unwrap_or("image/jpeg");
    let bytes = tokio::fs::read(&spooled).await.map_err(|e| {
        error!("Failed to read spooled upload: {}", e);
        ApiError::Internal("failed to read upload".into())
    })?;

    let label = label_image(vision.as_ref(), &bytes, mime_type).await.map_err(|e| {
        warn!("Vision labelling failed: {}", e);
        ApiError::Internal(e.to_string())
    })?;
    drop(spooled);

    info!(
        "Vision label for {}: {:?} / {:?}",
        claims.sub, label.object_type, label.color
    );

    let new = NewItem {
        object_type: label.object_type,
        color: label.color,
        poster_id: Some(claims.sub),
        ..NewItem::default()
    };
    let item = db_call_as_user(&state, &claims, move |db| db.insert_item(&new)).await?;

    Ok(Json(UploadItemResponse { success: true, item }))
}

fn spool(bytes: &[u8]) -> std::io::Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new().prefix("macfind-upload-").tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

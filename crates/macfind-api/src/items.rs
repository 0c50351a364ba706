use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, info};
use uuid::Uuid;

use macfind_db::{NewItem, NewMessage};
use macfind_types::api::{ClaimRequest, Claims, DeleteResponse, StatusUpdateRequest};
use macfind_types::events::ChangeEvent;
use macfind_types::models::{ItemFilters, ItemMetadata, NewContent};
use macfind_types::tags::{handle_from_email, suggest_tags};

use crate::error::ApiError;
use crate::state::{AppState, db_call, db_call_as_user};
use crate::storage::{IMAGE_BUCKET, image_extension};
use crate::upload::read_form;

/// GET /items — newest first, filtered by query parameters.
pub async fn list_items(
    State(state): State<AppState>,
    Query(filters): Query<ItemFilters>,
) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now();
    let items = db_call(&state, move |db| db.list_items(&filters, now)).await?;

    let items: Vec<_> = items
        .into_iter()
        .map(|item| state.storage.resolve_images(item))
        .collect();
    Ok(Json(items))
}

/// GET /items/{id}
pub async fn get_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let item = db_call(&state, move |db| db.get_item(item_id))
        .await?
        .ok_or(ApiError::NotFound("item"))?;
    Ok(Json(state.storage.resolve_images(item)))
}

/// POST /items — post a found item. Multipart fields: `image` (required),
/// `location`, `description`, `tags` (comma separated).
pub async fn post_found(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = read_form(multipart).await?;

    // Nothing is written unless a photo came with the post.
    let Some(image) = form.image.as_ref() else {
        return Err(ApiError::BadRequest("Image is required".into()));
    };

    let description = form.field("description").map(str::to_string);
    let location = form.field("location").map(str::to_string);
    let tags: Vec<String> = form
        .field("tags")
        .map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let suggested = suggest_tags(
        description.as_deref().unwrap_or_default(),
        image.filename.as_deref(),
        location.as_deref(),
    );

    let new = NewItem {
        vague_description: description.clone(),
        location_hint: location,
        metadata: ItemMetadata {
            notes: description,
            tags,
            suggested_tags: suggested,
            finder_email: Some(claims.email.clone()),
            ..ItemMetadata::default()
        },
        poster_id: Some(claims.sub),
        ..NewItem::default()
    };
    let mut item = db_call_as_user(&state, &claims, move |db| db.insert_item(&new)).await?;
    info!("{} posted found item {}", claims.sub, item.id);

    // A failed upload leaves the item without a photo rather than failing the post.
    let ext = image_extension(image.filename.as_deref(), image.content_type.as_deref());
    let path = format!("{}/{}.{}", item.id, Uuid::new_v4(), ext);
    match state.storage.save(IMAGE_BUCKET, &path, &image.bytes).await {
        Ok(()) => {
            let (item_id, p) = (item.id, path.clone());
            match db_call(&state, move |db| db.insert_item_image(item_id, &p, Some(&p))).await {
                Ok(img) => item.images.push(img),
                Err(e) => {
                    error!("Failed to record image for {}: {}", item.id, e);
                    state.storage.remove(IMAGE_BUCKET, &path).await;
                }
            }
        }
        Err(e) => error!("Failed to upload image for {}: {}", item.id, e),
    }

    Ok((StatusCode::CREATED, Json(state.storage.resolve_images(item))))
}

/// POST /items/{id}/claim — open a thread with the finder carrying the proof.
pub async fn claim_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let proof = req.proof.trim().to_string();
    if proof.is_empty() {
        return Err(ApiError::BadRequest("proof is required".into()));
    }

    let item = db_call(&state, move |db| db.get_item(item_id))
        .await?
        .ok_or(ApiError::NotFound("item"))?;
    let finder = item
        .owner_id
        .ok_or_else(|| ApiError::Conflict("item has no poster to claim from".into()))?;
    if finder == claims.sub {
        return Err(ApiError::BadRequest("cannot claim your own item".into()));
    }

    let new = NewMessage {
        item_id,
        sender_id: claims.sub,
        receiver_id: finder,
        content: NewContent::Text(format!("CLAIM: {}", proof)),
        sender_handle: Some(handle_from_email(&claims.email).to_string()),
    };
    let message = db_call_as_user(&state, &claims, move |db| db.insert_message(&new)).await?;

    info!("{} claimed item {}", claims.sub, item_id);
    state.dispatcher.publish(ChangeEvent::MessageInsert(message.clone()));
    Ok((StatusCode::CREATED, Json(message)))
}

/// PATCH /items/{id}/status
pub async fn set_status(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    let status = db_call(&state, move |db| db.set_item_status(item_id, actor, req.status)).await?;

    info!("Item {} status -> {} (by {})", item_id, status, actor);
    state.dispatcher.publish(ChangeEvent::ItemStatus { item_id, status });
    Ok(Json(StatusUpdateRequest { status }))
}

/// DELETE /items/{id} — poster only.
pub async fn delete_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = claims.sub;
    let paths = db_call(&state, move |db| db.delete_item(item_id, actor)).await?;

    for path in &paths {
        state.storage.remove(IMAGE_BUCKET, path).await;
    }
    info!("{} deleted item {}", actor, item_id);
    Ok(Json(DeleteResponse { deleted: true }))
}

/// GET /items/{id}/threads — everyone the caller has talked to about the item.
pub async fn list_threads(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = claims.sub;
    let threads = db_call(&state, move |db| db.list_threads(item_id, viewer)).await?;
    Ok(Json(threads))
}

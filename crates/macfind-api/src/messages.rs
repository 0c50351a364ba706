use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use macfind_db::NewMessage;
use macfind_types::api::{Claims, MarkReadResponse, SendMessageRequest};
use macfind_types::events::ChangeEvent;
use macfind_types::models::{ConfirmKind, NewContent};
use macfind_types::tags::handle_from_email;

use crate::error::ApiError;
use crate::state::{AppState, db_call, db_call_as_user};

#[derive(Debug, Deserialize)]
pub struct ThreadQuery {
    /// Restrict to the thread with this user.
    pub with: Option<Uuid>,
}

/// GET /items/{id}/messages?with= — oldest first.
pub async fn get_thread(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Query(query): Query<ThreadQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = claims.sub;
    let messages = db_call(&state, move |db| db.thread_messages(item_id, viewer, query.with)).await?;
    Ok(Json(messages))
}

/// POST /items/{id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.receiver_id == claims.sub {
        return Err(ApiError::BadRequest("cannot message yourself".into()));
    }
    let content = content_from_request(&req)?;

    let new = NewMessage {
        item_id,
        sender_id: claims.sub,
        receiver_id: req.receiver_id,
        content,
        sender_handle: Some(handle_from_email(&claims.email).to_string()),
    };
    let message = db_call_as_user(&state, &claims, move |db| db.insert_message(&new)).await?;

    debug!("{} -> {} on item {}", claims.sub, req.receiver_id, item_id);
    state.dispatcher.publish(ChangeEvent::MessageInsert(message.clone()));
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /items/{id}/threads/{other}/read — mark what `other` sent the caller as read.
pub async fn mark_thread_read(
    State(state): State<AppState>,
    Path((item_id, other)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (receiver, now) = (claims.sub, chrono::Utc::now());
    let updated = db_call(&state, move |db| db.mark_thread_read(item_id, other, receiver, now)).await?;
    Ok(Json(MarkReadResponse { updated }))
}

/// GET /messages/unread — newest first.
pub async fn unread(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let receiver = claims.sub;
    let messages = db_call(&state, move |db| db.unread_messages(receiver)).await?;
    Ok(Json(messages))
}

/// POST /messages/{id}/read
pub async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (receiver, now) = (claims.sub, chrono::Utc::now());
    let marked = db_call(&state, move |db| db.mark_message_read(message_id, receiver, now)).await?;
    Ok(Json(MarkReadResponse { updated: usize::from(marked) }))
}

/// Explicit confirmations win; a legacy status body is read as one.
fn content_from_request(req: &SendMessageRequest) -> Result<NewContent, ApiError> {
    if let Some(kind) = req.confirm {
        return Ok(NewContent::Confirm(kind));
    }
    let body = req
        .body
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ApiError::BadRequest("message body or confirm is required".into()))?;

    Ok(match ConfirmKind::from_sentinel(body) {
        Some(kind) => NewContent::Confirm(kind),
        None => NewContent::Text(body.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use macfind_types::models::{FOUND_SENTINEL, RETURN_SENTINEL};

    fn request(body: Option<&str>, confirm: Option<ConfirmKind>) -> SendMessageRequest {
        SendMessageRequest {
            receiver_id: Uuid::new_v4(),
            body: body.map(str::to_string),
            confirm,
        }
    }

    #[test]
    fn legacy_sentinels_become_confirmations() {
        assert_eq!(
            content_from_request(&request(Some(FOUND_SENTINEL), None)).unwrap(),
            NewContent::Confirm(ConfirmKind::Found)
        );
        assert_eq!(
            content_from_request(&request(Some(RETURN_SENTINEL), None)).unwrap(),
            NewContent::Confirm(ConfirmKind::Returned)
        );
        assert_eq!(
            content_from_request(&request(Some("  see you at Mills  "), None)).unwrap(),
            NewContent::Text("see you at Mills".into())
        );
    }

    #[test]
    fn explicit_confirm_and_empty_body() {
        assert_eq!(
            content_from_request(&request(Some("ignored"), Some(ConfirmKind::Returned))).unwrap(),
            NewContent::Confirm(ConfirmKind::Returned)
        );
        assert!(content_from_request(&request(Some("   "), None)).is_err());
        assert!(content_from_request(&request(None, None)).is_err());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConfirmKind, Item, ItemStatus, Message, UserProfile};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MagicLinkRequest {
    pub email: String,
    /// Path to return to after sign-in, appended to the link as `?redirect=`.
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MagicLinkResponse {
    pub sent_to: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub user_id: Uuid,
    pub email: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub profile: UserProfile,
}

// -- Items --

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadItemResponse {
    pub success: bool,
    pub item: Item,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusUpdateRequest {
    pub status: ItemStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimRequest {
    pub proof: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// One counterparty the viewer has talked to about an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub item_id: Uuid,
    pub counterparty_id: Uuid,
    pub last_message: Message,
    pub unread: u32,
}

// -- Messages --

/// Either `body` or `confirm` must be set. A `body` equal to one of the
/// legacy `STATUS:*` sentinels is read as the matching confirmation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub confirm: Option<ConfirmKind>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

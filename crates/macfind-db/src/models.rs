//! Database row types. These map directly to SQLite rows and are converted
//! into the shared `macfind-types` models at the edge of this crate.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use macfind_types::models::{
    ConfirmKind, Item, ItemImage, ItemMetadata, ItemStatus, Message, MessageContent, Role,
    UserProfile,
};

use crate::error::{Result, StoreError};

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

pub struct ItemRow {
    pub id: String,
    pub title: Option<String>,
    pub vague_description: Option<String>,
    pub status: String,
    pub category: Option<String>,
    pub location_hint: Option<String>,
    pub metadata: String,
    pub ai_confidence: Option<f64>,
    pub poster_id: Option<String>,
    pub object_type: Option<String>,
    pub color: Option<String>,
    pub created_at: String,
}

pub struct ImageRow {
    pub item_id: String,
    pub storage_path: Option<String>,
    pub thumbnail_path: Option<String>,
}

pub struct MessageRow {
    pub id: String,
    pub item_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: Option<String>,
    pub confirm_role: Option<String>,
    pub confirm_kind: Option<String>,
    pub sender_handle: Option<String>,
    pub read_at: Option<String>,
    pub created_at: String,
}

pub(crate) const ITEM_COLUMNS: &str = "id, title, vague_description, status, category, location_hint, \
     metadata, ai_confidence, poster_id, object_type, color, created_at";

pub(crate) const MESSAGE_COLUMNS: &str = "id, item_id, sender_id, receiver_id, body, confirm_role, \
     confirm_kind, sender_handle, read_at, created_at";

impl ItemRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            vague_description: row.get(2)?,
            status: row.get(3)?,
            category: row.get(4)?,
            location_hint: row.get(5)?,
            metadata: row.get(6)?,
            ai_confidence: row.get(7)?,
            poster_id: row.get(8)?,
            object_type: row.get(9)?,
            color: row.get(10)?,
            created_at: row.get(11)?,
        })
    }
}

impl MessageRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_id: row.get(1)?,
            sender_id: row.get(2)?,
            receiver_id: row.get(3)?,
            body: row.get(4)?,
            confirm_role: row.get(5)?,
            confirm_kind: row.get(6)?,
            sender_handle: row.get(7)?,
            read_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

impl TryFrom<UserRow> for UserProfile {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(UserProfile {
            id: parse_uuid(&row.id, "users.id")?,
            email: row.email,
            display_name: row.display_name,
        })
    }
}

impl TryFrom<ItemRow> for Item {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self> {
        let status = row
            .status
            .parse::<ItemStatus>()
            .map_err(|e| StoreError::Corrupt(format!("item {}: {}", row.id, e)))?;

        // Metadata is stored as an open JSON bag; narrow it here.
        let raw: serde_json::Value =
            serde_json::from_str(&row.metadata).unwrap_or(serde_json::Value::Null);

        let item = Item {
            id: parse_uuid(&row.id, "items.id")?,
            title: row.title,
            vague_description: row.vague_description,
            status,
            category: row.category,
            location_hint: row.location_hint,
            metadata: ItemMetadata::from_value(&raw),
            ai_confidence: row.ai_confidence,
            owner_id: row
                .poster_id
                .as_deref()
                .map(|id| parse_uuid(id, "items.poster_id"))
                .transpose()?,
            object_type: row.object_type,
            color: row.color,
            created_at: parse_ts(&row.created_at)?,
            images: Vec::new(),
        };
        Ok(item.normalized())
    }
}

impl ImageRow {
    /// Storage path wins, thumbnail is the fallback. Rows with neither are skipped.
    pub(crate) fn into_image(self) -> Option<ItemImage> {
        let path = self.storage_path.or_else(|| self.thumbnail_path.clone())?;
        Some(ItemImage {
            path,
            thumbnail_path: self.thumbnail_path,
            url: None,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let content = match (row.confirm_role.as_deref(), row.confirm_kind.as_deref()) {
            (Some(role), Some(kind)) => {
                let role = Role::parse(role)
                    .ok_or_else(|| StoreError::Corrupt(format!("message {}: role '{}'", row.id, role)))?;
                let kind = ConfirmKind::parse(kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("message {}: kind '{}'", row.id, kind)))?;
                MessageContent::Confirm { role, kind }
            }
            _ => MessageContent::Text {
                body: row.body.unwrap_or_default(),
            },
        };

        Ok(Message {
            id: parse_uuid(&row.id, "messages.id")?,
            item_id: parse_uuid(&row.item_id, "messages.item_id")?,
            sender_id: parse_uuid(&row.sender_id, "messages.sender_id")?,
            receiver_id: parse_uuid(&row.receiver_id, "messages.receiver_id")?,
            content,
            sender_handle: row.sender_handle,
            read_at: row.read_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> Result<Uuid> {
    value
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{} '{}': {}", column, value, e)))
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", value, e)))
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a posted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Found,
    /// Accepted by the schema and by filters; nothing in this workspace produces it.
    Lost,
    Claimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("item status cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ItemStatus,
    pub to: ItemStatus,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Lost => "lost",
            Self::Claimed => "claimed",
        }
    }

    /// `found|lost → claimed` and `claimed → claimed`. Nothing leaves `claimed`.
    pub fn transition(self, next: ItemStatus) -> Result<ItemStatus, InvalidTransition> {
        match (self, next) {
            (from, to) if from == to => Ok(to),
            (Self::Found | Self::Lost, Self::Claimed) => Ok(Self::Claimed),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown item status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "found" => Ok(Self::Found),
            "lost" => Ok(Self::Lost),
            "claimed" => Ok(Self::Claimed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Free-form metadata narrowed into a fixed record at the store boundary.
///
/// Rows may carry anything in their metadata bag (tag arrays with mixed element
/// types, unknown keys). Only string values survive the narrowing; tags are
/// lowercased and trimmed, empty entries dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finder_email: Option<String>,
}

impl ItemMetadata {
    pub fn from_value(value: &serde_json::Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let text = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            notes: text("notes"),
            tags: string_list(obj.get("tags")),
            suggested_tags: string_list(obj.get("suggested_tags")),
            colors: string_list(obj.get("colors")),
            finder_email: text("finder_email"),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Tags and suggested tags together, as searched by the tag filter.
    pub fn all_tags(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .chain(self.suggested_tags.iter())
            .map(String::as_str)
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemImage {
    pub path: String,
    pub thumbnail_path: Option<String>,
    /// Public URL, filled in by the API layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub title: Option<String>,
    pub vague_description: Option<String>,
    pub status: ItemStatus,
    pub category: Option<String>,
    pub location_hint: Option<String>,
    #[serde(default)]
    pub metadata: ItemMetadata,
    pub ai_confidence: Option<f64>,
    /// The finder: whoever posted the item.
    pub owner_id: Option<Uuid>,
    pub object_type: Option<String>,
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub images: Vec<ItemImage>,
}

impl Item {
    /// Fill `vague_description` from the vision ingest fields when it is absent.
    pub fn normalized(mut self) -> Self {
        if self.vague_description.is_none() {
            self.vague_description = match (&self.color, &self.object_type) {
                (Some(color), Some(object)) => Some(format!("{} {}", color, object)),
                (None, Some(object)) => Some(object.clone()),
                _ => None,
            };
        }
        self
    }
}

/// Which side of the handshake a confirmation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The user who posted the found item.
    Finder,
    /// The other participant of the thread.
    Claimant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finder => "finder",
            Self::Claimant => "claimant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "finder" => Some(Self::Finder),
            "claimant" => Some(Self::Claimant),
            _ => None,
        }
    }

    pub fn for_sender(sender_id: Uuid, finder_id: Option<Uuid>) -> Self {
        if finder_id == Some(sender_id) {
            Self::Finder
        } else {
            Self::Claimant
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmKind {
    /// "I found my item": the claimant has it back.
    Found,
    /// "I returned the item": the finder handed it over.
    Returned,
}

/// Message content as submitted by a client. Confirmations carry no role;
/// the store assigns it from the item's poster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewContent {
    Text(String),
    Confirm(ConfirmKind),
}

pub const FOUND_SENTINEL: &str = "STATUS:FOUND_CONFIRMED";
pub const RETURN_SENTINEL: &str = "STATUS:RETURN_CONFIRMED";

impl ConfirmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Returned => "returned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "found" => Some(Self::Found),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }

    /// Older clients signal through reserved message bodies.
    pub fn from_sentinel(body: &str) -> Option<Self> {
        match body.trim() {
            FOUND_SENTINEL => Some(Self::Found),
            RETURN_SENTINEL => Some(Self::Returned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    Confirm { role: Role, kind: ConfirmKind },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn as_confirm(&self) -> Option<(Role, ConfirmKind)> {
        match self {
            Self::Confirm { role, kind } => Some((*role, *kind)),
            Self::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub item_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: MessageContent,
    #[serde(default)]
    pub sender_handle: Option<String>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }

    /// The other participant, seen from `viewer`.
    pub fn counterparty_of(&self, viewer: Uuid) -> Uuid {
        if self.sender_id == viewer {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// True if the message belongs to the thread (item, a, b) in either direction.
    pub fn in_thread(&self, item_id: Uuid, a: Uuid, b: Uuid) -> bool {
        self.item_id == item_id
            && ((self.sender_id == a && self.receiver_id == b)
                || (self.sender_id == b && self.receiver_id == a))
    }
}

/// Sort by creation time, ties broken by id so the order is total.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "all")]
    All,
}

impl TimeRange {
    pub fn lower_bound(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => Some(now - Duration::hours(24)),
            Self::Week => Some(now - Duration::days(7)),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemFilters {
    pub status: Option<ItemStatus>,
    pub location: Option<String>,
    pub tag: Option<String>,
    pub search: Option<String>,
    pub time_range: Option<TimeRange>,
}

impl ItemFilters {
    pub fn with_status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Checks applied in memory after the store query (tag and free-text search
    /// work on the narrowed metadata, not on raw JSON).
    pub fn matches(&self, item: &Item) -> bool {
        if let Some(status) = self.status {
            if item.status != status {
                return false;
            }
        }

        if let Some(tag) = non_empty(&self.tag) {
            let needle = tag.to_lowercase();
            if !item.metadata.all_tags().any(|t| t.contains(&needle)) {
                return false;
            }
        }

        if let Some(location) = non_empty(&self.location) {
            let haystack = item.location_hint.as_deref().unwrap_or("").to_lowercase();
            if !haystack.contains(&location.to_lowercase()) {
                return false;
            }
        }

        if let Some(search) = non_empty(&self.search) {
            let metadata = item.metadata.to_value().to_string();
            let haystack = [
                item.title.as_deref().unwrap_or(""),
                item.vague_description.as_deref().unwrap_or(""),
                metadata.as_str(),
            ]
            .join(" ")
            .to_lowercase();
            if !haystack.contains(&search.to_lowercase()) {
                return false;
            }
        }

        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(status: ItemStatus) -> Item {
        Item {
            id: Uuid::new_v4(),
            title: None,
            vague_description: None,
            status,
            category: None,
            location_hint: Some("Mills Library, 2nd floor".into()),
            metadata: ItemMetadata {
                tags: vec!["black".into(), "backpack".into()],
                ..ItemMetadata::default()
            },
            ai_confidence: None,
            owner_id: None,
            object_type: Some("backpack".into()),
            color: Some("black".into()),
            created_at: Utc::now(),
            images: vec![],
        }
    }

    #[test]
    fn claimed_is_terminal() {
        assert_eq!(ItemStatus::Found.transition(ItemStatus::Claimed), Ok(ItemStatus::Claimed));
        assert_eq!(ItemStatus::Claimed.transition(ItemStatus::Claimed), Ok(ItemStatus::Claimed));
        assert!(ItemStatus::Claimed.transition(ItemStatus::Found).is_err());
        assert!(ItemStatus::Claimed.transition(ItemStatus::Lost).is_err());
        assert!(ItemStatus::Found.transition(ItemStatus::Lost).is_err());
    }

    #[test]
    fn metadata_narrowing_drops_non_strings() {
        let raw = serde_json::json!({
            "notes": "  left by the stairs ",
            "tags": ["Black", 3, null, " ", "Backpack"],
            "colors": "not-a-list",
            "unknown": {"nested": true}
        });
        let meta = ItemMetadata::from_value(&raw);
        assert_eq!(meta.notes.as_deref(), Some("left by the stairs"));
        assert_eq!(meta.tags, vec!["black", "backpack"]);
        assert!(meta.colors.is_empty());
        assert_eq!(ItemMetadata::from_value(&serde_json::json!([1, 2])), ItemMetadata::default());
    }

    #[test]
    fn normalized_derives_vague_description() {
        let it = item(ItemStatus::Found).normalized();
        assert_eq!(it.vague_description.as_deref(), Some("black backpack"));

        let mut only_type = item(ItemStatus::Found);
        only_type.color = None;
        assert_eq!(only_type.normalized().vague_description.as_deref(), Some("backpack"));
    }

    #[test]
    fn filters_match_tags_location_and_search() {
        let it = item(ItemStatus::Found).normalized();

        let mut f = ItemFilters::with_status(ItemStatus::Found);
        f.tag = Some("BACK".into());
        f.location = Some("mills".into());
        assert!(f.matches(&it));

        f.search = Some("black back".into());
        assert!(f.matches(&it));

        f.search = Some("umbrella".into());
        assert!(!f.matches(&it));

        assert!(!ItemFilters::with_status(ItemStatus::Claimed).matches(&it));
    }

    #[test]
    fn sentinel_bodies_parse_to_confirm_kinds() {
        assert_eq!(ConfirmKind::from_sentinel(FOUND_SENTINEL), Some(ConfirmKind::Found));
        assert_eq!(ConfirmKind::from_sentinel(RETURN_SENTINEL), Some(ConfirmKind::Returned));
        assert_eq!(ConfirmKind::from_sentinel("STATUS:found"), None);
    }

    #[test]
    fn message_content_wire_shape() {
        let confirm = MessageContent::Confirm { role: Role::Finder, kind: ConfirmKind::Returned };
        let json = serde_json::to_value(&confirm).unwrap();
        assert_eq!(json, serde_json::json!({"type": "confirm", "role": "finder", "kind": "returned"}));

        let text: MessageContent = serde_json::from_str(r#"{"type":"text","body":"hi"}"#).unwrap();
        assert_eq!(text, MessageContent::text("hi"));
    }
}

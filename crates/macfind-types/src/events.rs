use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ItemStatus, Message};

/// A row-level change published by the store layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChangeEvent {
    MessageInsert(Message),
    ItemStatus { item_id: Uuid, status: ItemStatus },
}

impl ChangeEvent {
    /// Row visibility: messages reach their two participants only, item
    /// status changes are public.
    pub fn visible_to(&self, user_id: Uuid) -> bool {
        match self {
            Self::MessageInsert(msg) => msg.sender_id == user_id || msg.receiver_id == user_id,
            Self::ItemStatus { .. } => true,
        }
    }
}

/// Column filter for a realtime subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "column", rename_all = "snake_case")]
pub enum FeedFilter {
    /// Message inserts where `receiver_id = user_id`.
    Receiver { user_id: Uuid },
    /// Message inserts and status changes for one item.
    Item { item_id: Uuid },
}

impl FeedFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (Self::Receiver { user_id }, ChangeEvent::MessageInsert(msg)) => {
                msg.receiver_id == *user_id
            }
            (Self::Receiver { .. }, ChangeEvent::ItemStatus { .. }) => false,
            (Self::Item { item_id }, ChangeEvent::MessageInsert(msg)) => msg.item_id == *item_id,
            (Self::Item { item_id }, ChangeEvent::ItemStatus { item_id: changed, .. }) => {
                changed == item_id
            }
        }
    }
}

/// Events sent over the realtime WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// Server confirms the connection is authenticated
    Ready { user_id: Uuid },

    /// A subscription was accepted
    Subscribed { sub_id: Uuid, filter: FeedFilter },

    /// A change matched one of the client's subscriptions
    Change { sub_id: Uuid, change: ChangeEvent },

    /// A command was rejected
    Error { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeCommand {
    /// Start receiving changes that match `filter`, tagged with `sub_id`.
    Subscribe { sub_id: Uuid, filter: FeedFilter },

    /// Stop a subscription
    Unsubscribe { sub_id: Uuid },
}

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use macfind_types::events::{ChangeEvent, FeedFilter};
use macfind_types::models::{Item, ItemStatus, Message, NewContent};

use crate::error::Result;

/// Request/response access to messages and items, on behalf of `user`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Unread messages addressed to `user`, newest first.
    async fn unread_messages(&self, user: Uuid) -> Result<Vec<Message>>;

    /// The thread between `viewer` and `other` on an item, oldest first.
    async fn thread_messages(&self, item_id: Uuid, viewer: Uuid, other: Uuid) -> Result<Vec<Message>>;

    async fn send_message(
        &self,
        sender: Uuid,
        item_id: Uuid,
        receiver: Uuid,
        content: NewContent,
    ) -> Result<Message>;

    /// Returns the number of messages newly marked read.
    async fn mark_thread_read(&self, item_id: Uuid, counterparty: Uuid, receiver: Uuid) -> Result<usize>;

    async fn mark_message_read(&self, message_id: Uuid, receiver: Uuid) -> Result<bool>;

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>>;

    async fn set_item_status(&self, item_id: Uuid, actor: Uuid, status: ItemStatus) -> Result<ItemStatus>;
}

/// Realtime row changes, filtered per subscription.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, user: Uuid, filter: FeedFilter) -> Result<Subscription>;
}

/// A live feed subscription. Dropping it tears the feed down.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next matching change, or `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

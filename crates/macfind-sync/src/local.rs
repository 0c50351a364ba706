use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use macfind_db::{Database, NewMessage};
use macfind_gateway::dispatcher::Dispatcher;
use macfind_types::events::{ChangeEvent, FeedFilter};
use macfind_types::models::{Item, ItemStatus, Message, NewContent};

use crate::backend::{ChangeFeed, MessageStore, Subscription};
use crate::error::{Result, SyncError};

/// In-process backend: the store and dispatcher are called directly.
#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> macfind_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }
}

#[async_trait]
impl MessageStore for LocalBackend {
    async fn unread_messages(&self, user: Uuid) -> Result<Vec<Message>> {
        self.blocking(move |db| db.unread_messages(user)).await
    }

    async fn thread_messages(&self, item_id: Uuid, viewer: Uuid, other: Uuid) -> Result<Vec<Message>> {
        self.blocking(move |db| db.thread_messages(item_id, viewer, Some(other))).await
    }

    async fn send_message(
        &self,
        sender: Uuid,
        item_id: Uuid,
        receiver: Uuid,
        content: NewContent,
    ) -> Result<Message> {
        let message = self
            .blocking(move |db| {
                let handle = db.get_user(sender)?.map(|p| p.email);
                db.insert_message(&NewMessage {
                    item_id,
                    sender_id: sender,
                    receiver_id: receiver,
                    content,
                    sender_handle: handle
                        .as_deref()
                        .map(|email| macfind_types::tags::handle_from_email(email).to_string()),
                })
            })
            .await?;
        self.dispatcher.publish(ChangeEvent::MessageInsert(message.clone()));
        Ok(message)
    }

    async fn mark_thread_read(&self, item_id: Uuid, counterparty: Uuid, receiver: Uuid) -> Result<usize> {
        let now = Utc::now();
        self.blocking(move |db| db.mark_thread_read(item_id, counterparty, receiver, now)).await
    }

    async fn mark_message_read(&self, message_id: Uuid, receiver: Uuid) -> Result<bool> {
        let now = Utc::now();
        self.blocking(move |db| db.mark_message_read(message_id, receiver, now)).await
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>> {
        self.blocking(move |db| db.get_item(item_id)).await
    }

    async fn set_item_status(&self, item_id: Uuid, actor: Uuid, status: ItemStatus) -> Result<ItemStatus> {
        let status = self
            .blocking(move |db| db.set_item_status(item_id, actor, status))
            .await?;
        self.dispatcher.publish(ChangeEvent::ItemStatus { item_id, status });
        Ok(status)
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn subscribe(&self, user: Uuid, filter: FeedFilter) -> Result<Subscription> {
        if let FeedFilter::Receiver { user_id } = filter {
            if user_id != user {
                return Err(SyncError::Rejected(
                    "receiver filter must name the subscribing user".into(),
                ));
            }
        }

        let mut changes = self.dispatcher.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if change.visible_to(user) && filter.matches(&change) && tx.send(change).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Local feed for {} lagged by {} changes", user, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use macfind_db::NewItem;

    async fn setup() -> (LocalBackend, Uuid, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let finder = db.upsert_identity("finder@mcmaster.ca").unwrap();
        let claimant = db.upsert_identity("claimant@mcmaster.ca").unwrap();
        db.ensure_user(finder, "finder@mcmaster.ca", None).unwrap();
        db.ensure_user(claimant, "claimant@mcmaster.ca", None).unwrap();
        let item = db
            .insert_item(&NewItem { poster_id: Some(finder), ..NewItem::default() })
            .unwrap()
            .id;
        (LocalBackend::new(Arc::new(db), Dispatcher::new()), item, finder, claimant)
    }

    #[tokio::test]
    async fn feed_delivers_only_matching_visible_rows() {
        let (backend, item, finder, claimant) = setup().await;
        let mut inbox = backend
            .subscribe(finder, FeedFilter::Receiver { user_id: finder })
            .await
            .unwrap();

        backend
            .send_message(finder, item, claimant, NewContent::Text("to you".into()))
            .await
            .unwrap();
        let sent = backend
            .send_message(claimant, item, finder, NewContent::Text("to me".into()))
            .await
            .unwrap();

        match inbox.recv().await {
            Some(ChangeEvent::MessageInsert(msg)) => {
                assert_eq!(msg.id, sent.id);
                assert_eq!(msg.sender_handle.as_deref(), Some("claimant"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn receiver_filter_for_someone_else_is_rejected() {
        let (backend, _, finder, claimant) = setup().await;
        let result = backend.subscribe(finder, FeedFilter::Receiver { user_id: claimant }).await;
        assert!(matches!(result, Err(SyncError::Rejected(_))));
    }

    #[tokio::test]
    async fn denied_status_change_is_reported_as_policy() {
        let (backend, item, _, _) = setup().await;
        let err = backend
            .set_item_status(item, Uuid::new_v4(), ItemStatus::Claimed)
            .await
            .unwrap_err();
        assert!(err.is_policy_denied());
    }
}

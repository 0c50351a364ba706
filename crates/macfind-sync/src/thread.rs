//! An open chat thread between the viewer and one counterparty about an item.
//!
//! While open, the session keeps the viewer's side read, folds confirmations
//! into the handshake state and marks the item claimed the first time it sees
//! both sides confirm.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use macfind_types::events::{ChangeEvent, FeedFilter};
use macfind_types::handshake::{ClosureLatch, Confirmations};
use macfind_types::models::{ConfirmKind, ItemStatus, Message, NewContent, sort_messages};

use crate::backend::{ChangeFeed, MessageStore, Subscription};
use crate::error::{Result, SyncError};

struct ThreadState {
    messages: Vec<Message>,
    confirmations: Confirmations,
    status: ItemStatus,
}

struct Inner<B> {
    backend: Arc<B>,
    item_id: Uuid,
    viewer: Uuid,
    counterparty: Uuid,
    finder: Option<Uuid>,
    state: Mutex<ThreadState>,
    latch: ClosureLatch,
    closed: watch::Sender<bool>,
    len: watch::Sender<usize>,
}

impl<B: MessageStore> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, ThreadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a message to the thread if it belongs here and is new.
    fn ingest(&self, msg: Message) -> bool {
        if !msg.in_thread(self.item_id, self.viewer, self.counterparty) {
            return false;
        }
        let mut state = self.lock();
        if state.messages.iter().any(|m| m.id == msg.id) {
            return false;
        }
        state.confirmations.observe(&msg);
        state.messages.push(msg);
        sort_messages(&mut state.messages);
        self.len.send_replace(state.messages.len());
        true
    }

    fn is_closed(&self) -> bool {
        let Some(finder) = self.finder else { return false };
        self.lock()
            .confirmations
            .is_closed(finder, self.viewer, self.counterparty)
    }

    /// Fire the claimed write once, the first time closure is observed.
    async fn settle(&self) {
        if !self.is_closed() {
            return;
        }
        self.closed.send_replace(true);
        if !self.latch.trip() {
            return;
        }
        if self.lock().status == ItemStatus::Claimed {
            debug!("Item {} already claimed", self.item_id);
            return;
        }

        match self
            .backend
            .set_item_status(self.item_id, self.viewer, ItemStatus::Claimed)
            .await
        {
            Ok(status) => {
                self.lock().status = status;
                info!("Item {} claimed after handshake", self.item_id);
            }
            Err(e) if e.is_policy_denied() => debug!("Claim of {} denied for {}", self.item_id, self.viewer),
            Err(e) => warn!("Failed to mark {} claimed: {}", self.item_id, e),
        }
    }

    async fn mark_read(&self) {
        match self
            .backend
            .mark_thread_read(self.item_id, self.counterparty, self.viewer)
            .await
        {
            Ok(0) => {}
            Ok(n) => debug!("Marked {} messages read on {}", n, self.item_id),
            Err(e) => warn!("Failed to mark thread {} read: {}", self.item_id, e),
        }
    }

    async fn on_change(&self, change: ChangeEvent) {
        match change {
            ChangeEvent::MessageInsert(msg) => {
                let incoming = msg.sender_id == self.counterparty && msg.receiver_id == self.viewer;
                if !self.ingest(msg) {
                    return;
                }
                if incoming {
                    self.mark_read().await;
                }
                self.settle().await;
            }
            ChangeEvent::ItemStatus { item_id, status } if item_id == self.item_id => {
                self.lock().status = status;
            }
            ChangeEvent::ItemStatus { .. } => {}
        }
    }
}

/// A live thread. Dropping it stops the realtime task.
pub struct ThreadSession<B> {
    inner: Arc<Inner<B>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<B> ThreadSession<B>
where
    B: MessageStore + ChangeFeed + 'static,
{
    /// Subscribe to the item's changes, load the history, mark the viewer's
    /// side read and check whether the handshake already completed.
    pub async fn open(backend: Arc<B>, item_id: Uuid, viewer: Uuid, counterparty: Uuid) -> Result<Self> {
        let item = backend
            .get_item(item_id)
            .await?
            .ok_or(SyncError::ItemNotFound(item_id))?;

        // subscribe before loading so nothing lands between the two
        let feed = backend.subscribe(viewer, FeedFilter::Item { item_id }).await?;
        let history = backend.thread_messages(item_id, viewer, counterparty).await?;

        let (closed, _) = watch::channel(false);
        let (len, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            backend,
            item_id,
            viewer,
            counterparty,
            finder: item.owner_id,
            state: Mutex::new(ThreadState {
                messages: Vec::new(),
                confirmations: Confirmations::default(),
                status: item.status,
            }),
            latch: ClosureLatch::new(),
            closed,
            len,
        });
        for msg in history {
            inner.ingest(msg);
        }
        inner.mark_read().await;
        inner.settle().await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(inner.clone(), feed, cancel.clone()));
        debug!("Opened thread {} between {} and {}", item_id, viewer, counterparty);

        Ok(Self { inner, cancel, task })
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<Message> {
        self.send(NewContent::Text(body.into())).await
    }

    /// Send a handshake confirmation. The server decides which role it counts
    /// for.
    pub async fn confirm(&self, kind: ConfirmKind) -> Result<Message> {
        self.send(NewContent::Confirm(kind)).await
    }

    async fn send(&self, content: NewContent) -> Result<Message> {
        let inner = &self.inner;
        let msg = inner
            .backend
            .send_message(inner.viewer, inner.item_id, inner.counterparty, content)
            .await?;
        inner.ingest(msg.clone());
        inner.settle().await;
        Ok(msg)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }

    pub fn status(&self) -> ItemStatus {
        self.inner.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Flips to true once the handshake completes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Number of messages in the thread.
    pub fn message_count(&self) -> watch::Receiver<usize> {
        self.inner.len.subscribe()
    }

    pub fn close(self) {}
}

impl<B> Drop for ThreadSession<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run<B: MessageStore>(inner: Arc<Inner<B>>, mut feed: Subscription, cancel: CancellationToken) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = feed.recv() => change,
        };
        match change {
            Some(change) => inner.on_change(change).await,
            None => {
                info!("Thread feed for {} ended", inner.item_id);
                break;
            }
        }
    }
}

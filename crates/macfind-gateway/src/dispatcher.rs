use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use macfind_types::events::ChangeEvent;

/// Fans row changes out to every connected realtime client. Each connection
/// applies its own subscription filters on the receiving side.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every published change goes to every receiver
    changes_tx: broadcast::Sender<ChangeEvent>,

    /// Open connections per user: user_id -> count
    connections: RwLock<HashMap<Uuid, usize>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                changes_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the raw change stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes_tx.subscribe()
    }

    /// Live receivers of the raw change stream.
    pub fn listener_count(&self) -> usize {
        self.inner.changes_tx.receiver_count()
    }

    /// Publish a committed change. Dropped silently when nobody listens.
    pub fn publish(&self, event: ChangeEvent) {
        if let Err(e) = self.inner.changes_tx.send(event) {
            debug!("No realtime listeners for {:?}", e.0);
        }
    }

    pub async fn connected(&self, user_id: Uuid) {
        *self.inner.connections.write().await.entry(user_id).or_default() += 1;
    }

    pub async fn disconnected(&self, user_id: Uuid) {
        let mut connections = self.inner.connections.write().await;
        if let Some(count) = connections.get_mut(&user_id) {
            *count -= 1;
            if *count == 0 {
                connections.remove(&user_id);
            }
        }
    }

    /// Number of open realtime connections for a user.
    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .connections
            .read()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }
}

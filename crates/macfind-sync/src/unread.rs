//! Unread notification tracking.
//!
//! The unread set is fed from two sides: a periodic pull that replaces it
//! wholesale, and a push subscription that merges single inserts. Both can
//! deliver the same row, so merges are keyed by message id. Every pull and
//! push is tagged with the generation it was started under; a user switch
//! bumps the generation and anything still in flight for the old user is
//! dropped on arrival.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use macfind_types::events::{ChangeEvent, FeedFilter};
use macfind_types::models::Message;

use crate::backend::{ChangeFeed, MessageStore};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Unread messages for one user, newest first, unique by id.
#[derive(Debug, Default, Clone)]
pub struct UnreadSet {
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
}

impl UnreadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with a fresh pull.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.clear();
        for msg in messages {
            if self.ids.insert(msg.id) {
                self.messages.push(msg);
            }
        }
        self.messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    }

    /// Merge one pushed message. Returns false if it was already present,
    /// already read, or addressed to someone other than `user`.
    pub fn merge(&mut self, user: Uuid, msg: Message) -> bool {
        if msg.receiver_id != user || !msg.is_unread() || self.ids.contains(&msg.id) {
            return false;
        }
        let pos = self
            .messages
            .partition_point(|m| (m.created_at, m.id) > (msg.created_at, msg.id));
        self.ids.insert(msg.id);
        self.messages.insert(pos, msg);
        true
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Message> {
        if !self.ids.remove(&id) {
            return None;
        }
        let pos = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(pos))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn ids(&self) -> &HashSet<Uuid> {
        &self.ids
    }
}

#[derive(Default)]
struct TrackerState {
    generation: u64,
    user: Option<Uuid>,
    set: UnreadSet,
}

struct Shared {
    state: Mutex<TrackerState>,
    badge: watch::Sender<usize>,
}

impl Shared {
    fn new() -> Self {
        let (badge, _) = watch::channel(0);
        Self {
            state: Mutex::new(TrackerState::default()),
            badge,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new generation for `user`. The set is emptied until the first
    /// pull lands.
    fn begin(&self, user: Option<Uuid>) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.user = user;
        state.set.clear();
        self.badge.send_replace(0);
        state.generation
    }

    fn apply_poll(&self, generation: u64, messages: Vec<Message>) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            debug!("Dropping unread poll from generation {}", generation);
            return false;
        }
        state.set.replace(messages);
        self.badge.send_replace(state.set.len());
        true
    }

    fn apply_push(&self, generation: u64, msg: Message) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        let Some(user) = state.user else { return false };
        let added = state.set.merge(user, msg);
        if added {
            self.badge.send_replace(state.set.len());
        }
        added
    }
}

struct Session {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Keeps the unread set for the current user up to date.
///
/// Must be driven from inside a tokio runtime: `set_user` spawns the poll and
/// push tasks.
pub struct UnreadTracker<B> {
    backend: Arc<B>,
    shared: Arc<Shared>,
    poll_interval: Duration,
    session: Mutex<Option<Session>>,
}

impl<B> UnreadTracker<B>
where
    B: MessageStore + ChangeFeed + 'static,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_poll_interval(backend, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(backend: Arc<B>, poll_interval: Duration) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared::new()),
            poll_interval,
            session: Mutex::new(None),
        }
    }

    /// Switch identity. Tears down the previous user's tasks first; passing
    /// `None` signs out.
    pub fn set_user(&self, user: Option<Uuid>) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = session.take() {
            old.shutdown();
        }

        let generation = self.shared.begin(user);
        let Some(user) = user else {
            info!("Unread tracker stopped");
            return;
        };
        info!("Tracking unread messages for {} (generation {})", user, generation);

        let cancel = CancellationToken::new();
        let poll = tokio::spawn(poll_loop(
            self.backend.clone(),
            self.shared.clone(),
            user,
            generation,
            self.poll_interval,
            cancel.clone(),
        ));
        let push = tokio::spawn(push_loop(
            self.backend.clone(),
            self.shared.clone(),
            user,
            generation,
            cancel.clone(),
        ));
        *session = Some(Session {
            cancel,
            tasks: vec![poll, push],
        });
    }

    pub fn stop(&self) {
        self.set_user(None);
    }

    pub fn user(&self) -> Option<Uuid> {
        self.shared.lock().user
    }

    /// Pull now instead of waiting for the next tick.
    pub async fn refresh(&self) -> crate::error::Result<()> {
        let (user, generation) = {
            let state = self.shared.lock();
            (state.user, state.generation)
        };
        let Some(user) = user else { return Ok(()) };
        let messages = self.backend.unread_messages(user).await?;
        self.shared.apply_poll(generation, messages);
        Ok(())
    }

    /// The user opened a notification. It leaves the set immediately and is
    /// marked read in the background; a failed write is picked up again by
    /// the next pull.
    pub fn open_notification(&self, message_id: Uuid) -> bool {
        let user = {
            let mut state = self.shared.lock();
            let Some(user) = state.user else { return false };
            if state.set.remove(message_id).is_none() {
                return false;
            }
            self.shared.badge.send_replace(state.set.len());
            user
        };

        let backend = self.backend.clone();
        tokio::spawn(async move {
            match backend.mark_message_read(message_id, user).await {
                Ok(true) => debug!("Marked {} read", message_id),
                Ok(false) => debug!("{} was already read", message_id),
                Err(e) if e.is_policy_denied() => debug!("Mark read of {} denied", message_id),
                Err(e) => warn!("Failed to mark {} read: {}", message_id, e),
            }
        });
        true
    }

    pub fn unread(&self) -> Vec<Message> {
        self.shared.lock().set.messages().to_vec()
    }

    pub fn count(&self) -> usize {
        self.shared.lock().set.len()
    }

    /// Unread count, updated whenever the set changes.
    pub fn badge(&self) -> watch::Receiver<usize> {
        self.shared.badge.subscribe()
    }
}

impl<B> Drop for UnreadTracker<B> {
    fn drop(&mut self) {
        let session = self.session.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = session.take() {
            session.shutdown();
        }
    }
}

async fn poll_loop<B: MessageStore>(
    backend: Arc<B>,
    shared: Arc<Shared>,
    user: Uuid,
    generation: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = backend.unread_messages(user) => result,
        };
        match result {
            Ok(messages) => {
                shared.apply_poll(generation, messages);
            }
            Err(e) => warn!("Unread poll for {} failed: {}", user, e),
        }
    }
    debug!("Unread poll for {} stopped", user);
}

async fn push_loop<B: ChangeFeed>(
    backend: Arc<B>,
    shared: Arc<Shared>,
    user: Uuid,
    generation: u64,
    cancel: CancellationToken,
) {
    let subscribed = tokio::select! {
        _ = cancel.cancelled() => return,
        result = backend.subscribe(user, FeedFilter::Receiver { user_id: user }) => result,
    };
    let mut feed = match subscribed {
        Ok(feed) => feed,
        Err(e) => {
            // polling still covers this user
            warn!("Unread feed for {} unavailable: {}", user, e);
            return;
        }
    };

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = feed.recv() => change,
        };
        match change {
            Some(ChangeEvent::MessageInsert(msg)) => {
                shared.apply_push(generation, msg);
            }
            Some(_) => {}
            None => {
                info!("Unread feed for {} ended", user);
                break;
            }
        }
    }
}

use std::collections::HashMap;

use uuid::Uuid;

use macfind_types::events::{ChangeEvent, FeedFilter, RealtimeCommand, RealtimeEvent};

/// Filters registered on one realtime connection, keyed by the client's sub id.
#[derive(Debug)]
pub struct Subscriptions {
    user_id: Uuid,
    filters: HashMap<Uuid, FeedFilter>,
}

impl Subscriptions {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            filters: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Apply a client command. Returns the reply to send, if any.
    pub fn apply(&mut self, cmd: RealtimeCommand) -> Option<RealtimeEvent> {
        match cmd {
            RealtimeCommand::Subscribe { sub_id, filter } => {
                if let FeedFilter::Receiver { user_id } = filter {
                    if user_id != self.user_id {
                        return Some(RealtimeEvent::Error {
                            message: "receiver filter must name the connected user".into(),
                        });
                    }
                }
                self.filters.insert(sub_id, filter);
                Some(RealtimeEvent::Subscribed { sub_id, filter })
            }
            RealtimeCommand::Unsubscribe { sub_id } => {
                self.filters.remove(&sub_id);
                None
            }
        }
    }

    /// One `Change` per matching subscription. Rows the user may not see
    /// produce nothing.
    pub fn route(&self, change: &ChangeEvent) -> Vec<RealtimeEvent> {
        if !change.visible_to(self.user_id) {
            return Vec::new();
        }
        self.filters
            .iter()
            .filter(|(_, filter)| filter.matches(change))
            .map(|(sub_id, _)| RealtimeEvent::Change {
                sub_id: *sub_id,
                change: change.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use macfind_types::models::{Message, MessageContent};

    fn message(item_id: Uuid, sender_id: Uuid, receiver_id: Uuid) -> ChangeEvent {
        ChangeEvent::MessageInsert(Message {
            id: Uuid::new_v4(),
            item_id,
            sender_id,
            receiver_id,
            content: MessageContent::text("still there?"),
            sender_handle: None,
            read_at: None,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn receiver_filter_only_for_self() {
        let me = Uuid::new_v4();
        let mut subs = Subscriptions::new(me);

        let reply = subs.apply(RealtimeCommand::Subscribe {
            sub_id: Uuid::new_v4(),
            filter: FeedFilter::Receiver { user_id: Uuid::new_v4() },
        });
        assert!(matches!(reply, Some(RealtimeEvent::Error { .. })));
        assert!(subs.is_empty());

        let sub_id = Uuid::new_v4();
        let reply = subs.apply(RealtimeCommand::Subscribe {
            sub_id,
            filter: FeedFilter::Receiver { user_id: me },
        });
        assert!(matches!(reply, Some(RealtimeEvent::Subscribed { sub_id: s, .. }) if s == sub_id));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn item_filter_does_not_leak_other_threads() {
        let (me, finder, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let item = Uuid::new_v4();
        let mut subs = Subscriptions::new(me);
        let sub_id = Uuid::new_v4();
        subs.apply(RealtimeCommand::Subscribe { sub_id, filter: FeedFilter::Item { item_id: item } });

        assert_eq!(subs.route(&message(item, finder, me)).len(), 1);
        assert!(subs.route(&message(item, finder, stranger)).is_empty());
        assert!(subs.route(&message(Uuid::new_v4(), finder, me)).is_empty());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let me = Uuid::new_v4();
        let mut subs = Subscriptions::new(me);
        let sub_id = Uuid::new_v4();
        subs.apply(RealtimeCommand::Subscribe { sub_id, filter: FeedFilter::Receiver { user_id: me } });

        let event = message(Uuid::new_v4(), Uuid::new_v4(), me);
        assert_eq!(subs.route(&event).len(), 1);

        assert!(subs.apply(RealtimeCommand::Unsubscribe { sub_id }).is_none());
        assert!(subs.route(&event).is_empty());
    }
}

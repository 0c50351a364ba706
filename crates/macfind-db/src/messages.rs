use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use macfind_types::api::ThreadSummary;
use macfind_types::models::{Message, NewContent, Role, sort_messages};

use crate::Database;
use crate::error::{Result, StoreError, is_foreign_key_violation};
use crate::models::{MESSAGE_COLUMNS, MessageRow, fmt_ts};

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub item_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: NewContent,
    pub sender_handle: Option<String>,
}

impl Database {
    /// Append a message to a thread. The poster lookup and insert share the
    /// writer lock, so the assigned role cannot race an ownership change.
    pub fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        self.with_conn_mut(|conn| {
            let poster: Option<Option<String>> = conn
                .query_row(
                    "SELECT poster_id FROM items WHERE id = ?1",
                    [new.item_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(poster) = poster else {
                return Err(StoreError::NotFound("item"));
            };
            let poster = poster.and_then(|p| p.parse::<Uuid>().ok());

            let (body, role, kind) = match &new.content {
                NewContent::Text(body) => (Some(body.as_str()), None, None),
                NewContent::Confirm(kind) => {
                    let role = Role::for_sender(new.sender_id, poster);
                    (None, Some(role.as_str()), Some(kind.as_str()))
                }
            };

            let result = conn.execute(
                "INSERT INTO messages (id, item_id, sender_id, receiver_id, body, confirm_role,
                                       confirm_kind, sender_handle, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.to_string(),
                    new.item_id.to_string(),
                    new.sender_id.to_string(),
                    new.receiver_id.to_string(),
                    body,
                    role,
                    kind,
                    new.sender_handle,
                    fmt_ts(now),
                ],
            );
            match result {
                Ok(_) => {}
                Err(e) if is_foreign_key_violation(&e) => {
                    return Err(StoreError::MissingUser(new.sender_id));
                }
                Err(e) => return Err(e.into()),
            }

            let row = conn.query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                [id.to_string()],
                MessageRow::from_row,
            )?;
            Message::try_from(row)
        })
    }

    /// Messages on an item visible to `viewer`, oldest first. With `other`
    /// set, only the thread between the two users.
    pub fn thread_messages(&self, item_id: Uuid, viewer: Uuid, other: Option<Uuid>) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let rows = match other {
                Some(other) => thread_between(conn, item_id, viewer, other)?,
                None => query_messages(
                    conn,
                    "item_id = ?1 AND (sender_id = ?2 OR receiver_id = ?2)",
                    &[item_id.to_string(), viewer.to_string()],
                )?,
            };
            let mut messages = rows;
            sort_messages(&mut messages);
            Ok(messages)
        })
    }

    /// Unread messages addressed to `receiver`, newest first.
    pub fn unread_messages(&self, receiver: Uuid) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut messages = query_messages(
                conn,
                "receiver_id = ?1 AND read_at IS NULL",
                &[receiver.to_string()],
            )?;
            sort_messages(&mut messages);
            messages.reverse();
            Ok(messages)
        })
    }

    /// Mark every unread message from `counterparty` to `receiver` on the item.
    /// Rows already read keep their original timestamp.
    pub fn mark_thread_read(
        &self,
        item_id: Uuid,
        counterparty: Uuid,
        receiver: Uuid,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET read_at = ?1
                 WHERE item_id = ?2 AND sender_id = ?3 AND receiver_id = ?4 AND read_at IS NULL",
                (fmt_ts(now), item_id.to_string(), counterparty.to_string(), receiver.to_string()),
            )?;
            Ok(updated)
        })
    }

    /// Mark one message read. Only its receiver may do so; anything else is a no-op.
    pub fn mark_message_read(&self, message_id: Uuid, receiver: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET read_at = ?1
                 WHERE id = ?2 AND receiver_id = ?3 AND read_at IS NULL",
                (fmt_ts(now), message_id.to_string(), receiver.to_string()),
            )?;
            Ok(updated > 0)
        })
    }

    /// One entry per counterparty the viewer has talked to about the item,
    /// most recent conversation first.
    pub fn list_threads(&self, item_id: Uuid, viewer: Uuid) -> Result<Vec<ThreadSummary>> {
        let messages = self.thread_messages(item_id, viewer, None)?;

        let mut threads: HashMap<Uuid, ThreadSummary> = HashMap::new();
        for msg in messages {
            let counterparty = msg.counterparty_of(viewer);
            let unread = u32::from(msg.receiver_id == viewer && msg.is_unread());
            match threads.get_mut(&counterparty) {
                Some(summary) => {
                    summary.unread += unread;
                    summary.last_message = msg;
                }
                None => {
                    threads.insert(
                        counterparty,
                        ThreadSummary {
                            item_id,
                            counterparty_id: counterparty,
                            last_message: msg,
                            unread,
                        },
                    );
                }
            }
        }

        let mut threads: Vec<ThreadSummary> = threads.into_values().collect();
        threads.sort_by(|a, b| {
            b.last_message
                .created_at
                .cmp(&a.last_message.created_at)
                .then(b.last_message.id.cmp(&a.last_message.id))
        });
        Ok(threads)
    }
}

/// The thread between `a` and `b` on an item, in either direction.
pub(crate) fn thread_between(conn: &Connection, item_id: Uuid, a: Uuid, b: Uuid) -> Result<Vec<Message>> {
    query_messages(
        conn,
        "item_id = ?1 AND ((sender_id = ?2 AND receiver_id = ?3)
                        OR (sender_id = ?3 AND receiver_id = ?2))",
        &[item_id.to_string(), a.to_string(), b.to_string()],
    )
}

fn query_messages(conn: &Connection, predicate: &str, params: &[String]) -> Result<Vec<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE {}", MESSAGE_COLUMNS, predicate);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), MessageRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        match Message::try_from(row) {
            Ok(msg) => messages.push(msg),
            Err(e) => warn!("Skipping message: {}", e),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewItem;
    use macfind_types::handshake::Confirmations;
    use macfind_types::models::{ConfirmKind, ItemStatus, MessageContent};

    struct Fixture {
        db: Database,
        item: Uuid,
        finder: Uuid,
        claimant: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let finder = db.upsert_identity("finder@mcmaster.ca").unwrap();
        let claimant = db.upsert_identity("claimant@mcmaster.ca").unwrap();
        db.ensure_user(finder, "finder@mcmaster.ca", None).unwrap();
        db.ensure_user(claimant, "claimant@mcmaster.ca", None).unwrap();
        let item = db
            .insert_item(&NewItem {
                vague_description: Some("blue water bottle".into()),
                poster_id: Some(finder),
                ..NewItem::default()
            })
            .unwrap()
            .id;
        Fixture { db, item, finder, claimant }
    }

    fn send(fx: &Fixture, from: Uuid, to: Uuid, content: NewContent) -> Message {
        fx.db
            .insert_message(&NewMessage {
                item_id: fx.item,
                sender_id: from,
                receiver_id: to,
                content,
                sender_handle: None,
            })
            .unwrap()
    }

    #[test]
    fn mark_thread_read_is_idempotent() {
        let fx = fixture();
        send(&fx, fx.claimant, fx.finder, NewContent::Text("is it mine?".into()));
        send(&fx, fx.claimant, fx.finder, NewContent::Text("it has a sticker".into()));
        send(&fx, fx.finder, fx.claimant, NewContent::Text("which sticker?".into()));

        let first = Utc::now();
        assert_eq!(fx.db.mark_thread_read(fx.item, fx.claimant, fx.finder, first).unwrap(), 2);

        let stamps: Vec<_> = fx
            .db
            .thread_messages(fx.item, fx.finder, Some(fx.claimant))
            .unwrap()
            .into_iter()
            .map(|m| m.read_at)
            .collect();

        let later = first + chrono::Duration::seconds(30);
        assert_eq!(fx.db.mark_thread_read(fx.item, fx.claimant, fx.finder, later).unwrap(), 0);

        let again: Vec<_> = fx
            .db
            .thread_messages(fx.item, fx.finder, Some(fx.claimant))
            .unwrap()
            .into_iter()
            .map(|m| m.read_at)
            .collect();
        assert_eq!(stamps, again);

        // The finder's own outgoing message stays unread for the claimant.
        assert_eq!(fx.db.unread_messages(fx.claimant).unwrap().len(), 1);
        assert!(fx.db.unread_messages(fx.finder).unwrap().is_empty());
    }

    #[test]
    fn confirm_role_is_assigned_from_poster() {
        let fx = fixture();
        let found = send(&fx, fx.claimant, fx.finder, NewContent::Confirm(ConfirmKind::Found));
        let returned = send(&fx, fx.finder, fx.claimant, NewContent::Confirm(ConfirmKind::Returned));

        assert_eq!(
            found.content,
            MessageContent::Confirm { role: Role::Claimant, kind: ConfirmKind::Found }
        );
        assert_eq!(returned.content.as_confirm(), Some((Role::Finder, ConfirmKind::Returned)));

        let history = fx.db.thread_messages(fx.item, fx.finder, Some(fx.claimant)).unwrap();
        let confirmations = Confirmations::from_history(&history);
        assert!(confirmations.is_closed(fx.finder, fx.finder, fx.claimant));
        assert!(confirmations.is_closed(fx.finder, fx.claimant, fx.finder));
    }

    #[test]
    fn sender_without_profile_is_missing_user() {
        let fx = fixture();
        let ghost = Uuid::new_v4();
        let err = fx
            .db
            .insert_message(&NewMessage {
                item_id: fx.item,
                sender_id: ghost,
                receiver_id: fx.finder,
                content: NewContent::Text("hello".into()),
                sender_handle: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingUser(id) if id == ghost));
    }

    #[test]
    fn message_on_unknown_item_is_not_found() {
        let fx = fixture();
        let err = fx
            .db
            .insert_message(&NewMessage {
                item_id: Uuid::new_v4(),
                sender_id: fx.claimant,
                receiver_id: fx.finder,
                content: NewContent::Text("hello".into()),
                sender_handle: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("item")));
    }

    #[test]
    fn mark_message_read_only_by_receiver() {
        let fx = fixture();
        let msg = send(&fx, fx.claimant, fx.finder, NewContent::Text("hi".into()));
        let now = Utc::now();

        assert!(!fx.db.mark_message_read(msg.id, fx.claimant, now).unwrap());
        assert!(fx.db.mark_message_read(msg.id, fx.finder, now).unwrap());
        assert!(!fx.db.mark_message_read(msg.id, fx.finder, now).unwrap());
    }

    #[test]
    fn threads_are_listed_per_viewer() {
        let fx = fixture();
        let other = fx.db.upsert_identity("other@mcmaster.ca").unwrap();
        fx.db.ensure_user(other, "other@mcmaster.ca", None).unwrap();

        send(&fx, fx.claimant, fx.finder, NewContent::Text("CLAIM: red sticker".into()));
        send(&fx, other, fx.finder, NewContent::Text("mine too?".into()));
        send(&fx, fx.finder, other, NewContent::Text("no".into()));

        let threads = fx.db.list_threads(fx.item, fx.finder).unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].counterparty_id, other);
        assert_eq!(threads[0].unread, 1);
        assert_eq!(threads[1].counterparty_id, fx.claimant);

        // The claimant only sees their own thread.
        let mine = fx.db.list_threads(fx.item, fx.claimant).unwrap();
        assert_eq!(mine.len(), 1);
    }

    #[test]
    fn chatting_is_not_enough_to_claim() {
        let fx = fixture();
        let other = fx.db.upsert_identity("other@mcmaster.ca").unwrap();
        fx.db.ensure_user(other, "other@mcmaster.ca", None).unwrap();

        send(&fx, fx.claimant, fx.finder, NewContent::Text("CLAIM: red sticker".into()));
        // two non-posters talking to each other about the item
        send(&fx, fx.claimant, other, NewContent::Text("is it yours?".into()));
        send(&fx, other, fx.claimant, NewContent::Confirm(ConfirmKind::Returned));

        for actor in [fx.claimant, other] {
            assert!(matches!(
                fx.db.set_item_status(fx.item, actor, ItemStatus::Claimed),
                Err(StoreError::PolicyDenied(_))
            ));
        }
        assert_eq!(fx.db.get_item(fx.item).unwrap().unwrap().status, ItemStatus::Found);
    }

    #[test]
    fn one_sided_confirmation_does_not_let_the_claimant_claim() {
        let fx = fixture();
        send(&fx, fx.claimant, fx.finder, NewContent::Confirm(ConfirmKind::Found));

        assert!(matches!(
            fx.db.set_item_status(fx.item, fx.claimant, ItemStatus::Claimed),
            Err(StoreError::PolicyDenied(_))
        ));
    }

    #[test]
    fn claimant_may_claim_after_both_confirm() {
        let fx = fixture();
        send(&fx, fx.claimant, fx.finder, NewContent::Confirm(ConfirmKind::Found));
        send(&fx, fx.finder, fx.claimant, NewContent::Confirm(ConfirmKind::Returned));

        assert_eq!(
            fx.db.set_item_status(fx.item, fx.claimant, ItemStatus::Claimed).unwrap(),
            ItemStatus::Claimed
        );
        assert_eq!(fx.db.get_item(fx.item).unwrap().unwrap().status, ItemStatus::Claimed);
    }

    #[test]
    fn messages_cascade_with_item() {
        let fx = fixture();
        send(&fx, fx.claimant, fx.finder, NewContent::Text("hi".into()));
        fx.db.delete_item(fx.item, fx.finder).unwrap();
        assert!(fx.db.unread_messages(fx.finder).unwrap().is_empty());
    }
}

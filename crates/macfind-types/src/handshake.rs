//! Claim/return handshake evaluation.
//!
//! A thread closes once the claimant has confirmed they got the item back
//! (`Found`) and the finder has confirmed they handed it over (`Returned`).
//! Roles are checked against the item's poster, so a confirmation only counts
//! when it comes from the participant holding the matching role.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::models::{ConfirmKind, Message, Role};

#[derive(Debug, Default, Clone)]
pub struct Confirmations {
    found_by: HashSet<Uuid>,
    returned_by: HashSet<Uuid>,
}

impl Confirmations {
    pub fn from_history<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Self {
        let mut this = Self::default();
        for msg in messages {
            this.observe(msg);
        }
        this
    }

    /// Fold one more message into the sets.
    pub fn observe(&mut self, msg: &Message) {
        match msg.content.as_confirm() {
            Some((Role::Claimant, ConfirmKind::Found)) => {
                self.found_by.insert(msg.sender_id);
            }
            Some((Role::Finder, ConfirmKind::Returned)) => {
                self.returned_by.insert(msg.sender_id);
            }
            _ => {}
        }
    }

    pub fn found_by(&self, user: Uuid) -> bool {
        self.found_by.contains(&user)
    }

    pub fn returned_by(&self, user: Uuid) -> bool {
        self.returned_by.contains(&user)
    }

    /// Closure as seen by `viewer` talking to `counterparty` about an item
    /// posted by `finder`. Anyone outside the pair sees an open thread.
    pub fn is_closed(&self, finder: Uuid, viewer: Uuid, counterparty: Uuid) -> bool {
        if viewer == counterparty {
            return false;
        }
        let claimant = if viewer == finder {
            counterparty
        } else if counterparty == finder {
            viewer
        } else {
            return false;
        };
        self.found_by(claimant) && self.returned_by(finder)
    }
}

/// One-shot guard so the claimed write fires once per session even if the
/// closure is observed on every refresh.
#[derive(Debug, Default)]
pub struct ClosureLatch(AtomicBool);

impl ClosureLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the first caller.
    pub fn trip(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

//! Coalescing FIFO of notifications buffered during outages.
//!
//! The queue never reorders distinct UUIDs; it only removes entries made
//! redundant by a later one for the same UUID.

use std::collections::VecDeque;

use tracing::debug;

use crate::{Notification, Oper};

/// FIFO with per-UUID coalescing.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<Notification>,
}

impl PendingQueue {
    /// Append a notification, dropping entries it supersedes: a DELETE
    /// removes every prior entry for the UUID, an UPDATE removes prior
    /// UPDATEs (CREATEs survive).
    pub fn push(&mut self, notification: Notification) {
        match notification.oper {
            Oper::Delete => {
                self.entries.retain(|n| {
                    let keep = n.uuid != notification.uuid;
                    if !keep {
                        debug!(oper = ?n.oper, uuid = %n.uuid, "Coalesced out of pending");
                    }
                    keep
                });
            }
            Oper::Update => {
                self.entries.retain(|n| {
                    let keep = n.uuid != notification.uuid || n.oper != Oper::Update;
                    if !keep {
                        debug!(oper = ?n.oper, uuid = %n.uuid, "Coalesced out of pending");
                    }
                    keep
                });
            }
            _ => {}
        }
        debug!(oper = ?notification.oper, uuid = %notification.uuid, "Buffered in pending");
        self.entries.push_back(notification);
    }

    /// Put a notification back at the head after a failed apply.
    pub fn push_front(&mut self, notification: Notification) {
        self.entries.push_front(notification);
    }

    pub fn pop_front(&mut self) -> Option<Notification> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn n(oper: Oper, uuid: Uuid) -> Notification {
        Notification { oper, kind: "virtual_machine".into(), uuid }
    }

    #[test]
    fn delete_supersedes_everything_for_the_uuid() {
        let u = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut q = PendingQueue::default();
        q.push(n(Oper::Create, u));
        q.push(n(Oper::Create, other));
        q.push(n(Oper::Update, u));
        q.push(n(Oper::Delete, u));

        let opers: Vec<_> = q.iter().map(|e| (e.oper, e.uuid)).collect();
        assert_eq!(opers, vec![(Oper::Create, other), (Oper::Delete, u)]);
    }

    #[test]
    fn update_supersedes_prior_updates_but_not_creates() {
        let u = Uuid::new_v4();
        let mut q = PendingQueue::default();
        q.push(n(Oper::Create, u));
        q.push(n(Oper::Update, u));
        q.push(n(Oper::Update, u));

        let opers: Vec<_> = q.iter().map(|e| e.oper).collect();
        assert_eq!(opers, vec![Oper::Create, Oper::Update]);
    }

    #[test]
    fn distinct_uuids_keep_their_relative_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut q = PendingQueue::default();
        q.push(n(Oper::Create, a));
        q.push(n(Oper::Create, b));
        q.push(n(Oper::Update, b));
        q.push(n(Oper::Update, a));

        let order: Vec<_> = q.iter().map(|e| (e.oper, e.uuid)).collect();
        assert_eq!(
            order,
            vec![(Oper::Create, a), (Oper::Create, b), (Oper::Update, b), (Oper::Update, a)]
        );
    }

    #[test]
    fn delete_then_recreate_keeps_both_in_order() {
        // Exercise the coalescing law over a mixed sequence.
        let u = Uuid::new_v4();
        let mut q = PendingQueue::default();
        for oper in [Oper::Create, Oper::Update, Oper::Update, Oper::Delete, Oper::Create, Oper::Update] {
            q.push(n(oper, u));
        }
        let opers: Vec<_> = q.iter().map(|e| e.oper).collect();
        assert_eq!(opers, vec![Oper::Delete, Oper::Create, Oper::Update]);
    }
}

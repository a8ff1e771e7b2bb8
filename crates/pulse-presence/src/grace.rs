//! Disconnect grace queue.
//!
//! Absorbs the common case of a client reconnecting within seconds of a
//! network blip. When the last known client of a user disconnects
//! ungracefully, the user-offline decision is parked here until the
//! grace window elapses; a reconnect in the meantime cancels it.

use std::collections::HashMap;

use pulse_core::types::id::{ClientId, UserId};

/// A pending user-offline decision for one disconnected client.
#[derive(Debug, Clone)]
pub struct GraceEntry {
    /// The disconnected client.
    pub client_id: ClientId,
    /// The user the client belonged to.
    pub user_id: UserId,
    /// Opaque user type, kept for the final offline notification.
    pub user_type: u32,
    /// When the disconnect was observed, epoch milliseconds.
    pub queued_at: i64,
    /// When the entry becomes due, epoch milliseconds.
    pub deadline: i64,
}

/// Queue of pending-offline entries, one per client.
#[derive(Debug)]
pub struct GraceQueue {
    window_ms: i64,
    entries: HashMap<ClientId, GraceEntry>,
}

impl GraceQueue {
    /// Create a queue with the given grace window.
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            entries: HashMap::new(),
        }
    }

    /// Enqueue a pending-offline entry. Re-pushing the same client
    /// refreshes its window.
    pub fn push(&mut self, client_id: &str, user_id: &UserId, user_type: u32, now_ms: i64) {
        self.entries.insert(
            client_id.to_string(),
            GraceEntry {
                client_id: client_id.to_string(),
                user_id: user_id.clone(),
                user_type,
                queued_at: now_ms,
                deadline: now_ms + self.window_ms,
            },
        );
    }

    /// Drop the entry for a client, if it belongs to the given user.
    /// Returns whether an entry was removed.
    pub fn cancel(&mut self, user_id: &UserId, client_id: &str) -> bool {
        match self.entries.get(client_id) {
            Some(entry) if entry.user_id == *user_id => {
                self.entries.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// The entry for a client, if pending.
    pub fn get(&self, client_id: &str) -> Option<&GraceEntry> {
        self.entries.get(client_id)
    }

    /// Whether any entry is pending for the user.
    pub fn has_user(&self, user_id: &UserId) -> bool {
        self.entries.values().any(|e| e.user_id == *user_id)
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn drain_due(&mut self, now_ms: i64) -> Vec<GraceEntry> {
        let due: Vec<ClientId> = self
            .entries
            .values()
            .filter(|e| e.deadline <= now_ms)
            .map(|e| e.client_id.clone())
            .collect();
        due.into_iter()
            .filter_map(|client_id| self.entries.remove(&client_id))
            .collect()
    }

    /// Users with at least one pending entry, deduplicated.
    pub fn users_pending(&self) -> Vec<(UserId, u32)> {
        let mut seen: Vec<(UserId, u32)> = Vec::new();
        for entry in self.entries.values() {
            if !seen.iter().any(|(user_id, _)| *user_id == entry.user_id) {
                seen.push((entry.user_id.clone(), entry.user_type));
            }
        }
        seen
    }

    /// Whether no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i64 = 15_000;

    #[test]
    fn push_and_drain_after_window() {
        let mut queue = GraceQueue::new(WINDOW);
        queue.push("c1", &UserId::new("u1"), 2, 0);

        assert!(queue.drain_due(WINDOW - 1).is_empty());
        let due = queue.drain_due(WINDOW);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].client_id, "c1");
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_drops_entry_silently() {
        let mut queue = GraceQueue::new(WINDOW);
        queue.push("c1", &UserId::new("u1"), 2, 0);

        assert!(queue.cancel(&UserId::new("u1"), "c1"));
        assert!(queue.drain_due(WINDOW * 2).is_empty());
    }

    #[test]
    fn cancel_requires_matching_user() {
        let mut queue = GraceQueue::new(WINDOW);
        queue.push("c1", &UserId::new("u1"), 2, 0);

        assert!(!queue.cancel(&UserId::new("u2"), "c1"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn repush_refreshes_deadline() {
        let mut queue = GraceQueue::new(WINDOW);
        queue.push("c1", &UserId::new("u1"), 2, 0);
        queue.push("c1", &UserId::new("u1"), 2, 10_000);

        assert!(queue.drain_due(WINDOW).is_empty());
        assert_eq!(queue.drain_due(10_000 + WINDOW).len(), 1);
    }

    #[test]
    fn users_pending_deduplicates() {
        let mut queue = GraceQueue::new(WINDOW);
        queue.push("c1", &UserId::new("u1"), 2, 0);
        queue.push("c2", &UserId::new("u1"), 2, 0);
        queue.push("c3", &UserId::new("u2"), 4, 0);

        let users = queue.users_pending();
        assert_eq!(users.len(), 2);
        assert!(queue.has_user(&UserId::new("u1")));
        assert!(queue.has_user(&UserId::new("u2")));
    }

    #[test]
    fn drain_leaves_undue_entries() {
        let mut queue = GraceQueue::new(WINDOW);
        queue.push("c1", &UserId::new("u1"), 2, 0);
        queue.push("c2", &UserId::new("u2"), 2, 10_000);

        let due = queue.drain_due(WINDOW);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].client_id, "c1");
        assert_eq!(queue.len(), 1);
    }
}

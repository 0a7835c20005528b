//! Room roster: the authoritative set of members and active publishers
//!
//! Mutated only by event application; every read returns an owned snapshot,
//! since the underlying tables may change on the next event tick.

use crate::config::JoinGrant;
use crate::media::FeedDescriptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Publisher and member state for one room session
#[derive(Default)]
pub struct RoomRoster {
    inner: RwLock<RosterState>,
}

#[derive(Default)]
struct RosterState {
    /// feed_id → descriptor for everyone currently publishing
    publishers: HashMap<String, FeedDescriptor>,
    /// user_id → display name for everyone in the room
    members: HashMap<String, String>,
}

impl RoomRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the join grant's participant list
    pub fn seed(&self, grant: &JoinGrant) {
        let Some(participants) = grant.participants.as_ref() else {
            return;
        };
        let mut state = self.inner.write();
        for participant in participants {
            state
                .members
                .insert(participant.user_id.clone(), participant.display.clone());
            if let Some(feed_id) = participant.feed_id.clone() {
                state.publishers.insert(
                    feed_id.clone(),
                    FeedDescriptor {
                        feed_id,
                        display: participant.display.clone(),
                        user_id: participant.user_id.clone(),
                    },
                );
            }
        }
        debug!(
            "roster seeded: {} members, {} publishers",
            state.members.len(),
            state.publishers.len()
        );
    }

    /// Record a publisher; returns false when the feed was already known
    pub fn apply_publisher_joined(&self, descriptor: FeedDescriptor) -> bool {
        let mut state = self.inner.write();
        state
            .members
            .entry(descriptor.user_id.clone())
            .or_insert_with(|| descriptor.display.clone());
        state
            .publishers
            .insert(descriptor.feed_id.clone(), descriptor)
            .is_none()
    }

    /// Remove a publisher; returns its descriptor when it was known
    pub fn apply_publisher_left(&self, feed_id: &str) -> Option<FeedDescriptor> {
        self.inner.write().publishers.remove(feed_id)
    }

    pub fn apply_member_joined(&self, user_id: &str, display: &str) {
        self.inner
            .write()
            .members
            .insert(user_id.to_string(), display.to_string());
    }

    /// Remove a member; their publishers (if any) leave via `publisher_left`
    pub fn apply_member_left(&self, user_id: &str) -> Option<String> {
        self.inner.write().members.remove(user_id)
    }

    /// Snapshot of all current publishers, ordered by feed id
    pub fn publishers(&self) -> Vec<FeedDescriptor> {
        let mut publishers: Vec<FeedDescriptor> =
            self.inner.read().publishers.values().cloned().collect();
        publishers.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));
        publishers
    }

    pub fn contains_feed(&self, feed_id: &str) -> bool {
        self.inner.read().publishers.contains_key(feed_id)
    }

    pub fn publisher_count(&self) -> usize {
        self.inner.read().publishers.len()
    }

    pub fn member_count(&self) -> usize {
        self.inner.read().members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(feed: &str, user: &str) -> FeedDescriptor {
        FeedDescriptor {
            feed_id: feed.to_string(),
            display: format!("user {user}"),
            user_id: user.to_string(),
        }
    }

    #[test]
    fn test_publisher_join_and_leave() {
        let roster = RoomRoster::new();
        assert!(roster.apply_publisher_joined(descriptor("f1", "u1")));
        assert!(!roster.apply_publisher_joined(descriptor("f1", "u1")));
        assert_eq!(roster.publisher_count(), 1);

        let left = roster.apply_publisher_left("f1").expect("known feed");
        assert_eq!(left.user_id, "u1");
        assert!(roster.apply_publisher_left("f1").is_none());
    }

    #[test]
    fn test_snapshot_is_detached_from_later_mutation() {
        let roster = RoomRoster::new();
        roster.apply_publisher_joined(descriptor("f1", "u1"));
        let snapshot = roster.publishers();
        roster.apply_publisher_left("f1");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(roster.publisher_count(), 0);
    }

    #[test]
    fn test_publishers_ordered_by_feed_id() {
        let roster = RoomRoster::new();
        roster.apply_publisher_joined(descriptor("f2", "u2"));
        roster.apply_publisher_joined(descriptor("f1", "u1"));
        let ids: Vec<String> = roster.publishers().into_iter().map(|d| d.feed_id).collect();
        assert_eq!(ids, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[test]
    fn test_seed_from_grant() {
        let roster = RoomRoster::new();
        let grant: JoinGrant = serde_json::from_value(serde_json::json!({
            "user_id": "me",
            "ws_url": "wss://conf.example.com/ws",
            "token": "tok",
            "expires_in": 600,
            "participants": [
                {"feed_id": "f9", "user_id": "u9", "display": "Nine"},
                {"user_id": "u10", "display": "Ten"}
            ]
        }))
        .unwrap();
        roster.seed(&grant);
        assert_eq!(roster.member_count(), 2);
        assert_eq!(roster.publisher_count(), 1);
        assert!(roster.contains_feed("f9"));
    }
}

//! Presence broadcasting for Huddle.
//!
//! Presence is derived, never stored: a user is online iff the registry
//! holds at least one connection bound to their identity. On every
//! online/offline transition the broadcaster emits two independent events,
//! a single-user delta and a full replace-semantics snapshot. Clients must
//! tolerate either arriving first; a receiver that keeps only the most
//! recent snapshot is always correct.

use crate::registry::Registry;
use huddle_protocol::{ServerEvent, UserId};
use std::sync::Arc;
use tracing::debug;

/// Announces presence transitions to all connected clients.
pub struct PresenceBroadcaster {
    registry: Arc<Registry>,
}

impl PresenceBroadcaster {
    /// Create a broadcaster over the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// The current online set, sorted for deterministic snapshots.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UserId> {
        let mut online = self.registry.online_users();
        online.sort_unstable();
        online
    }

    /// Announce that a user came online.
    pub fn announce_online(&self, user_id: UserId) {
        self.announce(user_id, true);
    }

    /// Announce that a user went offline.
    pub fn announce_offline(&self, user_id: UserId) {
        self.announce(user_id, false);
    }

    /// Send the current snapshot to a single connection, so a freshly
    /// identified client can build its initial view.
    pub fn sync_connection(&self, connection_id: &str) -> bool {
        self.registry
            .send_to_connection(connection_id, ServerEvent::presence_snapshot(self.snapshot()))
    }

    fn announce(&self, user_id: UserId, online: bool) {
        // Fire-and-forget on both events; delivery to one connection never
        // blocks delivery to others.
        self.registry
            .broadcast(&ServerEvent::presence_delta(user_id, online));
        let reached = self
            .registry
            .broadcast(&ServerEvent::presence_snapshot(self.snapshot()));

        debug!(user = user_id, online, reached, "Presence change announced");
    }
}

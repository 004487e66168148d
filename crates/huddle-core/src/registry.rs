//! Connection registry for Huddle.
//!
//! The registry is the single owner of the connection/identity mapping. All
//! lookups and delivery go through it; no other component scans connections.
//!
//! A connection is registered when the transport accepts it and stays
//! unbound until the client identifies. A user is online iff at least one
//! connection is bound to their identity; multiple simultaneous connections
//! per user (multi-device) are legal.
//!
//! Concurrency contract: `register`/`bind`/`unbind` for a given connection
//! are invoked from that connection's handler task, so they never interleave
//! for one connection. Operations on different connections are safe to run
//! concurrently; per-user transitions resolve atomically under the user
//! entry's lock. Delivery is fire-and-forget over unbounded senders, so a
//! dead receiver never blocks or fails delivery to others.

use crate::error::CoreError;
use dashmap::{DashMap, DashSet};
use huddle_protocol::{ServerEvent, UserId};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Opaque identifier for one live transport link.
pub type ConnectionId = String;

/// Registry entry for one live connection.
struct ConnectionEntry {
    /// Bound identity, `None` until the client identifies.
    user: Option<UserId>,
    /// Outbound event queue consumed by the connection's handler task.
    sender: mpsc::UnboundedSender<ServerEvent>,
    /// When the transport was accepted.
    connected_at: Instant,
}

/// Outcome of a successful [`Registry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// The user had no prior connections and just came online.
    pub came_online: bool,
    /// Set when the connection was previously bound to a different
    /// identity, which was released first.
    pub released: Option<UnbindOutcome>,
}

/// Outcome of releasing a bound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbindOutcome {
    /// The identity the connection was bound to.
    pub user: UserId,
    /// This was the user's last connection; they are now offline.
    pub went_offline: bool,
}

/// The connection registry.
#[derive(Default)]
pub struct Registry {
    /// Live connections indexed by connection id.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Bound connections per user identity.
    users: DashMap<UserId, DashSet<ConnectionId>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted, unbound connection.
    pub fn register(
        &self,
        connection_id: impl Into<ConnectionId>,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let connection_id = connection_id.into();
        debug!(connection = %connection_id, "Connection registered");
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user: None,
                sender,
                connected_at: Instant::now(),
            },
        );
    }

    /// Bind a connection to a verified user identity.
    ///
    /// Idempotent: rebinding to the same identity reports no transition.
    /// Binding to a different identity releases the previous one first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuthRequired`] if the connection is not
    /// registered, i.e. no transport link exists that an identity could have
    /// been verified for.
    pub fn bind(&self, connection_id: &str, user_id: UserId) -> Result<BindOutcome, CoreError> {
        let previous = {
            let mut entry = self
                .connections
                .get_mut(connection_id)
                .ok_or(CoreError::AuthRequired)?;
            entry.user.replace(user_id)
        };

        if previous == Some(user_id) {
            return Ok(BindOutcome {
                came_online: false,
                released: None,
            });
        }

        let released = previous.map(|old| UnbindOutcome {
            user: old,
            went_offline: self.detach(old, connection_id),
        });

        let came_online = self.attach(user_id, connection_id);
        debug!(connection = %connection_id, user = user_id, came_online, "Connection bound");

        Ok(BindOutcome {
            came_online,
            released,
        })
    }

    /// Remove a connection, releasing its identity binding if any.
    ///
    /// No-op on an unknown connection (double-close safe). Returns `None`
    /// when the connection was absent or never bound.
    pub fn unbind(&self, connection_id: &str) -> Option<UnbindOutcome> {
        let (_, entry) = self.connections.remove(connection_id)?;
        debug!(
            connection = %connection_id,
            lifetime_ms = entry.connected_at.elapsed().as_millis() as u64,
            "Connection removed"
        );

        let user = entry.user?;
        let went_offline = self.detach(user, connection_id);

        Some(UnbindOutcome { user, went_offline })
    }

    /// Identity bound to a connection, if any.
    #[must_use]
    pub fn identity_of(&self, connection_id: &str) -> Option<UserId> {
        self.connections.get(connection_id).and_then(|e| e.user)
    }

    /// Whether a user has at least one bound connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.get(&user_id).is_some_and(|s| !s.is_empty())
    }

    /// Connection ids bound to a user; empty if offline or unknown.
    #[must_use]
    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.users
            .get(&user_id)
            .map(|s| s.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }

    /// All user identities with at least one bound connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.users
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect()
    }

    /// Number of live connections, bound or not.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver an event to a single connection.
    ///
    /// Returns `false` if the connection is gone or its receiver dropped.
    pub fn send_to_connection(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an event to every connection bound to a user.
    ///
    /// Returns the number of connections the event was queued for; 0 if the
    /// user is offline or unknown.
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let connection_ids = self.connections_of(user_id);

        let mut delivered = 0;
        for connection_id in connection_ids {
            if self.send_to_connection(&connection_id, event.clone()) {
                delivered += 1;
            }
        }

        trace!(user = user_id, delivered, "Delivered to user connections");
        delivered
    }

    /// Deliver an event to every registered connection.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Add a connection to a user's set; reports the offline->online edge.
    fn attach(&self, user_id: UserId, connection_id: &str) -> bool {
        let set = self.users.entry(user_id).or_default();
        let was_empty = set.is_empty();
        set.insert(connection_id.to_string());
        was_empty
    }

    /// Remove a connection from a user's set; reports the online->offline
    /// edge. The empty set is dropped under its entry lock, so concurrent
    /// unbinds observe at most one offline transition.
    fn detach(&self, user_id: UserId, connection_id: &str) -> bool {
        if let Some(set) = self.users.get(&user_id) {
            set.remove(connection_id);
        }
        self.users.remove_if(&user_id, |_, set| set.is_empty()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(registry: &Registry, id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        rx
    }

    #[test]
    fn test_bind_unbind_transitions() {
        let registry = Registry::new();
        let _rx = conn(&registry, "c1");

        let outcome = registry.bind("c1", 1).unwrap();
        assert!(outcome.came_online);
        assert!(registry.is_online(1));
        assert_eq!(registry.identity_of("c1"), Some(1));

        let outcome = registry.unbind("c1").unwrap();
        assert_eq!(outcome.user, 1);
        assert!(outcome.went_offline);
        assert!(!registry.is_online(1));
    }

    #[test]
    fn test_bind_is_idempotent() {
        let registry = Registry::new();
        let _rx = conn(&registry, "c1");

        assert!(registry.bind("c1", 1).unwrap().came_online);
        let again = registry.bind("c1", 1).unwrap();
        assert!(!again.came_online);
        assert!(again.released.is_none());
        assert_eq!(registry.connections_of(1).len(), 1);
    }

    #[test]
    fn test_bind_requires_registered_connection() {
        let registry = Registry::new();
        assert!(matches!(
            registry.bind("ghost", 1),
            Err(CoreError::AuthRequired)
        ));
    }

    #[test]
    fn test_multi_device_stays_online() {
        let registry = Registry::new();
        let _rx1 = conn(&registry, "phone");
        let _rx2 = conn(&registry, "laptop");

        assert!(registry.bind("phone", 1).unwrap().came_online);
        assert!(!registry.bind("laptop", 1).unwrap().came_online);
        assert_eq!(registry.connections_of(1).len(), 2);

        // First device closing does not take the user offline.
        assert!(!registry.unbind("phone").unwrap().went_offline);
        assert!(registry.is_online(1));

        assert!(registry.unbind("laptop").unwrap().went_offline);
        assert!(!registry.is_online(1));
    }

    #[test]
    fn test_unbind_unknown_is_noop() {
        let registry = Registry::new();
        assert!(registry.unbind("never-seen").is_none());

        // Unbound connection closing reports no identity transition.
        let _rx = conn(&registry, "c1");
        assert!(registry.unbind("c1").is_none());
        // Double close.
        assert!(registry.unbind("c1").is_none());
    }

    #[test]
    fn test_rebind_releases_previous_identity() {
        let registry = Registry::new();
        let _rx = conn(&registry, "c1");

        registry.bind("c1", 1).unwrap();
        let outcome = registry.bind("c1", 2).unwrap();

        assert!(outcome.came_online);
        let released = outcome.released.unwrap();
        assert_eq!(released.user, 1);
        assert!(released.went_offline);
        assert!(!registry.is_online(1));
        assert!(registry.is_online(2));
    }

    #[test]
    fn test_send_to_user_reaches_all_devices() {
        let registry = Registry::new();
        let mut rx1 = conn(&registry, "phone");
        let mut rx2 = conn(&registry, "laptop");
        let mut rx3 = conn(&registry, "other");

        registry.bind("phone", 1).unwrap();
        registry.bind("laptop", 1).unwrap();
        registry.bind("other", 2).unwrap();

        let delivered = registry.send_to_user(1, &ServerEvent::presence_delta(1, true));
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());

        assert_eq!(registry.send_to_user(99, &ServerEvent::presence_delta(1, true)), 0);
    }

    #[test]
    fn test_broadcast_includes_unbound_connections() {
        let registry = Registry::new();
        let mut rx1 = conn(&registry, "bound");
        let mut rx2 = conn(&registry, "anonymous");
        registry.bind("bound", 1).unwrap();

        let delivered = registry.broadcast(&ServerEvent::presence_snapshot(vec![1]));
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_dead_receiver_does_not_fail_others() {
        let registry = Registry::new();
        let rx1 = conn(&registry, "dead");
        let mut rx2 = conn(&registry, "alive");
        registry.bind("dead", 1).unwrap();
        registry.bind("alive", 1).unwrap();
        drop(rx1);

        let delivered = registry.send_to_user(1, &ServerEvent::presence_delta(1, true));
        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
    }
}

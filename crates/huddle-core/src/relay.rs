//! Message relay for Huddle.
//!
//! The relay persists chat messages through the external store and fans the
//! canonical persisted row out to every connection of the receiver and the
//! sender. Delivery to online connections is at-least-once and best-effort;
//! history is durable exactly-once, and an offline receiver reconciles by
//! pulling their mailbox on reconnect.
//!
//! Per-pair FIFO holds because a connection's events are handled
//! sequentially and the store assigns monotonic identifiers; no ordering is
//! guaranteed across different sender/receiver pairs.

use crate::error::CoreError;
use crate::registry::Registry;
use crate::store::{MessageStore, UserDirectory};
use huddle_protocol::{Message, MessageContent, ServerEvent, UserId};
use std::sync::Arc;
use tracing::debug;

/// Persists and delivers point-to-point chat events.
pub struct MessageRelay {
    registry: Arc<Registry>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
}

impl MessageRelay {
    /// Create a relay over the given registry, store, and directory.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            registry,
            store,
            directory,
        }
    }

    /// Relay a chat message from a connection to a user.
    ///
    /// The message is persisted before anything is forwarded; a store
    /// failure means nothing was sent. On success the persisted row is
    /// delivered to every receiver connection (0 if offline) and echoed to
    /// every sender connection, so all of the sender's devices converge on
    /// the same server-assigned message.
    ///
    /// # Errors
    ///
    /// [`CoreError::AuthRequired`] for an unbound sender connection,
    /// [`CoreError::InvalidTarget`] for an unknown receiver, and
    /// [`CoreError::Persistence`] when the store rejects the write.
    pub async fn send_message(
        &self,
        sender_connection: &str,
        receiver_id: UserId,
        content: MessageContent,
    ) -> Result<Message, CoreError> {
        let sender_id = self
            .registry
            .identity_of(sender_connection)
            .ok_or(CoreError::AuthRequired)?;

        if !self.directory.contains(receiver_id).await? {
            return Err(CoreError::InvalidTarget(receiver_id));
        }

        // Persist first; the store is the only suspension point and is
        // never awaited while holding shared state.
        let message = self
            .store
            .create_message(sender_id, receiver_id, content)
            .await?;

        let event = ServerEvent::message_new(message.clone());
        let delivered = self.registry.send_to_user(receiver_id, &event);
        self.registry.send_to_user(sender_id, &event);

        debug!(
            message_id = message.id,
            sender = sender_id,
            receiver = receiver_id,
            delivered,
            "Message relayed"
        );

        Ok(message)
    }

    /// Mark all messages from `peer_id` to the caller as read.
    ///
    /// One-way mutation; the peer gets no realtime notification.
    ///
    /// # Errors
    ///
    /// [`CoreError::AuthRequired`] for an unbound connection,
    /// [`CoreError::Persistence`] when the store rejects the update.
    pub async fn mark_read(
        &self,
        reader_connection: &str,
        peer_id: UserId,
    ) -> Result<(), CoreError> {
        let reader_id = self
            .registry
            .identity_of(reader_connection)
            .ok_or(CoreError::AuthRequired)?;

        self.store.mark_read(peer_id, reader_id).await?;
        debug!(reader = reader_id, peer = peer_id, "Messages marked read");
        Ok(())
    }

    /// Full mailbox for a user, for reconnection reconciliation.
    ///
    /// # Errors
    ///
    /// [`CoreError::Persistence`] when the store fails.
    pub async fn history(&self, user_id: UserId) -> Result<Vec<Message>, CoreError> {
        Ok(self.store.list_messages(user_id).await?)
    }
}

//! Persistence and directory interfaces.
//!
//! Durable storage of users and messages lives outside the core; the relay
//! consumes it through these narrow traits. The store assigns message
//! identifiers and timestamps, which makes the persisted row the canonical
//! form every client converges on.
//!
//! [`MemoryStore`] is the in-process reference implementation, used by the
//! server binary as its default backend and by the test suites.

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_protocol::{Message, MessageContent, UserEntry, UserId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors surfaced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed; the operation had no durable effect.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. The store assigns the identifier and the
    /// creation timestamp; identifiers are monotonic per store.
    async fn create_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: MessageContent,
    ) -> Result<Message, StoreError>;

    /// All messages where `user_id` is the sender or the receiver, in any
    /// order (clients sort on their side).
    async fn list_messages(&self, user_id: UserId) -> Result<Vec<Message>, StoreError>;

    /// Mark every message from `sender_id` to `receiver_id` as read.
    async fn mark_read(&self, sender_id: UserId, receiver_id: UserId) -> Result<(), StoreError>;
}

/// User directory lookups, supplied by the external identity provider.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// All known users.
    async fn list_users(&self) -> Result<Vec<UserEntry>, StoreError>;

    /// Whether `user_id` is a known identity.
    async fn contains(&self, user_id: UserId) -> Result<bool, StoreError>;
}

/// In-memory store implementing both interfaces.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, UserEntry>,
    messages: Mutex<Vec<Message>>,
    next_message_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user to the directory, replacing any previous entry.
    pub fn add_user(&self, id: UserId, username: impl Into<String>) {
        self.users.insert(
            id,
            UserEntry {
                id,
                username: username.into(),
            },
        );
    }

    /// Add a user only if the directory does not know the identity yet.
    ///
    /// Used when a verified identity binds for the first time; the external
    /// auth layer has already vouched for it.
    pub fn ensure_user(&self, id: UserId, username: impl Into<String>) {
        self.users.entry(id).or_insert_with(|| UserEntry {
            id,
            username: username.into(),
        });
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: MessageContent,
    ) -> Result<Message, StoreError> {
        let message = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1,
            sender_id,
            receiver_id,
            content,
            created_at: Self::now_millis(),
            read: false,
        };

        let mut messages = self
            .messages
            .lock()
            .map_err(|_| StoreError::Backend("message table poisoned".into()))?;
        messages.push(message.clone());

        Ok(message)
    }

    async fn list_messages(&self, user_id: UserId) -> Result<Vec<Message>, StoreError> {
        let messages = self
            .messages
            .lock()
            .map_err(|_| StoreError::Backend("message table poisoned".into()))?;

        Ok(messages
            .iter()
            .filter(|m| m.sender_id == user_id || m.receiver_id == user_id)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, sender_id: UserId, receiver_id: UserId) -> Result<(), StoreError> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| StoreError::Backend("message table poisoned".into()))?;

        for message in messages
            .iter_mut()
            .filter(|m| m.sender_id == sender_id && m.receiver_id == receiver_id)
        {
            message.read = true;
        }

        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn list_users(&self) -> Result<Vec<UserEntry>, StoreError> {
        let mut users: Vec<UserEntry> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn contains(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.users.contains_key(&user_id))
    }
}

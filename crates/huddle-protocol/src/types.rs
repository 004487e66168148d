//! Shared data types for the Huddle protocol.
//!
//! These types cross the wire inside events and are also the currency of the
//! persistence interface, so both the core and the server depend on them.

use serde::{Deserialize, Serialize};

/// A user identity, assigned and verified by the external identity provider.
pub type UserId = i64;

/// A directory entry for a known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    /// User identity.
    pub id: UserId,
    /// Display name.
    pub username: String,
}

/// Content of a chat message.
///
/// File messages carry a reference to an already-uploaded file; the bytes
/// themselves never travel through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Text {
        /// Message body.
        body: String,
    },
    /// Reference to an uploaded file.
    File {
        /// Original file name.
        name: String,
        /// Storage path the receiver can fetch the file from.
        path: String,
    },
}

impl MessageContent {
    /// Create text content.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    /// Create a file reference.
    #[must_use]
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        MessageContent::File {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// A persisted chat message.
///
/// Immutable once stored, except for the `read` flag which only transitions
/// `false` -> `true` through the relay's mark-read operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned identifier, monotonic per store.
    pub id: i64,
    /// Sender identity.
    pub sender_id: UserId,
    /// Receiver identity.
    pub receiver_id: UserId,
    /// Text or file-reference content.
    pub content: MessageContent,
    /// Store-assigned creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Whether the receiver has marked this message read.
    pub read: bool,
}

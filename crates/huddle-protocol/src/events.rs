//! Event types for the Huddle protocol.
//!
//! Events are the fundamental unit of communication. Every event name has a
//! fixed payload schema, validated on decode before anything is dispatched.
//! Each event is serialized using MessagePack for efficient binary encoding.

use crate::types::{Message, MessageContent, UserId};
use serde::{Deserialize, Serialize};

/// Stable error codes carried by [`ServerEvent::Error`].
pub mod error_code {
    /// Operation attempted on a connection that has not identified.
    pub const AUTH_REQUIRED: u16 = 4001;
    /// Receiver or callee identity is unknown or unavailable.
    pub const INVALID_TARGET: u16 = 4004;
    /// A call session for this pair already exists.
    pub const ALREADY_IN_PROGRESS: u16 = 4009;
    /// Signaling event inconsistent with the session state or sender role.
    pub const SESSION_STATE_VIOLATION: u16 = 4010;
    /// Message store failed; nothing was persisted or forwarded.
    pub const PERSISTENCE_FAILURE: u16 = 4500;
    /// Payload failed schema validation.
    pub const MALFORMED_EVENT: u16 = 4400;
}

/// An event sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this connection to a verified user identity.
    Identify {
        /// Identity supplied by the external auth layer.
        user_id: UserId,
    },

    /// Send a chat message to another user.
    MessageSend {
        /// Receiver identity.
        receiver_id: UserId,
        /// Text or file-reference content.
        content: MessageContent,
    },

    /// Mark all messages from a peer to the caller as read.
    MarkRead {
        /// The peer whose messages should be marked.
        peer_id: UserId,
    },

    /// Start a call with another user.
    CallRequest {
        /// Callee identity.
        callee_id: UserId,
    },

    /// Accept a ringing call.
    CallAccept {
        /// The calling peer.
        caller_id: UserId,
    },

    /// Reject a ringing call.
    CallReject {
        /// The calling peer.
        caller_id: UserId,
    },

    /// Forward an SDP offer to the call peer.
    CallOffer {
        /// The other party of the session.
        peer_id: UserId,
        /// SDP blob, opaque to the relay.
        sdp: String,
    },

    /// Forward an SDP answer to the call peer.
    CallAnswer {
        /// The other party of the session.
        peer_id: UserId,
        /// SDP blob, opaque to the relay.
        sdp: String,
    },

    /// Forward an ICE candidate to the call peer.
    CallIceCandidate {
        /// The other party of the session.
        peer_id: UserId,
        /// Candidate blob, opaque to the relay.
        candidate: serde_json::Value,
    },

    /// Hang up the call with a peer.
    CallEnd {
        /// The other party of the session.
        peer_id: UserId,
    },

    /// Keepalive ping.
    Ping {
        /// Optional timestamp echoed back in the pong.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// An event sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection established handshake.
    Welcome {
        /// Unique connection identifier.
        connection_id: String,
        /// Protocol version spoken by the server.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Full replace-semantics view of who is online.
    PresenceSnapshot {
        /// All currently online user identities.
        online: Vec<UserId>,
    },

    /// Incremental presence hint for a single user.
    PresenceDelta {
        /// The user whose status changed.
        user_id: UserId,
        /// New online status.
        online: bool,
    },

    /// A newly persisted message, delivered to the receiver and echoed to
    /// the sender's other connections.
    MessageNew {
        /// The canonical, store-assigned message.
        message: Message,
    },

    /// Incoming call notification, forwarded to the callee.
    CallRequest {
        /// The calling user.
        from: UserId,
    },

    /// The callee accepted; forwarded to the caller.
    CallAccept {
        /// The accepting user.
        from: UserId,
    },

    /// The callee rejected; forwarded to the caller.
    CallReject {
        /// The rejecting user.
        from: UserId,
    },

    /// SDP offer forwarded from the session initiator.
    CallOffer {
        /// The offering user.
        from: UserId,
        /// SDP blob, opaque to the relay.
        sdp: String,
    },

    /// SDP answer forwarded from the session responder.
    CallAnswer {
        /// The answering user.
        from: UserId,
        /// SDP blob, opaque to the relay.
        sdp: String,
    },

    /// ICE candidate forwarded from the other party.
    CallIceCandidate {
        /// The sending user.
        from: UserId,
        /// Candidate blob, opaque to the relay.
        candidate: serde_json::Value,
    },

    /// The call ended, by hangup or by the peer disconnecting.
    CallEnd {
        /// The party that ended the call.
        from: UserId,
    },

    /// A ringing call was not answered within the configured window.
    CallTimeout {
        /// The callee that never answered.
        peer_id: UserId,
    },

    /// Error response for a failed client event.
    Error {
        /// Stable error code, see [`error_code`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Create a new Welcome event.
    #[must_use]
    pub fn welcome(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerEvent::Welcome {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a presence snapshot event.
    #[must_use]
    pub fn presence_snapshot(online: Vec<UserId>) -> Self {
        ServerEvent::PresenceSnapshot { online }
    }

    /// Create a presence delta event.
    #[must_use]
    pub fn presence_delta(user_id: UserId, online: bool) -> Self {
        ServerEvent::PresenceDelta { user_id, online }
    }

    /// Create a message delivery event.
    #[must_use]
    pub fn message_new(message: Message) -> Self {
        ServerEvent::MessageNew { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_names() {
        let json = serde_json::to_value(ClientEvent::Identify { user_id: 7 }).unwrap();
        assert_eq!(json["type"], "identify");

        let json = serde_json::to_value(ServerEvent::presence_delta(7, true)).unwrap();
        assert_eq!(json["type"], "presence_delta");
        assert_eq!(json["online"], true);
    }

    #[test]
    fn test_call_events_are_symmetric() {
        // The client addresses a peer; the forwarded copy names the origin.
        let out = ClientEvent::CallOffer {
            peer_id: 2,
            sdp: "v=0".into(),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "call_offer");

        let fwd = ServerEvent::CallOffer {
            from: 1,
            sdp: "v=0".into(),
        };
        let json = serde_json::to_value(&fwd).unwrap();
        assert_eq!(json["type"], "call_offer");
        assert_eq!(json["from"], 1);
    }
}

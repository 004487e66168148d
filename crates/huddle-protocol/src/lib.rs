//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle realtime chat relay.
//!
//! This crate defines the events exchanged between clients and the relay
//! core, the shared data types they carry, and the binary codec used on the
//! wire:
//!
//! - **Events** - Tagged client/server event enums, one fixed schema per
//!   event name
//! - **Types** - User, message, and content types shared across crates
//! - **Codec** - MessagePack serialization with length-prefixed framing
//!
//! Audio/video media never passes through this protocol; call events carry
//! only the negotiation metadata (SDP blobs and ICE candidates) needed for
//! the peers to establish a direct media path.

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{decode, decode_from, encode, encode_into, ProtocolError};
pub use events::{error_code, ClientEvent, ServerEvent};
pub use types::{Message, MessageContent, UserEntry, UserId};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

//! # huddle-core
//!
//! Core state and routing for the Huddle realtime chat relay.
//!
//! This crate provides the components with real concurrency and ordering
//! concerns; everything around them is plumbing:
//!
//! - **Registry** - Single owner of the connection/identity mapping
//! - **PresenceBroadcaster** - Derives and announces the online set
//! - **MessageRelay** - Persists and fans out chat messages
//! - **CallCoordinator** - Signaling state machine per user pair
//! - **Store** - Narrow persistence and directory interfaces
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │  Connection │────▶│  Registry   │◀────│ CallCoordinator  │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!                            │
//!                     ┌──────┴──────┐
//!                     ▼             ▼
//!             ┌─────────────┐ ┌─────────────┐     ┌─────────┐
//!             │  Presence   │ │MessageRelay │────▶│  Store  │
//!             └─────────────┘ └─────────────┘     └─────────┘
//! ```

pub mod call;
pub mod error;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod store;

pub use call::{CallConfig, CallCoordinator, CallSession, CallState, PairKey};
pub use error::CoreError;
pub use presence::PresenceBroadcaster;
pub use registry::{BindOutcome, ConnectionId, Registry, UnbindOutcome};
pub use relay::MessageRelay;
pub use store::{MemoryStore, MessageStore, StoreError, UserDirectory};

//! # huddle-server
//!
//! Realtime chat relay and call signaling server.
//!
//! Exposes the server building blocks as a library so integration tests can
//! drive a real instance; the `huddle` binary is a thin wrapper around
//! [`handlers::run_server`].

pub mod config;
pub mod handlers;
pub mod metrics;

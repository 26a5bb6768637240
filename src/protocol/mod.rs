//! # Relay Protocol
//!
//! Typed messages, version conversion and the per-connection engine.
//!
//! ## Components
//! - **Message**: typed messages and their current-version encoding
//! - **Versioning**: declarative layout diffs for older peers
//! - **Handshake**: HELLO/ACK state machine
//! - **Dispatcher**: per-type handler table
//! - **Handlers**: default relay handlers backed by the transaction cache
//! - **Connection**: framing loop, error recovery and keepalive

pub mod connection;
pub mod dispatcher;
pub mod handlers;
pub mod handshake;
pub mod message;
pub mod versioning;

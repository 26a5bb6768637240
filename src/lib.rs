//! # BDN Relay
//!
//! Core of a relay node in a blockchain distribution network: a framed
//! binary protocol engine for peer connections and a transaction short-id
//! cache shared by every connection of the node.
//!
//! ## Layout
//! - [`core`]: byte buffers, header preview, structural validation
//! - [`protocol`]: typed messages, version conversion, handshake, the
//!   per-connection engine and message handlers
//! - [`service`]: transaction cache, peer registry and the node event loop
//! - [`transport`]: socket-side collaborators (TCP and in-memory)
//! - [`utils`]: clock, alarms, expiration queue, metrics and logging
//!
//! ## Example Usage
//! ```no_run
//! use bdn_relay::config::RelayConfig;
//! use bdn_relay::service::RelayNode;
//! use bdn_relay::utils::logging::init_logging;
//!
//! # async fn run() -> bdn_relay::error::Result<()> {
//! let config = RelayConfig::from_env()?;
//! init_logging(&config.logging)?;
//!
//! let (node, handle) = RelayNode::bind(config).await?;
//! println!("listening on {}", handle.local_addr());
//! node.run().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::RelayConfig;
pub use error::{ErrorClass, RelayError, Result};
pub use protocol::connection::Connection;
pub use protocol::message::{Message, MessageType, Sha256Hash, ShortId};
pub use service::{RelayNode, TxCache};

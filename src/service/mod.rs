//! # Relay Services
//!
//! Node-level state shared by connections.
//!
//! ## Components
//! - **Transaction cache**: short-id assignments and transaction contents
//! - **Peer registry**: connections indexed by peer node id
//! - **Node**: single-loop driver owning listeners, connections and alarms

pub mod node;
pub mod peers;
pub mod tx_cache;

pub use node::{NodeCommand, NodeHandle, RelayNode};
pub use peers::PeerRegistry;
pub use tx_cache::{TransactionInfo, TxCache};

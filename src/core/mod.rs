//! # Core Protocol Components
//!
//! Byte buffers and wire framing shared by every connection.
//!
//! ## Components
//! - **Buffer**: inbound append/consume buffer and outbound message queue
//! - **Codec**: header preview, broadcast preview, structural validation and
//!   a tokio-util codec
//!
//! ## Wire Format
//! ```text
//! [Type tag(12, NUL padded)] [Payload length(4, LE)] [Payload(N) ... Control flag(1)]
//! ```
//!
//! ## Security
//! - Maximum payload size is configurable (64MB default)
//! - Per-type length bounds checked before allocation
//! - Malformed type tags close the connection

pub mod buffer;
pub mod codec;

//! # Protocol Version Conversion
//!
//! Messages are decoded and encoded at the current protocol version only.
//! Traffic to and from older peers is rewritten at the byte level by
//! applying declarative [`LayoutDiff`]s.
//!
//! A diff lists how the fixed-width fields at the start of a payload changed
//! when `since_version` was introduced. Everything after the listed fields
//! (variable-length content and the control flag) is copied verbatim.
//!
//! - **Forward** (old peer -> current): applies every diff newer than the peer's
//!   version, oldest first. Added fields get their default value.
//! - **Backward** (current -> old peer): applies the same diffs newest first.
//!   Added fields are dropped and widened integers saturate to the old width.
//!
//! When no diff applies the input `Bytes` is returned untouched.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::trace;

use crate::core::codec::{preview_header, HEADER_LEN};
use crate::error::{RelayError, Result};
use crate::protocol::message::MessageType;

/// Width of a little-endian integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    pub fn byte_len(self) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }

    pub fn max_value(self) -> u64 {
        match self {
            IntWidth::U8 => u8::MAX as u64,
            IntWidth::U16 => u16::MAX as u64,
            IntWidth::U32 => u32::MAX as u64,
            IntWidth::U64 => u64::MAX,
        }
    }

    fn read(self, src: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..self.byte_len()].copy_from_slice(&src[..self.byte_len()]);
        u64::from_le_bytes(bytes)
    }

    /// Write `value`, clamped to this width's maximum.
    fn write_saturating(self, value: u64, dst: &mut BytesMut) {
        let clamped = value.min(self.max_value());
        dst.put_slice(&clamped.to_le_bytes()[..self.byte_len()]);
    }
}

/// How one fixed-width region of a payload changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    /// `n` bytes with the same layout in both versions.
    Unchanged(usize),
    /// Integer whose width changed.
    Resized { old: IntWidth, new: IntWidth },
    /// Field introduced in the newer version.
    Added { width: IntWidth, default: u64 },
    /// Field that only exists in the older version.
    Removed { width: IntWidth },
}

impl FieldChange {
    fn old_len(&self) -> usize {
        match *self {
            FieldChange::Unchanged(n) => n,
            FieldChange::Resized { old, .. } => old.byte_len(),
            FieldChange::Added { .. } => 0,
            FieldChange::Removed { width } => width.byte_len(),
        }
    }

    fn new_len(&self) -> usize {
        match *self {
            FieldChange::Unchanged(n) => n,
            FieldChange::Resized { new, .. } => new.byte_len(),
            FieldChange::Added { width, .. } => width.byte_len(),
            FieldChange::Removed { .. } => 0,
        }
    }
}

/// Payload layout change introduced by one protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutDiff {
    pub msg_type: MessageType,
    /// First version using the newer layout.
    pub since_version: u32,
    pub fields: Vec<FieldChange>,
}

impl LayoutDiff {
    pub fn new(msg_type: MessageType, since_version: u32, fields: Vec<FieldChange>) -> Self {
        Self {
            msg_type,
            since_version,
            fields,
        }
    }

    fn old_fixed_len(&self) -> usize {
        self.fields.iter().map(FieldChange::old_len).sum()
    }

    fn new_fixed_len(&self) -> usize {
        self.fields.iter().map(FieldChange::new_len).sum()
    }

    /// Payload growth from the older to the newer layout.
    pub fn size_delta(&self) -> isize {
        self.new_fixed_len() as isize - self.old_fixed_len() as isize
    }

    /// Rewrite an old-layout payload into the new layout.
    pub fn forward(&self, payload: &[u8]) -> Result<Bytes> {
        let fixed = self.old_fixed_len();
        self.check_len(payload, fixed)?;

        let mut out = BytesMut::with_capacity((payload.len() as isize + self.size_delta()) as usize);
        let mut pos = 0;
        for field in &self.fields {
            match *field {
                FieldChange::Unchanged(n) => {
                    out.put_slice(&payload[pos..pos + n]);
                    pos += n;
                }
                FieldChange::Resized { old, new } => {
                    new.write_saturating(old.read(&payload[pos..]), &mut out);
                    pos += old.byte_len();
                }
                FieldChange::Added { width, default } => {
                    width.write_saturating(default, &mut out);
                }
                FieldChange::Removed { width } => {
                    pos += width.byte_len();
                }
            }
        }
        out.put_slice(&payload[pos..]);
        Ok(out.freeze())
    }

    /// Rewrite a new-layout payload into the old layout.
    pub fn backward(&self, payload: &[u8]) -> Result<Bytes> {
        let fixed = self.new_fixed_len();
        self.check_len(payload, fixed)?;

        let mut out = BytesMut::with_capacity((payload.len() as isize - self.size_delta()) as usize);
        let mut pos = 0;
        for field in &self.fields {
            match *field {
                FieldChange::Unchanged(n) => {
                    out.put_slice(&payload[pos..pos + n]);
                    pos += n;
                }
                FieldChange::Resized { old, new } => {
                    old.write_saturating(new.read(&payload[pos..]), &mut out);
                    pos += new.byte_len();
                }
                FieldChange::Added { width, .. } => {
                    pos += width.byte_len();
                }
                FieldChange::Removed { width } => {
                    width.write_saturating(0, &mut out);
                }
            }
        }
        out.put_slice(&payload[pos..]);
        Ok(out.freeze())
    }

    fn check_len(&self, payload: &[u8], fixed: usize) -> Result<()> {
        if payload.len() < fixed {
            return Err(RelayError::Conversion(format!(
                "{} payload of {} bytes shorter than v{} fixed fields ({fixed} bytes)",
                self.msg_type,
                payload.len(),
                self.since_version
            )));
        }
        Ok(())
    }
}

/// Layout diffs for every message type whose encoding changed.
#[derive(Debug, Clone, Default)]
pub struct ConverterRegistry {
    diffs: HashMap<MessageType, Vec<LayoutDiff>>,
}

impl ConverterRegistry {
    /// Registry with no conversions: every message passes through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry describing the relay protocol's historical layouts.
    pub fn with_defaults() -> Self {
        use FieldChange::{Added, Resized, Unchanged};
        let mut registry = Self::new();

        // Nonce added to keepalive messages
        for msg_type in [MessageType::Ping, MessageType::Pong] {
            registry.register(LayoutDiff::new(
                msg_type,
                5,
                vec![Added {
                    width: IntWidth::U64,
                    default: 0,
                }],
            ));
        }

        // Quota flag after the short id
        registry.register(LayoutDiff::new(
            MessageType::Tx,
            7,
            vec![
                Unchanged(52),
                Unchanged(4),
                Added {
                    width: IntWidth::U8,
                    default: 0,
                },
            ],
        ));

        // Wider tx counters plus memory and block counters
        registry.register(LayoutDiff::new(
            MessageType::BdnPerformanceStats,
            10,
            vec![
                Unchanged(20),
                Resized {
                    old: IntWidth::U16,
                    new: IntWidth::U32,
                },
                Resized {
                    old: IntWidth::U16,
                    new: IntWidth::U32,
                },
                Added {
                    width: IntWidth::U16,
                    default: 0,
                },
                Added {
                    width: IntWidth::U32,
                    default: 0,
                },
                Added {
                    width: IntWidth::U32,
                    default: 0,
                },
                Added {
                    width: IntWidth::U32,
                    default: 0,
                },
            ],
        ));

        registry
    }

    pub fn register(&mut self, diff: LayoutDiff) {
        let diffs = self.diffs.entry(diff.msg_type).or_default();
        diffs.push(diff);
        diffs.sort_by_key(|diff| diff.since_version);
    }

    fn pending(&self, msg_type: MessageType, peer_version: u32) -> &[LayoutDiff] {
        let diffs = match self.diffs.get(&msg_type) {
            Some(diffs) => diffs.as_slice(),
            None => return &[],
        };
        let first = diffs.partition_point(|diff| diff.since_version <= peer_version);
        &diffs[first..]
    }

    pub fn needs_conversion(&self, msg_type: MessageType, peer_version: u32) -> bool {
        !self.pending(msg_type, peer_version).is_empty()
    }

    /// Payload growth when converting a `peer_version` message to the current layout.
    pub fn size_delta(&self, msg_type: MessageType, peer_version: u32) -> isize {
        self.pending(msg_type, peer_version)
            .iter()
            .map(LayoutDiff::size_delta)
            .sum()
    }

    /// Convert a complete message received from a `peer_version` peer.
    pub fn convert_from_older(&self, raw: Bytes, peer_version: u32) -> Result<Bytes> {
        let msg_type = message_type_of(&raw)?;
        let diffs = self.pending(msg_type, peer_version);
        if diffs.is_empty() {
            return Ok(raw);
        }

        let mut payload = raw.slice(HEADER_LEN..);
        for diff in diffs {
            payload = diff.forward(&payload)?;
        }
        trace!(%msg_type, peer_version, "Converted message from older version");
        Ok(reframe(&raw, &payload))
    }

    /// Convert a complete current-version message for a `peer_version` peer.
    pub fn convert_to_older(&self, raw: Bytes, peer_version: u32) -> Result<Bytes> {
        let msg_type = message_type_of(&raw)?;
        let diffs = self.pending(msg_type, peer_version);
        if diffs.is_empty() {
            return Ok(raw);
        }

        let mut payload = raw.slice(HEADER_LEN..);
        for diff in diffs.iter().rev() {
            payload = diff.backward(&payload)?;
        }
        trace!(%msg_type, peer_version, "Converted message to older version");
        Ok(reframe(&raw, &payload))
    }
}

fn message_type_of(raw: &[u8]) -> Result<MessageType> {
    let header = preview_header(raw)
        .ok_or_else(|| RelayError::Conversion("Message shorter than header".to_string()))?;
    if !header.is_full_message {
        return Err(RelayError::Conversion(
            "Cannot convert a partial message".to_string(),
        ));
    }
    header.message_type()
}

/// Original type tag with a new payload and payload length.
fn reframe(raw: &[u8], payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(&raw[..HEADER_LEN - 4]);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{BdnPerformanceStatsMessage, Message, PingMessage};

    fn stats(new_tx_from_node: u32) -> BdnPerformanceStatsMessage {
        BdnPerformanceStatsMessage {
            interval_start_ms: 1_000,
            interval_end_ms: 61_000,
            new_blocks_from_node: 3,
            new_blocks_from_bdn: 4,
            new_tx_from_node,
            new_tx_from_bdn: 12,
            memory_utilization_mb: 512,
            new_blocks_seen: 9,
            block_messages_from_node: 2,
            block_announcements_from_node: 1,
        }
    }

    #[test]
    fn test_identity_when_current() {
        let registry = ConverterRegistry::with_defaults();
        let raw = Message::Ping(PingMessage { nonce: 5 }).encode();

        let converted = registry.convert_to_older(raw.clone(), 10).unwrap();
        assert_eq!(converted.as_ptr(), raw.as_ptr());
        assert!(!registry.needs_conversion(MessageType::Hello, 4));
    }

    #[test]
    fn test_ping_nonce_dropped_for_v4() {
        let registry = ConverterRegistry::with_defaults();
        let raw = Message::Ping(PingMessage { nonce: 5 }).encode();

        let old = registry.convert_to_older(raw, 4).unwrap();
        assert_eq!(old.len(), HEADER_LEN + 1);
        assert_eq!(&old[12..16], &1u32.to_le_bytes());

        let restored = registry.convert_from_older(old, 4).unwrap();
        assert_eq!(
            Message::decode(restored).unwrap(),
            Message::Ping(PingMessage { nonce: 0 })
        );
    }

    #[test]
    fn test_bdn_stats_saturate_on_backward() {
        let registry = ConverterRegistry::with_defaults();
        assert_eq!(registry.size_delta(MessageType::BdnPerformanceStats, 9), 18);

        let raw = Message::BdnPerformanceStats(stats(70_000)).encode();
        let old = registry.convert_to_older(raw, 9).unwrap();
        assert_eq!(old.len(), HEADER_LEN + 25);

        let restored = Message::decode(registry.convert_from_older(old, 9).unwrap()).unwrap();
        match restored {
            Message::BdnPerformanceStats(restored) => {
                assert_eq!(restored.new_tx_from_node, 65_535);
                assert_eq!(restored.new_tx_from_bdn, 12);
                assert_eq!(restored.memory_utilization_mb, 0);
                assert_eq!(restored.new_blocks_from_bdn, 4);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_short_payload_is_conversion_error() {
        let diff = LayoutDiff::new(
            MessageType::Tx,
            7,
            vec![FieldChange::Unchanged(52), FieldChange::Unchanged(4)],
        );
        assert!(matches!(
            diff.forward(&[0u8; 10]),
            Err(RelayError::Conversion(_))
        ));
    }

    #[test]
    fn test_removed_field_restored_with_zero() {
        let diff = LayoutDiff::new(
            MessageType::Ack,
            3,
            vec![FieldChange::Removed {
                width: IntWidth::U16,
            }],
        );
        let new = diff.forward(&[0x34, 0x12, 0x01]).unwrap();
        assert_eq!(&new[..], &[0x01]);
        let old = diff.backward(&new).unwrap();
        assert_eq!(&old[..], &[0x00, 0x00, 0x01]);
    }
}

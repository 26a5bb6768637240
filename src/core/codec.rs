//! Wire framing: header preview, structural validation, broadcast preview
//! and a tokio-util codec.
//!
//! The preview functions never consume. The connection engine previews the
//! buffered bytes, validates the header before anything is allocated, and
//! only then pops a full message off its input buffer.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::constants::{
    ERR_MALFORMED_TYPE_TAG, ERR_PAYLOAD_OUT_OF_BOUNDS, ERR_PAYLOAD_TOO_LARGE,
    ERR_UNKNOWN_MESSAGE_TYPE,
};
use crate::error::{RelayError, Result};
use crate::protocol::message::{Message, MessageType, Sha256Hash};

/// Width of the NUL-padded type tag.
pub const MSG_TYPE_LEN: usize = 12;
/// Common header: type tag + `u32` payload length.
pub const HEADER_LEN: usize = MSG_TYPE_LEN + 4;
/// Trailing control-flag byte counted within the payload length.
pub const CONTROL_FLAGS_LEN: usize = 1;
pub const CONTROL_FLAG_VALID: u8 = 0x01;

pub const SHA256_HASH_LEN: usize = 32;
pub const NETWORK_NUM_LEN: usize = 4;
pub const NODE_ID_LEN: usize = 16;
/// hash | network number | source id
pub const BROADCAST_PREFIX_LEN: usize = SHA256_HASH_LEN + NETWORK_NUM_LEN + NODE_ID_LEN;

/// Header fields read without consuming anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPreview {
    /// Header and the whole declared payload are buffered.
    pub is_full_message: bool,
    pub type_tag: [u8; MSG_TYPE_LEN],
    pub payload_len: u32,
}

impl HeaderPreview {
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }

    /// Tag text with NUL padding stripped.
    ///
    /// Returns a framing error for non-ASCII tags or bytes after the padding
    /// starts, since the stream can no longer be trusted.
    pub fn tag(&self) -> Result<&str> {
        let end = self
            .type_tag
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MSG_TYPE_LEN);
        let (tag, padding) = self.type_tag.split_at(end);

        if end == 0
            || padding.iter().any(|&b| b != 0)
            || !tag.iter().all(|b| b.is_ascii_graphic())
        {
            return Err(RelayError::Framing(ERR_MALFORMED_TYPE_TAG.to_string()));
        }

        std::str::from_utf8(tag)
            .map_err(|_| RelayError::Framing(ERR_MALFORMED_TYPE_TAG.to_string()))
    }

    pub fn message_type(&self) -> Result<MessageType> {
        let tag = self.tag()?;
        MessageType::from_tag(tag)
            .ok_or_else(|| RelayError::Validation(format!("{ERR_UNKNOWN_MESSAGE_TYPE}: {tag}")))
    }
}

/// Read the common header from the front of `data`.
///
/// `None` when fewer than [`HEADER_LEN`] bytes are available.
pub fn preview_header(data: &[u8]) -> Option<HeaderPreview> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let mut type_tag = [0u8; MSG_TYPE_LEN];
    type_tag.copy_from_slice(&data[..MSG_TYPE_LEN]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[MSG_TYPE_LEN..HEADER_LEN]);
    let payload_len = u32::from_le_bytes(len_bytes);

    Some(HeaderPreview {
        is_full_message: data.len() >= HEADER_LEN + payload_len as usize,
        type_tag,
        payload_len,
    })
}

/// Routing fields of a broadcast-family message, read before the full
/// payload is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastPreview {
    pub is_full_message: bool,
    pub msg_type: MessageType,
    pub message_hash: Sha256Hash,
    pub network_num: u32,
    pub source_id: Uuid,
    pub payload_len: u32,
}

/// Extract the broadcast prefix from the front of `data`.
///
/// `Ok(None)` while the prefix is not yet buffered or when the message is not
/// a broadcast-family type.
pub fn preview_broadcast(data: &[u8]) -> Result<Option<BroadcastPreview>> {
    let header = match preview_header(data) {
        Some(header) => header,
        None => return Ok(None),
    };
    let msg_type = header.message_type()?;
    if !msg_type.is_broadcast_family() || data.len() < HEADER_LEN + BROADCAST_PREFIX_LEN {
        return Ok(None);
    }

    let mut prefix = &data[HEADER_LEN..HEADER_LEN + BROADCAST_PREFIX_LEN];
    let message_hash = Sha256Hash::from_slice(&prefix[..SHA256_HASH_LEN])?;
    prefix.advance(SHA256_HASH_LEN);
    let network_num = prefix.get_u32_le();
    let source_id = Uuid::from_slice(prefix).map_err(|e| RelayError::Validation(e.to_string()))?;

    Ok(Some(BroadcastPreview {
        is_full_message: header.is_full_message,
        msg_type,
        message_hash,
        network_num,
        source_id,
        payload_len: header.payload_len,
    }))
}

/// Cheap structural checks run on a header before any allocation.
#[derive(Debug, Clone, Copy)]
pub struct MessageValidator {
    max_payload_size: usize,
}

impl MessageValidator {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// Resolve the header's message type, checking the declared length.
    pub fn validate(&self, header: &HeaderPreview) -> Result<MessageType> {
        // A malformed tag desynchronises the stream, so check it first.
        let tag = header.tag()?;
        let payload_len = header.payload_len as usize;

        if payload_len > self.max_payload_size {
            return Err(RelayError::Framing(format!(
                "{ERR_PAYLOAD_TOO_LARGE}: {payload_len} > {}",
                self.max_payload_size
            )));
        }

        let msg_type = MessageType::from_tag(tag)
            .ok_or_else(|| RelayError::Validation(format!("{ERR_UNKNOWN_MESSAGE_TYPE}: {tag}")))?;

        let (min, max) = msg_type.payload_bounds();
        if payload_len < min || max.is_some_and(|max| payload_len > max) {
            return Err(RelayError::Validation(format!(
                "{ERR_PAYLOAD_OUT_OF_BOUNDS}: {msg_type} payload of {payload_len} bytes"
            )));
        }

        Ok(msg_type)
    }
}

impl Default for MessageValidator {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

/// Stream codec for clients and tools that speak the relay protocol at the
/// current version.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    validator: MessageValidator,
}

impl MessageCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            validator: MessageValidator::new(max_payload_size),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let header = match preview_header(src) {
            Some(header) => header,
            None => return Ok(None),
        };
        self.validator.validate(&header)?;

        if !header.is_full_message {
            src.reserve(header.total_len() - src.len());
            return Ok(None);
        }

        let raw = src.split_to(header.total_len()).freeze();
        Message::decode(raw).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::protocol::message::{BroadcastHeader, PingMessage, QuotaType, TxMessage};
    use bytes::Bytes;

    fn header_bytes(tag: &[u8], payload_len: u32) -> Vec<u8> {
        let mut data = vec![0u8; MSG_TYPE_LEN];
        data[..tag.len()].copy_from_slice(tag);
        data.extend_from_slice(&payload_len.to_le_bytes());
        data
    }

    #[test]
    fn test_preview_needs_full_header() {
        let data = header_bytes(b"ping", 9);
        assert!(preview_header(&data[..HEADER_LEN - 1]).is_none());

        let preview = preview_header(&data).unwrap();
        assert!(!preview.is_full_message);
        assert_eq!(preview.payload_len, 9);
        assert_eq!(preview.total_len(), HEADER_LEN + 9);
    }

    #[test]
    fn test_preview_reports_full_message() {
        let encoded = Message::Ping(PingMessage { nonce: 3 }).encode();
        let preview = preview_header(&encoded).unwrap();
        assert!(preview.is_full_message);
        assert_eq!(preview.message_type().unwrap(), MessageType::Ping);
    }

    #[test]
    fn test_malformed_tag_is_framing_error() {
        let validator = MessageValidator::default();

        let non_ascii = preview_header(&header_bytes(&[0xFF, b'x'], 1)).unwrap();
        assert_eq!(
            validator.validate(&non_ascii).unwrap_err().class(),
            ErrorClass::Framing
        );

        let gap = preview_header(&header_bytes(b"ack\0x", 1)).unwrap();
        assert_eq!(
            validator.validate(&gap).unwrap_err().class(),
            ErrorClass::Framing
        );
    }

    #[test]
    fn test_unknown_tag_is_validation_error() {
        let validator = MessageValidator::default();
        let preview = preview_header(&header_bytes(b"block", 10)).unwrap();
        assert_eq!(
            validator.validate(&preview).unwrap_err().class(),
            ErrorClass::Validation
        );
    }

    #[test]
    fn test_length_limits() {
        let validator = MessageValidator::new(1024);

        let oversized = preview_header(&header_bytes(b"tx", 4096)).unwrap();
        assert_eq!(
            validator.validate(&oversized).unwrap_err().class(),
            ErrorClass::Framing
        );

        let out_of_bounds = preview_header(&header_bytes(b"hello", 30)).unwrap();
        assert_eq!(
            validator.validate(&out_of_bounds).unwrap_err().class(),
            ErrorClass::Validation
        );

        let legacy_ping = preview_header(&header_bytes(b"ping", 1)).unwrap();
        assert_eq!(validator.validate(&legacy_ping).unwrap(), MessageType::Ping);
    }

    #[test]
    fn test_broadcast_preview_before_full_payload() {
        let source_id = Uuid::from_bytes([4; 16]);
        let encoded = Message::Tx(TxMessage {
            header: BroadcastHeader {
                message_hash: Sha256Hash::new([8; 32]),
                network_num: 12,
                source_id,
            },
            short_id: 1,
            quota_type: QuotaType::None,
            contents: Bytes::from(vec![0u8; 256]),
        })
        .encode();

        let partial = &encoded[..HEADER_LEN + BROADCAST_PREFIX_LEN];
        let preview = preview_broadcast(partial).unwrap().unwrap();
        assert!(!preview.is_full_message);
        assert_eq!(preview.msg_type, MessageType::Tx);
        assert_eq!(preview.message_hash, Sha256Hash::new([8; 32]));
        assert_eq!(preview.network_num, 12);
        assert_eq!(preview.source_id, source_id);

        assert!(preview_broadcast(&partial[..HEADER_LEN + 10]).unwrap().is_none());
        let ping = Message::Ping(PingMessage { nonce: 0 }).encode();
        assert!(preview_broadcast(&ping).unwrap().is_none());
    }

    #[test]
    fn test_codec_decodes_across_partial_reads() {
        let mut codec = MessageCodec::default();
        let encoded = Message::Ping(PingMessage { nonce: 77 }).encode();

        let mut src = BytesMut::from(&encoded[..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&encoded[10..]);

        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Ping(PingMessage { nonce: 77 }));
        assert!(src.is_empty());
    }
}

//! # Relay Messages
//!
//! Typed messages exchanged between relay peers, and their wire encoding at
//! the current protocol version.
//!
//! Every message is a 16-byte header (NUL-padded type tag, `u32` LE payload
//! length) followed by the payload, whose last byte is the control flag.
//! Broadcast-family messages (`broadcast`, `tx`, `blockconf`) start their
//! payload with a shared 52-byte routing prefix.
//!
//! Decoding produces owned values: variable-length fields are `Bytes` slices
//! of the consumed message, never borrows of the receive buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::codec::{
    preview_header, CONTROL_FLAGS_LEN, CONTROL_FLAG_VALID, HEADER_LEN, MSG_TYPE_LEN,
    NODE_ID_LEN, SHA256_HASH_LEN,
};
use crate::error::constants::{ERR_LENGTH_MISMATCH, ERR_TRAILING_BYTES, ERR_TRUNCATED_PAYLOAD};
use crate::error::{RelayError, Result};

/// Compact transaction alias.
pub type ShortId = u32;

/// Short id value meaning "no short id".
pub const NULL_TX_SID: ShortId = 0;

/// 32-byte SHA-256 digest identifying a transaction or block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sha256Hash([u8; SHA256_HASH_LEN]);

impl Sha256Hash {
    pub const fn new(bytes: [u8; SHA256_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SHA256_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| RelayError::Validation(format!("Invalid hash length: {}", bytes.len())))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_HASH_LEN] {
        &self.0
    }
}

impl From<[u8; SHA256_HASH_LEN]> for Sha256Hash {
    fn from(bytes: [u8; SHA256_HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Hash({})", hex::encode(self.0))
    }
}

/// Message type, identified on the wire by its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Hello,
    Ack,
    Ping,
    Pong,
    Broadcast,
    Tx,
    #[serde(rename = "gettxs")]
    GetTxs,
    Txs,
    #[serde(rename = "blockconf")]
    BlockConfirmation,
    #[serde(rename = "bdnperf")]
    BdnPerformanceStats,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Hello,
        MessageType::Ack,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Broadcast,
        MessageType::Tx,
        MessageType::GetTxs,
        MessageType::Txs,
        MessageType::BlockConfirmation,
        MessageType::BdnPerformanceStats,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::Ack => "ack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Broadcast => "broadcast",
            MessageType::Tx => "tx",
            MessageType::GetTxs => "gettxs",
            MessageType::Txs => "txs",
            MessageType::BlockConfirmation => "blockconf",
            MessageType::BdnPerformanceStats => "bdnperf",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|msg_type| msg_type.tag() == tag)
    }

    /// Tag padded with NULs to the header's type field width.
    pub fn tag_bytes(self) -> [u8; MSG_TYPE_LEN] {
        let mut bytes = [0u8; MSG_TYPE_LEN];
        let tag = self.tag().as_bytes();
        bytes[..tag.len()].copy_from_slice(tag);
        bytes
    }

    /// Inclusive payload length bounds across every supported protocol version.
    pub fn payload_bounds(self) -> (usize, Option<usize>) {
        match self {
            MessageType::Hello => (25, Some(25)),
            MessageType::Ack => (1, Some(1)),
            MessageType::Ping | MessageType::Pong => (1, Some(9)),
            MessageType::Broadcast => (54, None),
            MessageType::Tx => (57, None),
            MessageType::GetTxs | MessageType::Txs => (5, None),
            MessageType::BlockConfirmation => (61, None),
            MessageType::BdnPerformanceStats => (25, Some(43)),
        }
    }

    /// Whether the payload starts with the broadcast routing prefix.
    pub fn is_broadcast_family(self) -> bool {
        matches!(
            self,
            MessageType::Broadcast | MessageType::Tx | MessageType::BlockConfirmation
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Fee quota a transaction is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaType {
    #[default]
    None,
    FreeDailyQuota,
    PaidDailyQuota,
}

impl QuotaType {
    pub fn as_u8(self) -> u8 {
        match self {
            QuotaType::None => 0,
            QuotaType::FreeDailyQuota => 1,
            QuotaType::PaidDailyQuota => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QuotaType::None),
            1 => Ok(QuotaType::FreeDailyQuota),
            2 => Ok(QuotaType::PaidDailyQuota),
            other => Err(RelayError::Validation(format!("Unknown quota type: {other}"))),
        }
    }
}

/// Routing prefix shared by broadcast-family messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastHeader {
    pub message_hash: Sha256Hash,
    pub network_num: u32,
    pub source_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub network_num: u32,
    pub node_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongMessage {
    pub nonce: u64,
}

/// Opaque block or blob relayed to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub header: BroadcastHeader,
    pub is_encrypted: bool,
    pub blob: Bytes,
}

/// Transaction announcement, optionally carrying its short id and contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMessage {
    pub header: BroadcastHeader,
    pub short_id: ShortId,
    pub quota_type: QuotaType,
    pub contents: Bytes,
}

impl TxMessage {
    pub fn tx_hash(&self) -> Sha256Hash {
        self.header.message_hash
    }
}

/// Request for transactions by short id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTxsMessage {
    pub short_ids: Vec<ShortId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxsEntry {
    pub short_id: ShortId,
    pub hash: Sha256Hash,
    pub contents: Bytes,
}

/// Reply to [`GetTxsMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxsMessage {
    pub txs: Vec<TxsEntry>,
}

/// Short ids and transaction hashes confirmed by a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConfirmationMessage {
    pub header: BroadcastHeader,
    pub short_ids: Vec<ShortId>,
    pub tx_hashes: Vec<Sha256Hash>,
}

impl BlockConfirmationMessage {
    pub fn block_hash(&self) -> Sha256Hash {
        self.header.message_hash
    }
}

/// Periodic traffic statistics reported by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BdnPerformanceStatsMessage {
    pub interval_start_ms: u64,
    pub interval_end_ms: u64,
    pub new_blocks_from_node: u16,
    pub new_blocks_from_bdn: u16,
    pub new_tx_from_node: u32,
    pub new_tx_from_bdn: u32,
    pub memory_utilization_mb: u16,
    pub new_blocks_seen: u32,
    pub block_messages_from_node: u32,
    pub block_announcements_from_node: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(HelloMessage),
    Ack,
    Ping(PingMessage),
    Pong(PongMessage),
    Broadcast(BroadcastMessage),
    Tx(TxMessage),
    GetTxs(GetTxsMessage),
    Txs(TxsMessage),
    BlockConfirmation(BlockConfirmationMessage),
    BdnPerformanceStats(BdnPerformanceStatsMessage),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Ack => MessageType::Ack,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::Broadcast(_) => MessageType::Broadcast,
            Message::Tx(_) => MessageType::Tx,
            Message::GetTxs(_) => MessageType::GetTxs,
            Message::Txs(_) => MessageType::Txs,
            Message::BlockConfirmation(_) => MessageType::BlockConfirmation,
            Message::BdnPerformanceStats(_) => MessageType::BdnPerformanceStats,
        }
    }

    /// Encode header and payload at the current protocol version.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.put_slice(&self.msg_type().tag_bytes());
        buf.put_u32_le(0);

        match self {
            Message::Hello(hello) => {
                buf.put_u32_le(hello.protocol_version);
                buf.put_u32_le(hello.network_num);
                buf.put_slice(hello.node_id.as_bytes());
            }
            Message::Ack => {}
            Message::Ping(ping) => buf.put_u64_le(ping.nonce),
            Message::Pong(pong) => buf.put_u64_le(pong.nonce),
            Message::Broadcast(broadcast) => {
                put_broadcast_header(&mut buf, &broadcast.header);
                buf.put_u8(u8::from(broadcast.is_encrypted));
                buf.put_slice(&broadcast.blob);
            }
            Message::Tx(tx) => {
                put_broadcast_header(&mut buf, &tx.header);
                buf.put_u32_le(tx.short_id);
                buf.put_u8(tx.quota_type.as_u8());
                buf.put_slice(&tx.contents);
            }
            Message::GetTxs(get_txs) => {
                buf.put_u32_le(get_txs.short_ids.len() as u32);
                for short_id in &get_txs.short_ids {
                    buf.put_u32_le(*short_id);
                }
            }
            Message::Txs(txs) => {
                buf.put_u32_le(txs.txs.len() as u32);
                for entry in &txs.txs {
                    buf.put_u32_le(entry.short_id);
                    buf.put_slice(entry.hash.as_bytes());
                    buf.put_u32_le(entry.contents.len() as u32);
                    buf.put_slice(&entry.contents);
                }
            }
            Message::BlockConfirmation(conf) => {
                put_broadcast_header(&mut buf, &conf.header);
                buf.put_u32_le(conf.short_ids.len() as u32);
                for short_id in &conf.short_ids {
                    buf.put_u32_le(*short_id);
                }
                buf.put_u32_le(conf.tx_hashes.len() as u32);
                for hash in &conf.tx_hashes {
                    buf.put_slice(hash.as_bytes());
                }
            }
            Message::BdnPerformanceStats(stats) => {
                buf.put_u64_le(stats.interval_start_ms);
                buf.put_u64_le(stats.interval_end_ms);
                buf.put_u16_le(stats.new_blocks_from_node);
                buf.put_u16_le(stats.new_blocks_from_bdn);
                buf.put_u32_le(stats.new_tx_from_node);
                buf.put_u32_le(stats.new_tx_from_bdn);
                buf.put_u16_le(stats.memory_utilization_mb);
                buf.put_u32_le(stats.new_blocks_seen);
                buf.put_u32_le(stats.block_messages_from_node);
                buf.put_u32_le(stats.block_announcements_from_node);
            }
        }

        buf.put_u8(CONTROL_FLAG_VALID);
        let payload_len = (buf.len() - HEADER_LEN) as u32;
        buf[MSG_TYPE_LEN..HEADER_LEN].copy_from_slice(&payload_len.to_le_bytes());
        buf.freeze()
    }

    /// Decode one complete message laid out at the current protocol version.
    pub fn decode(raw: Bytes) -> Result<Message> {
        let preview = preview_header(&raw)
            .ok_or_else(|| RelayError::Validation(ERR_TRUNCATED_PAYLOAD.to_string()))?;
        let msg_type = preview.message_type()?;
        let payload_len = preview.payload_len as usize;

        if raw.len() != HEADER_LEN + payload_len || payload_len < CONTROL_FLAGS_LEN {
            return Err(RelayError::Validation(ERR_LENGTH_MISMATCH.to_string()));
        }

        let body = raw.slice(HEADER_LEN..raw.len() - CONTROL_FLAGS_LEN);
        let mut reader = PayloadReader::new(body);

        let msg = match msg_type {
            MessageType::Hello => Message::Hello(HelloMessage {
                protocol_version: reader.read_u32()?,
                network_num: reader.read_u32()?,
                node_id: reader.read_uuid()?,
            }),
            MessageType::Ack => Message::Ack,
            MessageType::Ping => Message::Ping(PingMessage {
                nonce: reader.read_u64()?,
            }),
            MessageType::Pong => Message::Pong(PongMessage {
                nonce: reader.read_u64()?,
            }),
            MessageType::Broadcast => {
                let header = reader.read_broadcast_header()?;
                let is_encrypted = reader.read_u8()? != 0;
                let blob = reader.read_remaining();
                Message::Broadcast(BroadcastMessage {
                    header,
                    is_encrypted,
                    blob,
                })
            }
            MessageType::Tx => {
                let header = reader.read_broadcast_header()?;
                let short_id = reader.read_u32()?;
                let quota_type = QuotaType::from_u8(reader.read_u8()?)?;
                let contents = reader.read_remaining();
                Message::Tx(TxMessage {
                    header,
                    short_id,
                    quota_type,
                    contents,
                })
            }
            MessageType::GetTxs => Message::GetTxs(GetTxsMessage {
                short_ids: reader.read_short_ids()?,
            }),
            MessageType::Txs => {
                let count = reader.read_count(4 + SHA256_HASH_LEN + 4)?;
                let mut txs = Vec::new();
                txs.try_reserve_exact(count)?;
                for _ in 0..count {
                    let short_id = reader.read_u32()?;
                    let hash = reader.read_hash()?;
                    let len = reader.read_u32()? as usize;
                    let contents = reader.read_bytes(len)?;
                    txs.push(TxsEntry {
                        short_id,
                        hash,
                        contents,
                    });
                }
                Message::Txs(TxsMessage { txs })
            }
            MessageType::BlockConfirmation => {
                let header = reader.read_broadcast_header()?;
                let short_ids = reader.read_short_ids()?;
                let count = reader.read_count(SHA256_HASH_LEN)?;
                let mut tx_hashes = Vec::new();
                tx_hashes.try_reserve_exact(count)?;
                for _ in 0..count {
                    tx_hashes.push(reader.read_hash()?);
                }
                Message::BlockConfirmation(BlockConfirmationMessage {
                    header,
                    short_ids,
                    tx_hashes,
                })
            }
            MessageType::BdnPerformanceStats => {
                Message::BdnPerformanceStats(BdnPerformanceStatsMessage {
                    interval_start_ms: reader.read_u64()?,
                    interval_end_ms: reader.read_u64()?,
                    new_blocks_from_node: reader.read_u16()?,
                    new_blocks_from_bdn: reader.read_u16()?,
                    new_tx_from_node: reader.read_u32()?,
                    new_tx_from_bdn: reader.read_u32()?,
                    memory_utilization_mb: reader.read_u16()?,
                    new_blocks_seen: reader.read_u32()?,
                    block_messages_from_node: reader.read_u32()?,
                    block_announcements_from_node: reader.read_u32()?,
                })
            }
        };

        reader.finish()?;
        Ok(msg)
    }
}

fn put_broadcast_header(buf: &mut BytesMut, header: &BroadcastHeader) {
    buf.put_slice(header.message_hash.as_bytes());
    buf.put_u32_le(header.network_num);
    buf.put_slice(header.source_id.as_bytes());
}

/// Bounds-checked little-endian reader over a payload body.
struct PayloadReader {
    body: Bytes,
}

impl PayloadReader {
    fn new(body: Bytes) -> Self {
        Self { body }
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.body.remaining() < n {
            return Err(RelayError::Validation(ERR_TRUNCATED_PAYLOAD.to_string()));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.body.get_u8())
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.body.get_u16_le())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.body.get_u32_le())
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.body.get_u64_le())
    }

    fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        Ok(self.body.split_to(n))
    }

    fn read_hash(&mut self) -> Result<Sha256Hash> {
        let bytes = self.read_bytes(SHA256_HASH_LEN)?;
        Sha256Hash::from_slice(&bytes)
    }

    fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes = self.read_bytes(NODE_ID_LEN)?;
        Uuid::from_slice(&bytes).map_err(|e| RelayError::Validation(e.to_string()))
    }

    fn read_broadcast_header(&mut self) -> Result<BroadcastHeader> {
        Ok(BroadcastHeader {
            message_hash: self.read_hash()?,
            network_num: self.read_u32()?,
            source_id: self.read_uuid()?,
        })
    }

    /// Element count that must fit in the remaining bytes at `min_item_len` each.
    fn read_count(&mut self, min_item_len: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_item_len) > self.body.remaining() {
            return Err(RelayError::Validation(ERR_TRUNCATED_PAYLOAD.to_string()));
        }
        Ok(count)
    }

    fn read_short_ids(&mut self) -> Result<Vec<ShortId>> {
        let count = self.read_count(4)?;
        let mut short_ids = Vec::new();
        short_ids.try_reserve_exact(count)?;
        for _ in 0..count {
            short_ids.push(self.read_u32()?);
        }
        Ok(short_ids)
    }

    fn read_remaining(&mut self) -> Bytes {
        self.body.split_to(self.body.remaining())
    }

    fn finish(self) -> Result<()> {
        if self.body.has_remaining() {
            return Err(RelayError::Validation(ERR_TRAILING_BYTES.to_string()));
        }
        Ok(())
    }
}

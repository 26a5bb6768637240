//! Property-based tests using proptest
//!
//! Wire encoding, version conversion, buffering and cache bounds checked
//! across randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bdn_relay::config::TxCacheConfig;
use bdn_relay::core::buffer::{InputBuffer, OutputBuffer};
use bdn_relay::core::codec::{preview_header, MessageValidator};
use bdn_relay::protocol::message::*;
use bdn_relay::protocol::versioning::ConverterRegistry;
use bdn_relay::service::TxCache;
use bdn_relay::utils::{AlarmQueue, ManualClock};
use bytes::Bytes;
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

fn arb_hash() -> impl Strategy<Value = Sha256Hash> {
    any::<[u8; 32]>().prop_map(Sha256Hash::new)
}

fn arb_broadcast_header() -> impl Strategy<Value = BroadcastHeader> {
    (arb_hash(), any::<u32>(), any::<[u8; 16]>()).prop_map(|(message_hash, network_num, id)| {
        BroadcastHeader {
            message_hash,
            network_num,
            source_id: Uuid::from_bytes(id),
        }
    })
}

fn arb_bytes(max: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..max).prop_map(Bytes::from)
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<u32>(), any::<u32>(), any::<[u8; 16]>()).prop_map(|(v, n, id)| {
            Message::Hello(HelloMessage {
                protocol_version: v,
                network_num: n,
                node_id: Uuid::from_bytes(id),
            })
        }),
        Just(Message::Ack),
        any::<u64>().prop_map(|nonce| Message::Ping(PingMessage { nonce })),
        any::<u64>().prop_map(|nonce| Message::Pong(PongMessage { nonce })),
        (arb_broadcast_header(), any::<bool>(), arb_bytes(512)).prop_map(
            |(header, is_encrypted, blob)| Message::Broadcast(BroadcastMessage {
                header,
                is_encrypted,
                blob,
            })
        ),
        (arb_broadcast_header(), any::<u32>(), 0u8..3, arb_bytes(512)).prop_map(
            |(header, short_id, quota, contents)| Message::Tx(TxMessage {
                header,
                short_id,
                quota_type: QuotaType::from_u8(quota).unwrap(),
                contents,
            })
        ),
        prop::collection::vec(any::<u32>(), 0..64)
            .prop_map(|short_ids| Message::GetTxs(GetTxsMessage { short_ids })),
        prop::collection::vec((any::<u32>(), arb_hash(), arb_bytes(64)), 0..16).prop_map(
            |entries| Message::Txs(TxsMessage {
                txs: entries
                    .into_iter()
                    .map(|(short_id, hash, contents)| TxsEntry {
                        short_id,
                        hash,
                        contents,
                    })
                    .collect(),
            })
        ),
        (
            arb_broadcast_header(),
            prop::collection::vec(any::<u32>(), 0..32),
            prop::collection::vec(arb_hash(), 0..8)
        )
            .prop_map(|(header, short_ids, tx_hashes)| {
                Message::BlockConfirmation(BlockConfirmationMessage {
                    header,
                    short_ids,
                    tx_hashes,
                })
            }),
        (any::<u64>(), any::<u64>(), any::<u16>(), any::<u32>(), any::<u32>()).prop_map(
            |(start, end, blocks, tx_node, tx_bdn)| {
                Message::BdnPerformanceStats(BdnPerformanceStatsMessage {
                    interval_start_ms: start,
                    interval_end_ms: end,
                    new_blocks_from_node: blocks,
                    new_tx_from_node: tx_node,
                    new_tx_from_bdn: tx_bdn,
                    ..BdnPerformanceStatsMessage::default()
                })
            }
        ),
    ]
}

// Property: every message decodes to itself and passes header validation
proptest! {
    #[test]
    fn prop_message_roundtrip(msg in arb_message()) {
        let encoded = msg.encode();
        let header = preview_header(&encoded).expect("Header should be complete");

        prop_assert!(header.is_full_message);
        prop_assert_eq!(header.total_len(), encoded.len());
        prop_assert_eq!(MessageValidator::default().validate(&header).unwrap(), msg.msg_type());

        let decoded = Message::decode(encoded).expect("Decoding should not fail");
        prop_assert_eq!(decoded, msg);
    }
}

// Property: converting down and back up is lossless for every version,
// except counters that do not fit the older layout
proptest! {
    #[test]
    fn prop_version_conversion_roundtrip(msg in arb_message(), peer_version in 4u32..=10) {
        let registry = ConverterRegistry::with_defaults();
        let encoded = msg.encode();

        let older = registry.convert_to_older(encoded, peer_version).unwrap();
        let header = preview_header(&older).unwrap();
        prop_assert_eq!(header.total_len(), older.len());

        let restored = Message::decode(registry.convert_from_older(older, peer_version).unwrap()).unwrap();
        match (&msg, &restored) {
            (Message::Ping(_), Message::Ping(ping)) if peer_version < 5 => prop_assert_eq!(ping.nonce, 0),
            (Message::Pong(_), Message::Pong(pong)) if peer_version < 5 => prop_assert_eq!(pong.nonce, 0),
            (Message::Tx(sent), Message::Tx(got)) if peer_version < 7 => {
                prop_assert_eq!(got.quota_type, QuotaType::None);
                prop_assert_eq!(&got.contents, &sent.contents);
                prop_assert_eq!(got.short_id, sent.short_id);
            }
            (Message::BdnPerformanceStats(sent), Message::BdnPerformanceStats(got)) if peer_version < 10 => {
                prop_assert_eq!(got.new_tx_from_node, sent.new_tx_from_node.min(u16::MAX as u32));
                prop_assert_eq!(got.new_tx_from_bdn, sent.new_tx_from_bdn.min(u16::MAX as u32));
                prop_assert_eq!(got.interval_end_ms, sent.interval_end_ms);
            }
            _ => prop_assert_eq!(&restored, &msg),
        }
    }
}

// Property: a stream split at arbitrary points yields the same messages
proptest! {
    #[test]
    fn prop_input_buffer_reassembles_stream(
        messages in prop::collection::vec(arb_message(), 1..8),
        chunk in 1usize..64,
    ) {
        let stream: Vec<u8> = messages.iter().flat_map(|m| m.encode().to_vec()).collect();
        let mut buffer = InputBuffer::new();
        let mut decoded = Vec::new();

        for piece in stream.chunks(chunk) {
            buffer.append(piece);
            while let Some(header) = preview_header(buffer.as_slice()) {
                if !header.is_full_message {
                    break;
                }
                let raw = buffer.consume(header.total_len()).unwrap();
                decoded.push(Message::decode(raw).unwrap());
            }
        }

        prop_assert!(buffer.is_empty());
        prop_assert_eq!(decoded, messages);
    }
}

// Property: the output buffer drains exactly what was queued, in order
proptest! {
    #[test]
    fn prop_output_buffer_preserves_bytes(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..100), 1..20),
        step in 1usize..50,
    ) {
        let mut buffer = OutputBuffer::new();
        let expected: Vec<u8> = chunks.iter().flatten().copied().collect();
        for chunk in chunks {
            buffer.append(Bytes::from(chunk));
        }
        prop_assert_eq!(buffer.len(), expected.len());

        let mut drained = Vec::new();
        while let Some(front) = buffer.get_buffer() {
            let n = step.min(front.len());
            drained.extend_from_slice(&front[..n]);
            buffer.advance(n).unwrap();
        }
        prop_assert!(buffer.is_empty());
        prop_assert_eq!(drained, expected);
    }
}

// Property: retained contents never exceed the memory limit
proptest! {
    #[test]
    fn prop_tx_cache_respects_memory_limit(
        sizes in prop::collection::vec(1usize..40, 1..60),
        limit in 40usize..200,
    ) {
        let clock = ManualClock::new();
        let alarms = Arc::new(AlarmQueue::new(Arc::new(clock.clone())));
        let config = TxCacheConfig {
            memory_limit_bytes: limit,
            ..TxCacheConfig::default()
        };
        let mut cache = TxCache::new(1, config, Arc::new(clock), alarms);

        for (i, size) in sizes.into_iter().enumerate() {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&(i as u64).to_le_bytes());
            let hash = Sha256Hash::new(bytes);
            cache.assign_short_id(hash, i as u32 + 1);
            cache.set_content(hash, Bytes::from(vec![0u8; size]));

            prop_assert!(cache.total_contents_size() <= limit);
            let state = cache.cache_state();
            prop_assert_eq!(state.hash_to_short_ids_len, state.short_id_to_hash_len);
        }
    }
}

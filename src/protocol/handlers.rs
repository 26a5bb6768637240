//! Default relay message handlers.
//!
//! These keep the node's transaction cache in sync with relayed traffic and
//! answer transaction requests. Anything they retain is copied out of the
//! message so cached entries never pin a receive buffer.

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::config::ALL_NETWORK_NUM;
use crate::core::codec::{preview_broadcast, HeaderPreview};
use crate::error::{RelayError, Result};
use crate::protocol::dispatcher::{Dispatcher, HandlerContext};
use crate::protocol::message::{Message, MessageType, TxsEntry, TxsMessage, NULL_TX_SID};
use crate::transport::ConnectionId;

/// Dispatcher with every default handler registered.
pub fn default_dispatcher() -> Result<Dispatcher> {
    let dispatcher = Dispatcher::new();
    register_default_handlers(&dispatcher)?;
    Ok(dispatcher)
}

pub fn register_default_handlers(dispatcher: &Dispatcher) -> Result<()> {
    dispatcher.register(MessageType::Tx, handle_tx)?;
    dispatcher.register(MessageType::GetTxs, handle_get_txs)?;
    dispatcher.register(MessageType::Txs, handle_txs)?;
    dispatcher.register(MessageType::BlockConfirmation, handle_block_confirmation)?;
    dispatcher.register(MessageType::Broadcast, handle_broadcast)?;
    dispatcher.register(MessageType::BdnPerformanceStats, handle_bdn_performance_stats)?;
    dispatcher.register_preview(MessageType::Broadcast, preview_broadcast_routing)?;
    Ok(())
}

fn unexpected(expected: MessageType, msg: &Message) -> RelayError {
    RelayError::Processing(format!(
        "{expected} handler received {} message",
        msg.msg_type()
    ))
}

fn handle_tx(ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<()> {
    let Message::Tx(tx) = msg else {
        return Err(unexpected(MessageType::Tx, msg));
    };

    let mut cache = ctx.tx_cache()?;
    let network_num = tx.header.network_num;
    if network_num != cache.network_num() && network_num != ALL_NETWORK_NUM {
        return Err(RelayError::Unauthorized(format!(
            "Transaction for network {network_num} relayed to network {}",
            cache.network_num()
        )));
    }

    if tx.short_id != NULL_TX_SID {
        cache.assign_short_id(tx.tx_hash(), tx.short_id);
    }
    if !tx.contents.is_empty() {
        cache.set_content(tx.tx_hash(), Bytes::copy_from_slice(&tx.contents));
    }

    trace!(
        conn_id = %ctx.conn_id,
        tx_hash = %tx.tx_hash(),
        short_id = tx.short_id,
        quota = ?tx.quota_type,
        "Processed transaction"
    );
    Ok(())
}

fn handle_get_txs(ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<()> {
    let Message::GetTxs(request) = msg else {
        return Err(unexpected(MessageType::GetTxs, msg));
    };

    let search = ctx.tx_cache()?.get_transactions(&request.short_ids);
    debug!(
        conn_id = %ctx.conn_id,
        requested = request.short_ids.len(),
        found = search.found.len(),
        missing = search.missing.len(),
        "Answering transaction request"
    );

    let txs = search
        .found
        .into_iter()
        .filter_map(|info| {
            Some(TxsEntry {
                short_id: info.short_id,
                hash: info.hash?,
                contents: info.contents?,
            })
        })
        .collect();
    ctx.reply(Message::Txs(TxsMessage { txs }));
    Ok(())
}

fn handle_txs(ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<()> {
    let Message::Txs(txs) = msg else {
        return Err(unexpected(MessageType::Txs, msg));
    };

    let mut cache = ctx.tx_cache()?;
    for entry in &txs.txs {
        if entry.short_id != NULL_TX_SID {
            cache.assign_short_id(entry.hash, entry.short_id);
        }
        if !entry.contents.is_empty() {
            cache.set_content(entry.hash, Bytes::copy_from_slice(&entry.contents));
        }
    }
    debug!(conn_id = %ctx.conn_id, count = txs.txs.len(), "Stored transactions");
    Ok(())
}

fn handle_block_confirmation(ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<()> {
    let Message::BlockConfirmation(conf) = msg else {
        return Err(unexpected(MessageType::BlockConfirmation, msg));
    };

    let mut cache = ctx.tx_cache()?;
    cache.track_seen_in_block(conf.block_hash(), conf.short_ids.clone());
    for tx_hash in &conf.tx_hashes {
        cache.remove_by_hash(tx_hash);
    }
    debug!(
        conn_id = %ctx.conn_id,
        block_hash = %conf.block_hash(),
        short_ids = conf.short_ids.len(),
        tx_hashes = conf.tx_hashes.len(),
        "Processed block confirmation"
    );
    Ok(())
}

fn handle_broadcast(ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<()> {
    let Message::Broadcast(broadcast) = msg else {
        return Err(unexpected(MessageType::Broadcast, msg));
    };

    debug!(
        conn_id = %ctx.conn_id,
        block_hash = %broadcast.header.message_hash,
        network_num = broadcast.header.network_num,
        encrypted = broadcast.is_encrypted,
        size = broadcast.blob.len(),
        "Received broadcast"
    );
    Ok(())
}

fn handle_bdn_performance_stats(ctx: &mut HandlerContext<'_>, msg: &Message) -> Result<()> {
    let Message::BdnPerformanceStats(stats) = msg else {
        return Err(unexpected(MessageType::BdnPerformanceStats, msg));
    };

    info!(
        conn_id = %ctx.conn_id,
        interval_start_ms = stats.interval_start_ms,
        interval_end_ms = stats.interval_end_ms,
        new_blocks_from_node = stats.new_blocks_from_node,
        new_blocks_from_bdn = stats.new_blocks_from_bdn,
        new_tx_from_node = stats.new_tx_from_node,
        new_tx_from_bdn = stats.new_tx_from_bdn,
        memory_utilization_mb = stats.memory_utilization_mb,
        "Gateway performance stats"
    );
    Ok(())
}

fn preview_broadcast_routing(
    conn_id: ConnectionId,
    _header: &HeaderPreview,
    buffered: &[u8],
) -> Result<()> {
    if let Some(preview) = preview_broadcast(buffered)? {
        trace!(
            %conn_id,
            block_hash = %preview.message_hash,
            network_num = preview.network_num,
            source_id = %preview.source_id,
            complete = preview.is_full_message,
            "Broadcast routing preview"
        );
    }
    Ok(())
}

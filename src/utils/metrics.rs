//! Observability and Metrics
//!
//! Process-wide counters for the relay: connection lifecycle, message
//! throughput, every error tier the connection engine recovers from, and the
//! transaction cache's eviction activity.
//!
//! Uses atomic counters so any task can record without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for relay operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections created
    pub connections_total: AtomicU64,
    /// Connections not yet disposed
    pub connections_active: AtomicU64,
    /// Connections that reached the established state
    pub handshakes_completed: AtomicU64,
    /// Total messages decoded
    pub messages_received: AtomicU64,
    /// Total messages enqueued
    pub messages_sent: AtomicU64,
    /// Total bytes appended to input buffers
    pub bytes_received: AtomicU64,
    /// Total bytes enqueued on output buffers
    pub bytes_sent: AtomicU64,
    /// Unrecoverable framing errors
    pub framing_errors: AtomicU64,
    /// Validation and authorization failures
    pub validation_errors: AtomicU64,
    /// Pre-handshake protocol violations
    pub handshake_violations: AtomicU64,
    /// Other decode or handler failures
    pub processing_errors: AtomicU64,
    /// Strikes counted toward the bad-message threshold
    pub bad_messages: AtomicU64,
    /// Connections closed for too many bad messages
    pub bad_message_closes: AtomicU64,
    /// Connections closed for missing pong replies
    pub pong_timeouts: AtomicU64,
    /// Inbound connections closed as duplicates of a newer one
    pub duplicate_connections_closed: AtomicU64,
    /// Short ids assigned
    pub short_ids_assigned: AtomicU64,
    /// Short ids removed by the TTL sweep
    pub short_ids_expired: AtomicU64,
    /// Transactions evicted to honour the memory limit
    pub tx_removed_by_memory_limit: AtomicU64,
    /// Whole-cache clears triggered by the memory limit
    pub tx_cache_full_clears: AtomicU64,
    /// Blocks whose short ids were retired by confirmation depth
    pub blocks_confirmed: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            handshake_violations: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            bad_messages: AtomicU64::new(0),
            bad_message_closes: AtomicU64::new(0),
            pong_timeouts: AtomicU64::new(0),
            duplicate_connections_closed: AtomicU64::new(0),
            short_ids_assigned: AtomicU64::new(0),
            short_ids_expired: AtomicU64::new(0),
            tx_removed_by_memory_limit: AtomicU64::new(0),
            tx_cache_full_clears: AtomicU64::new(0),
            blocks_confirmed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a disposed connection
    pub fn connection_disposed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decoded inbound message
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an enqueued outbound message
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_violation(&self) {
        self.handshake_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_message(&self) {
        self.bad_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_message_close(&self) {
        self.bad_message_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pong_timeout(&self) {
        self.pong_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_connection_closed(&self) {
        self.duplicate_connections_closed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn short_id_assigned(&self) {
        self.short_ids_assigned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn short_ids_expired(&self, count: u64) {
        self.short_ids_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn tx_removed_by_memory_limit(&self, count: u64) {
        self.tx_removed_by_memory_limit
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn tx_cache_full_clear(&self) {
        self.tx_cache_full_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_confirmed(&self) {
        self.blocks_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            handshake_violations: self.handshake_violations.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            bad_messages: self.bad_messages.load(Ordering::Relaxed),
            bad_message_closes: self.bad_message_closes.load(Ordering::Relaxed),
            pong_timeouts: self.pong_timeouts.load(Ordering::Relaxed),
            duplicate_connections_closed: self
                .duplicate_connections_closed
                .load(Ordering::Relaxed),
            short_ids_assigned: self.short_ids_assigned.load(Ordering::Relaxed),
            short_ids_expired: self.short_ids_expired.load(Ordering::Relaxed),
            tx_removed_by_memory_limit: self.tx_removed_by_memory_limit.load(Ordering::Relaxed),
            tx_cache_full_clears: self.tx_cache_full_clears.load(Ordering::Relaxed),
            blocks_confirmed: self.blocks_confirmed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_completed = snapshot.handshakes_completed,
            messages_received = snapshot.messages_received,
            messages_sent = snapshot.messages_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            framing_errors = snapshot.framing_errors,
            validation_errors = snapshot.validation_errors,
            handshake_violations = snapshot.handshake_violations,
            processing_errors = snapshot.processing_errors,
            bad_messages = snapshot.bad_messages,
            bad_message_closes = snapshot.bad_message_closes,
            pong_timeouts = snapshot.pong_timeouts,
            duplicate_connections_closed = snapshot.duplicate_connections_closed,
            short_ids_assigned = snapshot.short_ids_assigned,
            short_ids_expired = snapshot.short_ids_expired,
            tx_removed_by_memory_limit = snapshot.tx_removed_by_memory_limit,
            tx_cache_full_clears = snapshot.tx_cache_full_clears,
            blocks_confirmed = snapshot.blocks_confirmed,
            uptime_seconds = snapshot.uptime_seconds,
            "Relay metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_completed: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub framing_errors: u64,
    pub validation_errors: u64,
    pub handshake_violations: u64,
    pub processing_errors: u64,
    pub bad_messages: u64,
    pub bad_message_closes: u64,
    pub pong_timeouts: u64,
    pub duplicate_connections_closed: u64,
    pub short_ids_assigned: u64,
    pub short_ids_expired: u64,
    pub tx_removed_by_memory_limit: u64,
    pub tx_cache_full_clears: u64,
    pub blocks_confirmed: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

//! # Transaction Short-ID Cache
//!
//! Maps 32-byte transaction hashes to compact short ids and caches
//! transaction contents for one blockchain network.
//!
//! ## Indexes
//! - hash -> set of short ids (a hash may have several aliases)
//! - short id -> hash (each short id names exactly one hash)
//! - hash -> contents, with a running total of content bytes
//! - short ids in assignment order ([`ExpirationQueue`])
//! - short ids seen per block, in arrival order
//!
//! ## Eviction
//! - **TTL**: assignments older than `sid_expire_time` are removed by an
//!   alarm that reschedules itself at the next expiry.
//! - **Memory**: when content bytes exceed the limit, the oldest assignments
//!   are removed until the total fits. If that is not enough the whole cache
//!   is cleared.
//! - **Confirmation**: once more than `final_tx_confirmations_count` blocks
//!   are tracked, the oldest block's transactions are retired with all of
//!   their short ids.
//!
//! Removing the last short id of a hash also drops its contents.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::TxCacheConfig;
use crate::protocol::message::{Sha256Hash, ShortId, NULL_TX_SID};
use crate::utils::expiration_queue::ExpirationQueue;
use crate::utils::metrics::global_metrics;
use crate::utils::scheduler::{Scheduler, TimerEvent, TimerHandle};
use crate::utils::time::Clock;

/// Result of a short id lookup. Fields are `None` when unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub hash: Option<Sha256Hash>,
    pub contents: Option<Bytes>,
    pub short_id: ShortId,
}

/// What a peer must still send before a block can be reconstructed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingTransactions {
    pub has_missing: bool,
    /// Short ids with no known hash.
    pub unknown_short_ids: Vec<ShortId>,
    /// Hashes known by short id but without contents.
    pub unknown_hashes: Vec<Sha256Hash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionSearchResult {
    pub found: Vec<TransactionInfo>,
    pub missing: Vec<TransactionInfo>,
}

/// Eviction counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCacheStats {
    pub short_ids_assigned: u64,
    pub short_ids_expired: u64,
    pub tx_removed_by_memory_limit: u64,
    pub full_clears: u64,
    pub blocks_confirmed: u64,
}

/// Size summary of every index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheState {
    pub network_num: u32,
    pub hash_to_short_ids_len: usize,
    pub short_id_to_hash_len: usize,
    pub hash_to_contents_len: usize,
    pub short_ids_seen_in_block_len: usize,
    pub total_contents_size: usize,
}

pub struct TxCache {
    network_num: u32,
    config: TxCacheConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    hash_to_short_ids: HashMap<Sha256Hash, HashSet<ShortId>>,
    short_id_to_hash: HashMap<ShortId, Sha256Hash>,
    hash_to_contents: HashMap<Sha256Hash, Bytes>,
    expiration_queue: ExpirationQueue<ShortId>,
    seen_in_block: VecDeque<(Sha256Hash, Vec<ShortId>)>,
    total_contents_size: usize,
    expiration_timer: Option<TimerHandle>,
    stats: TxCacheStats,
}

impl TxCache {
    pub fn new(
        network_num: u32,
        config: TxCacheConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let expiration_queue = ExpirationQueue::new(config.sid_expire_time);
        Self {
            network_num,
            config,
            clock,
            scheduler,
            hash_to_short_ids: HashMap::new(),
            short_id_to_hash: HashMap::new(),
            hash_to_contents: HashMap::new(),
            expiration_queue,
            seen_in_block: VecDeque::new(),
            total_contents_size: 0,
            expiration_timer: None,
            stats: TxCacheStats::default(),
        }
    }

    pub fn network_num(&self) -> u32 {
        self.network_num
    }

    pub fn set_confirmation_depth(&mut self, depth: usize) {
        self.config.final_tx_confirmations_count = depth;
    }

    /// Map `short_id` to `hash` and queue it for expiration.
    pub fn assign_short_id(&mut self, hash: Sha256Hash, short_id: ShortId) {
        if short_id == NULL_TX_SID {
            warn!(%hash, "Attempt to assign null short id to transaction. Ignoring.");
            return;
        }

        if let Some(previous) = self.short_id_to_hash.get(&short_id).copied() {
            if previous != hash {
                debug!(short_id, %previous, %hash, "Reassigning short id to a new transaction");
                self.remove_by_short_id(short_id, false);
            }
        }

        debug!(short_id, %hash, "Assigning short id");
        self.hash_to_short_ids
            .entry(hash)
            .or_default()
            .insert(short_id);
        self.short_id_to_hash.insert(short_id, hash);
        self.expiration_queue.add(short_id, self.clock.now());
        self.stats.short_ids_assigned += 1;
        global_metrics().short_id_assigned();

        if self.expiration_timer.is_none() {
            self.arm_expiration_timer(self.config.sid_expire_time);
        }
    }

    /// Store contents for `hash`, then enforce the memory limit.
    pub fn set_content(&mut self, hash: Sha256Hash, contents: Bytes) {
        let new_size = contents.len();
        let previous_size = self
            .hash_to_contents
            .insert(hash, contents)
            .map_or(0, |previous| previous.len());
        self.total_contents_size = self.total_contents_size - previous_size + new_size;

        self.memory_limit_clean_up();
    }

    pub fn has_content(&self, hash: &Sha256Hash) -> bool {
        self.hash_to_contents.contains_key(hash)
    }

    pub fn has_short_id_for(&self, hash: &Sha256Hash) -> bool {
        self.hash_to_short_ids.contains_key(hash)
    }

    pub fn has_short_id(&self, short_id: ShortId) -> bool {
        self.short_id_to_hash.contains_key(&short_id)
    }

    /// One short id of `hash` (the lowest), or [`NULL_TX_SID`].
    pub fn get_short_id(&self, hash: &Sha256Hash) -> ShortId {
        self.hash_to_short_ids
            .get(hash)
            .and_then(|short_ids| short_ids.iter().min().copied())
            .unwrap_or(NULL_TX_SID)
    }

    pub fn get_short_ids(&self, hash: &Sha256Hash) -> HashSet<ShortId> {
        self.hash_to_short_ids.get(hash).cloned().unwrap_or_default()
    }

    pub fn get_by_short_id(&self, short_id: ShortId) -> TransactionInfo {
        let hash = self.short_id_to_hash.get(&short_id).copied();
        let contents = hash.and_then(|hash| self.hash_to_contents.get(&hash).cloned());
        TransactionInfo {
            hash,
            contents,
            short_id,
        }
    }

    pub fn get_transaction_by_hash(&self, hash: &Sha256Hash) -> Option<Bytes> {
        self.hash_to_contents.get(hash).cloned()
    }

    pub fn get_missing(&self, short_ids: &[ShortId]) -> MissingTransactions {
        let mut missing = MissingTransactions::default();
        for &short_id in short_ids {
            match self.short_id_to_hash.get(&short_id) {
                None => missing.unknown_short_ids.push(short_id),
                Some(hash) if !self.hash_to_contents.contains_key(hash) => {
                    missing.unknown_hashes.push(*hash)
                }
                Some(_) => {}
            }
        }
        missing.has_missing =
            !missing.unknown_short_ids.is_empty() || !missing.unknown_hashes.is_empty();
        missing
    }

    /// Split `short_ids` into those with contents and those without.
    pub fn get_transactions(&self, short_ids: &[ShortId]) -> TransactionSearchResult {
        let mut result = TransactionSearchResult::default();
        for &short_id in short_ids {
            let info = self.get_by_short_id(short_id);
            if info.contents.is_some() {
                result.found.push(info);
            } else {
                debug!(short_id, "Short id was requested but is unknown");
                result.missing.push(TransactionInfo {
                    hash: None,
                    contents: None,
                    short_id,
                });
            }
        }
        result
    }

    /// Hashes with cached contents.
    pub fn iter_transaction_hashes(&self) -> impl Iterator<Item = &Sha256Hash> {
        self.hash_to_contents.keys()
    }

    /// Remove `hash` with all of its short ids and contents.
    pub fn remove_by_hash(&mut self, hash: &Sha256Hash) -> HashSet<ShortId> {
        let short_ids = self.hash_to_short_ids.remove(hash).unwrap_or_default();
        for short_id in &short_ids {
            self.short_id_to_hash.remove(short_id);
            self.expiration_queue.remove(short_id);
        }

        let removed_contents = self.remove_contents(hash);
        debug!(
            %hash,
            short_ids = short_ids.len(),
            removed_contents,
            "Removed transaction by hash"
        );
        short_ids
    }

    /// Remove `short_id`. Contents go away when it was the hash's last short id,
    /// or unconditionally with `remove_siblings`, which also drops every other
    /// short id of the same hash.
    pub fn remove_by_short_id(&mut self, short_id: ShortId, remove_siblings: bool) {
        if let Some(hash) = self.short_id_to_hash.remove(&short_id) {
            let retire_hash = match self.hash_to_short_ids.get_mut(&hash) {
                Some(short_ids) if short_ids.len() == 1 || remove_siblings => true,
                Some(short_ids) => {
                    short_ids.remove(&short_id);
                    false
                }
                None => false,
            };

            if retire_hash {
                let siblings = self.hash_to_short_ids.remove(&hash).unwrap_or_default();
                for sibling in siblings.into_iter().filter(|&sibling| sibling != short_id) {
                    self.short_id_to_hash.remove(&sibling);
                    self.expiration_queue.remove(&sibling);
                }
                self.remove_contents(&hash);
            }
        }

        self.expiration_queue.remove(&short_id);
    }

    /// Record the short ids carried by a block and retire the oldest block
    /// once the confirmation window is full.
    pub fn track_seen_in_block(&mut self, block_hash: Sha256Hash, short_ids: Vec<ShortId>) {
        let seen_count = short_ids.len();
        match self
            .seen_in_block
            .iter_mut()
            .find(|(tracked, _)| *tracked == block_hash)
        {
            Some(entry) => entry.1 = short_ids,
            None => self.seen_in_block.push_back((block_hash, short_ids)),
        }

        while self.seen_in_block.len() > self.config.final_tx_confirmations_count {
            let Some((confirmed_block, final_short_ids)) = self.seen_in_block.pop_front() else {
                break;
            };
            for short_id in final_short_ids {
                self.remove_by_short_id(short_id, true);
            }
            self.stats.blocks_confirmed += 1;
            global_metrics().block_confirmed();
            debug!(block_hash = %confirmed_block, "Retired short ids of confirmed block");
        }

        let state = self.cache_state();
        debug!(
            %block_hash,
            seen_short_ids = seen_count,
            hash_to_short_ids = state.hash_to_short_ids_len,
            short_id_to_hash = state.short_id_to_hash_len,
            hash_to_contents = state.hash_to_contents_len,
            tracked_blocks = state.short_ids_seen_in_block_len,
            total_contents_size = state.total_contents_size,
            "Tracked short ids seen in block"
        );
    }

    /// Stop tracking `block_hash` without retiring its transactions.
    pub fn on_block_cleaned_up(&mut self, block_hash: &Sha256Hash) {
        self.seen_in_block.retain(|(tracked, _)| tracked != block_hash);
    }

    pub fn tracked_block_count(&self) -> usize {
        self.seen_in_block.len()
    }

    /// Remove every assignment older than the TTL.
    ///
    /// Returns the delay until the next sweep is due, or `None` when nothing is
    /// left to expire.
    pub fn expire_old_assignments(&mut self) -> Option<Duration> {
        let now = self.clock.now();
        info!(
            entries = self.expiration_queue.len(),
            "Expiring old short id assignments"
        );

        let mut expired = Vec::new();
        self.expiration_queue
            .remove_expired(now, |short_id| expired.push(short_id));
        for &short_id in &expired {
            self.remove_by_short_id(short_id, false);
        }
        self.stats.short_ids_expired += expired.len() as u64;
        global_metrics().short_ids_expired(expired.len() as u64);

        info!(
            expired = expired.len(),
            remaining = self.expiration_queue.len(),
            "Finished cleaning up short ids"
        );

        match self.expiration_queue.oldest_timestamp() {
            Some(oldest) => {
                let until_oldest_expires = oldest
                    .checked_add(self.config.sid_expire_time)
                    .map_or(Duration::MAX, |expires| expires.saturating_duration_since(now));
                Some(until_oldest_expires.max(self.config.min_cleanup_interval))
            }
            None => {
                if let Some(timer) = self.expiration_timer.take() {
                    self.scheduler.unregister(timer);
                }
                None
            }
        }
    }

    /// Handle the [`TimerEvent::ExpireShortIds`] alarm.
    pub fn on_expiration_alarm(&mut self) {
        if let Some(fired) = self.expiration_timer.take() {
            self.scheduler.unregister(fired);
        }
        if let Some(delay) = self.expire_old_assignments() {
            self.arm_expiration_timer(delay);
        }
    }

    fn arm_expiration_timer(&mut self, delay: Duration) {
        match self.scheduler.register(delay, TimerEvent::ExpireShortIds) {
            Ok(timer) => self.expiration_timer = Some(timer),
            Err(e) => error!(error = %e, "Failed to arm short id expiration timer"),
        }
    }

    pub fn is_expiration_armed(&self) -> bool {
        self.expiration_timer.is_some()
    }

    /// Short ids waiting for expiration.
    pub fn pending_expirations(&self) -> usize {
        self.expiration_queue.len()
    }

    pub fn total_contents_size(&self) -> usize {
        self.total_contents_size
    }

    pub fn stats(&self) -> TxCacheStats {
        self.stats
    }

    pub fn cache_state(&self) -> CacheState {
        CacheState {
            network_num: self.network_num,
            hash_to_short_ids_len: self.hash_to_short_ids.len(),
            short_id_to_hash_len: self.short_id_to_hash.len(),
            hash_to_contents_len: self.hash_to_contents.len(),
            short_ids_seen_in_block_len: self.seen_in_block.len(),
            total_contents_size: self.total_contents_size,
        }
    }

    /// Drop every index and disarm the expiration alarm.
    pub fn clear(&mut self) {
        self.hash_to_short_ids.clear();
        self.short_id_to_hash.clear();
        self.hash_to_contents.clear();
        self.expiration_queue.clear();
        self.seen_in_block.clear();
        self.total_contents_size = 0;
        if let Some(timer) = self.expiration_timer.take() {
            self.scheduler.unregister(timer);
        }
    }

    fn remove_contents(&mut self, hash: &Sha256Hash) -> bool {
        match self.hash_to_contents.remove(hash) {
            Some(contents) => {
                self.total_contents_size = self.total_contents_size.saturating_sub(contents.len());
                true
            }
            None => false,
        }
    }

    fn memory_limit_clean_up(&mut self) {
        let limit = self.config.memory_limit_bytes;
        if self.total_contents_size <= limit {
            return;
        }

        debug!(
            limit,
            current = self.total_contents_size,
            "Transaction cache exceeds memory limit"
        );

        let mut removed = 0u64;
        while self.total_contents_size > limit {
            match self.expiration_queue.remove_oldest() {
                Some(short_id) => {
                    self.remove_by_short_id(short_id, false);
                    removed += 1;
                }
                None => break,
            }
        }

        if self.total_contents_size > limit {
            let state = self.cache_state();
            warn!(
                hash_to_contents = state.hash_to_contents_len,
                total_contents_size = state.total_contents_size,
                "Failed to decrease memory consumption due to lack of short ids, clearing the cache"
            );
            removed += self.hash_to_contents.len() as u64;
            self.clear();
            self.stats.full_clears += 1;
            global_metrics().tx_cache_full_clear();
        }

        self.stats.tx_removed_by_memory_limit += removed;
        global_metrics().tx_removed_by_memory_limit(removed);
        debug!(
            removed,
            size_after = self.total_contents_size,
            "Removed oldest transactions from cache"
        );
    }
}

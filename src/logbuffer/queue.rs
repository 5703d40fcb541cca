//! Per-entity log queue with block-window density caps and lookback eviction

use super::LogEvent;

use ethers::types::{H256, U256};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Natural key of a log event within one entity's scope
pub(crate) type LogKey = (i64, H256, i64);

/// The block-rate-aligned window containing `block`
pub(crate) fn block_window(block: i64, block_rate: u32) -> (i64, i64) {
    let size = i64::from(block_rate.max(1));
    let start = block - block.rem_euclid(size);
    (start, start + size - 1)
}

/// Ordered-by-block queue of one entity's pending logs.
///
/// Bounded two ways: each block-rate-aligned window retains at most
/// `block_rate` logs, and blocks older than the lookback threshold are
/// evicted. The `seen` set covers stored and already-dequeued logs so a
/// re-enqueued log is never delivered twice; it is pruned together with the
/// blocks it refers to.
pub struct EntityQueue {
    entity: U256,
    /// Block number -> logs at that block, ordered by log index
    logs: BTreeMap<i64, Vec<LogEvent>>,
    seen: HashSet<LogKey>,
}

impl EntityQueue {
    pub fn new(entity: U256) -> Self {
        Self {
            entity,
            logs: BTreeMap::new(),
            seen: HashSet::new(),
        }
    }

    /// Insert new logs, skipping duplicates and dropping what the window
    /// caps or the lookback threshold exclude. Returns (added, dropped);
    /// their sum equals the number of non-duplicate inputs.
    pub fn enqueue(&mut self, block_threshold: i64, block_rate: u32, logs: &[LogEvent]) -> (usize, usize) {
        let mut added = 0;
        let mut dropped = 0;

        for log in logs {
            let key = log.key();
            if self.seen.contains(&key) {
                continue;
            }

            if log.block_number < block_threshold {
                debug!(
                    "Dropping log below lookback threshold {} for entity {}: block {}",
                    block_threshold, self.entity, log.block_number
                );
                dropped += 1;
                continue;
            }

            let (start, end) = block_window(log.block_number, block_rate);
            if self.size_of_range(start, end) >= block_rate.max(1) as usize {
                debug!(
                    "Dropping log for entity {}: window [{}, {}] is full",
                    self.entity, start, end
                );
                dropped += 1;
                continue;
            }

            let entry = self.logs.entry(log.block_number).or_default();
            let position = entry.partition_point(|stored| stored.log_index <= log.log_index);
            entry.insert(position, log.clone());
            self.seen.insert(key);
            added += 1;
        }

        if added > 0 {
            // Keep memory bounded even if the caller never cleans
            self.evict_older_than(block_threshold);
        }

        (added, dropped)
    }

    /// Remove and return up to `limit` of the oldest logs within
    /// [start, end], block then log-index ascending.
    pub fn dequeue(&mut self, start: i64, end: i64, limit: usize) -> Vec<LogEvent> {
        let mut out = Vec::new();
        let mut emptied = Vec::new();

        for (&block, entry) in self.logs.range_mut(start..=end) {
            let take = (limit - out.len()).min(entry.len());
            out.extend(entry.drain(..take));
            if entry.is_empty() {
                emptied.push(block);
            }
            if out.len() == limit {
                break;
            }
        }

        for block in emptied {
            self.logs.remove(&block);
        }

        out
    }

    /// Number of stored logs with block numbers in [start, end]
    pub fn size_of_range(&self, start: i64, end: i64) -> usize {
        self.logs.range(start..=end).map(|(_, entry)| entry.len()).sum()
    }

    /// Evict every log strictly older than `block_threshold`, pruning the
    /// dedup set with them. Returns the eviction count.
    pub fn evict_older_than(&mut self, block_threshold: i64) -> usize {
        let stale: Vec<i64> = self.logs.range(..block_threshold).map(|(&block, _)| block).collect();

        let mut evicted = 0;
        for block in stale {
            if let Some(entry) = self.logs.remove(&block) {
                evicted += entry.len();
            }
        }

        if evicted > 0 {
            debug!("Evicted {} aged-out logs for entity {}", evicted, self.entity);
        }

        self.seen.retain(|(block, _, _)| *block >= block_threshold);
        evicted
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

//! Log event buffer - bounded, deduplicating, fair
//!
//! Absorbs bursts of blockchain log events keyed by entity identifier,
//! retains only a bounded recent window, and serves size-capped dequeue
//! batches apportioned fairly across entities. Overload is expressed
//! through the added/dropped/remaining counters, never as an error.

pub mod queue;

use crate::config::BufferConfig;
use crate::metrics;
use queue::{block_window, EntityQueue, LogKey};

use dashmap::DashMap;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A single decoded log event, immutable once stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub block_number: i64,
    pub tx_hash: H256,
    pub log_index: i64,
}

impl LogEvent {
    pub(crate) fn key(&self) -> LogKey {
        (self.block_number, self.tx_hash, self.log_index)
    }
}

/// A dequeued log with its entity and a synthetic identity usable for
/// cross-batch comparisons
#[derive(Debug, Clone)]
pub struct BufferedLog {
    pub id: H256,
    pub entity: U256,
    pub log: LogEvent,
}

/// Selector admitting every entity
pub fn default_entity_selector(_entity: &U256) -> bool {
    true
}

/// Rotation state for fair dequeue iteration
struct DequeueOrder {
    /// Entity ids in sorted order
    ids: Vec<U256>,
    /// Index to start the next dequeue pass from
    cursor: usize,
}

/// Concurrency-safe buffer of pending log events per entity.
///
/// The entity map is only locked for lookup/create; all log manipulation
/// happens under the per-entity mutex, so distinct entities never block
/// each other.
pub struct LogBuffer {
    config: BufferConfig,
    queues: DashMap<U256, Arc<Mutex<EntityQueue>>>,
    order: Mutex<DequeueOrder>,
    /// Highest block number observed across all enqueues
    last_block_seen: AtomicI64,
}

impl LogBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
            order: Mutex::new(DequeueOrder {
                ids: Vec::new(),
                cursor: 0,
            }),
            last_block_seen: AtomicI64::new(0),
        }
    }

    /// Store new logs for an entity. Exact duplicates (including logs
    /// already dequeued and not yet aged out) are discarded uncounted;
    /// genuinely new logs are either added or dropped, so
    /// `added + dropped` equals the number of non-duplicate inputs.
    pub fn enqueue(&self, entity: U256, logs: &[LogEvent]) -> (usize, usize) {
        if logs.is_empty() {
            return (0, 0);
        }

        if let Some(latest) = logs.iter().map(|log| log.block_number).max() {
            self.last_block_seen.fetch_max(latest, Ordering::SeqCst);
        }
        let threshold = self.block_threshold();

        let queue_ref = self.queue_for(entity);
        let mut queue = lock(&queue_ref);
        let (added, dropped) = queue.enqueue(threshold, self.config.block_rate, logs);

        metrics::record_logs_enqueued(added);
        metrics::record_logs_dropped(dropped);
        (added, dropped)
    }

    /// Remove and return up to `max_results` logs eligible within the
    /// block-rate-aligned window containing `up_to_block`, taking at most
    /// `per_entity_limit` from any single entity (0 falls back to the
    /// configured default). Entities are visited from a cursor that rotates
    /// across calls so none is permanently starved. `remaining` counts
    /// eligible logs still queued across selected entities.
    pub fn dequeue<F>(
        &self,
        up_to_block: i64,
        block_rate: u32,
        per_entity_limit: u32,
        max_results: usize,
        selector: F,
    ) -> (Vec<BufferedLog>, usize)
    where
        F: Fn(&U256) -> bool,
    {
        let (start, end) = block_window(up_to_block, block_rate);
        let limit = if per_entity_limit == 0 {
            self.config.default_entity_limit as usize
        } else {
            per_entity_limit as usize
        };

        let (ids, cursor) = {
            let order = lock(&self.order);
            (order.ids.clone(), order.cursor)
        };
        if ids.is_empty() {
            return (Vec::new(), 0);
        }

        let mut results = Vec::new();
        let mut remaining = 0;
        let mut next_cursor = cursor;

        let n = ids.len();
        for i in 0..n {
            let idx = (cursor + i) % n;
            let entity = ids[idx];
            if !selector(&entity) {
                continue;
            }
            let Some(queue_ref) = self.queues.get(&entity).map(|q| Arc::clone(q.value())) else {
                continue;
            };
            let mut queue = lock(&queue_ref);

            let eligible = queue.size_of_range(start, end);
            if eligible == 0 {
                continue;
            }
            if results.len() >= max_results {
                remaining += eligible;
                continue;
            }

            let take = limit.min(max_results - results.len());
            let logs = queue.dequeue(start, end, take);
            remaining += eligible - logs.len();
            if !logs.is_empty() {
                next_cursor = (idx + 1) % n;
            }
            for log in logs {
                results.push(BufferedLog {
                    id: buffered_log_id(&entity, &log),
                    entity,
                    log,
                });
            }
        }

        lock(&self.order).cursor = next_cursor;

        metrics::record_logs_dequeued(results.len());
        (results, remaining)
    }

    /// Evict logs from every entity strictly older than
    /// `up_to_block - lookback`; returns the eviction count. Independent of
    /// dequeue, for when the consumer is slow or an entity goes idle.
    pub fn clean(&self, up_to_block: i64) -> usize {
        let threshold = up_to_block - i64::from(self.config.lookback);

        let queues: Vec<Arc<Mutex<EntityQueue>>> =
            self.queues.iter().map(|entry| entry.value().clone()).collect();

        let mut evicted = 0;
        for queue_ref in queues {
            evicted += lock(&queue_ref).evict_older_than(threshold);
        }
        evicted
    }

    /// Per-entity variant of [`clean`](Self::clean)
    pub fn clean_entity(&self, entity: U256, up_to_block: i64) -> usize {
        let threshold = up_to_block - i64::from(self.config.lookback);
        let Some(queue_ref) = self.queues.get(&entity).map(|q| Arc::clone(q.value())) else {
            return 0;
        };
        let evicted = lock(&queue_ref).evict_older_than(threshold);
        evicted
    }

    fn block_threshold(&self) -> i64 {
        let threshold =
            self.last_block_seen.load(Ordering::SeqCst) - i64::from(self.config.lookback);
        if threshold <= 0 {
            1
        } else {
            threshold
        }
    }

    /// Lazily create the entity's queue; the map lock is held only for
    /// this lookup/create step.
    fn queue_for(&self, entity: U256) -> Arc<Mutex<EntityQueue>> {
        if let Some(queue) = self.queues.get(&entity) {
            return Arc::clone(queue.value());
        }

        let queue = self
            .queues
            .entry(entity)
            .or_insert_with(|| Arc::new(Mutex::new(EntityQueue::new(entity))))
            .clone();

        let mut order = lock(&self.order);
        if let Err(position) = order.ids.binary_search(&entity) {
            order.ids.insert(position, entity);
        }

        queue
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn buffered_log_id(entity: &U256, log: &LogEvent) -> H256 {
    let mut entity_bytes = [0u8; 32];
    entity.to_big_endian(&mut entity_bytes);

    let mut hasher = Keccak256::new();
    hasher.update(entity_bytes);
    hasher.update(log.block_number.to_be_bytes());
    hasher.update(log.tx_hash.as_bytes());
    hasher.update(log.log_index.to_be_bytes());
    let digest = hasher.finalize();
    H256::from_slice(digest.as_slice())
}

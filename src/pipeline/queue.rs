/**
 * ============================================================================
 * DURABLE QUEUE MODULE
 * ============================================================================
 *
 * PURPOSE: Keep events that are not yet delivered, across restarts
 *
 * STORAGE STRUCTURE:
 * {queue storage key} -> JSON array of events, oldest first
 *
 * QUEUE BEHAVIOR:
 * - FIFO (First In First Out) ordering
 * - Size-limited (oldest event dropped when full, never the newest)
 * - Snapshot writes throttled on enqueue, immediate on dequeue
 * - Invalid records skipped on hydration, malformed snapshot = empty queue
 * - Quota exceeded: drop the oldest half, retry the write once
 *
 * ============================================================================
 */

use crate::config::QueueConfig;
use crate::error::{Result, StorageError, TrackerError};
use crate::storage::Storage;
use crate::types::TrackingEvent;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct QueueEntry {
    seq: u64,
    event: TrackingEvent,
}

/**
 * A peeked batch, remembering exactly which entries it holds
 * Pass it back to acknowledge() once the transport accepted it
 */
#[derive(Debug, Clone)]
pub struct QueuedBatch {
    pub events: Vec<TrackingEvent>,
    first_seq: u64,
    last_seq: u64,
}

impl QueuedBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct DurableQueue {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    last_persist: Option<Instant>,
    dirty: bool,
    dropped: u64,
}

impl DurableQueue {
    /**
     * Create queue and hydrate it from the last snapshot
     * Never fails: unreadable state means an empty queue
     */
    pub fn new(config: QueueConfig, storage: Arc<dyn Storage>) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
            next_seq: 0,
            config,
            storage,
            last_persist: None,
            dirty: false,
            dropped: 0,
        };
        queue.hydrate();
        queue
    }

    fn hydrate(&mut self) {
        let raw = match self.storage.get(&self.config.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                log::info!("No existing queue snapshot, starting with empty queue");
                return;
            }
            Err(e) => {
                log::warn!("Failed to read queue snapshot, starting empty: {}", e);
                return;
            }
        };

        let records = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(records)) => records,
            Ok(_) | Err(_) => {
                log::warn!("Queue snapshot is malformed, starting with empty queue");
                return;
            }
        };

        let total = records.len();
        let mut events: Vec<TrackingEvent> = records
            .iter()
            .filter_map(TrackingEvent::from_snapshot_value)
            .collect();

        if events.len() < total {
            log::warn!(
                "Discarded {} invalid records from queue snapshot",
                total - events.len()
            );
        }
        if events.len() > self.config.max_size {
            let excess = events.len() - self.config.max_size;
            events.drain(..excess);
            self.dropped += excess as u64;
        }

        for event in events {
            self.push_entry(event);
        }
        log::info!("Hydrated queue with {} events", self.entries.len());
    }

    fn push_entry(&mut self, event: TrackingEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(QueueEntry { seq, event });
    }

    /**
     * Append an event, evicting the oldest one when at capacity
     * The event is kept in memory even when persisting fails
     */
    pub fn enqueue(&mut self, event: TrackingEvent) -> Result<()> {
        if self.entries.len() >= self.config.max_size {
            self.entries.pop_front();
            self.dropped += 1;
            log::warn!(
                "Queue at max capacity ({}), evicted oldest event",
                self.config.max_size
            );
        }
        self.push_entry(event);
        self.dirty = true;

        let due = self
            .last_persist
            .map(|at| at.elapsed() >= self.config.persist_interval())
            .unwrap_or(true);
        if due {
            self.persist()?;
        }
        Ok(())
    }

    /// Non-destructive view of up to `n` oldest events.
    pub fn get_batch(&self, n: usize) -> Vec<TrackingEvent> {
        self.entries.iter().take(n).map(|e| e.event.clone()).collect()
    }

    /// Like get_batch, but remembers which entries were handed out.
    pub fn peek_batch(&self, n: usize) -> Option<QueuedBatch> {
        let taken: Vec<&QueueEntry> = self.entries.iter().take(n).collect();
        let (first, last) = (taken.first()?.seq, taken.last()?.seq);
        Some(QueuedBatch {
            events: taken.into_iter().map(|e| e.event.clone()).collect(),
            first_seq: first,
            last_seq: last,
        })
    }

    /**
     * Remove the `n` oldest events
     * Only call once a batch holding exactly these events was accepted
     */
    pub fn dequeue(&mut self, n: usize) -> Result<usize> {
        let removed = n.min(self.entries.len());
        self.entries.drain(..removed);
        self.dirty = true;
        self.persist()?;
        log::debug!("Dequeued {} events ({} remaining)", removed, self.entries.len());
        Ok(removed)
    }

    /**
     * Remove the entries of an accepted batch
     * Entries evicted while the batch was in flight are simply gone already
     */
    pub fn acknowledge(&mut self, batch: &QueuedBatch) -> Result<usize> {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.seq < batch.first_seq || e.seq > batch.last_seq);
        let removed = before - self.entries.len();
        self.dirty = true;
        self.persist()?;
        log::debug!(
            "Acknowledged batch of {} ({} removed, {} remaining)",
            batch.len(),
            removed,
            self.entries.len()
        );
        Ok(removed)
    }

    /**
     * Write pending changes to storage
     * On quota errors, halves the queue and retries exactly once
     */
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        match self.write_snapshot() {
            Ok(()) => {}
            Err(TrackerError::Storage(e)) if e.is_quota_exceeded() => {
                let drop_count = self.entries.len() / 2;
                log::warn!(
                    "Storage quota exceeded, dropping {} oldest events and retrying: {}",
                    drop_count,
                    e
                );
                self.entries.drain(..drop_count);
                self.dropped += drop_count as u64;

                if let Err(retry_err) = self.write_snapshot() {
                    log::error!("Queue snapshot retry failed: {}", retry_err);
                    self.last_persist = Some(Instant::now());
                    return Err(retry_err);
                }
            }
            Err(e) => {
                log::error!("Failed to write queue snapshot: {}", e);
                self.last_persist = Some(Instant::now());
                return Err(e);
            }
        }

        self.dirty = false;
        self.last_persist = Some(Instant::now());
        Ok(())
    }

    fn write_snapshot(&self) -> Result<()> {
        let events: Vec<&TrackingEvent> = self.entries.iter().map(|e| &e.event).collect();
        let json = serde_json::to_string(&events)?;
        self.storage
            .set(&self.config.storage_key, &json)
            .map_err(TrackerError::from)
    }

    pub fn clear(&mut self) -> std::result::Result<(), StorageError> {
        log::info!("Clearing queue ({} events)", self.entries.len());
        self.entries.clear();
        self.dirty = false;
        self.storage.remove(&self.config.storage_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether changes are waiting for the next snapshot write.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Events lost to overflow or quota recovery.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }
}

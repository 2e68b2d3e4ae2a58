/**
 * ============================================================================
 * TELEMETRY RELAY
 * ============================================================================
 *
 * PURPOSE: Client-side delivery core for behavioral tracking events
 *
 * ARCHITECTURE:
 * - config: Configuration schema, validation and persistence
 * - error: Error taxonomy
 * - storage: Key/value slot storage (file and in-memory backends)
 * - types: Event, batch and status models
 * - pipeline: Rate limiting, aggregation, durable queue, dispatch, facade
 * - connection: Token lifecycle, socket transport, connection manager
 *
 * ============================================================================
 */

pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use config::{TrackerConfig, load_config, save_config};
pub use connection::{ConnectionManager, TokenLifecycle, TokenRegistry, WsTransport};
pub use error::{Result, StorageError, TrackerError};
pub use pipeline::{
    BatchTransport, ConsentPredicate, Dispatcher, DurableQueue, HttpBatchTransport, TrackOutcome,
    Tracker,
};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use types::{BatchPayload, TrackingEvent, TransmissionStatus};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

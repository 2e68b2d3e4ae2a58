/**
 * ============================================================================
 * PIPELINE MODULE
 * ============================================================================
 *
 * PURPOSE: Path of an event from ingestion to an acknowledged batch
 *
 * ARCHITECTURE:
 * - rate_limiter: Per-type minimum interval gate
 * - aggregator: Fingerprint buckets, merged per flush window
 * - queue: Size-limited FIFO mirrored to storage
 * - dispatcher: Periodic batch delivery through a BatchTransport
 * - tracker: Facade wiring consent -> limiter -> aggregator -> queue
 *
 * ============================================================================
 */

pub mod aggregator;
pub mod dispatcher;
pub mod queue;
pub mod rate_limiter;
pub mod tracker;

pub use aggregator::Aggregator;
pub use dispatcher::{BatchTransport, Dispatcher, HttpBatchTransport};
pub use queue::{DurableQueue, QueuedBatch};
pub use rate_limiter::RateLimiter;
pub use tracker::{ConsentPredicate, TrackOutcome, Tracker};

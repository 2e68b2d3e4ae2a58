/**
 * ============================================================================
 * TRACKER MODULE
 * ============================================================================
 *
 * PURPOSE: Single inbound surface for tracking events
 *
 * EVENT PATH:
 * track(event)
 *   -> consent predicate (host-supplied, checked on every call)
 *   -> RateLimiter::should_allow(event_type)
 *   -> Aggregator::add (timer flush every window)
 *   -> DurableQueue::enqueue
 *   -> Dispatcher (periodic, through a BatchTransport)
 *
 * LIFECYCLE:
 * - new(): validate config, hydrate the queue
 * - start(): spawn the flush timer and the dispatcher
 * - update_config(): hot-apply runtime flags and rate rules
 * - destroy(): flush, stop timers, persist; idempotent
 *
 * ============================================================================
 */

use crate::config::TrackerConfig;
use crate::connection::manager::ConnectionManager;
use crate::connection::registry::TokenRegistry;
use crate::error::{Result, TrackerError};
use crate::lock;
use crate::pipeline::aggregator::Aggregator;
use crate::pipeline::dispatcher::{BatchTransport, Dispatcher};
use crate::pipeline::queue::DurableQueue;
use crate::pipeline::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::storage::Storage;
use crate::types::{SyncStatistics, TrackingEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Host-supplied consent check, consulted on every `track` call.
pub type ConsentPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Why `track` did not take an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Accepted,
    Disabled,
    NoConsent,
    RateLimited,
}

pub struct Tracker {
    config: Mutex<TrackerConfig>,
    consent: ConsentPredicate,
    limiter: Mutex<RateLimiter>,
    aggregator: Arc<Mutex<Aggregator>>,
    queue: Arc<Mutex<DurableQueue>>,
    dispatcher: Arc<Dispatcher>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// Move aggregator output into the queue; returns how many went in.
fn enqueue_all(queue: &Mutex<DurableQueue>, events: Vec<TrackingEvent>) -> Result<usize> {
    let count = events.len();
    let mut queue = lock(queue);
    let mut first_error = None;
    for event in events {
        // Events stay queued in memory even when the snapshot write fails
        if let Err(e) = queue.enqueue(event) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(count),
    }
}

impl Tracker {
    /**
     * Build the pipeline over an existing transport
     * Fails fast on invalid configuration
     */
    pub fn new(
        config: TrackerConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn BatchTransport>,
        consent: ConsentPredicate,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(Mutex::new(DurableQueue::new(config.queue.clone(), storage)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            transport,
            config.dispatch.clone(),
        ));

        log::info!(
            "[TRACKER] Created (enabled: {}, aggregation: {}, {} rate rules)",
            config.enabled,
            config.aggregation.enabled,
            config.rate_limits.len()
        );

        Ok(Self {
            limiter: Mutex::new(RateLimiter::from_millis(&config.rate_limits)),
            aggregator: Arc::new(Mutex::new(Aggregator::new(config.aggregation.clone()))),
            queue,
            dispatcher,
            consent,
            config: Mutex::new(config),
            flush_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /**
     * Socket-backed tracker: tokens from the registry, batches over the
     * connection manager
     * The manager is returned so the host can drive focus and activity
     */
    pub fn over_socket(
        config: TrackerConfig,
        storage: Arc<dyn Storage>,
        registry: &TokenRegistry,
        consent: ConsentPredicate,
    ) -> Result<(Self, ConnectionManager)> {
        let manager = ConnectionManager::from_config(&config, registry, Arc::clone(&storage))?;
        let tracker = Self::new(config, storage, Arc::new(manager.clone()), consent)?;
        Ok((tracker, manager))
    }

    /**
     * Spawn the aggregation flush timer and the dispatcher
     * Must be called from within a tokio runtime
     */
    pub fn start(&self) {
        if self.is_destroyed() {
            log::warn!("[TRACKER] start() after destroy() ignored");
            return;
        }

        let mut flush_task = lock(&self.flush_task);
        if flush_task.is_none() {
            let aggregator = Arc::clone(&self.aggregator);
            let queue = Arc::clone(&self.queue);
            let window = lock(&self.config).aggregation.window();
            *flush_task = Some(tokio::spawn(async move {
                let mut ticker = interval(window);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let ready = lock(&aggregator).flush();
                    if ready.is_empty() {
                        continue;
                    }
                    if let Err(e) = enqueue_all(&queue, ready) {
                        log::warn!("[TRACKER] Flushed events queued, snapshot failed: {}", e);
                    }
                }
            }));
        }
        drop(flush_task);

        self.dispatcher.start();
        log::info!("[TRACKER] Started");
    }

    /**
     * Offer one event to the pipeline
     * Drops it silently (with the reason) when disabled, without consent,
     * or inside its type's rate interval
     */
    pub fn track(&self, event: TrackingEvent) -> Result<TrackOutcome> {
        if self.is_destroyed() || !lock(&self.config).enabled {
            return Ok(TrackOutcome::Disabled);
        }
        if !(self.consent)() {
            log::debug!("[TRACKER] No consent, dropping {}", event.event_type);
            return Ok(TrackOutcome::NoConsent);
        }
        if !lock(&self.limiter).should_allow(&event.event_type) {
            return Ok(TrackOutcome::RateLimited);
        }

        let ready = lock(&self.aggregator).add(event);
        if !ready.is_empty() {
            enqueue_all(&self.queue, ready)?;
        }
        Ok(TrackOutcome::Accepted)
    }

    /// Close the aggregation window now; returns events moved to the queue.
    pub fn flush(&self) -> Result<usize> {
        let ready = lock(&self.aggregator).flush();
        enqueue_all(&self.queue, ready)
    }

    /// Flush, then try to send one batch right away.
    pub async fn dispatch_now(&self) -> Result<usize> {
        self.flush()?;
        self.dispatcher.dispatch_once().await
    }

    /**
     * Apply a new configuration at runtime
     * Hot fields: enabled, rate_limits, aggregation.enabled, dispatch batch
     * size/timeout. Anything touching endpoints, storage or timers needs a
     * new tracker and is rejected with Config
     */
    pub fn update_config(&self, new_config: TrackerConfig) -> Result<()> {
        new_config.validate()?;

        let mut config = lock(&self.config);
        if config.needs_restart(&new_config) {
            return Err(TrackerError::Config(
                "changed settings require a tracker restart".to_string(),
            ));
        }

        if config.rate_limits != new_config.rate_limits {
            lock(&self.limiter).replace_rules(&new_config.rate_limits);
        }
        if config.aggregation.enabled != new_config.aggregation.enabled {
            let released = lock(&self.aggregator).set_enabled(new_config.aggregation.enabled);
            if !released.is_empty() {
                enqueue_all(&self.queue, released)?;
            }
        }
        if config.enabled != new_config.enabled {
            log::info!("[TRACKER] Tracking {}", if new_config.enabled { "enabled" } else { "disabled" });
        }

        *config = new_config;
        log::info!("[TRACKER] Configuration updated");
        Ok(())
    }

    pub fn config(&self) -> TrackerConfig {
        lock(&self.config).clone()
    }

    pub fn pending_events(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn statistics(&self) -> SyncStatistics {
        self.dispatcher.statistics()
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        lock(&self.limiter).stats()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /**
     * Stop timers, move buffered events to the queue and persist it
     * Later calls do nothing
     */
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[TRACKER] Destroying");

        if let Some(task) = lock(&self.flush_task).take() {
            task.abort();
        }
        let buffered = lock(&self.aggregator).flush();
        if let Err(e) = enqueue_all(&self.queue, buffered) {
            log::warn!("[TRACKER] Final flush could not be persisted: {}", e);
        }
        self.dispatcher.stop();
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUEUE_STORAGE_KEY;
    use crate::pipeline::dispatcher::tests::RecordingTransport;
    use crate::storage::MemoryStorage;
    use crate::types::event_types;
    use std::time::Duration;

    fn always() -> ConsentPredicate {
        Arc::new(|| true)
    }

    fn tracker_with(
        config: TrackerConfig,
        consent: ConsentPredicate,
    ) -> (Tracker, Arc<MemoryStorage>, Arc<RecordingTransport>) {
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(RecordingTransport::default());
        let tracker = Tracker::new(config, storage.clone(), transport.clone(), consent).unwrap();
        (tracker, storage, transport)
    }

    fn scroll(url: &str) -> TrackingEvent {
        TrackingEvent::new("v1", "s1", event_types::SCROLL).with_metadata("url", url)
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_fails_fast() {
        let mut config = TrackerConfig::default();
        config.socket_url = "not-a-url".to_string();
        let result = Tracker::new(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(RecordingTransport::default()),
            always(),
        );
        assert!(matches!(result, Err(TrackerError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_is_checked_on_every_call() {
        let granted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&granted);
        let (tracker, _, _) = tracker_with(
            TrackerConfig::default(),
            Arc::new(move || flag.load(Ordering::SeqCst)),
        );

        let click = TrackingEvent::new("v1", "s1", event_types::CLICK);
        assert_eq!(tracker.track(click.clone()).unwrap(), TrackOutcome::NoConsent);

        granted.store(true, Ordering::SeqCst);
        assert_eq!(tracker.track(click).unwrap(), TrackOutcome::Accepted);
        tracker.flush().unwrap();
        assert_eq!(tracker.pending_events(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_events_never_reach_the_queue() {
        let (tracker, _, _) = tracker_with(TrackerConfig::default(), always());

        assert_eq!(tracker.track(scroll("/a")).unwrap(), TrackOutcome::Accepted);
        assert_eq!(tracker.track(scroll("/a")).unwrap(), TrackOutcome::RateLimited);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(tracker.track(scroll("/a")).unwrap(), TrackOutcome::Accepted);

        assert_eq!(tracker.flush().unwrap(), 1);
        assert_eq!(tracker.pending_events(), 1);
        assert_eq!(tracker.rate_limiter_stats().throttled.get("SCROLL"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush_merges_scroll_burst() {
        let mut config = TrackerConfig::default();
        config.rate_limits.clear();
        let (tracker, _, transport) = tracker_with(config, always());
        tracker.start();

        for _ in 0..5 {
            tracker.track(scroll("/article")).unwrap();
        }
        for _ in 0..5 {
            tracker
                .track(TrackingEvent::new("v1", "s1", event_types::FORM_SUBMIT))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(tracker.pending_events(), 6);

        // Dispatcher tick at 5 s sends the batch
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.pending_events(), 0);
        let sent = lock(&transport.sent);
        assert_eq!(sent.len(), 1);
        let merged = sent[0]
            .events
            .iter()
            .find(|e| e.event_type == event_types::SCROLL)
            .unwrap();
        assert_eq!(merged.aggregated_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_hot_fields() {
        let (tracker, _, _) = tracker_with(TrackerConfig::default(), always());

        tracker.track(scroll("/a")).unwrap();
        let mut next = tracker.config();
        next.aggregation.enabled = false;
        next.rate_limits.clear();
        tracker.update_config(next.clone()).unwrap();

        // Disabling aggregation released the open bucket
        assert_eq!(tracker.pending_events(), 1);
        assert_eq!(tracker.track(scroll("/a")).unwrap(), TrackOutcome::Accepted);
        assert_eq!(tracker.track(scroll("/a")).unwrap(), TrackOutcome::Accepted);
        assert_eq!(tracker.pending_events(), 3);

        next.enabled = false;
        tracker.update_config(next.clone()).unwrap();
        assert_eq!(tracker.track(scroll("/a")).unwrap(), TrackOutcome::Disabled);

        next.socket_url = "wss://elsewhere.example/ws".to_string();
        assert!(matches!(
            tracker.update_config(next),
            Err(TrackerError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_flushes_and_persists_once() {
        let (tracker, storage, _) = tracker_with(TrackerConfig::default(), always());
        tracker.start();

        tracker.track(scroll("/a")).unwrap();
        tracker
            .track(TrackingEvent::new("v1", "s1", event_types::CLICK))
            .unwrap();

        tracker.destroy();
        tracker.destroy();
        assert!(tracker.is_destroyed());
        assert_eq!(tracker.pending_events(), 2);

        let snapshot: serde_json::Value =
            serde_json::from_str(&storage.get(QUEUE_STORAGE_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(snapshot.as_array().unwrap().len(), 2);

        assert_eq!(
            tracker.track(TrackingEvent::new("v1", "s1", event_types::CLICK)).unwrap(),
            TrackOutcome::Disabled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_now_sends_buffered_events() {
        let (tracker, _, transport) = tracker_with(TrackerConfig::default(), always());
        tracker.track(scroll("/a")).unwrap();
        assert_eq!(tracker.dispatch_now().await.unwrap(), 1);
        assert_eq!(lock(&transport.sent).len(), 1);
        assert_eq!(tracker.statistics().total_events_sent, 1);
    }
}

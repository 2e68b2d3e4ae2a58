/**
 * ============================================================================
 * DISPATCHER MODULE
 * ============================================================================
 *
 * PURPOSE: Move queued events to the server in acknowledged batches
 *
 * DISPATCH CYCLE (every interval, default 5 s):
 * 1. Peek up to batch_size oldest events (queue untouched)
 * 2. Build {visitorId, sessionId, events} from the oldest event's context
 * 3. Send through the BatchTransport, bounded by send_timeout
 * 4. Success: acknowledge exactly the peeked entries
 *    Failure: keep them, retry on the next tick
 *
 * TRANSPORTS:
 * - ConnectionManager: socket "track_batch" request, acked by the server
 * - HttpBatchTransport: POST {endpoint}/events/batch with a bearer token
 *
 * ============================================================================
 */

use crate::config::{DispatchConfig, TrackerConfig};
use crate::connection::auth::TokenLifecycle;
use crate::error::{Result, TrackerError};
use crate::lock;
use crate::pipeline::queue::DurableQueue;
use crate::types::{BatchPayload, SyncStatistics, TransmissionStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

/// Where batches go.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Deliver one batch; Ok only once the server accepted it.
    async fn send(&self, payload: &BatchPayload) -> Result<()>;

    fn status(&self) -> TransmissionStatus {
        TransmissionStatus::Connected
    }
}

/**
 * Batch delivery over plain HTTP
 * Used when no socket is available (or wanted)
 */
pub struct HttpBatchTransport {
    url: String,
    client: reqwest::Client,
    tokens: Arc<TokenLifecycle>,
}

impl HttpBatchTransport {
    pub fn new(config: &TrackerConfig, tokens: Arc<TokenLifecycle>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.dispatch.send_timeout())
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: format!("{}/events/batch", config.api_url.trim_end_matches('/')),
            client,
            tokens,
        })
    }
}

#[async_trait]
impl BatchTransport for HttpBatchTransport {
    async fn send(&self, payload: &BatchPayload) -> Result<()> {
        let token = self
            .tokens
            .get_valid_access_token()
            .await
            .ok_or_else(|| TrackerError::Auth("no valid access token".to_string()))?;

        log::debug!("[DISPATCH] POST {} ({} events)", self.url, payload.len());
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Next attempt must not reuse the rejected credential
            self.tokens.invalidate();
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TrackerError::Http {
                url: self.url.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/**
 * Periodic batch sender over a shared queue
 */
pub struct Dispatcher {
    queue: Arc<Mutex<DurableQueue>>,
    transport: Arc<dyn BatchTransport>,
    config: DispatchConfig,
    statistics: Mutex<SyncStatistics>,
    sending: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<Mutex<DurableQueue>>,
        transport: Arc<dyn BatchTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            transport,
            config,
            statistics: Mutex::new(SyncStatistics::default()),
            sending: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /**
     * Send one batch if the queue holds any
     * Returns the number of events acknowledged; a send already in flight
     * makes this a no-op
     */
    pub async fn dispatch_once(&self) -> Result<usize> {
        let Ok(_sending) = self.sending.try_lock() else {
            log::debug!("[DISPATCH] Send already in flight, skipping");
            return Ok(0);
        };

        let Some(batch) = lock(&self.queue).peek_batch(self.config.batch_size) else {
            return Ok(0);
        };
        let Some(payload) = BatchPayload::from_events(batch.events.clone()) else {
            return Ok(0);
        };

        log::info!("[DISPATCH] Sending batch of {} events", payload.len());
        let wait = self.config.send_timeout();
        let outcome = match timeout(wait, self.transport.send(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::Timeout(wait)),
        };

        match outcome {
            Ok(()) => {
                let acknowledged = lock(&self.queue).acknowledge(&batch);
                self.record_success(batch.len());
                if let Err(e) = acknowledged {
                    // Entries are gone from memory; only the snapshot lags
                    log::warn!("[DISPATCH] Batch sent but snapshot write failed: {}", e);
                }
                log::info!("[DISPATCH] Batch of {} events acknowledged", batch.len());
                Ok(batch.len())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    fn record_success(&self, events_sent: usize) {
        let mut stats = lock(&self.statistics);
        stats.total_events_sent += events_sent as u64;
        stats.total_batches_sent += 1;
        stats.last_sync_time = Some(Utc::now());
        stats.consecutive_failures = 0;
        stats.last_error = None;
    }

    fn record_error(&self, error: &TrackerError) {
        let mut stats = lock(&self.statistics);
        stats.consecutive_failures += 1;
        stats.last_error = Some(error.to_string());
        log::warn!(
            "[DISPATCH] Batch send failed ({} in a row), will retry next tick: {}",
            stats.consecutive_failures,
            error
        );
    }

    /**
     * Spawn the periodic dispatch task
     * Calling it while already running does nothing
     */
    pub fn start(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            log::debug!("[DISPATCH] Already running");
            return;
        }

        let dispatcher = Arc::clone(self);
        let period = self.config.interval();
        log::info!("[DISPATCH] Starting, interval {:?}", period);
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = dispatcher.dispatch_once().await;
            }
        }));
    }

    /**
     * Stop the periodic task and write the queue snapshot
     * Safe to call any number of times
     */
    pub fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
            log::info!("[DISPATCH] Stopped");
        }
        if let Err(e) = lock(&self.queue).persist() {
            log::error!("[DISPATCH] Final queue persist failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Current statistics with live pending count and transport status.
    pub fn statistics(&self) -> SyncStatistics {
        let mut stats = lock(&self.statistics).clone();
        stats.pending_events = lock(&self.queue).len();
        stats.connection_status = self.transport.status();
        stats
    }
}

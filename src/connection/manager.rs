/**
 * ============================================================================
 * CONNECTION MANAGER MODULE
 * ============================================================================
 *
 * PURPOSE: Keep an authenticated socket open while the page is visible
 *
 * STATES: Disconnected -> Connecting -> Connected
 *
 * DISCONNECT TRIGGERS:
 * - Explicit disconnect() / destroy()
 * - Page hidden
 * - Server rejected the credential (auth_error)
 *
 * RECONNECT TRIGGERS (auto_reconnect on):
 * - Page visible again while disconnected
 * - Credential renewed after an auth error
 * - Periodic check (30 s) found the token near expiry: renew, then reconnect
 *
 * PRESENCE:
 * - Pointer/keyboard/scroll/touch input marks the user active
 * - No input for the inactivity threshold marks the user inactive
 * - Each transition emits "presence", at most once per second
 *
 * BACKGROUND TASKS (all aborted by destroy()):
 * - pump: reads transport events for the current connection
 * - expiry check: periodic token inspection
 * - inactivity: debounce timer, restarted on every input
 * - renewal: auth-error / expiry recovery
 *
 * ============================================================================
 */

use crate::config::{ConnectionConfig, TrackerConfig};
use crate::connection::auth::TokenLifecycle;
use crate::connection::client::{Handshake, SocketEvent, SocketTransport, WsTransport};
use crate::connection::registry::TokenRegistry;
use crate::error::{Result, TrackerError};
use crate::lock;
use crate::pipeline::dispatcher::BatchTransport;
use crate::pipeline::rate_limiter::RateLimiter;
use crate::storage::Storage;
use crate::types::{BatchPayload, ConnectionState, TransmissionStatus, event_types};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Kinds of user input that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Keyboard,
    Scroll,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewalCause {
    AuthError,
    // Server rejected the credential while another caller was renewing it
    AuthErrorDuringRequest,
    NearExpiry,
}

struct SharedState {
    phase: ConnectionPhase,
    // Bumped on every disconnect so stale connects and pumps can tell
    epoch: u64,
    // Access token bound into the current (or last) handshake
    handshake_token: Option<String>,
    status: TransmissionStatus,
    connection: ConnectionState,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    expiry_check: Option<JoinHandle<()>>,
    inactivity: Option<JoinHandle<()>>,
    renewal: Option<JoinHandle<()>>,
}

fn abort(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

fn is_live(handle: &Option<JoinHandle<()>>) -> bool {
    handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
}

struct Inner {
    transport: Arc<dyn SocketTransport>,
    tokens: Arc<TokenLifecycle>,
    config: Mutex<ConnectionConfig>,
    state: Mutex<SharedState>,
    tasks: Mutex<Tasks>,
    presence: Mutex<RateLimiter>,
    // Held across token lookup and transport connect; one attempt at a time
    connect_gate: AsyncMutex<()>,
    destroyed: AtomicBool,
}

/**
 * Handle to the connection state machine
 * Cheap to clone; every clone drives the same connection
 */
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        tokens: Arc<TokenLifecycle>,
        config: ConnectionConfig,
    ) -> Self {
        let mut presence = RateLimiter::new();
        presence.set_rule(event_types::PRESENCE, config.presence_min_interval());

        Self {
            inner: Arc::new(Inner {
                transport,
                tokens,
                config: Mutex::new(config),
                state: Mutex::new(SharedState {
                    phase: ConnectionPhase::Disconnected,
                    epoch: 0,
                    handshake_token: None,
                    status: TransmissionStatus::Disconnected,
                    connection: ConnectionState::default(),
                }),
                tasks: Mutex::new(Tasks::default()),
                presence: Mutex::new(presence),
                connect_gate: AsyncMutex::new(()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /**
     * WebSocket manager for the configured endpoints
     * Tokens come from the registry so every user of the endpoint shares them
     */
    pub fn from_config(
        config: &TrackerConfig,
        registry: &TokenRegistry,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let tokens = registry.get_or_create(config, storage)?;
        let transport = WsTransport::new(&config.socket_url, config.connection.connection_timeout());
        Ok(Self::new(
            Arc::new(transport),
            tokens,
            config.connection.clone(),
        ))
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn config(&self) -> ConnectionConfig {
        lock(&self.inner.config).clone()
    }

    pub fn tokens(&self) -> &Arc<TokenLifecycle> {
        &self.inner.tokens
    }

    pub fn phase(&self) -> ConnectionPhase {
        lock(&self.inner.state).phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// Status for UI display.
    pub fn status(&self) -> TransmissionStatus {
        lock(&self.inner.state).status.clone()
    }

    /// Snapshot of focus and activity bookkeeping.
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).connection.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        lock(&self.inner.config).auto_reconnect = enabled;
    }

    /**
     * Apply runtime connection settings
     * Takes effect from the next timer or reconnect
     */
    pub fn update_config(&self, config: ConnectionConfig) {
        lock(&self.inner.presence)
            .set_rule(event_types::PRESENCE, config.presence_min_interval());
        *lock(&self.inner.config) = config;
    }

    fn settle_disconnected(&self, epoch: u64, status: TransmissionStatus) {
        let mut state = lock(&self.inner.state);
        if state.epoch == epoch {
            state.phase = ConnectionPhase::Disconnected;
            state.status = status;
            state.connection.connected = false;
        }
    }

    /**
     * Open the connection with a valid access token
     * Without a token the manager stays Disconnected and returns Auth
     */
    pub async fn connect(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(TrackerError::Config("connection manager destroyed".to_string()));
        }

        let requested_epoch = lock(&self.inner.state).epoch;
        // A stale attempt finishes (and closes its own session) before the next one starts
        let _gate = self.inner.connect_gate.lock().await;

        let epoch = {
            let mut state = lock(&self.inner.state);
            if state.epoch != requested_epoch {
                log::debug!("[CONNECTION] Connect superseded by a disconnect while queued");
                return Ok(());
            }
            if state.phase != ConnectionPhase::Disconnected {
                log::debug!("[CONNECTION] Connect ignored, already {:?}", state.phase);
                return Ok(());
            }
            state.phase = ConnectionPhase::Connecting;
            state.status = TransmissionStatus::Connecting;
            state.epoch
        };

        let Some(token) = self.inner.tokens.get_valid_access_token().await else {
            log::warn!("[CONNECTION] No valid access token, staying disconnected");
            let message = "no valid access token".to_string();
            self.settle_disconnected(epoch, TransmissionStatus::Error(message.clone()));
            return Err(TrackerError::Auth(message));
        };

        let wait = self.config().connection_timeout();
        let handshake = Handshake {
            token: token.clone(),
        };
        let connected = match timeout(wait, self.inner.transport.connect(handshake)).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::Timeout(wait)),
        };
        let events = match connected {
            Ok(events) => events,
            Err(e) => {
                log::warn!("[CONNECTION] Connect failed: {}", e);
                self.settle_disconnected(epoch, TransmissionStatus::Error(e.to_string()));
                return Err(e);
            }
        };

        let still_wanted = {
            let mut state = lock(&self.inner.state);
            if state.epoch == epoch && state.phase == ConnectionPhase::Connecting {
                state.phase = ConnectionPhase::Connected;
                state.status = TransmissionStatus::Connected;
                state.connection.connected = true;
                state.handshake_token = Some(token);
                true
            } else {
                false
            }
        };
        if !still_wanted {
            log::info!("[CONNECTION] Disconnect requested while connecting, closing");
            self.inner.transport.disconnect().await;
            return Ok(());
        }

        self.spawn_pump(events, epoch);
        self.spawn_expiry_check();
        self.ensure_inactivity_timer();
        log::info!("[CONNECTION] Connected");
        Ok(())
    }

    /**
     * Close the connection and stop its tasks
     * Recovery and inactivity timers keep running
     */
    pub async fn disconnect(&self) {
        let was_open = {
            let mut state = lock(&self.inner.state);
            state.epoch += 1;
            let was_open = state.phase != ConnectionPhase::Disconnected;
            state.phase = ConnectionPhase::Disconnected;
            state.status = TransmissionStatus::Disconnected;
            state.connection.connected = false;
            was_open
        };
        {
            let mut tasks = lock(&self.inner.tasks);
            abort(&mut tasks.pump);
            abort(&mut tasks.expiry_check);
        }
        if was_open {
            log::info!("[CONNECTION] Disconnecting");
            self.inner.transport.disconnect().await;
        }
    }

    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<SocketEvent>, epoch: u64) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let reason = loop {
                let Some(event) = events.recv().await else {
                    break "event stream closed".to_string();
                };
                let Some(manager) = Self::from_weak(&weak) else {
                    return;
                };
                match event {
                    SocketEvent::Connected => log::debug!("[CONNECTION] Transport connected"),
                    SocketEvent::Message { event, .. } => {
                        log::debug!("[CONNECTION] Server event: {}", event)
                    }
                    SocketEvent::AuthError(reason) => {
                        manager.on_auth_error(reason);
                        return;
                    }
                    SocketEvent::Disconnected(reason) => break reason,
                }
            };
            if let Some(manager) = Self::from_weak(&weak) {
                manager.on_transport_closed(epoch, &reason);
            }
        });

        if let Some(previous) = lock(&self.inner.tasks).pump.replace(handle) {
            previous.abort();
        }
    }

    /// Transport went away by itself; reflect it, no reconnection.
    fn on_transport_closed(&self, epoch: u64, reason: &str) {
        let closed = {
            let mut state = lock(&self.inner.state);
            if state.epoch == epoch && state.phase == ConnectionPhase::Connected {
                state.phase = ConnectionPhase::Disconnected;
                state.status = TransmissionStatus::Disconnected;
                state.connection.connected = false;
                true
            } else {
                false
            }
        };
        if closed {
            log::warn!("[CONNECTION] Transport disconnected: {}", reason);
            abort(&mut lock(&self.inner.tasks).expiry_check);
        }
    }

    fn on_auth_error(&self, reason: String) {
        log::warn!("[CONNECTION] Credential rejected: {}", reason);
        lock(&self.inner.state).status = TransmissionStatus::Error(format!("auth error: {}", reason));

        if self.inner.tokens.is_request_in_progress() {
            log::info!("[CONNECTION] Token request already in flight, waiting for it");
            self.spawn_renewal(RenewalCause::AuthErrorDuringRequest);
            return;
        }
        self.spawn_renewal(RenewalCause::AuthError);
    }

    /**
     * Renew the credential, then cycle the connection
     * Runs in its own task since disconnect() aborts the pump and the
     * expiry check that trigger it
     */
    fn spawn_renewal(&self, cause: RenewalCause) {
        let mut tasks = lock(&self.inner.tasks);
        if is_live(&tasks.renewal) {
            log::debug!("[CONNECTION] Renewal already running");
            return;
        }

        let manager = self.clone();
        tasks.renewal = Some(tokio::spawn(async move {
            let renewed = match cause {
                RenewalCause::AuthError => {
                    sleep(manager.config().auth_error_delay()).await;
                    manager.inner.tokens.force_refresh().await
                }
                RenewalCause::AuthErrorDuringRequest => {
                    let rejected = lock(&manager.inner.state).handshake_token.clone();
                    manager.disconnect().await;
                    match manager.inner.tokens.get_valid_access_token().await {
                        Some(token) if Some(&token) == rejected.as_ref() => {
                            manager.inner.tokens.force_refresh().await
                        }
                        renewed => renewed,
                    }
                }
                RenewalCause::NearExpiry => manager.inner.tokens.get_valid_access_token().await,
            };

            if renewed.is_none() {
                log::warn!("[CONNECTION] Token renewal failed ({:?})", cause);
                if cause == RenewalCause::NearExpiry {
                    // Current credential is still usable until the server says otherwise
                    return;
                }
            }

            manager.disconnect().await;
            if renewed.is_some() && manager.config().auto_reconnect && !manager.is_destroyed() {
                log::info!("[CONNECTION] Reconnecting with renewed token");
                if let Err(e) = manager.connect().await {
                    log::warn!("[CONNECTION] Reconnect after renewal failed: {}", e);
                }
            }
        }));
    }

    fn spawn_expiry_check(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.config().token_check_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = Self::from_weak(&weak) else {
                    break;
                };
                if !manager.is_connected() || manager.inner.tokens.is_request_in_progress() {
                    continue;
                }
                if manager.inner.tokens.is_near_expiration() {
                    log::info!("[CONNECTION] Token near expiry, renewing");
                    manager.spawn_renewal(RenewalCause::NearExpiry);
                }
            }
        });

        if let Some(previous) = lock(&self.inner.tasks).expiry_check.replace(handle) {
            previous.abort();
        }
    }

    /**
     * Page visibility changed
     * Hidden closes the socket, visible reopens it when auto_reconnect is on
     */
    pub async fn handle_visibility_change(&self, visible: bool) {
        lock(&self.inner.state).connection.focused = visible;

        if !visible {
            log::info!("[CONNECTION] Page hidden, disconnecting");
            self.disconnect().await;
            return;
        }

        let reconnect = self.config().auto_reconnect
            && !self.is_destroyed()
            && self.phase() == ConnectionPhase::Disconnected;
        if reconnect {
            log::info!("[CONNECTION] Page visible, reconnecting");
            if let Err(e) = self.connect().await {
                log::warn!("[CONNECTION] Reconnect on focus failed: {}", e);
            }
        }
    }

    /**
     * User input seen
     * Restarts the inactivity timer; emits presence when leaving inactivity
     */
    pub async fn record_activity(&self, kind: ActivityKind) {
        if self.is_destroyed() {
            return;
        }

        let was_inactive = {
            let mut state = lock(&self.inner.state);
            state.connection.last_activity_at = Utc::now();
            std::mem::replace(&mut state.connection.considered_inactive, false)
        };

        self.restart_inactivity_timer();

        if was_inactive {
            log::debug!("[CONNECTION] User active again ({:?})", kind);
            self.emit_presence("active").await;
        }
    }

    /// Start the debounce timer unless one is already pending.
    fn ensure_inactivity_timer(&self) {
        if !is_live(&lock(&self.inner.tasks).inactivity) {
            self.restart_inactivity_timer();
        }
    }

    fn restart_inactivity_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let threshold = self.config().inactivity_threshold();
        let handle = tokio::spawn(async move {
            sleep(threshold).await;
            if let Some(manager) = Self::from_weak(&weak) {
                manager.mark_inactive().await;
            }
        });

        if let Some(previous) = lock(&self.inner.tasks).inactivity.replace(handle) {
            previous.abort();
        }
    }

    async fn mark_inactive(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.connection.considered_inactive {
                return;
            }
            state.connection.considered_inactive = true;
        }
        log::debug!("[CONNECTION] User inactive");
        self.emit_presence("inactive").await;
    }

    /// Returns whether the presence event went out.
    async fn emit_presence(&self, status: &str) -> bool {
        let (connected, focused) = {
            let state = lock(&self.inner.state);
            (state.phase == ConnectionPhase::Connected, state.connection.focused)
        };
        if !connected {
            log::debug!("[CONNECTION] Presence '{}' not sent, disconnected", status);
            return false;
        }
        if !lock(&self.inner.presence).should_allow(event_types::PRESENCE) {
            log::debug!("[CONNECTION] Presence '{}' rate limited", status);
            return false;
        }

        let data = json!({
            "status": status,
            "focused": focused,
            "at": Utc::now(),
        });
        match self.inner.transport.emit("presence", data).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[CONNECTION] Presence emit failed: {}", e);
                false
            }
        }
    }

    /**
     * Tear everything down
     * Safe to call any number of times; the manager cannot reconnect after
     */
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[CONNECTION] Destroying connection manager");
        {
            let mut tasks = lock(&self.inner.tasks);
            abort(&mut tasks.renewal);
            abort(&mut tasks.inactivity);
        }
        self.disconnect().await;
    }
}

#[async_trait]
impl BatchTransport for ConnectionManager {
    async fn send(&self, payload: &BatchPayload) -> Result<()> {
        if !self.is_connected() {
            return Err(TrackerError::NotConnected);
        }

        let data = serde_json::to_value(payload)?;
        let ack = self
            .inner
            .transport
            .request("track_batch", data, self.config().ack_timeout())
            .await?;

        if let Some(error) = ack.get("error").and_then(Value::as_str) {
            return Err(TrackerError::Socket(format!("server rejected batch: {}", error)));
        }
        Ok(())
    }

    fn status(&self) -> TransmissionStatus {
        lock(&self.inner.state).status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::connection::auth::tests::MockTokenApi;
    use crate::storage::MemoryStorage;
    use crate::types::TrackingEvent;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Default)]
    struct MockSocket {
        handshakes: Mutex<Vec<Handshake>>,
        disconnects: AtomicU32,
        emitted: Mutex<Vec<(String, Value)>>,
        requests: Mutex<Vec<(String, Value)>>,
        events: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
        refuse: AtomicBool,
        // Applied to the next connect only
        connect_delay: Mutex<Option<Duration>>,
    }

    impl MockSocket {
        fn push(&self, event: SocketEvent) {
            lock(&self.events)
                .as_ref()
                .expect("socket not connected")
                .send(event)
                .unwrap();
        }

        fn tokens_seen(&self) -> Vec<String> {
            lock(&self.handshakes).iter().map(|h| h.token.clone()).collect()
        }

        fn presence_statuses(&self) -> Vec<String> {
            lock(&self.emitted)
                .iter()
                .filter(|(event, _)| event == "presence")
                .map(|(_, data)| data["status"].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl SocketTransport for MockSocket {
        async fn connect(&self, handshake: Handshake) -> Result<mpsc::UnboundedReceiver<SocketEvent>> {
            let delay = lock(&self.connect_delay).take();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TrackerError::Socket("connection refused".to_string()));
            }
            lock(&self.handshakes).push(handshake);
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(SocketEvent::Connected).unwrap();
            *lock(&self.events) = Some(tx);
            Ok(rx)
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            lock(&self.events).take();
        }

        async fn emit(&self, event: &str, data: Value) -> Result<()> {
            if lock(&self.events).is_none() {
                return Err(TrackerError::NotConnected);
            }
            lock(&self.emitted).push((event.to_string(), data));
            Ok(())
        }

        async fn request(&self, event: &str, data: Value, _wait: Duration) -> Result<Value> {
            let received = data["events"].as_array().map(Vec::len).unwrap_or(0);
            lock(&self.requests).push((event.to_string(), data));
            Ok(json!({ "received": received }))
        }
    }

    fn manager_with(
        api: MockTokenApi,
        config: ConnectionConfig,
    ) -> (ConnectionManager, Arc<MockSocket>, Arc<MockTokenApi>) {
        let api = Arc::new(api);
        let tokens = Arc::new(TokenLifecycle::new(
            api.clone(),
            Arc::new(MemoryStorage::new()),
            TokenConfig {
                retry_max_attempts: 2,
                retry_delay_ms: 100,
                ..TokenConfig::default()
            },
            "client-1".to_string(),
        ));
        let socket = Arc::new(MockSocket::default());
        let manager = ConnectionManager::new(socket.clone(), tokens, config);
        (manager, socket, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_binds_token_into_handshake() {
        let (manager, socket, api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());

        manager.connect().await.unwrap();
        assert_eq!(manager.phase(), ConnectionPhase::Connected);
        assert_eq!(manager.status(), TransmissionStatus::Connected);
        assert!(manager.state().connected);

        let current = manager.tokens().current_pair().unwrap().access_token.unwrap();
        assert_eq!(socket.tokens_seen(), vec![current]);
        assert_eq!(api.issue_calls.load(Ordering::SeqCst), 1);

        // Second connect while connected is a no-op
        manager.connect().await.unwrap();
        assert_eq!(socket.tokens_seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_token_stays_disconnected() {
        let (manager, socket, _api) = manager_with(
            MockTokenApi::new().failing_issues(u32::MAX),
            ConnectionConfig::default(),
        );

        assert!(matches!(manager.connect().await, Err(TrackerError::Auth(_))));
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert!(matches!(manager.status(), TransmissionStatus::Error(_)));
        assert!(socket.tokens_seen().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_transport_leaves_disconnected() {
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        socket.refuse.store(true, Ordering::SeqCst);

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);

        socket.refuse.store(false, Ordering::SeqCst);
        manager.connect().await.unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_closes_and_visible_reopens() {
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        manager.connect().await.unwrap();

        manager.handle_visibility_change(false).await;
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert!(!manager.state().focused);
        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);

        manager.handle_visibility_change(true).await;
        assert_eq!(manager.phase(), ConnectionPhase::Connected);
        assert!(manager.state().focused);
        assert_eq!(socket.tokens_seen().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_without_auto_reconnect_stays_closed() {
        let config = ConnectionConfig {
            auto_reconnect: false,
            ..ConnectionConfig::default()
        };
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), config);
        manager.connect().await.unwrap();

        manager.handle_visibility_change(false).await;
        manager.handle_visibility_change(true).await;
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert_eq!(socket.tokens_seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_renews_and_reconnects() {
        let (manager, socket, api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        manager.connect().await.unwrap();

        socket.push(SocketEvent::AuthError("token expired".to_string()));
        sleep(Duration::from_secs(5)).await;

        let tokens = socket.tokens_seen();
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_during_foreign_refresh_waits_for_it() {
        let api = MockTokenApi {
            latency: Duration::from_millis(500),
            ..MockTokenApi::new()
        };
        let (manager, socket, api) = manager_with(api, ConnectionConfig::default());
        manager.connect().await.unwrap();

        // Another user of the shared lifecycle renews the credential
        let tokens = Arc::clone(manager.tokens());
        let refresh = tokio::spawn(async move { tokens.force_refresh().await });
        sleep(Duration::from_millis(10)).await;
        assert!(manager.tokens().is_request_in_progress());

        socket.push(SocketEvent::AuthError("rejected".to_string()));
        sleep(Duration::from_millis(10)).await;
        assert!(!manager.is_connected());
        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);

        let renewed = refresh.await.unwrap().unwrap();
        sleep(Duration::from_millis(10)).await;

        let seen = socket.tokens_seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], renewed);
        assert!(manager.is_connected());
        // The manager joined the running request instead of starting its own
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.issue_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connect_leaves_newer_connection_open() {
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        manager.tokens().get_valid_access_token().await.unwrap();
        *lock(&socket.connect_delay) = Some(Duration::from_millis(200));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.phase(), ConnectionPhase::Connecting);

        manager.handle_visibility_change(false).await;
        manager.handle_visibility_change(true).await;
        first.await.unwrap().unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.phase(), ConnectionPhase::Connected);
        assert!(manager.state().focused);
        // Hiding the page and the abandoned attempt; the live session is untouched
        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 2);
        assert!(lock(&socket.events).is_some());
        assert_eq!(socket.tokens_seen().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_is_reflected_without_reconnect() {
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        manager.connect().await.unwrap();

        socket.push(SocketEvent::Disconnected("server going away".to_string()));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert_eq!(manager.status(), TransmissionStatus::Disconnected);
        assert_eq!(socket.tokens_seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_check_renews_and_reconnects() {
        // Tokens live 20 s, inside the 30 s margin, so every check renews
        let api = MockTokenApi {
            lifetime_seconds: 20,
            ..MockTokenApi::new()
        };
        let (manager, socket, api) = manager_with(api, ConnectionConfig::default());
        manager.connect().await.unwrap();
        assert_eq!(socket.tokens_seen().len(), 1);

        sleep(Duration::from_secs(31)).await;

        let tokens = socket.tokens_seen();
        assert!(tokens.len() >= 2);
        assert_ne!(tokens[0], tokens[tokens.len() - 1]);
        assert!(api.refresh_calls.load(Ordering::SeqCst) >= 1);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_emits_rate_limited_presence() {
        let config = ConnectionConfig {
            inactivity_threshold_seconds: 1,
            ..ConnectionConfig::default()
        };
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), config);
        manager.connect().await.unwrap();

        manager.record_activity(ActivityKind::Pointer).await;
        assert!(socket.presence_statuses().is_empty());

        sleep(Duration::from_millis(1100)).await;
        assert!(manager.state().considered_inactive);
        assert_eq!(socket.presence_statuses(), vec!["inactive"]);

        // Back to active 400 ms after the last emission: state flips, event is dropped
        sleep(Duration::from_millis(400)).await;
        manager.record_activity(ActivityKind::Keyboard).await;
        assert!(!manager.state().considered_inactive);
        assert_eq!(socket.presence_statuses(), vec!["inactive"]);

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(socket.presence_statuses(), vec!["inactive", "inactive"]);

        sleep(Duration::from_millis(1000)).await;
        manager.record_activity(ActivityKind::Touch).await;
        assert_eq!(socket.presence_statuses(), vec!["inactive", "inactive", "active"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_connect_turns_inactive() {
        let config = ConnectionConfig {
            inactivity_threshold_seconds: 1,
            ..ConnectionConfig::default()
        };
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), config);
        manager.connect().await.unwrap();

        sleep(Duration::from_secs(10)).await;
        assert!(manager.state().considered_inactive);
        assert_eq!(socket.presence_statuses(), vec!["inactive"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_batch_needs_connection_and_ack() {
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        let payload = BatchPayload::from_events(vec![
            TrackingEvent::new("v1", "s1", "CLICK"),
            TrackingEvent::new("v1", "s1", "PAGE_VIEW"),
        ])
        .unwrap();

        assert!(matches!(
            manager.send(&payload).await,
            Err(TrackerError::NotConnected)
        ));

        manager.connect().await.unwrap();
        manager.send(&payload).await.unwrap();

        let requests = lock(&socket.requests);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "track_batch");
        assert_eq!(requests[0].1["visitorId"], "v1");
        assert_eq!(requests[0].1["events"].as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent_and_final() {
        let (manager, socket, _api) = manager_with(MockTokenApi::new(), ConnectionConfig::default());
        manager.connect().await.unwrap();
        manager.record_activity(ActivityKind::Scroll).await;

        manager.destroy().await;
        manager.destroy().await;
        assert!(manager.is_destroyed());
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert_eq!(socket.disconnects.load(Ordering::SeqCst), 1);

        assert!(manager.connect().await.is_err());
        manager.handle_visibility_change(true).await;
        assert_eq!(socket.tokens_seen().len(), 1);
    }
}

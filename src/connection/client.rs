/**
 * ============================================================================
 * WEBSOCKET TRANSPORT MODULE
 * ============================================================================
 *
 * PURPOSE: Socket connection carrying tracking traffic
 *
 * PROTOCOL:
 * 1. Connect to WebSocket endpoint (TLS for wss://)
 * 2. Send: {"type":"auth","token":"<jwt>"}
 * 3. Send: {"event":"<name>","data":...,"id"?:n}
 * 4. Receive: {"event":"<name>","data":...,"id"?:n}
 *    - "ack" with an id resolves the request carrying that id
 *    - "auth_error" ends the current connection's usefulness
 *
 * CONNECTION LIFECYCLE:
 * - One reader task and one writer task per connection
 * - No reconnection at this level; the connection manager decides
 * - Pings answered with pongs, close frame sent on disconnect
 *
 * ============================================================================
 */

use crate::error::{Result, TrackerError};
use crate::lock;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Connection parameters bound at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub token: String,
}

/// What the transport reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected,
    Disconnected(String),
    AuthError(String),
    Message { event: String, data: Value },
}

/**
 * Socket seam used by the connection manager
 * Implementations never reconnect on their own
 */
#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Open a connection; the receiver yields events until it closes.
    async fn connect(&self, handshake: Handshake) -> Result<mpsc::UnboundedReceiver<SocketEvent>>;

    async fn disconnect(&self);

    /// Fire-and-forget event.
    async fn emit(&self, event: &str, data: Value) -> Result<()>;

    /// Event that waits for the server's acknowledgement.
    async fn request(&self, event: &str, data: Value, wait: Duration) -> Result<Value>;
}

#[derive(Debug, Serialize)]
struct AuthFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    token: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

struct Session {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/**
 * WebSocket implementation of the socket seam
 * Holds at most one live session
 */
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
    next_id: AtomicU64,
    session: Mutex<Option<Session>>,
}

impl WsTransport {
    pub fn new(url: &str, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .map(|s| !s.outgoing.is_closed())
            .unwrap_or(false)
    }

    fn send_frame(&self, frame: &EventFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let session = lock(&self.session);
        let session = session.as_ref().ok_or(TrackerError::NotConnected)?;
        session
            .outgoing
            .send(Message::Text(text))
            .map_err(|_| TrackerError::NotConnected)
    }

    fn close_session(session: Session) {
        let Session {
            outgoing,
            pending,
            reader,
            writer: _,
        } = session;
        reader.abort();
        // Writer ends on its own after flushing the close frame
        let _ = outgoing.send(Message::Close(None));
        lock(&pending).clear();
    }
}

/// First 100 characters of a frame, for logging.
fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}

/// Route one inbound text frame.
fn dispatch_frame(text: &str, pending: &PendingAcks, events: &mpsc::UnboundedSender<SocketEvent>) {
    let frame = match serde_json::from_str::<EventFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!(
                "[SOCKET] Ignoring unparseable frame ({}): {:?}",
                e,
                preview(text)
            );
            return;
        }
    };

    match (frame.event.as_str(), frame.id) {
        ("ack", Some(id)) => match lock(pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(frame.data);
            }
            None => log::debug!("[SOCKET] Ack for unknown request {}", id),
        },
        ("auth_error", _) => {
            let reason = frame
                .data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| frame.data.to_string());
            log::warn!("[SOCKET] Server rejected credential: {}", reason);
            let _ = events.send(SocketEvent::AuthError(reason));
        }
        _ => {
            let _ = events.send(SocketEvent::Message {
                event: frame.event,
                data: frame.data,
            });
        }
    }
}

#[async_trait]
impl SocketTransport for WsTransport {
    async fn connect(&self, handshake: Handshake) -> Result<mpsc::UnboundedReceiver<SocketEvent>> {
        if let Some(previous) = lock(&self.session).take() {
            log::debug!("[SOCKET] Replacing previous session");
            Self::close_session(previous);
        }

        log::info!("[SOCKET] Connecting to {}", self.url);
        let (ws_stream, response) = timeout(self.connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| TrackerError::Timeout(self.connect_timeout))??;
        log::info!("[SOCKET] WebSocket connected, status: {}", response.status());

        let (mut sink, mut stream) = ws_stream.split();

        let auth = serde_json::to_string(&AuthFrame {
            kind: "auth",
            token: &handshake.token,
        })?;
        sink.send(Message::Text(auth)).await?;

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SocketEvent>();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    log::warn!("[SOCKET] Send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let _ = events_tx.send(SocketEvent::Connected);

        let reader_pending = Arc::clone(&pending);
        let reader_outgoing = outgoing.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&text, &reader_pending, &events_tx);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = reader_outgoing.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break format!("server closed connection: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("receive failed: {}", e),
                    None => break "stream ended".to_string(),
                }
            };
            log::info!("[SOCKET] Disconnected: {}", reason);
            // Outstanding requests fail instead of waiting for their timeout
            lock(&reader_pending).clear();
            let _ = events_tx.send(SocketEvent::Disconnected(reason));
        });

        let superseded = lock(&self.session).replace(Session {
            outgoing,
            pending,
            reader,
            writer,
        });
        if let Some(previous) = superseded {
            log::debug!("[SOCKET] Closing session opened while this one was connecting");
            Self::close_session(previous);
        }
        Ok(events_rx)
    }

    async fn disconnect(&self) {
        if let Some(session) = lock(&self.session).take() {
            log::info!("[SOCKET] Closing connection");
            Self::close_session(session);
        }
    }

    async fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.send_frame(&EventFrame {
            event: event.to_string(),
            data,
            id: None,
        })
    }

    async fn request(&self, event: &str, data: Value, wait: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let pending = {
            let session = lock(&self.session);
            let session = session.as_ref().ok_or(TrackerError::NotConnected)?;
            lock(&session.pending).insert(id, tx);
            Arc::clone(&session.pending)
        };

        let sent = self.send_frame(&EventFrame {
            event: event.to_string(),
            data,
            id: Some(id),
        });
        if let Err(e) = sent {
            lock(&pending).remove(&id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(TrackerError::NotConnected),
            Err(_) => {
                lock(&pending).remove(&id);
                Err(TrackerError::Timeout(wait))
            }
        }
    }
}

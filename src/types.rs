/**
 * ============================================================================
 * TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Data structures shared across the pipeline and connection layer
 *
 * TYPES DEFINED:
 * - TrackingEvent: a single behavioral event as produced by the host
 * - BatchPayload: wire shape of one dispatched batch
 * - TransmissionStatus: connection state for UI display
 * - ConnectionState: focus/activity bookkeeping of the connection manager
 * - SyncStatistics: delivery counters for monitoring
 *
 * ============================================================================
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known event type names.
pub mod event_types {
    pub const PAGE_VIEW: &str = "PAGE_VIEW";
    pub const CLICK: &str = "CLICK";
    pub const SCROLL: &str = "SCROLL";
    pub const HOVER: &str = "HOVER";
    pub const MOUSE_MOVE: &str = "MOUSE_MOVE";
    pub const FOCUS: &str = "FOCUS";
    pub const BLUR: &str = "BLUR";
    pub const RESIZE: &str = "RESIZE";
    pub const FORM_SUBMIT: &str = "FORM_SUBMIT";
    pub const PRESENCE: &str = "PRESENCE";
}

/**
 * A behavioral event as handed to the pipeline
 * occurred_at is assigned by the producer and never rewritten
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl TrackingEvent {
    pub fn new(
        visitor_id: impl Into<String>,
        session_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            session_id: session_id.into(),
            event_type: event_type.into(),
            metadata: Map::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Number of raw events this one stands for (1 unless aggregated).
    pub fn aggregated_count(&self) -> u64 {
        self.metadata
            .get("aggregatedCount")
            .and_then(Value::as_u64)
            .unwrap_or(1)
    }

    /**
     * Parse a persisted record, rejecting anything structurally invalid
     * visitorId, sessionId and eventType must be strings, metadata an object
     */
    pub fn from_snapshot_value(value: &Value) -> Option<Self> {
        let record = value.as_object()?;
        let has_string = |field: &str| record.get(field).map(Value::is_string).unwrap_or(false);

        if !has_string("visitorId") || !has_string("sessionId") || !has_string("eventType") {
            return None;
        }
        if !record.get("metadata").map(Value::is_object).unwrap_or(false) {
            return None;
        }

        serde_json::from_value(value.clone()).ok()
    }
}

/**
 * One batch as it goes over the wire
 * Context ids come from the oldest event in the batch
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub visitor_id: String,
    pub session_id: String,
    pub events: Vec<TrackingEvent>,
}

impl BatchPayload {
    pub fn from_events(events: Vec<TrackingEvent>) -> Option<Self> {
        let first = events.first()?;
        Some(Self {
            visitor_id: first.visitor_id.clone(),
            session_id: first.session_id.clone(),
            events,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/**
 * Current connection status of the socket
 * Used for UI display and reconnection logic
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum TransmissionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/**
 * Focus and activity bookkeeping kept by the connection manager
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    pub focused: bool,
    pub last_activity_at: DateTime<Utc>,
    pub considered_inactive: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connected: false,
            focused: true,
            last_activity_at: Utc::now(),
            considered_inactive: false,
        }
    }
}

/**
 * Delivery statistics for monitoring and UI display
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub total_events_sent: u64,
    pub total_batches_sent: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_events: usize,
    pub connection_status: TransmissionStatus,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for SyncStatistics {
    fn default() -> Self {
        Self {
            total_events_sent: 0,
            total_batches_sent: 0,
            last_sync_time: None,
            pending_events: 0,
            connection_status: TransmissionStatus::Disconnected,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

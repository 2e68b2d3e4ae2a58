/**
 * ============================================================================
 * AGGREGATOR MODULE
 * ============================================================================
 *
 * PURPOSE: Collapse bursts of low-information events into one event per
 * fingerprint and flush window
 *
 * FINGERPRINT:
 * - Allow-listed types: (eventType, visitorId, sessionId, contextKey)
 *   SCROLL -> url, HOVER/MOUSE_MOVE -> target element, FOCUS/BLUR -> field
 *   name, RESIZE -> none
 * - Every other type: unique nonce, so it is never merged
 *
 * MERGE RULES (field by field):
 * - numbers: latest value, plus running <field>_min / <field>_max
 * - arrays: union without duplicates
 * - anything else: latest value wins
 *
 * FLUSH:
 * - Timer-driven by the owner (default window 1000 ms)
 * - Forced from add() once max_buckets buckets are open
 * - Output follows bucket creation order
 *
 * ============================================================================
 */

use crate::config::AggregationConfig;
use crate::types::{TrackingEvent, event_types};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// High-frequency, low-information types that may be merged.
static AGGREGABLE_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        event_types::SCROLL,
        event_types::HOVER,
        event_types::MOUSE_MOVE,
        event_types::FOCUS,
        event_types::BLUR,
        event_types::RESIZE,
    ])
});

pub fn is_aggregable(event_type: &str) -> bool {
    AGGREGABLE_TYPES.contains(event_type)
}

/**
 * One open merge target
 * Lives from the first event of its fingerprint until the next flush
 */
#[derive(Debug, Clone)]
pub struct AggregationBucket {
    pub representative: TrackingEvent,
    pub count: u64,
    pub first_occurred_at: DateTime<Utc>,
    pub last_occurred_at: DateTime<Utc>,
    pub merged_metadata: Map<String, Value>,
    numeric_ranges: HashMap<String, (f64, f64)>,
}

impl AggregationBucket {
    fn open(event: TrackingEvent) -> Self {
        let numeric_ranges = event
            .metadata
            .iter()
            .filter_map(|(key, value)| value.as_f64().map(|n| (key.clone(), (n, n))))
            .collect();

        Self {
            count: 1,
            first_occurred_at: event.occurred_at,
            last_occurred_at: event.occurred_at,
            merged_metadata: event.metadata.clone(),
            numeric_ranges,
            representative: event,
        }
    }

    fn merge(&mut self, event: TrackingEvent) {
        self.count += 1;
        // Arrival order, not clock order
        self.last_occurred_at = event.occurred_at;

        for (key, value) in event.metadata {
            if let Some(n) = value.as_f64() {
                let range = self.numeric_ranges.entry(key.clone()).or_insert((n, n));
                range.0 = range.0.min(n);
                range.1 = range.1.max(n);
                self.merged_metadata.insert(key, value);
                continue;
            }

            if let Value::Array(incoming) = &value {
                if let Some(Value::Array(existing)) = self.merged_metadata.get_mut(&key) {
                    for item in incoming {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                    continue;
                }
            }

            self.merged_metadata.insert(key, value);
        }
    }

    fn into_event(self) -> TrackingEvent {
        let mut metadata = self.merged_metadata;

        if self.count > 1 {
            for (key, (min, max)) in self.numeric_ranges {
                metadata.insert(format!("{}_min", key), number(min));
                metadata.insert(format!("{}_max", key), number(max));
            }
        }

        metadata.insert("aggregatedCount".to_string(), Value::from(self.count));
        metadata.insert(
            "firstOccurredAt".to_string(),
            Value::String(self.first_occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        metadata.insert(
            "lastOccurredAt".to_string(),
            Value::String(self.last_occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        TrackingEvent {
            metadata,
            ..self.representative
        }
    }
}

/// Whole numbers stay integers on the wire.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn metadata_str<'a>(event: &'a TrackingEvent, key: &str) -> Option<&'a str> {
    event.metadata.get(key).and_then(Value::as_str)
}

/**
 * Derive the merge key of an event
 * Non-aggregable types get a fresh nonce on every call
 */
pub fn fingerprint(event: &TrackingEvent) -> String {
    if !is_aggregable(&event.event_type) {
        return format!("{}|{}", event.event_type, Uuid::new_v4());
    }

    let context = match event.event_type.as_str() {
        event_types::SCROLL => metadata_str(event, "url").unwrap_or(""),
        event_types::HOVER | event_types::MOUSE_MOVE => metadata_str(event, "target")
            .or_else(|| metadata_str(event, "elementId"))
            .unwrap_or(""),
        event_types::FOCUS | event_types::BLUR => metadata_str(event, "fieldName").unwrap_or(""),
        _ => "",
    };

    format!(
        "{}|{}|{}|{}",
        event.event_type, event.visitor_id, event.session_id, context
    )
}

pub struct Aggregator {
    config: AggregationConfig,
    buckets: Vec<AggregationBucket>,
    index: HashMap<String, usize>,
    merged_total: u64,
}

impl Aggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            config,
            buckets: Vec::new(),
            index: HashMap::new(),
            merged_total: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /**
     * Toggle aggregation at runtime
     * Disabling releases whatever is still buffered
     */
    pub fn set_enabled(&mut self, enabled: bool) -> Vec<TrackingEvent> {
        self.config.enabled = enabled;
        if enabled { Vec::new() } else { self.flush() }
    }

    /**
     * Buffer an event
     * Returns the events that are ready for the queue right now: the event
     * itself when aggregation is disabled, the whole buffer when the bucket
     * cap was reached, nothing otherwise
     */
    pub fn add(&mut self, event: TrackingEvent) -> Vec<TrackingEvent> {
        if !self.config.enabled {
            return vec![event];
        }

        let key = fingerprint(&event);
        match self.index.get(&key) {
            Some(&position) => {
                self.buckets[position].merge(event);
                self.merged_total += 1;
            }
            None => {
                self.index.insert(key, self.buckets.len());
                self.buckets.push(AggregationBucket::open(event));
            }
        }

        if self.buckets.len() >= self.config.max_buckets {
            log::debug!(
                "[AGGREGATOR] Bucket cap reached ({}), forcing flush",
                self.config.max_buckets
            );
            return self.flush();
        }
        Vec::new()
    }

    /// Materialize every open bucket and start a new window.
    pub fn flush(&mut self) -> Vec<TrackingEvent> {
        if self.buckets.is_empty() {
            return Vec::new();
        }
        self.index.clear();
        let events: Vec<TrackingEvent> = self
            .buckets
            .drain(..)
            .map(AggregationBucket::into_event)
            .collect();
        log::debug!("[AGGREGATOR] Flushed {} events", events.len());
        events
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Raw events absorbed into an existing bucket since construction.
    pub fn merged_total(&self) -> u64 {
        self.merged_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn aggregator(max_buckets: usize) -> Aggregator {
        Aggregator::new(AggregationConfig {
            enabled: true,
            window_ms: 1000,
            max_buckets,
        })
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn scroll(url: &str, depth: i64, offset_ms: i64) -> TrackingEvent {
        TrackingEvent::new("visitor", "session", event_types::SCROLL)
            .with_metadata("url", url)
            .with_metadata("depth", depth)
            .at(base_time() + Duration::milliseconds(offset_ms))
    }

    #[test]
    fn test_same_fingerprint_collapses_into_one_event() {
        let mut agg = aggregator(100);
        for i in 0..5 {
            assert!(agg.add(scroll("/pricing", 10 * (i + 1), 100 * i)).is_empty());
        }

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        let event = &flushed[0];
        assert_eq!(event.metadata["aggregatedCount"], 5);
        assert_eq!(
            event.metadata["lastOccurredAt"],
            (base_time() + Duration::milliseconds(400)).to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        assert_eq!(
            event.metadata["firstOccurredAt"],
            base_time().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        assert_eq!(event.metadata["depth"], 50);
        assert_eq!(event.metadata["depth_min"], 10);
        assert_eq!(event.metadata["depth_max"], 50);
        assert_eq!(agg.bucket_count(), 0);
        assert_eq!(agg.merged_total(), 4);
    }

    #[test]
    fn test_last_occurred_at_follows_arrival_order() {
        let mut agg = aggregator(100);
        agg.add(scroll("/late", 1, 500));
        agg.add(scroll("/late", 2, 900));
        agg.add(scroll("/late", 3, 100));

        let event = agg.flush().remove(0);
        assert_eq!(
            event.metadata["firstOccurredAt"],
            (base_time() + Duration::milliseconds(500)).to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        assert_eq!(
            event.metadata["lastOccurredAt"],
            (base_time() + Duration::milliseconds(100)).to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        assert_eq!(event.metadata["aggregatedCount"], 3);
    }

    #[test]
    fn test_non_aggregable_events_are_never_merged() {
        let mut agg = aggregator(100);
        for _ in 0..5 {
            agg.add(
                TrackingEvent::new("visitor", "session", event_types::FORM_SUBMIT)
                    .with_metadata("form", "signup"),
            );
        }
        let flushed = agg.flush();
        assert_eq!(flushed.len(), 5);
        assert!(flushed.iter().all(|e| e.metadata["aggregatedCount"] == 1));
        assert!(flushed.iter().all(|e| !e.metadata.contains_key("form_min")));
    }

    #[test]
    fn test_context_key_separates_buckets() {
        let mut agg = aggregator(100);
        agg.add(scroll("/a", 1, 0));
        agg.add(scroll("/b", 1, 10));
        agg.add(scroll("/a", 2, 20));
        agg.add(
            TrackingEvent::new("visitor", "session", event_types::FOCUS)
                .with_metadata("fieldName", "email"),
        );
        agg.add(
            TrackingEvent::new("visitor", "session", event_types::FOCUS)
                .with_metadata("fieldName", "password"),
        );
        agg.add(
            TrackingEvent::new("visitor", "other-session", event_types::RESIZE)
                .with_metadata("width", 800),
        );
        agg.add(
            TrackingEvent::new("visitor", "other-session", event_types::RESIZE)
                .with_metadata("width", 1024),
        );

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 5);
        // Creation order: /a, /b, email, password, resize
        assert_eq!(flushed[0].metadata["url"], "/a");
        assert_eq!(flushed[0].metadata["aggregatedCount"], 2);
        assert_eq!(flushed[1].metadata["url"], "/b");
        assert_eq!(flushed[2].metadata["fieldName"], "email");
        assert_eq!(flushed[3].metadata["fieldName"], "password");
        assert_eq!(flushed[4].metadata["aggregatedCount"], 2);
        assert_eq!(flushed[4].metadata["width"], 1024);
    }

    #[test]
    fn test_hover_uses_target_then_element_id() {
        let a = TrackingEvent::new("v", "s", event_types::HOVER).with_metadata("target", "#buy");
        let b = TrackingEvent::new("v", "s", event_types::HOVER).with_metadata("elementId", "#buy");
        let c = TrackingEvent::new("v", "s", event_types::HOVER).with_metadata("target", "#nav");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));

        let click = TrackingEvent::new("v", "s", event_types::CLICK);
        assert_ne!(fingerprint(&click), fingerprint(&click));
    }

    #[test]
    fn test_metadata_merge_rules() {
        let mut agg = aggregator(100);
        agg.add(
            TrackingEvent::new("v", "s", event_types::MOUSE_MOVE)
                .with_metadata("target", "canvas")
                .with_metadata("x", 10.5)
                .with_metadata("zones", json!(["top", "left"]))
                .with_metadata("label", "first"),
        );
        agg.add(
            TrackingEvent::new("v", "s", event_types::MOUSE_MOVE)
                .with_metadata("target", "canvas")
                .with_metadata("x", 3)
                .with_metadata("zones", json!(["left", "bottom"]))
                .with_metadata("label", "second"),
        );

        let event = agg.flush().remove(0);
        assert_eq!(event.metadata["x"], 3);
        assert_eq!(event.metadata["x_min"], 3);
        assert_eq!(event.metadata["x_max"], 10.5);
        assert_eq!(event.metadata["zones"], json!(["top", "left", "bottom"]));
        assert_eq!(event.metadata["label"], "second");
    }

    #[test]
    fn test_bucket_cap_forces_flush() {
        let mut agg = aggregator(3);
        assert!(agg.add(scroll("/1", 1, 0)).is_empty());
        assert!(agg.add(scroll("/2", 1, 0)).is_empty());
        // Merging into an existing bucket does not grow the count
        assert!(agg.add(scroll("/1", 2, 5)).is_empty());

        let forced = agg.add(scroll("/3", 1, 0));
        assert_eq!(forced.len(), 3);
        assert_eq!(agg.bucket_count(), 0);
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_disabled_aggregator_passes_events_through() {
        let mut agg = Aggregator::new(AggregationConfig {
            enabled: false,
            ..AggregationConfig::default()
        });
        let event = scroll("/x", 1, 0);
        let out = agg.add(event.clone());
        assert_eq!(out, vec![event]);
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_disabling_releases_buffer() {
        let mut agg = aggregator(100);
        agg.add(scroll("/x", 1, 0));
        agg.add(scroll("/x", 2, 1));
        let released = agg.set_enabled(false);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].metadata["aggregatedCount"], 2);
        assert!(agg.set_enabled(true).is_empty());
    }
}

/**
 * ============================================================================
 * RATE LIMITER MODULE
 * ============================================================================
 *
 * PURPOSE: Per-event-type minimum-interval gate
 *
 * BEHAVIOR:
 * - Types with a rule pass at most once per interval
 * - Types without a rule always pass
 * - Dropped events are only counted, never buffered
 *
 * ============================================================================
 */

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of limiter counters for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub rules: BTreeMap<String, Duration>,
    pub throttled: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    rules: HashMap<String, Duration>,
    last_allowed: HashMap<String, Instant>,
    throttled: HashMap<String, u64>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `event type -> minimum interval in ms` table.
    pub fn from_millis(rules: &BTreeMap<String, u64>) -> Self {
        let mut limiter = Self::new();
        for (event_type, ms) in rules {
            limiter.set_rule(event_type, Duration::from_millis(*ms));
        }
        limiter
    }

    /// Decide whether an event of this type may enter the pipeline now.
    pub fn should_allow(&mut self, event_type: &str) -> bool {
        self.should_allow_at(event_type, Instant::now())
    }

    fn should_allow_at(&mut self, event_type: &str, now: Instant) -> bool {
        let Some(interval) = self.rules.get(event_type).copied() else {
            return true;
        };

        let allowed = match self.last_allowed.get(event_type) {
            Some(last) => now.saturating_duration_since(*last) >= interval,
            None => true,
        };

        if allowed {
            self.last_allowed.insert(event_type.to_string(), now);
        } else {
            *self.throttled.entry(event_type.to_string()).or_insert(0) += 1;
            log::debug!("[RATE_LIMIT] Throttled {} (interval {:?})", event_type, interval);
        }
        allowed
    }

    /// Add or replace a rule; applies from the next call.
    pub fn set_rule(&mut self, event_type: &str, min_interval: Duration) {
        self.rules.insert(event_type.to_string(), min_interval);
    }

    pub fn remove_rule(&mut self, event_type: &str) {
        self.rules.remove(event_type);
        self.last_allowed.remove(event_type);
    }

    /// Replace every rule at once, keeping timestamps of surviving types.
    pub fn replace_rules(&mut self, rules: &BTreeMap<String, u64>) {
        self.rules = rules
            .iter()
            .map(|(t, ms)| (t.clone(), Duration::from_millis(*ms)))
            .collect();
        let rules = &self.rules;
        self.last_allowed.retain(|t, _| rules.contains_key(t));
    }

    /// Time left until this type would pass again. Never mutates state.
    pub fn get_time_until_next(&self, event_type: &str) -> Duration {
        let (Some(interval), Some(last)) =
            (self.rules.get(event_type), self.last_allowed.get(event_type))
        else {
            return Duration::ZERO;
        };
        interval.saturating_sub(Instant::now().saturating_duration_since(*last))
    }

    pub fn throttled_count(&self, event_type: &str) -> u64 {
        self.throttled.get(event_type).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            rules: self.rules.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            throttled: self.throttled.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    /// Forget timestamps and counters; rules stay.
    pub fn reset(&mut self) {
        self.last_allowed.clear();
        self.throttled.clear();
    }
}

/**
 * ============================================================================
 * TRACKER CONFIGURATION MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration schema, persistence, and validation
 *
 * STORAGE: Configuration stored as JSON wherever the host chooses
 *
 * FUNCTIONALITY:
 * - Define configuration schema with production defaults
 * - Validate configuration values
 * - Load configuration from disk
 * - Save configuration atomically
 * - Classify changes that need a restart versus a hot update
 *
 * ============================================================================
 */

use crate::error::{Result, TrackerError};
use crate::types::event_types;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Storage key of the queue snapshot.
pub const QUEUE_STORAGE_KEY: &str = "tracker_event_queue";
/// Storage key of the token pair.
pub const TOKEN_STORAGE_KEY: &str = "tracker_token_pair";
/// Storage key of the client fingerprint.
pub const FINGERPRINT_STORAGE_KEY: &str = "tracker_client_fingerprint";

/**
 * Complete tracker configuration
 * All pipeline and connection behavior is controlled through these settings
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    // Master enable/disable switch
    pub enabled: bool,

    // HTTP API base (token endpoints, HTTP batch transport)
    pub api_url: String,

    // Socket endpoint (e.g., ws://localhost:8080/tracking)
    pub socket_url: String,

    // Stable client identifier sent to the token endpoint; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_fingerprint: Option<String>,

    // Minimum milliseconds between two events of the same type
    pub rate_limits: BTreeMap<String, u64>,

    pub aggregation: AggregationConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub token: TokenConfig,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregationConfig {
    pub enabled: bool,
    // Flush window in milliseconds
    pub window_ms: u64,
    // Bucket count that forces an immediate flush
    pub max_buckets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    // Minimum milliseconds between two snapshot writes on enqueue
    pub persist_interval_ms: u64,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub interval_ms: u64,
    pub send_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenConfig {
    // Tokens closer than this to their expiry claim count as expired
    pub safety_margin_seconds: u64,
    pub retry_max_attempts: u32,
    // Fixed delay between attempts
    pub retry_delay_ms: u64,
    pub request_timeout_seconds: u64,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    // Reconnect on refocus and after credential renewal
    pub auto_reconnect: bool,
    pub token_check_interval_seconds: u64,
    // Pause before renewing after the server rejected the credential
    pub auth_error_delay_ms: u64,
    pub inactivity_threshold_seconds: u64,
    pub presence_min_interval_ms: u64,
    pub connection_timeout_seconds: u64,
    // Wait for the server's acknowledgement of a socket batch
    pub ack_timeout_seconds: u64,
}

impl Default for TrackerConfig {
    /**
     * Production-ready default configuration
     */
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "http://localhost:8080/api".to_string(),
            socket_url: "ws://localhost:8080/tracking".to_string(),
            client_fingerprint: None,
            rate_limits: default_rate_limits(),
            aggregation: AggregationConfig::default(),
            queue: QueueConfig::default(),
            dispatch: DispatchConfig::default(),
            token: TokenConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 1000,
            max_buckets: 50,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            persist_interval_ms: 2000,
            storage_key: QUEUE_STORAGE_KEY.to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval_ms: 5000,
            send_timeout_seconds: 15,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_margin_seconds: 30,
            retry_max_attempts: 3,
            retry_delay_ms: 1000,
            request_timeout_seconds: 10,
            storage_key: TOKEN_STORAGE_KEY.to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            token_check_interval_seconds: 30,
            auth_error_delay_ms: 1000,
            inactivity_threshold_seconds: 300,
            presence_min_interval_ms: 1000,
            connection_timeout_seconds: 10,
            ack_timeout_seconds: 15,
        }
    }
}

/// Minimum intervals for the high-frequency browser events.
pub fn default_rate_limits() -> BTreeMap<String, u64> {
    BTreeMap::from([
        (event_types::MOUSE_MOVE.to_string(), 100),
        (event_types::SCROLL.to_string(), 250),
        (event_types::HOVER.to_string(), 200),
        (event_types::RESIZE.to_string(), 500),
    ])
}

impl AggregationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl QueueConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

impl DispatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }
}

impl TokenConfig {
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl ConnectionConfig {
    pub fn token_check_interval(&self) -> Duration {
        Duration::from_secs(self.token_check_interval_seconds)
    }

    pub fn auth_error_delay(&self) -> Duration {
        Duration::from_millis(self.auth_error_delay_ms)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_seconds)
    }

    pub fn presence_min_interval(&self) -> Duration {
        Duration::from_millis(self.presence_min_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }
}

impl TrackerConfig {
    /**
     * Check if config changes require a tracker restart
     *
     * Fields that require restart (affect connection/auth/storage):
     * - api_url, socket_url, client_fingerprint, storage keys, queue size
     *
     * Fields that can be hot-updated (runtime behavior only):
     * - enabled, rate limits, aggregation enable flag, connection flags
     */
    pub fn needs_restart(&self, other: &TrackerConfig) -> bool {
        self.api_url != other.api_url
            || self.socket_url != other.socket_url
            || self.client_fingerprint != other.client_fingerprint
            || self.queue != other.queue
            || self.token.storage_key != other.token.storage_key
            || self.aggregation.window_ms != other.aggregation.window_ms
            || self.dispatch.interval_ms != other.dispatch.interval_ms
    }

    /**
     * Validate configuration values
     * Returns Ok(()) if valid, Err(TrackerError::Config) with the first violation
     */
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TrackerError::Config(msg.to_string()));

        // Validate URLs
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return invalid("api_url must start with http:// or https://");
        }
        if !self.socket_url.starts_with("ws://") && !self.socket_url.starts_with("wss://") {
            return invalid("socket_url must start with ws:// or wss://");
        }
        if let Some(fingerprint) = &self.client_fingerprint {
            if fingerprint.is_empty() || fingerprint.len() > 128 {
                return invalid("client_fingerprint must be between 1 and 128 characters");
            }
        }

        // Validate numeric ranges
        if self.rate_limits.values().any(|&ms| ms == 0 || ms > 3_600_000) {
            return invalid("rate limit intervals must be between 1 and 3600000 ms");
        }
        if self.aggregation.window_ms < 50 || self.aggregation.window_ms > 60_000 {
            return invalid("aggregation.window_ms must be between 50 and 60000");
        }
        if self.aggregation.max_buckets == 0 || self.aggregation.max_buckets > 10_000 {
            return invalid("aggregation.max_buckets must be between 1 and 10000");
        }
        if self.queue.max_size == 0 || self.queue.max_size > 100_000 {
            return invalid("queue.max_size must be between 1 and 100000");
        }
        if self.queue.storage_key.is_empty() || self.token.storage_key.is_empty() {
            return invalid("storage keys must not be empty");
        }
        if self.queue.storage_key == self.token.storage_key {
            return invalid("queue and token storage keys must differ");
        }
        if self.dispatch.batch_size == 0 || self.dispatch.batch_size > self.queue.max_size {
            return invalid("dispatch.batch_size must be between 1 and queue.max_size");
        }
        if self.dispatch.interval_ms < 100 {
            return invalid("dispatch.interval_ms must be at least 100");
        }
        if self.token.retry_max_attempts < 1 || self.token.retry_max_attempts > 20 {
            return invalid("token.retry_max_attempts must be between 1 and 20");
        }
        if self.connection.token_check_interval_seconds == 0 {
            return invalid("connection.token_check_interval_seconds must be positive");
        }
        if self.connection.inactivity_threshold_seconds == 0 {
            return invalid("connection.inactivity_threshold_seconds must be positive");
        }
        if self.connection.connection_timeout_seconds == 0 || self.connection.ack_timeout_seconds == 0 {
            return invalid("connection timeouts must be positive");
        }

        Ok(())
    }
}

/**
 * Load configuration from disk
 * Returns default configuration if file doesn't exist
 */
pub fn load_config(path: &Path) -> Result<TrackerConfig> {
    if !path.exists() {
        log::info!("Tracker config not found at {}, using defaults", path.display());
        return Ok(TrackerConfig::default());
    }

    let json_str = fs::read_to_string(path)
        .map_err(|e| TrackerError::Config(format!("Failed to read config file: {}", e)))?;

    let config: TrackerConfig = serde_json::from_str(&json_str)
        .map_err(|e| TrackerError::Config(format!("Failed to parse config JSON: {}", e)))?;

    config.validate()?;

    log::info!("Loaded tracker config from {}", path.display());
    Ok(config)
}

/**
 * Save configuration to disk atomically
 * Uses temporary file + rename to prevent corruption
 */
pub fn save_config(path: &Path, config: &TrackerConfig) -> Result<()> {
    config.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TrackerError::Config(format!("Failed to create config directory: {}", e)))?;
    }

    let json_str = serde_json::to_string_pretty(config)?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json_str)
        .map_err(|e| TrackerError::Config(format!("Failed to write temporary config file: {}", e)))?;

    fs::rename(&temp_path, path)
        .map_err(|e| TrackerError::Config(format!("Failed to save config file: {}", e)))?;

    log::info!("Saved tracker config to {}", path.display());
    Ok(())
}

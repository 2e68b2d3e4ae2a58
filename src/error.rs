/**
 * ============================================================================
 * ERROR MODULE
 * ============================================================================
 *
 * PURPOSE: Error taxonomy shared by the pipeline and the connection layer
 *
 * CLASSES:
 * - Config: integration mistakes, surfaced immediately
 * - Storage: snapshot persistence failures (quota, I/O)
 * - Network / Http / Socket / Timeout: transient transport failures
 * - Auth: credential rejected or unobtainable
 *
 * ============================================================================
 */

use thiserror::Error;

/// Failures raised by a [`crate::storage::Storage`] backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend refused the write because it would exceed its quota.
    #[error("Storage quota exceeded for '{key}': needed {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Errors that can occur anywhere in the tracker.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Invalid configuration. Not retried.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request could not be sent or the response could not be read.
    #[error("Network error: {0}")]
    Network(String),

    /// Server answered with a non-success status.
    #[error("Request to {url} failed with status {status}: {body}")]
    Http {
        url: String,
        status: u16,
        body: String,
    },

    /// Credential rejected by the server or unobtainable.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        TrackerError::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TrackerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TrackerError::Socket(err.to_string())
    }
}

impl TrackerError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::Network(_)
                | TrackerError::Socket(_)
                | TrackerError::NotConnected
                | TrackerError::Timeout(_)
        ) || matches!(self, TrackerError::Http { status, .. } if *status >= 500 || *status == 429)
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

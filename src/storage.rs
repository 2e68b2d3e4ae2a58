/**
 * ============================================================================
 * STORAGE MODULE
 * ============================================================================
 *
 * PURPOSE: Key/value slots for snapshots that must survive a restart
 *
 * SLOTS:
 * - queue snapshot (JSON array of events)
 * - token pair (JSON object)
 * - client fingerprint (JSON string)
 *
 * Every write replaces the whole slot. Readers treat a missing or
 * unreadable slot as empty.
 *
 * BACKENDS:
 * - FileStorage: one file per key, atomic writes (temp file + rename)
 * - MemoryStorage: in-process map, optional byte quota
 *
 * ============================================================================
 */

use crate::error::StorageError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A slot-based persistent store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/**
 * Directory-backed storage
 * Each key maps to {dir}/{key}.json
 */
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: Option<usize>,
}

impl FileStorage {
    /**
     * Open storage rooted at `dir`, creating it if needed
     */
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            log::info!("Created storage directory: {}", dir.display());
        }
        Ok(Self {
            dir,
            quota_bytes: None,
        })
    }

    /**
     * Open storage in the platform data directory
     * Falls back to the working directory when no data dir is known
     */
    pub fn in_data_dir(app_name: &str) -> Result<Self, StorageError> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(app_name))
    }

    /// Cap the combined size of all slots.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    fn used_bytes_excluding(&self, excluded: &Path) -> Result<usize, StorageError> {
        let mut total = 0usize;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path == excluded || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            total += fs::metadata(&path)?.len() as usize;
        }
        Ok(total)
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);

        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes_excluding(&path)?;
            let available = quota.saturating_sub(used);
            if value.len() > available {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed: value.len(),
                    available,
                });
            }
        }

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, value)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/**
 * In-process storage
 * Quota counts the byte length of every stored value
 */
#[derive(Default)]
pub struct MemoryStorage {
    slots: Mutex<HashMap<String, String>>,
    quota_bytes: Mutex<Option<usize>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            quota_bytes: Mutex::new(Some(quota_bytes)),
        }
    }

    /// Change or lift the quota at runtime.
    pub fn set_quota(&self, quota_bytes: Option<usize>) {
        *self.quota_bytes.lock().unwrap_or_else(|p| p.into_inner()) = quota_bytes;
    }

    pub fn used_bytes(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(String::len)
            .sum()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        Ok(slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let quota = *self.quota_bytes.lock().unwrap_or_else(|p| p.into_inner());
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(quota) = quota {
            let used: usize = slots
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let available = quota.saturating_sub(used);
            if value.len() > available {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed: value.len(),
                    available,
                });
            }
        }

        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.slots
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}

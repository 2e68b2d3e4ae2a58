/**
 * ============================================================================
 * TOKEN REGISTRY MODULE
 * ============================================================================
 *
 * PURPOSE: One TokenLifecycle per API endpoint, owned by the host
 *
 * SHARING:
 * - Everything talking to the same endpoint shares one lifecycle
 * - Endpoints are compared without a trailing '/'
 * - The host creates one registry and hands it to whatever needs tokens
 *
 * ============================================================================
 */

use crate::config::TrackerConfig;
use crate::connection::auth::TokenLifecycle;
use crate::error::Result;
use crate::lock;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct TokenRegistry {
    lifecycles: Mutex<HashMap<String, Arc<TokenLifecycle>>>,
}

fn normalize(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifecycle for `config.api_url`, created over HTTP on first use.
    pub fn get_or_create(
        &self,
        config: &TrackerConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<TokenLifecycle>> {
        let key = normalize(&config.api_url);
        let mut lifecycles = lock(&self.lifecycles);
        if let Some(existing) = lifecycles.get(&key) {
            return Ok(Arc::clone(existing));
        }

        log::info!("[TOKEN] Creating token lifecycle for {}", key);
        let lifecycle = Arc::new(TokenLifecycle::from_config(config, storage)?);
        lifecycles.insert(key, Arc::clone(&lifecycle));
        Ok(lifecycle)
    }

    /// Register a prebuilt lifecycle, replacing any previous one.
    pub fn insert(&self, endpoint: &str, lifecycle: Arc<TokenLifecycle>) {
        lock(&self.lifecycles).insert(normalize(endpoint), lifecycle);
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<TokenLifecycle>> {
        lock(&self.lifecycles).get(&normalize(endpoint)).cloned()
    }

    pub fn remove(&self, endpoint: &str) -> Option<Arc<TokenLifecycle>> {
        lock(&self.lifecycles).remove(&normalize(endpoint))
    }

    pub fn len(&self) -> usize {
        lock(&self.lifecycles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_same_endpoint_shares_lifecycle() {
        let registry = TokenRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        let config = TrackerConfig::default();
        let first = registry.get_or_create(&config, Arc::clone(&storage)).unwrap();

        let mut trailing = config.clone();
        trailing.api_url = format!("{}/", config.api_url);
        let second = registry.get_or_create(&trailing, Arc::clone(&storage)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut other = config.clone();
        other.api_url = "https://other.example/api".to_string();
        let third = registry.get_or_create(&other, storage).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&config.api_url).is_some());
        assert!(registry.get(&config.api_url).is_none());
    }

    #[test]
    fn test_fingerprint_shared_through_storage() {
        let registry = TokenRegistry::new();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let config = TrackerConfig::default();
        let first = registry.get_or_create(&config, Arc::clone(&storage)).unwrap();

        let fresh = TokenRegistry::new();
        let second = fresh.get_or_create(&config, storage).unwrap();
        assert_eq!(first.client_fingerprint(), second.client_fingerprint());
    }
}

/**
 * ============================================================================
 * TOKEN LIFECYCLE MODULE
 * ============================================================================
 *
 * PURPOSE: Obtain, renew and persist the credential pair used by the socket
 *
 * AUTHENTICATION FLOW:
 * 1. POST {endpoint}/token with {"client": "..."}
 *    -> {"access_token": "...", "refresh_token": "..."}
 * 2. POST {endpoint}/token/refresh with {"client": "...", "refresh_token": "..."}
 *    -> {"access_token": "..."}
 * 3. Pair mirrored to storage, reused on the next load
 *
 * TOKEN LIFECYCLE:
 * - Access tokens carry an `exp` claim (JWT payload, seconds)
 * - Tokens within the safety margin (30 s) of expiry count as expired
 * - Refresh first, full issue when refresh fails
 * - Fixed delay between attempts, bounded attempt count
 * - At most one issue/refresh request in flight: later callers await the
 *   same shared future
 *
 * ============================================================================
 */

use crate::config::{FINGERPRINT_STORAGE_KEY, TokenConfig, TrackerConfig};
use crate::error::{Result, TrackerError};
use crate::lock;
use crate::storage::Storage;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/**
 * Credential pair as persisted
 * access_token is dropped on invalidation while the refresh token survives
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/**
 * Response body from the issue endpoint
 */
#[derive(Debug, Clone, Deserialize)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    client: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    client: &'a str,
    refresh_token: &'a str,
}

/// Network side of token acquisition.
#[async_trait]
pub trait TokenApi: Send + Sync {
    async fn issue(&self, client: &str) -> Result<IssuedTokens>;
    async fn refresh(&self, client: &str, refresh_token: &str) -> Result<String>;
}

/**
 * Token endpoints over HTTP
 */
pub struct HttpTokenApi {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTokenApi {
    pub fn new(endpoint: &str, config: &TokenConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TrackerError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{}", self.endpoint, path);
        log::debug!("[TOKEN] Sending POST request to: {}", url);

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            if status == reqwest::StatusCode::UNAUTHORIZED {
                log::warn!("[TOKEN] Received 401 Unauthorized from {}", url);
            }
            return Err(TrackerError::Http {
                url,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl TokenApi for HttpTokenApi {
    async fn issue(&self, client: &str) -> Result<IssuedTokens> {
        self.post("/token", &IssueRequest { client }).await
    }

    async fn refresh(&self, client: &str, refresh_token: &str) -> Result<String> {
        let response: RefreshResponse = self
            .post(
                "/token/refresh",
                &RefreshRequest {
                    client,
                    refresh_token,
                },
            )
            .await?;
        Ok(response.access_token)
    }
}

/**
 * Read the `exp` claim of a JWT without verifying the signature
 * Returns None when the token is not a decodable JWT
 */
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let seconds = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    DateTime::from_timestamp(seconds, 0)
}

/// True when fewer than `margin` remain before the token's expiry claim.
pub fn is_token_near_expiration(token: &str, margin: std::time::Duration) -> bool {
    let Some(expires_at) = decode_expiry(token) else {
        return true;
    };
    let margin = chrono::Duration::milliseconds(margin.as_millis() as i64);
    expires_at - Utc::now() < margin
}

/**
 * Client fingerprint: configured value, else the persisted one, else a new
 * random id that is persisted for the next load
 */
pub fn resolve_client_fingerprint(configured: Option<&str>, storage: &dyn Storage) -> String {
    if let Some(fingerprint) = configured {
        return fingerprint.to_string();
    }

    if let Ok(Some(raw)) = storage.get(FINGERPRINT_STORAGE_KEY) {
        if let Ok(stored) = serde_json::from_str::<String>(&raw) {
            if !stored.is_empty() {
                return stored;
            }
        }
    }

    let fingerprint = Uuid::new_v4().to_string();
    match serde_json::to_string(&fingerprint) {
        Ok(json) => {
            if let Err(e) = storage.set(FINGERPRINT_STORAGE_KEY, &json) {
                log::warn!("[TOKEN] Failed to persist client fingerprint: {}", e);
            }
        }
        Err(e) => log::warn!("[TOKEN] Failed to serialize client fingerprint: {}", e),
    }
    fingerprint
}

type TokenRequest = Shared<BoxFuture<'static, Option<String>>>;

/// Everything an in-flight request needs, detached from `&self`.
#[derive(Clone)]
struct RequestContext {
    api: Arc<dyn TokenApi>,
    storage: Arc<dyn Storage>,
    config: TokenConfig,
    client: String,
    pair: Arc<Mutex<Option<TokenPair>>>,
}

impl RequestContext {
    fn store(&self, pair: TokenPair) {
        match serde_json::to_string(&pair) {
            Ok(json) => {
                if let Err(e) = self.storage.set(&self.config.storage_key, &json) {
                    log::warn!("[TOKEN] Failed to persist token pair: {}", e);
                }
            }
            Err(e) => log::warn!("[TOKEN] Failed to serialize token pair: {}", e),
        }
        *lock(&self.pair) = Some(pair);
    }

    async fn acquire(self) -> Option<String> {
        let attempts = self.config.retry_max_attempts.max(1);

        for attempt in 1..=attempts {
            let refresh_token = lock(&self.pair)
                .as_ref()
                .and_then(|p| p.refresh_token.clone());

            if let Some(refresh_token) = refresh_token {
                match self.api.refresh(&self.client, &refresh_token).await {
                    Ok(access_token) => {
                        log::info!("[TOKEN] Access token refreshed");
                        self.store(TokenPair {
                            access_token: Some(access_token.clone()),
                            refresh_token: Some(refresh_token),
                        });
                        return Some(access_token);
                    }
                    Err(e) => {
                        log::warn!("[TOKEN] Refresh failed, falling back to issue: {}", e);
                        if !e.is_transient() {
                            // Rejected refresh tokens are never sent again
                            if let Some(pair) = lock(&self.pair).as_mut() {
                                pair.refresh_token = None;
                            }
                        }
                    }
                }
            }

            match self.api.issue(&self.client).await {
                Ok(issued) => {
                    log::info!("[TOKEN] Obtained new token pair");
                    let access_token = issued.access_token.clone();
                    self.store(TokenPair {
                        access_token: Some(issued.access_token),
                        refresh_token: Some(issued.refresh_token),
                    });
                    return Some(access_token);
                }
                Err(e) => {
                    log::warn!(
                        "[TOKEN] Token issue failed (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        e
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        log::error!(
            "[TOKEN] Giving up after {} attempts, tracking unavailable",
            attempts
        );
        None
    }
}

/**
 * Owner of the credential pair
 * Shared through get_valid_access_token / is_request_in_progress /
 * is_near_expiration; renewal is single-flight
 */
pub struct TokenLifecycle {
    ctx: RequestContext,
    in_flight: Mutex<Option<TokenRequest>>,
}

impl TokenLifecycle {
    /**
     * Create lifecycle and load the last known pair from storage
     * Unreadable pair means no pair
     */
    pub fn new(
        api: Arc<dyn TokenApi>,
        storage: Arc<dyn Storage>,
        config: TokenConfig,
        client_fingerprint: String,
    ) -> Self {
        let pair = Self::load_pair(storage.as_ref(), &config.storage_key);
        Self {
            ctx: RequestContext {
                api,
                storage,
                config,
                client: client_fingerprint,
                pair: Arc::new(Mutex::new(pair)),
            },
            in_flight: Mutex::new(None),
        }
    }

    /**
     * Build against the HTTP token endpoints named in the tracker config
     */
    pub fn from_config(config: &TrackerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let api = HttpTokenApi::new(&config.api_url, &config.token)?;
        let fingerprint =
            resolve_client_fingerprint(config.client_fingerprint.as_deref(), storage.as_ref());
        Ok(Self::new(
            Arc::new(api),
            storage,
            config.token.clone(),
            fingerprint,
        ))
    }

    fn load_pair(storage: &dyn Storage, key: &str) -> Option<TokenPair> {
        match storage.get(key) {
            Ok(Some(raw)) => match serde_json::from_str::<TokenPair>(&raw) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    log::warn!("[TOKEN] Stored token pair is malformed, ignoring: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("[TOKEN] Failed to read stored token pair: {}", e);
                None
            }
        }
    }

    pub fn client_fingerprint(&self) -> &str {
        &self.ctx.client
    }

    /// Current pair, re-reading storage when memory holds none.
    pub fn current_pair(&self) -> Option<TokenPair> {
        let mut pair = lock(&self.ctx.pair);
        if pair.is_none() {
            *pair = Self::load_pair(self.ctx.storage.as_ref(), &self.ctx.config.storage_key);
        }
        pair.clone()
    }

    fn usable_access_token(&self) -> Option<String> {
        let token = self.current_pair()?.access_token?;
        if is_token_near_expiration(&token, self.ctx.config.safety_margin()) {
            None
        } else {
            Some(token)
        }
    }

    /**
     * Get an access token that is valid for at least the safety margin
     * Returns None when issue and refresh both failed every attempt
     */
    pub async fn get_valid_access_token(&self) -> Option<String> {
        if let Some(token) = self.usable_access_token() {
            log::debug!("[TOKEN] Using stored access token");
            return Some(token);
        }
        self.join_or_start().await
    }

    /**
     * Renew regardless of the current token's expiry
     * The current access token is discarded first
     */
    pub async fn force_refresh(&self) -> Option<String> {
        self.invalidate();
        self.join_or_start().await
    }

    async fn join_or_start(&self) -> Option<String> {
        let request = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.as_ref() {
                Some(request) if request.peek().is_none() => {
                    log::debug!("[TOKEN] Joining in-flight token request");
                    request.clone()
                }
                _ => {
                    log::info!("[TOKEN] Starting token request");
                    let request = self.ctx.clone().acquire().boxed().shared();
                    *in_flight = Some(request.clone());
                    request
                }
            }
        };

        let token = request.clone().await;

        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .as_ref()
            .map(|current| current.ptr_eq(&request))
            .unwrap_or(false)
        {
            *in_flight = None;
        }
        token
    }

    /// Whether an issue/refresh request is currently outstanding.
    pub fn is_request_in_progress(&self) -> bool {
        lock(&self.in_flight)
            .as_ref()
            .map(|request| request.peek().is_none())
            .unwrap_or(false)
    }

    /// True when there is no access token or it expires within the margin.
    pub fn is_near_expiration(&self) -> bool {
        match self.current_pair().and_then(|p| p.access_token) {
            Some(token) => is_token_near_expiration(&token, self.ctx.config.safety_margin()),
            None => true,
        }
    }

    /**
     * Forget the access token, keeping the refresh token
     * Called when the server rejected the credential
     */
    pub fn invalidate(&self) {
        log::warn!("[TOKEN] Invalidating access token");
        let mut pair = lock(&self.ctx.pair);
        if let Some(current) = pair.as_mut() {
            current.access_token = None;
            match serde_json::to_string(&*current) {
                Ok(json) => {
                    if let Err(e) = self.ctx.storage.set(&self.ctx.config.storage_key, &json) {
                        log::warn!("[TOKEN] Failed to persist invalidated pair: {}", e);
                    }
                }
                Err(e) => log::warn!("[TOKEN] Failed to serialize token pair: {}", e),
            }
        }
    }

    /// Drop the pair from memory and storage.
    pub fn clear(&self) {
        *lock(&self.ctx.pair) = None;
        if let Err(e) = self.ctx.storage.remove(&self.ctx.config.storage_key) {
            log::warn!("[TOKEN] Failed to remove stored token pair: {}", e);
        }
    }
}

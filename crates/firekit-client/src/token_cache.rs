//! Access token caching for the REST transport.
//!
//! - Refresh margin to avoid token expiry during requests
//! - Single-flight refresh so concurrent requests trigger one fetch
//! - Fallback to the current token when a refresh fails but it is still usable

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};

// =============================================================================
// Constants
// =============================================================================

/// Refresh tokens 60 seconds before expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// TTL assumed when the provider reports a nonsensical expiry.
const TOKEN_DEFAULT_TTL: Duration = Duration::from_secs(50 * 60);

/// OAuth scope for Firestore access.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

// =============================================================================
// Token sources
// =============================================================================

/// A freshly minted access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Something that can mint access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> FirestoreResult<AccessToken>;
}

/// Service account credentials via `gcp_auth`.
pub struct ServiceAccountSource {
    provider: Arc<dyn TokenProvider>,
}

impl ServiceAccountSource {
    /// Load the service account named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub fn from_env() -> FirestoreResult<Self> {
        let service_account = CustomServiceAccount::from_env().map_err(|e| {
            FirestoreError::auth_error(format!("Failed to load service account: {}", e))
        })?;

        match service_account {
            Some(sa) => Ok(Self {
                provider: Arc::new(sa),
            }),
            None => Err(FirestoreError::auth_error(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file.",
            )),
        }
    }
}

#[async_trait]
impl TokenSource for ServiceAccountSource {
    async fn fetch(&self) -> FirestoreResult<AccessToken> {
        let token = self
            .provider
            .token(&[FIRESTORE_SCOPE])
            .await
            .map_err(|e| FirestoreError::auth_error(format!("Failed to obtain auth token: {}", e)))?;

        Ok(AccessToken {
            value: token.as_str().to_string(),
            expires_at: token.expires_at(),
        })
    }
}

// =============================================================================
// Token Cache
// =============================================================================

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    /// Valid with the refresh margin applied.
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }

    /// Not yet expired, even if a refresh is due.
    fn is_usable(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Token cache shared by every pooled REST client.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    cache: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// Drop the cached token (e.g. after the server reports it expired).
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_token(&self) -> FirestoreResult<String> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh()) {
                return Ok(cached.access_token.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh()) {
            return Ok(cached.access_token.clone());
        }

        match self.source.fetch().await {
            Ok(token) => {
                let expires_at = expiry_instant(token.expires_at);
                *cache = Some(CachedToken {
                    access_token: token.value.clone(),
                    expires_at,
                });
                debug!("Refreshed Firestore access token");
                Ok(token.value)
            }
            Err(e) => match cache.as_ref().filter(|c| c.is_usable()) {
                Some(cached) => {
                    warn!("Token refresh failed, using existing token: {}", e);
                    Ok(cached.access_token.clone())
                }
                None => Err(e),
            },
        }
    }
}

fn expiry_instant(expires_at: DateTime<Utc>) -> Instant {
    let now = Utc::now();
    if expires_at <= now {
        // Forces a refresh on the next request.
        return Instant::now();
    }
    let ttl = (expires_at - now).to_std().unwrap_or(TOKEN_DEFAULT_TTL);
    Instant::now() + ttl
}

// =============================================================================
// Tests
// =============================================================================

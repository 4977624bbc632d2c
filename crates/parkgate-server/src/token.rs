use std::future::Future;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::GatewayError;

/// Tokens closer than this to expiry are refreshed before use.
pub const MIN_REMAINING_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    /// Unix seconds.
    expires_at: i64,
}

/// Access-token cache with single-flight refresh.
///
/// Readers take the fast path through the `RwLock`. A refresh holds the
/// `refresh` gate, so concurrent callers that all see a stale token wait for
/// one upstream fetch and then share its result.
pub struct TokenCache {
    slot: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
    persist_path: Option<PathBuf>,
}

impl TokenCache {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        let restored = persist_path.as_ref().and_then(|path| {
            let raw = std::fs::read_to_string(path).ok()?;
            match serde_json::from_str::<CachedToken>(&raw) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable token cache");
                    None
                }
            }
        });
        Self {
            slot: RwLock::new(restored),
            refresh: Mutex::new(()),
            persist_path,
        }
    }

    async fn fresh(&self) -> Option<String> {
        let now = Utc::now().timestamp();
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|t| t.expires_at - now > MIN_REMAINING_SECS)
            .map(|t| t.access_token.clone())
    }

    /// Returns a token with more than [`MIN_REMAINING_SECS`] left, calling
    /// `fetch` at most once across concurrent callers. `fetch` yields the
    /// token and its lifetime in seconds. A failed fetch leaves the cache
    /// untouched, so the next caller simply tries again.
    pub async fn acquire_with<F, Fut>(&self, fetch: F) -> Result<String, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, i64), GatewayError>>,
    {
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }
        let _gate = self.refresh.lock().await;
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let (access_token, expires_in) = fetch().await?;
        let entry = CachedToken {
            access_token: access_token.clone(),
            expires_at: Utc::now().timestamp() + expires_in,
        };
        debug!(expires_in, "access token refreshed");
        *self.slot.write().await = Some(entry.clone());
        self.persist(&entry).await;
        Ok(access_token)
    }

    /// Drops the cached token if it is still `stale`, forcing the next
    /// acquire to fetch. A token another caller already replaced is kept.
    pub async fn force_refresh(&self, stale: &str) {
        let mut slot = self.slot.write().await;
        if slot.as_ref().is_some_and(|t| t.access_token == stale) {
            *slot = None;
        }
    }

    async fn persist(&self, entry: &CachedToken) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let body = match serde_json::to_vec(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "token cache serialization failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(path, body).await {
            warn!(path = %path.display(), error = %e, "token cache write failed");
        }
    }
}

use std::sync::Arc;
use tokio::sync::RwLock;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory token slot with atomic swap, expiry and rotation tracking.
#[derive(Clone, Default)]
pub struct TokenCache {
    token: Arc<RwLock<Option<CachedToken>>>,
    last_rotated: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token unless it expires within `margin`.
    pub async fn get_fresh(&self, margin: Duration) -> Option<String> {
        let token = self.token.read().await;
        token
            .as_ref()
            .filter(|t| Utc::now() + margin < t.expires_at)
            .map(|t| t.value.clone())
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.token.read().await.as_ref().map(|t| t.expires_at)
    }

    /// Atomically swap the token and record rotation time.
    pub async fn swap(&self, new_token: String, expires_at: DateTime<Utc>) {
        let mut token = self.token.write().await;
        let rotated = token.as_ref().map(|t| t.value != new_token).unwrap_or(true);
        *token = Some(CachedToken {
            value: new_token,
            expires_at,
        });
        drop(token);

        if rotated {
            let now = Utc::now();
            *self.last_rotated.write().await = Some(now);
            debug!(rotated_at = %now, "cached token replaced");
        }
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }

    pub async fn last_rotated(&self) -> Option<DateTime<Utc>> {
        *self.last_rotated.read().await
    }

    /// Seconds the current value has been in use; 0 before the first swap.
    pub async fn age_seconds(&self) -> u64 {
        self.last_rotated()
            .await
            .map(|rotated| (Utc::now() - rotated).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

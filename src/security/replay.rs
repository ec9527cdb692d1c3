use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Outcome of [`ConsumedTokens::check_and_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// First use; the token is now recorded.
    Recorded,
    AlreadyConsumed,
    /// Every slot holds a token that could still validate.
    Full,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    expires_at: DateTime<Utc>,
    keep_until: DateTime<Utc>,
}

/// Set of consumed confirmation tokens, keyed by SHA-256 of the full token.
///
/// An entry is kept until both the retention window and the token's own
/// expiry have passed, so a live token is never forgotten.
#[derive(Debug, Clone)]
pub struct ConsumedTokens {
    retention: Duration,
    capacity: usize,
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Default for ConsumedTokens {
    fn default() -> Self {
        Self::new(
            std::time::Duration::from_secs(DEFAULT_RETENTION_SECS),
            DEFAULT_CAPACITY,
        )
    }
}

impl ConsumedTokens {
    pub fn new(retention: std::time::Duration, capacity: usize) -> Self {
        Self {
            retention: Duration::from_std(retention).unwrap_or(Duration::MAX),
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Atomically record `token`, which stops validating at `expires_at`.
    pub async fn check_and_store(&self, token: &str, expires_at: DateTime<Utc>) -> Consumption {
        let key = format!("{:x}", Sha256::digest(token.as_bytes()));
        let now = Utc::now();
        let mut map = self.inner.lock().await;
        if map.contains_key(&key) {
            return Consumption::AlreadyConsumed;
        }

        map.retain(|_, entry| entry.keep_until > now);
        if map.len() >= self.capacity {
            // only tokens that can no longer validate may be forgotten
            let evictable = map
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            match evictable {
                Some(k) => {
                    map.remove(&k);
                }
                None => return Consumption::Full,
            }
        }

        let keep_until = now
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .max(expires_at);
        map.insert(
            key,
            Entry {
                expires_at,
                keep_until,
            },
        );
        Consumption::Recorded
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_minutes(m: i64) -> DateTime<Utc> {
        Utc::now() + Duration::minutes(m)
    }

    #[tokio::test]
    async fn test_second_use_detected() {
        let used = ConsumedTokens::default();
        assert_eq!(used.check_and_store("payload|sig", in_minutes(5)).await, Consumption::Recorded);
        assert_eq!(
            used.check_and_store("payload|sig", in_minutes(5)).await,
            Consumption::AlreadyConsumed
        );
        assert_eq!(used.check_and_store("payload|other", in_minutes(5)).await, Consumption::Recorded);
        assert_eq!(used.len().await, 2);
    }

    #[tokio::test]
    async fn test_expired_entries_pruned_after_retention() {
        let used = ConsumedTokens::new(std::time::Duration::from_millis(30), 100);
        used.check_and_store("a", Utc::now()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        used.check_and_store("b", in_minutes(5)).await;
        assert_eq!(used.len().await, 1);
    }

    #[tokio::test]
    async fn test_live_token_outlives_retention() {
        let used = ConsumedTokens::new(std::time::Duration::from_millis(30), 100);
        assert_eq!(used.check_and_store("long", in_minutes(120)).await, Consumption::Recorded);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        used.check_and_store("other", in_minutes(5)).await;
        assert_eq!(
            used.check_and_store("long", in_minutes(120)).await,
            Consumption::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn test_full_set_refuses_instead_of_evicting_live_tokens() {
        let used = ConsumedTokens::new(std::time::Duration::from_secs(3600), 2);
        used.check_and_store("a", in_minutes(5)).await;
        used.check_and_store("b", in_minutes(5)).await;

        assert_eq!(used.check_and_store("c", in_minutes(5)).await, Consumption::Full);
        assert_eq!(used.len().await, 2);
        assert_eq!(used.check_and_store("a", in_minutes(5)).await, Consumption::AlreadyConsumed);
    }

    #[tokio::test]
    async fn test_full_set_evicts_expired_token() {
        let used = ConsumedTokens::new(std::time::Duration::from_secs(3600), 2);
        used.check_and_store("stale", Utc::now() - Duration::seconds(1)).await;
        used.check_and_store("live", in_minutes(5)).await;

        assert_eq!(used.check_and_store("new", in_minutes(5)).await, Consumption::Recorded);
        assert_eq!(used.len().await, 2);
        assert_eq!(used.check_and_store("live", in_minutes(5)).await, Consumption::AlreadyConsumed);
    }
}

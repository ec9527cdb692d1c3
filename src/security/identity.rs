use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AuthError, UpstreamError};

const ME_QUERY: &str = "query GetCurrentUser { me { id email organisation { id name } } }";

/// Verified caller identity. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub org_id: String,
    pub org_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: UserIdentity,
    expires_at: Instant,
}

/// TTL cache of resolved identities keyed by a fragment of the token.
#[derive(Debug, Clone)]
pub struct IdentityCache {
    ttl: Duration,
    capacity: usize,
    inner: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl IdentityCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, token: &str) -> Option<UserIdentity> {
        let key = cache_key(token);
        let mut map = self.inner.lock().await;
        match map.get(&key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                debug!(user_id = %entry.identity.user_id, "identity cache hit");
                Some(entry.identity.clone())
            }
            Some(_) => {
                map.remove(&key);
                debug!("identity cache entry expired");
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, token: &str, identity: UserIdentity) {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        // purge expired
        map.retain(|_, entry| entry.expires_at > now);
        if map.len() >= self.capacity {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            }
        }
        debug!(user_id = %identity.user_id, "identity cached");
        map.insert(
            cache_key(token),
            CacheEntry {
                identity,
                expires_at: now + self.ttl,
            },
        );
    }

    pub async fn invalidate(&self, token: &str) {
        if self.inner.lock().await.remove(&cache_key(token)).is_some() {
            debug!("identity cache entry invalidated");
        }
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
        debug!("identity cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// First and last eight characters; short tokens are hashed instead.
fn cache_key(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 16 {
        let digest = Sha256::digest(token.as_bytes());
        return format!("sha256:{:x}", digest);
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{}...{}", head, tail)
}

/// "Who am I" query against the upstream GraphQL API.
#[derive(Debug, Clone)]
pub struct UpstreamIdentityClient {
    endpoint: String,
    http_client: Client,
}

impl UpstreamIdentityClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }

    pub async fn fetch_identity(&self, token: &str) -> Result<UserIdentity, UpstreamError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "query": ME_QUERY }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        parse_me_response(&body)
    }
}

fn parse_me_response(body: &Value) -> Result<UserIdentity, UpstreamError> {
    if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            let first = errors[0]
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(UpstreamError::Response(format!("graphql error: {}", first)));
        }
    }

    let me = body
        .get("data")
        .and_then(|d| d.get("me"))
        .filter(|m| !m.is_null())
        .ok_or_else(|| UpstreamError::Response("missing 'me' field".to_string()))?;
    let org = me.get("organisation").unwrap_or(&Value::Null);

    let user_id = id_string(me.get("id"));
    let org_id = id_string(org.get("id"));
    let (Some(user_id), Some(org_id)) = (user_id, org_id) else {
        return Err(UpstreamError::Response(
            "missing user or organization id".to_string(),
        ));
    };

    Ok(UserIdentity {
        user_id,
        org_id,
        org_name: org
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("Unknown")
            .to_string(),
        email: me.get("email").and_then(|e| e.as_str()).map(str::to_string),
    })
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Cache-first bearer → identity resolution.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    client: UpstreamIdentityClient,
    cache: IdentityCache,
}

impl IdentityResolver {
    pub fn new(client: UpstreamIdentityClient, cache: IdentityCache) -> Self {
        Self { client, cache }
    }

    pub async fn resolve(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if let Some(identity) = self.cache.get(token).await {
            return Ok(identity);
        }

        match self.client.fetch_identity(token).await {
            Ok(identity) => {
                info!(
                    user_id = %identity.user_id,
                    org_id = %identity.org_id,
                    org_name = %identity.org_name,
                    "identity resolved"
                );
                self.cache.insert(token, identity.clone()).await;
                Ok(identity)
            }
            Err(err) => {
                warn!(error = %err, "identity verification failed");
                Err(AuthError::InvalidCredential(err))
            }
        }
    }

    pub async fn invalidate(&self, token: &str) {
        self.cache.invalidate(token).await;
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }
}

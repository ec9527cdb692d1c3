use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::oauth::OAuthClient;
use crate::auth::token_manager::TokenManager;
use crate::error::{AuthError, Result};
use crate::security::token_cache::TokenCache;

/// Where the gateway gets an upstream token when the request did not bring one.
#[derive(Clone)]
pub enum TokenProvider {
    /// One configured token for every request.
    Static(String),
    /// Per-principal delegated tokens.
    Delegated(TokenManager),
    /// A client-credentials token shared by the whole gateway.
    Service(ServiceToken),
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenProvider::{}", self.kind())
    }
}

impl TokenProvider {
    pub fn kind(&self) -> &'static str {
        match self {
            TokenProvider::Static(_) => "static",
            TokenProvider::Delegated(_) => "delegated",
            TokenProvider::Service(_) => "service",
        }
    }

    pub fn token_manager(&self) -> Option<&TokenManager> {
        match self {
            TokenProvider::Delegated(manager) => Some(manager),
            _ => None,
        }
    }

    /// `principal` is only consulted in delegated mode, where it is required.
    pub async fn token(&self, principal: Option<&str>) -> Result<String> {
        match self {
            TokenProvider::Static(token) => Ok(token.clone()),
            TokenProvider::Delegated(manager) => {
                let principal = principal.ok_or_else(|| {
                    AuthError::NotAuthenticated("no bearer token or principal on request".to_string())
                })?;
                manager.get_valid_token(principal).await
            }
            TokenProvider::Service(service) => service.token().await,
        }
    }
}

/// Client-credentials token kept in memory and renewed near expiry.
#[derive(Debug, Clone)]
pub struct ServiceToken {
    oauth: OAuthClient,
    cache: TokenCache,
    refresh_margin: Duration,
    renew_lock: Arc<Mutex<()>>,
}

impl ServiceToken {
    pub fn new(oauth: OAuthClient, refresh_threshold_secs: u64) -> Self {
        Self {
            oauth,
            cache: TokenCache::new(),
            refresh_margin: Duration::seconds(refresh_threshold_secs as i64),
            renew_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn token(&self) -> Result<String> {
        if let Some(token) = self.cache.get_fresh(self.refresh_margin).await {
            return Ok(token);
        }

        let _guard = self.renew_lock.lock().await;
        // another caller may have renewed while we waited
        if let Some(token) = self.cache.get_fresh(self.refresh_margin).await {
            return Ok(token);
        }

        debug!("requesting service token");
        let response = self.oauth.client_credentials().await?;
        let expires_at = response.expires_at(Utc::now())?;
        self.cache.swap(response.access_token.clone(), expires_at).await;
        info!(expires_at = %expires_at, "service token renewed");
        Ok(response.access_token)
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }
}

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::oauth::{DeviceAuthorization, OAuthClient, OAuthError, TokenResponse};
use crate::config::OAuthSettings;
use crate::error::{AuthError, Result, StorageError, UpstreamError};
use crate::security::audit_log::AuditLogger;
use crate::security::credential_store::CredentialStore;
use crate::security::identity::IdentityResolver;

const PENDING_LOGIN_TTL: Duration = Duration::from_secs(600);

/// Delegated token set, persisted as JSON through the credential store.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegatedTokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for DelegatedTokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedTokenSet")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl DelegatedTokenSet {
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Result<Self, UpstreamError> {
        let expires_at = response.expires_at(now)?;
        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            scope: response.scope,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: ChronoDuration) -> bool {
        now + threshold >= self.expires_at
    }
}

struct PendingLogin {
    state: String,
    code_verifier: String,
    issued_at: Instant,
}

impl PendingLogin {
    fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= PENDING_LOGIN_TTL
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PrincipalState {
    NoCredential,
    PendingExchange,
    Authenticated { expires_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginStart {
    pub authorization_url: String,
    pub state: String,
}

/// Expiry details for a principal, safe to show to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub principal: String,
    pub token_type: String,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
    pub is_valid: bool,
    pub has_refresh_token: bool,
}

/// Per-principal delegated token lifecycle.
#[derive(Clone)]
pub struct TokenManager {
    store: CredentialStore,
    oauth: OAuthClient,
    identity: Option<IdentityResolver>,
    refresh_threshold: ChronoDuration,
    allow_client_credentials: bool,
    pending: Arc<Mutex<HashMap<String, PendingLogin>>>,
    refresh_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    audit: AuditLogger,
}

impl TokenManager {
    pub fn new(store: CredentialStore, oauth: OAuthClient, settings: &OAuthSettings) -> Self {
        info!(
            refresh_threshold_secs = settings.refresh_threshold_secs,
            "token manager initialized"
        );
        Self {
            store,
            oauth,
            identity: None,
            refresh_threshold: ChronoDuration::seconds(settings.refresh_threshold_secs as i64),
            allow_client_credentials: settings.allow_client_credentials,
            pending: Arc::new(Mutex::new(HashMap::new())),
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
            audit: AuditLogger::new(),
        }
    }

    /// Cached identities of revoked tokens are dropped through this resolver.
    pub fn with_identity_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.identity = Some(resolver);
        self
    }

    /// Current access token for `principal`, refreshed first when close to expiry.
    pub async fn get_valid_token(&self, principal: &str) -> Result<String> {
        let lock = self.refresh_lock(principal).await;
        let _guard = lock.lock().await;

        let Some(tokens) = self.load(principal).await? else {
            return self.silent_login(principal).await;
        };

        let now = Utc::now();
        if !tokens.needs_refresh(now, self.refresh_threshold) {
            debug!(principal, expires_at = %tokens.expires_at, "using stored token");
            return Ok(tokens.access_token);
        }

        let Some(refresh_token) = tokens.refresh_token.clone() else {
            if !tokens.is_expired(now) {
                warn!(principal, "token near expiry and no refresh token available");
                return Ok(tokens.access_token);
            }
            if self.can_use_client_credentials() {
                return self.authenticate_service(principal).await;
            }
            self.discard(principal, &tokens).await?;
            return Err(AuthError::ReauthenticationRequired(principal.to_string()).into());
        };

        info!(principal, expires_at = %tokens.expires_at, "refreshing token");
        match self.oauth.refresh(&refresh_token).await {
            Ok(response) => {
                let mut refreshed = DelegatedTokenSet::from_response(response, Utc::now())?;
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = Some(refresh_token);
                }
                self.save(principal, &refreshed).await?;
                if let Some(identity) = &self.identity {
                    identity.invalidate(&tokens.access_token).await;
                }
                self.audit.token_refreshed(principal);
                Ok(refreshed.access_token)
            }
            Err(UpstreamError::OAuth(OAuthError::InvalidGrant(_))) => {
                self.audit.refresh_failed(principal, "invalid_grant");
                self.discard(principal, &tokens).await?;
                Err(AuthError::ReauthenticationRequired(principal.to_string()).into())
            }
            Err(err) => {
                self.audit.refresh_failed(principal, "upstream error");
                Err(err.into())
            }
        }
    }

    /// Start an authorization-code login. Replaces any earlier pending login.
    pub async fn initiate_login(&self, principal: &str) -> Result<LoginStart> {
        let request = self.oauth.authorization_url().map_err(UpstreamError::from)?;
        let mut pending = self.pending.lock().await;
        pending.retain(|_, p| !p.is_expired());
        pending.insert(
            principal.to_string(),
            PendingLogin {
                state: request.state.clone(),
                code_verifier: request.code_verifier,
                issued_at: Instant::now(),
            },
        );
        self.audit.login_started(principal, "authorization_code");

        Ok(LoginStart {
            authorization_url: request.url,
            state: request.state,
        })
    }

    pub async fn complete_login(&self, principal: &str, code: &str, state: &str) -> Result<TokenInfo> {
        let code_verifier = {
            let mut pending = self.pending.lock().await;
            let Some(login) = pending.get(principal) else {
                return Err(AuthError::NoPendingLogin.into());
            };
            if login.is_expired() {
                pending.remove(principal);
                return Err(AuthError::LoginExpired.into());
            }
            if !states_match(&login.state, state) {
                self.audit.state_mismatch(principal);
                return Err(AuthError::StateMismatch.into());
            }
            let verifier = login.code_verifier.clone();
            pending.remove(principal);
            verifier
        };

        let response = self.oauth.exchange_code(code, &code_verifier).await?;
        let tokens = DelegatedTokenSet::from_response(response, Utc::now())?;
        self.save(principal, &tokens).await?;
        self.audit.login_completed(principal, "authorization_code");
        Ok(self.describe(principal, &tokens))
    }

    /// Principal whose pending login issued `state`.
    pub async fn pending_principal(&self, state: &str) -> Option<String> {
        let pending = self.pending.lock().await;
        pending
            .iter()
            .find(|(_, login)| !login.is_expired() && states_match(&login.state, state))
            .map(|(principal, _)| principal.clone())
    }

    pub async fn start_device_login(&self, principal: &str) -> Result<DeviceAuthorization> {
        let device = self.oauth.start_device().await?;
        self.audit.login_started(principal, "device_code");
        Ok(device)
    }

    pub async fn complete_device_login(
        &self,
        principal: &str,
        device: &DeviceAuthorization,
    ) -> Result<TokenInfo> {
        let response = match self.oauth.poll_device(device).await {
            Ok(response) => response,
            Err(UpstreamError::OAuth(OAuthError::AccessDenied)) => {
                return Err(AuthError::DeviceFlow("access denied by user".to_string()).into())
            }
            Err(UpstreamError::OAuth(OAuthError::ExpiredToken)) => {
                return Err(AuthError::DeviceFlow("device code expired".to_string()).into())
            }
            Err(err) => return Err(err.into()),
        };
        let tokens = DelegatedTokenSet::from_response(response, Utc::now())?;
        self.save(principal, &tokens).await?;
        self.audit.login_completed(principal, "device_code");
        Ok(self.describe(principal, &tokens))
    }

    /// Client-credentials grant stored under `principal`.
    pub async fn authenticate_service(&self, principal: &str) -> Result<String> {
        let response = self.oauth.client_credentials().await?;
        let tokens = DelegatedTokenSet::from_response(response, Utc::now())?;
        self.save(principal, &tokens).await?;
        self.audit.login_completed(principal, "client_credentials");
        Ok(tokens.access_token)
    }

    pub async fn is_authenticated(&self, principal: &str) -> Result<bool> {
        Ok(self
            .load(principal)
            .await?
            .map(|t| !t.is_expired(Utc::now()) || t.refresh_token.is_some())
            .unwrap_or(false))
    }

    pub async fn state(&self, principal: &str) -> Result<PrincipalState> {
        if let Some(tokens) = self.load(principal).await? {
            if !tokens.is_expired(Utc::now()) || tokens.refresh_token.is_some() {
                return Ok(PrincipalState::Authenticated {
                    expires_at: tokens.expires_at,
                });
            }
        }
        let pending = self.pending.lock().await;
        match pending.get(principal) {
            Some(login) if !login.is_expired() => Ok(PrincipalState::PendingExchange),
            _ => Ok(PrincipalState::NoCredential),
        }
    }

    pub async fn token_info(&self, principal: &str) -> Result<Option<TokenInfo>> {
        Ok(self
            .load(principal)
            .await?
            .map(|tokens| self.describe(principal, &tokens)))
    }

    /// Returns whether a stored token set was removed.
    pub async fn logout(&self, principal: &str) -> Result<bool> {
        self.pending.lock().await.remove(principal);

        if let Some(identity) = &self.identity {
            match self.load(principal).await {
                Ok(Some(tokens)) => identity.invalidate(&tokens.access_token).await,
                Ok(None) => {}
                Err(err) => warn!(principal, error = %err, "could not read tokens during logout"),
            }
        }

        let removed = self.store.delete_token_set(principal).await?;
        self.audit.logout(principal, removed);
        Ok(removed)
    }

    pub async fn list_authenticated_principals(&self) -> Result<Vec<String>> {
        Ok(self.store.list_principals().await?)
    }

    fn can_use_client_credentials(&self) -> bool {
        self.allow_client_credentials && self.oauth.supports_client_credentials()
    }

    async fn silent_login(&self, principal: &str) -> Result<String> {
        if self.can_use_client_credentials() {
            debug!(principal, "no stored token, using client credentials");
            return self.authenticate_service(principal).await;
        }
        Err(AuthError::NotAuthenticated(format!("no credential for {}, log in first", principal)).into())
    }

    async fn discard(&self, principal: &str, tokens: &DelegatedTokenSet) -> Result<()> {
        self.store.delete_token_set(principal).await?;
        if let Some(identity) = &self.identity {
            identity.invalidate(&tokens.access_token).await;
        }
        Ok(())
    }

    async fn refresh_lock(&self, principal: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        // a lock only the map references has no waiter or holder
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(principal.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, principal: &str) -> Result<Option<DelegatedTokenSet>, StorageError> {
        let Some(raw) = self.store.get_token_set(principal).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| StorageError::Corrupt(format!("delegated token set for {}", principal)))
    }

    async fn save(&self, principal: &str, tokens: &DelegatedTokenSet) -> Result<(), StorageError> {
        let raw = serde_json::to_string(tokens)
            .map_err(|_| StorageError::Corrupt(format!("delegated token set for {}", principal)))?;
        self.store.store_token_set(principal, &raw).await
    }

    fn describe(&self, principal: &str, tokens: &DelegatedTokenSet) -> TokenInfo {
        let now = Utc::now();
        TokenInfo {
            principal: principal.to_string(),
            token_type: tokens.token_type.clone(),
            scope: tokens.scope.clone(),
            expires_at: tokens.expires_at,
            expires_in_seconds: (tokens.expires_at - now).num_seconds().max(0),
            is_valid: !tokens.is_expired(now),
            has_refresh_token: tokens.refresh_token.is_some(),
        }
    }
}

fn states_match(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

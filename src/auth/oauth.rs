use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::OAuthSettings;
use crate::error::{ConfigError, UpstreamError};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_EXPIRES_IN: i64 = 3600;
const MAX_EXPIRES_IN: i64 = 366 * 24 * 3600;
const DEFAULT_DEVICE_INTERVAL: u64 = 5;
const SLOW_DOWN_STEP: u64 = 5;

/// RFC 6749 / RFC 8628 error codes returned by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    #[error("authorization_pending")]
    AuthorizationPending,

    #[error("slow_down")]
    SlowDown,

    #[error("expired_token")]
    ExpiredToken,

    #[error("access_denied")]
    AccessDenied,

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("{error}: {description}")]
    Other { error: String, description: String },
}

impl OAuthError {
    fn from_body(body: ErrorBody) -> Self {
        let description = body.error_description.unwrap_or_default();
        match body.error.as_str() {
            "invalid_grant" => OAuthError::InvalidGrant(description),
            "authorization_pending" => OAuthError::AuthorizationPending,
            "slow_down" => OAuthError::SlowDown,
            "expired_token" => OAuthError::ExpiredToken,
            "access_denied" => OAuthError::AccessDenied,
            _ => OAuthError::Other {
                error: body.error,
                description,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

impl TokenResponse {
    pub fn expires_in_secs(&self) -> i64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)
    }

    /// Absolute expiry. Lifetimes above a year are capped; negative ones are rejected.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, UpstreamError> {
        let secs = self.expires_in_secs();
        if secs < 0 {
            return Err(UpstreamError::Response(format!("negative expires_in: {}", secs)));
        }
        if secs > MAX_EXPIRES_IN {
            warn!(expires_in = secs, "capping token lifetime");
        }
        TimeDelta::try_seconds(secs.min(MAX_EXPIRES_IN))
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| UpstreamError::Response(format!("expires_in out of range: {}", secs)))
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Redirect target plus the secrets needed to finish the exchange.
#[derive(Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

impl std::fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    DEFAULT_DEVICE_INTERVAL
}

/// Random PKCE verifier (43 url-safe chars) and its S256 challenge.
pub fn pkce_pair() -> (String, String) {
    let verifier = random_urlsafe(32);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

pub fn random_state() -> String {
    random_urlsafe(16)
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Client for the authorization server's authorize, token and device endpoints.
#[derive(Clone)]
pub struct OAuthClient {
    settings: OAuthSettings,
    authorization_endpoint: Option<Url>,
    token_endpoint: Url,
    device_endpoint: Option<Url>,
    client_id: String,
    http_client: Client,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl OAuthClient {
    pub fn new(settings: &OAuthSettings, timeout: Duration) -> Result<Self, ConfigError> {
        let token_endpoint = parse_url("OAUTH_TOKEN_URL", settings.token_endpoint.as_deref())?;
        let authorization_endpoint = parse_optional_url(
            "OAUTH_AUTHORIZATION_URL",
            settings.authorization_endpoint.as_deref(),
        )?;
        let device_endpoint =
            parse_optional_url("OAUTH_DEVICE_URL", settings.device_authorization_endpoint.as_deref())?;
        let client_id = settings
            .client_id
            .clone()
            .ok_or(ConfigError::Missing("OAUTH_CLIENT_ID"))?;
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                name: "REQUEST_TIMEOUT_SECS",
                reason: e.to_string(),
            })?;

        Ok(Self {
            settings: settings.clone(),
            authorization_endpoint,
            token_endpoint,
            device_endpoint,
            client_id,
            http_client,
        })
    }

    pub fn supports_client_credentials(&self) -> bool {
        self.settings.client_secret.is_some()
    }

    /// Build the authorization URL with a fresh `state` and PKCE S256 challenge.
    pub fn authorization_url(&self) -> Result<AuthorizationRequest, OAuthError> {
        let mut url = self
            .authorization_endpoint
            .clone()
            .ok_or(OAuthError::NotConfigured("OAUTH_AUTHORIZATION_URL"))?;
        let state = random_state();
        let (code_verifier, challenge) = pkce_pair();

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("scope", &self.settings.scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            code_verifier,
        })
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, UpstreamError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        self.token_request(&form).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, UpstreamError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = self.settings.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        self.token_request(&form).await
    }

    pub async fn client_credentials(&self) -> Result<TokenResponse, UpstreamError> {
        let secret = self
            .settings
            .client_secret
            .as_deref()
            .ok_or(OAuthError::NotConfigured("OAUTH_CLIENT_SECRET"))?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", secret),
            ("scope", self.settings.scope.as_str()),
        ];
        self.token_request(&form).await
    }

    pub async fn start_device(&self) -> Result<DeviceAuthorization, UpstreamError> {
        let endpoint = self
            .device_endpoint
            .clone()
            .ok_or(OAuthError::NotConfigured("OAUTH_DEVICE_URL"))?;
        let form = [
            ("client_id", self.client_id.as_str()),
            ("scope", self.settings.scope.as_str()),
        ];
        let response = self.http_client.post(endpoint).form(&form).send().await?;
        let device: DeviceAuthorization = decode(response).await?;
        info!(
            verification_uri = %device.verification_uri,
            expires_in = device.expires_in,
            "device authorization started"
        );
        Ok(device)
    }

    /// One token request for a device code; pending states come back as errors.
    pub async fn poll_device_once(&self, device_code: &str) -> Result<TokenResponse, UpstreamError> {
        let form = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("device_code", device_code),
            ("client_id", self.client_id.as_str()),
        ];
        self.token_request(&form).await
    }

    /// Poll until the user approves, denies, or the code expires.
    pub async fn poll_device(
        &self,
        device: &DeviceAuthorization,
    ) -> Result<TokenResponse, UpstreamError> {
        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = device.interval;

        loop {
            if Instant::now() >= deadline {
                return Err(OAuthError::ExpiredToken.into());
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;

            match self.poll_device_once(&device.device_code).await {
                Ok(tokens) => return Ok(tokens),
                Err(UpstreamError::OAuth(OAuthError::AuthorizationPending)) => {
                    debug!("device authorization pending");
                }
                Err(UpstreamError::OAuth(OAuthError::SlowDown)) => {
                    interval += SLOW_DOWN_STEP;
                    debug!(interval, "device polling slowed down");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, UpstreamError> {
        let response = self
            .http_client
            .post(self.token_endpoint.clone())
            .form(form)
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, UpstreamError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Response(format!("undecodable token response: {}", e)));
    }

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => {
            let err = OAuthError::from_body(err);
            if !matches!(err, OAuthError::AuthorizationPending | OAuthError::SlowDown) {
                warn!(status = status.as_u16(), error = %err, "authorization server rejected request");
            }
            Err(err.into())
        }
        Err(_) => Err(UpstreamError::Status(status.as_u16())),
    }
}

fn parse_optional_url(name: &'static str, raw: Option<&str>) -> Result<Option<Url>, ConfigError> {
    raw.map(|r| parse_url(name, Some(r))).transpose()
}

fn parse_url(name: &'static str, raw: Option<&str>) -> Result<Url, ConfigError> {
    let raw = raw.ok_or(ConfigError::Missing(name))?;
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

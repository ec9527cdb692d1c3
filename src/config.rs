use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Single bearer token from configuration.
    Static,
    /// Per-principal delegated tokens from the identity provider.
    #[default]
    Oauth2,
    /// One service token from the client-credentials grant.
    #[serde(rename = "client_credentials")]
    ClientCredentials,
}

impl std::str::FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(AuthMethod::Static),
            "oauth2" | "oauth" => Ok(AuthMethod::Oauth2),
            "client_credentials" | "service" => Ok(AuthMethod::ClientCredentials),
            other => Err(ConfigError::Invalid {
                name: "AUTH_METHOD",
                reason: format!("unknown auth method '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub device_authorization_endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub use_device_code_flow: bool,
    #[serde(default)]
    pub allow_client_credentials: bool,
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            authorization_endpoint: None,
            token_endpoint: None,
            device_authorization_endpoint: None,
            client_id: None,
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            scope: default_scope(),
            use_device_code_flow: false,
            allow_client_credentials: false,
            refresh_threshold_secs: default_refresh_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Base64 AES-256 key for credentials at rest.
    pub encryption_key: Option<String>,
    pub confirmation_secret: Option<String>,
    #[serde(default = "default_confirmation_expiry_minutes")]
    pub confirmation_expiry_minutes: i64,
    /// Most consumed confirmation tokens remembered at once.
    #[serde(default = "default_confirmation_replay_capacity")]
    pub confirmation_replay_capacity: usize,
    #[serde(default = "default_identity_cache_ttl_secs")]
    pub identity_cache_ttl_secs: u64,
    #[serde(default = "default_identity_cache_capacity")]
    pub identity_cache_capacity: usize,
    #[serde(default = "default_upstream_api_url")]
    pub upstream_api_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub auth_method: AuthMethod,
    pub static_token: Option<String>,
    #[serde(default)]
    pub oauth: OAuthSettings,
}

fn default_database_path() -> String {
    "data/tokens.db".to_string()
}
fn default_confirmation_expiry_minutes() -> i64 {
    5
}
fn default_confirmation_replay_capacity() -> usize {
    10_000
}
fn default_identity_cache_ttl_secs() -> u64 {
    300
}
fn default_identity_cache_capacity() -> usize {
    10_000
}
fn default_upstream_api_url() -> String {
    "http://localhost:8080/graphql".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_redirect_uri() -> String {
    "http://localhost:8765/auth/callback".to_string()
}
fn default_scope() -> String {
    "openid profile email offline_access".to_string()
}
fn default_refresh_threshold_secs() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            encryption_key: None,
            confirmation_secret: None,
            confirmation_expiry_minutes: default_confirmation_expiry_minutes(),
            confirmation_replay_capacity: default_confirmation_replay_capacity(),
            identity_cache_ttl_secs: default_identity_cache_ttl_secs(),
            identity_cache_capacity: default_identity_cache_capacity(),
            upstream_api_url: default_upstream_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
            auth_method: AuthMethod::default(),
            static_token: None,
            oauth: OAuthSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        Ok(settings)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut s = Settings::default();

        if let Some(v) = get("TOKEN_DB_PATH") {
            s.database_path = v;
        }
        s.encryption_key = get("TOKEN_ENCRYPTION_KEY");
        s.confirmation_secret = get("CONFIRMATION_SECRET");
        if let Some(v) = get("CONFIRMATION_EXPIRY_MINUTES") {
            s.confirmation_expiry_minutes = parse_num("CONFIRMATION_EXPIRY_MINUTES", &v)?;
        }
        if let Some(v) = get("CONFIRMATION_REPLAY_CAPACITY") {
            s.confirmation_replay_capacity = parse_num("CONFIRMATION_REPLAY_CAPACITY", &v)?;
        }
        if let Some(v) = get("IDENTITY_CACHE_TTL_SECS") {
            s.identity_cache_ttl_secs = parse_num("IDENTITY_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = get("IDENTITY_CACHE_CAPACITY") {
            s.identity_cache_capacity = parse_num("IDENTITY_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = get("UPSTREAM_API_URL") {
            s.upstream_api_url = v;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_SECS") {
            s.request_timeout_secs = parse_num("REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("AUTH_METHOD") {
            s.auth_method = v.parse()?;
        }
        s.static_token = get("UPSTREAM_API_TOKEN");

        let o = &mut s.oauth;
        o.authorization_endpoint = get("OAUTH_AUTHORIZATION_URL");
        o.token_endpoint = get("OAUTH_TOKEN_URL");
        o.device_authorization_endpoint = get("OAUTH_DEVICE_URL");
        o.client_id = get("OAUTH_CLIENT_ID");
        o.client_secret = get("OAUTH_CLIENT_SECRET");
        if let Some(v) = get("OAUTH_REDIRECT_URI") {
            o.redirect_uri = v;
        }
        if let Some(v) = get("OAUTH_SCOPE") {
            o.scope = v;
        }
        if let Some(v) = get("OAUTH_USE_DEVICE_CODE") {
            o.use_device_code_flow = parse_bool(&v);
        }
        if let Some(v) = get("OAUTH_ALLOW_CLIENT_CREDENTIALS") {
            o.allow_client_credentials = parse_bool(&v);
        }
        if let Some(v) = get("OAUTH_REFRESH_THRESHOLD_SECS") {
            o.refresh_threshold_secs = parse_num("OAUTH_REFRESH_THRESHOLD_SECS", &v)?;
        }

        Ok(s)
    }

    /// Check that the selected auth method has everything it needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.auth_method {
            AuthMethod::Static => {
                if self.static_token.is_none() {
                    return Err(ConfigError::Missing("UPSTREAM_API_TOKEN"));
                }
            }
            AuthMethod::Oauth2 => {
                let o = &self.oauth;
                if o.client_id.is_none() {
                    return Err(ConfigError::Missing("OAUTH_CLIENT_ID"));
                }
                if o.token_endpoint.is_none() {
                    return Err(ConfigError::Missing("OAUTH_TOKEN_URL"));
                }
                if o.authorization_endpoint.is_none() {
                    return Err(ConfigError::Missing("OAUTH_AUTHORIZATION_URL"));
                }
                if o.client_secret.is_none() && !o.use_device_code_flow {
                    return Err(ConfigError::Invalid {
                        name: "OAUTH_CLIENT_SECRET",
                        reason: "oauth2 requires a client secret or OAUTH_USE_DEVICE_CODE=true"
                            .to_string(),
                    });
                }
                if o.use_device_code_flow && o.device_authorization_endpoint.is_none() {
                    return Err(ConfigError::Missing("OAUTH_DEVICE_URL"));
                }
                if o.allow_client_credentials && o.client_secret.is_none() {
                    return Err(ConfigError::Invalid {
                        name: "OAUTH_ALLOW_CLIENT_CREDENTIALS",
                        reason: "client credentials require OAUTH_CLIENT_SECRET".to_string(),
                    });
                }
            }
            AuthMethod::ClientCredentials => {
                let o = &self.oauth;
                if o.client_id.is_none() {
                    return Err(ConfigError::Missing("OAUTH_CLIENT_ID"));
                }
                if o.client_secret.is_none() {
                    return Err(ConfigError::Missing("OAUTH_CLIENT_SECRET"));
                }
                if o.token_endpoint.is_none() {
                    return Err(ConfigError::Missing("OAUTH_TOKEN_URL"));
                }
            }
        }
        if self.identity_cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "IDENTITY_CACHE_CAPACITY",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }
}

fn parse_num<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| ConfigError::Invalid {
        name,
        reason: format!("'{}' is not a number", raw),
    })
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

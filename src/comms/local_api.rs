use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::oauth::OAuthClient;
use crate::auth::provider::{ServiceToken, TokenProvider};
use crate::auth::token_manager::TokenManager;
use crate::comms::context_layer;
use crate::config::{AuthMethod, Settings};
use crate::error::{AuthError, ConfigError, GatewayError};
use crate::security::audit_log::AuditLogger;
use crate::security::confirmation::ConfirmationService;
use crate::security::credential_store::CredentialStore;
use crate::security::crypto::TokenCipher;
use crate::security::identity::{IdentityCache, IdentityResolver, UpstreamIdentityClient};
use crate::security::replay::{ConsumedTokens, DEFAULT_RETENTION_SECS};
use crate::security::request_context;

pub type SharedState = Arc<AppState>;

const DELETE_CREDENTIAL_ACTION: &str = "delete_credential";

#[derive(Debug, Clone)]
pub struct AppState {
    pub store: CredentialStore,
    pub identity: IdentityResolver,
    pub provider: TokenProvider,
    pub confirmation: ConfirmationService,
    pub audit: AuditLogger,
}

impl AppState {
    /// Construct every shared component from settings.
    pub async fn build(settings: &Settings) -> Result<Self, GatewayError> {
        settings.validate()?;

        let cipher = TokenCipher::from_config(settings.encryption_key.as_deref())?;
        let store = CredentialStore::open(&settings.database_path, cipher).await?;

        let client = UpstreamIdentityClient::new(&settings.upstream_api_url, settings.request_timeout())
            .map_err(|e| ConfigError::Invalid {
                name: "UPSTREAM_API_URL",
                reason: e.to_string(),
            })?;
        let identity = IdentityResolver::new(
            client,
            IdentityCache::new(settings.identity_cache_ttl(), settings.identity_cache_capacity),
        );

        let provider = match settings.auth_method {
            AuthMethod::Static => TokenProvider::Static(
                settings
                    .static_token
                    .clone()
                    .ok_or(ConfigError::Missing("UPSTREAM_API_TOKEN"))?,
            ),
            AuthMethod::Oauth2 => {
                let oauth = OAuthClient::new(&settings.oauth, settings.request_timeout())?;
                TokenProvider::Delegated(
                    TokenManager::new(store.clone(), oauth, &settings.oauth)
                        .with_identity_resolver(identity.clone()),
                )
            }
            AuthMethod::ClientCredentials => {
                let oauth = OAuthClient::new(&settings.oauth, settings.request_timeout())?;
                TokenProvider::Service(ServiceToken::new(oauth, settings.oauth.refresh_threshold_secs))
            }
        };

        let confirmation = ConfirmationService::new(
            settings.confirmation_secret.as_deref(),
            settings.confirmation_expiry_minutes,
        )
        .with_consumed_set(ConsumedTokens::new(
            std::time::Duration::from_secs(DEFAULT_RETENTION_SECS),
            settings.confirmation_replay_capacity,
        ));

        info!(provider = provider.kind(), "gateway state initialized");
        Ok(Self {
            store,
            identity,
            provider,
            confirmation,
            audit: AuditLogger::new(),
        })
    }

    pub fn new(
        store: CredentialStore,
        identity: IdentityResolver,
        provider: TokenProvider,
        confirmation: ConfirmationService,
    ) -> Self {
        Self {
            store,
            identity,
            provider,
            confirmation,
            audit: AuditLogger::new(),
        }
    }

    pub async fn shutdown(&self) {
        self.identity.clear().await;
        self.store.close().await;
    }
}

#[derive(Deserialize)]
pub struct PrincipalQuery {
    pub principal: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Deserialize)]
pub struct LogoutRequest {
    pub principal: String,
}

#[derive(Deserialize)]
pub struct StoreCredentialRequest {
    pub org_name: String,
    pub token: String,
}

#[derive(Deserialize)]
pub struct ConfirmQuery {
    pub confirmation_token: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn delegated_login_disabled() -> Response {
    error_response(StatusCode::NOT_FOUND, "delegated login is not enabled")
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

// Start authorization-code login: redirect to the identity provider
async fn login(
    State(state): State<SharedState>,
    Query(query): Query<PrincipalQuery>,
) -> Result<Response, GatewayError> {
    let Some(manager) = state.provider.token_manager() else {
        return Ok(delegated_login_disabled());
    };
    let start = manager.initiate_login(&query.principal).await?;
    debug!(principal = %query.principal, "redirecting to authorization endpoint");
    Ok(Redirect::to(&start.authorization_url).into_response())
}

// Redirect target of the identity provider
async fn callback(
    State(state): State<SharedState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, GatewayError> {
    let Some(manager) = state.provider.token_manager() else {
        return Ok(delegated_login_disabled());
    };
    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        state.audit.identity_rejected(&error);
        let message = format!("authorization failed: {} {}", error, description);
        return Ok(error_response(StatusCode::UNAUTHORIZED, message.trim_end()));
    }
    let (Some(code), Some(oauth_state)) = (query.code, query.state) else {
        return Ok(error_response(StatusCode::BAD_REQUEST, "missing code or state"));
    };

    let principal = manager
        .pending_principal(&oauth_state)
        .await
        .ok_or(AuthError::NoPendingLogin)?;
    let info = manager.complete_login(&principal, &code, &oauth_state).await?;
    Ok(Json(json!({"status": "authenticated", "token": info})).into_response())
}

async fn logout(
    State(state): State<SharedState>,
    Json(req): Json<LogoutRequest>,
) -> Result<Response, GatewayError> {
    let Some(manager) = state.provider.token_manager() else {
        return Ok(delegated_login_disabled());
    };
    let removed = manager.logout(&req.principal).await?;
    Ok(Json(json!({"principal": req.principal, "logged_out": removed})).into_response())
}

async fn status(
    State(state): State<SharedState>,
    Query(query): Query<PrincipalQuery>,
) -> Result<Response, GatewayError> {
    let Some(manager) = state.provider.token_manager() else {
        return Ok(delegated_login_disabled());
    };
    let principal_state = manager.state(&query.principal).await?;
    let token = manager.token_info(&query.principal).await?;
    Ok(Json(json!({
        "principal": query.principal,
        "status": principal_state,
        "token": token,
    }))
    .into_response())
}

async fn principals(State(state): State<SharedState>) -> Result<Response, GatewayError> {
    let Some(manager) = state.provider.token_manager() else {
        return Ok(delegated_login_disabled());
    };
    let principals = manager.list_authenticated_principals().await?;
    Ok(Json(json!({"principals": principals})).into_response())
}

// ------- context-protected routes --------

async fn me() -> Result<Response, GatewayError> {
    let ctx = request_context::get();
    let identity = ctx
        .user_identity
        .ok_or_else(|| AuthError::NotAuthenticated("no identity on request".to_string()))?;
    let orgs: Vec<&String> = ctx.user_tokens.keys().collect();
    Ok(Json(json!({
        "user_id": identity.user_id,
        "org_id": identity.org_id,
        "org_name": identity.org_name,
        "email": identity.email,
        "orgs": orgs,
    }))
    .into_response())
}

fn current_user_id() -> Result<String, GatewayError> {
    request_context::current_user()
        .map(|u| u.user_id)
        .ok_or_else(|| AuthError::NotAuthenticated("no identity on request".to_string()).into())
}

async fn list_credentials(State(state): State<SharedState>) -> Result<Response, GatewayError> {
    let user_id = current_user_id()?;
    let orgs = state.store.list_orgs(&user_id).await?;
    Ok(Json(json!({"user_id": user_id, "orgs": orgs})).into_response())
}

async fn store_credential(
    State(state): State<SharedState>,
    Json(req): Json<StoreCredentialRequest>,
) -> Result<Response, GatewayError> {
    let user_id = current_user_id()?;
    if req.org_name.trim().is_empty() || req.token.trim().is_empty() {
        return Ok(error_response(StatusCode::BAD_REQUEST, "org_name and token are required"));
    }
    state.store.store(&user_id, &req.org_name, &req.token).await?;
    state.audit.credential_stored(&user_id, &req.org_name);
    Ok((
        StatusCode::CREATED,
        Json(json!({"org_name": req.org_name, "stored": true})),
    )
        .into_response())
}

// Two-step delete: without a confirmation token a preview is returned
async fn delete_credential(
    State(state): State<SharedState>,
    Path(org): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> Result<Response, GatewayError> {
    let user_id = current_user_id()?;
    let expected = json!({"user_id": user_id, "org_name": org});

    let Some(token) = query.confirmation_token else {
        let orgs = state.store.list_orgs(&user_id).await?;
        if !orgs.contains(&org) {
            return Ok(error_response(StatusCode::NOT_FOUND, "no credential for this organization"));
        }
        let token_info = state
            .confirmation
            .generate(DELETE_CREDENTIAL_ACTION, expected, None);
        let preview = state.confirmation.create_preview_response(
            "delete",
            vec![json!({"org_name": org})],
            "credentials",
            vec!["The stored credential will be removed permanently".to_string()],
            &token_info,
        );
        return Ok((StatusCode::ACCEPTED, Json(preview)).into_response());
    };

    let confirmed = state.confirmation.validate(&token).await?;
    if confirmed.action != DELETE_CREDENTIAL_ACTION || confirmed.data != expected {
        state.audit.confirmation_rejected("token issued for a different operation");
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "confirmation token does not match this operation",
        ));
    }

    let removed = state.store.delete(&user_id, &org).await?;
    if removed {
        state.audit.credential_deleted(&user_id, &org);
    }
    Ok(Json(json!({"org_name": org, "deleted": removed})).into_response())
}

pub fn create_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/api/v1/me", get(me))
        .route(
            "/api/v1/credentials",
            get(list_credentials).post(store_credential),
        )
        .route("/api/v1/credentials/{org}", delete(delete_credential))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            context_layer::inject_context,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/logout", post(logout))
        .route("/auth/status", get(status))
        .route("/auth/principals", get(principals))
        .merge(protected)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let state = Arc::new(state);
    let app = create_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future()
        .await?;

    state.shutdown().await;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::comms::local_api::SharedState;
use crate::error::GatewayError;
use crate::security::request_context;

pub const PRINCIPAL_HEADER: &str = "x-principal";

// Bearer from the Authorization header; anything else is treated as absent
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn principal(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

/// Resolve the caller and run the rest of the request inside a populated
/// request context.
pub async fn inject_context(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = match bearer_token(req.headers()) {
        Some(token) => token,
        None => {
            debug!(provider = state.provider.kind(), "no bearer on request, using provider");
            state.provider.token(principal(req.headers())).await?
        }
    };

    let identity = state.identity.resolve(&token).await.inspect_err(|e| {
        state.audit.identity_rejected(&e.to_string());
    })?;

    let mut user_tokens = state.store.get_all(&identity.user_id).await?;
    user_tokens
        .entry(identity.org_name.clone())
        .or_insert_with(|| token.clone());

    debug!(
        user_id = %identity.user_id,
        org_name = %identity.org_name,
        orgs = user_tokens.len(),
        "request context ready"
    );

    request_context::scope(async move {
        request_context::set(Some(token), Some(identity), Some(user_tokens))?;
        Ok::<_, GatewayError>(next.run(req).await)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   spaced "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("spaced"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn test_principal_header() {
        let mut headers = HeaderMap::new();
        assert!(principal(&headers).is_none());
        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static(" alice "));
        assert_eq!(principal(&headers), Some("alice"));
    }
}

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use gateway_auth::comms::local_api::{create_router, AppState, SharedState};
use gateway_auth::config::Settings;
use gateway_auth::security::crypto::generate_key_base64;
use http_body_util::BodyExt;
use mockito::{Matcher, Mock, Server, ServerGuard};
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const GOOD_TOKEN: &str = "good-bearer-0123456789abcdef";
const OTHER_TOKEN: &str = "other-bearer-0123456789abcdef";

struct TestApp {
    _dir: TempDir,
    server: ServerGuard,
    router: Router,
    state: SharedState,
}

fn identity_body(user: &str, org_id: &str, org_name: &str) -> String {
    json!({
        "data": {
            "me": {
                "id": user,
                "email": format!("{}@example.com", user),
                "organisation": { "id": org_id, "name": org_name }
            }
        }
    })
    .to_string()
}

async fn test_app() -> TestApp {
    test_app_with(&[]).await
}

async fn test_app_with(extra: &[(&str, &str)]) -> TestApp {
    let dir = TempDir::new().unwrap();
    let server = Server::new_async().await;
    let base = server.url();

    let mut env: HashMap<String, String> = [
        ("TOKEN_DB_PATH", dir.path().join("tokens.db").display().to_string()),
        ("TOKEN_ENCRYPTION_KEY", generate_key_base64()),
        ("CONFIRMATION_SECRET", "integration-secret".to_string()),
        ("UPSTREAM_API_URL", format!("{}/graphql", base)),
        ("AUTH_METHOD", "oauth2".to_string()),
        ("OAUTH_AUTHORIZATION_URL", format!("{}/authorize", base)),
        ("OAUTH_TOKEN_URL", format!("{}/token", base)),
        ("OAUTH_CLIENT_ID", "gateway".to_string()),
        ("OAUTH_CLIENT_SECRET", "s3cret".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    env.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    let settings = Settings::from_lookup(|key| env.get(key).cloned()).unwrap();
    let state = Arc::new(AppState::build(&settings).await.unwrap());
    TestApp {
        _dir: dir,
        server,
        router: create_router(state.clone()),
        state,
    }
}

async fn mock_identity(server: &mut ServerGuard, token: &str, user: &str, hits: usize) -> Mock {
    server
        .mock("POST", "/graphql")
        .match_header("authorization", Matcher::Exact(format!("Bearer {}", token)))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(identity_body(user, "org-1", "Acme"))
        .expect(hits)
        .create_async()
        .await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn with_body(method: &str, uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn delete(uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;
    let (status, body) = send(&app.router, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_me_requires_credential() {
    let app = test_app().await;
    let (status, body) = send(&app.router, get("/api/v1/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("not authenticated"));
}

#[tokio::test]
async fn test_me_resolves_identity_once_per_ttl() {
    let mut app = test_app().await;
    let mock = mock_identity(&mut app.server, GOOD_TOKEN, "user-42", 1).await;

    for _ in 0..3 {
        let (status, body) = send(&app.router, get("/api/v1/me", Some(GOOD_TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], "user-42");
        assert_eq!(body["org_name"], "Acme");
        // the presented token fills its own org
        assert_eq!(body["orgs"], json!(["Acme"]));
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn test_rejected_bearer_is_unauthorized() {
    let mut app = test_app().await;
    let _mock = app
        .server
        .mock("POST", "/graphql")
        .with_status(401)
        .create_async()
        .await;

    let (status, body) = send(&app.router, get("/api/v1/me", Some("revoked-token-0123456789"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid credential");
    assert!(!body.to_string().contains("revoked-token"));
}

#[tokio::test]
async fn test_store_and_list_credentials() {
    let mut app = test_app().await;
    let _mock = mock_identity(&mut app.server, GOOD_TOKEN, "user-42", 1).await;

    let (status, _) = send(
        &app.router,
        with_body(
            "POST",
            "/api/v1/credentials",
            Some(GOOD_TOKEN),
            json!({"org_name": "beta", "token": "beta-token"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app.router, get("/api/v1/credentials", Some(GOOD_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orgs"], json!(["beta"]));
    assert!(!body.to_string().contains("beta-token"));

    let (_, me) = send(&app.router, get("/api/v1/me", Some(GOOD_TOKEN))).await;
    assert_eq!(me["orgs"], json!(["Acme", "beta"]));

    assert_eq!(
        app.state.store.get("user-42", "beta").await.unwrap().as_deref(),
        Some("beta-token")
    );
}

#[tokio::test]
async fn test_delete_credential_needs_confirmation() {
    let mut app = test_app().await;
    let _mock = mock_identity(&mut app.server, GOOD_TOKEN, "user-42", 1).await;
    app.state.store.store("user-42", "beta", "beta-token").await.unwrap();

    let (status, preview) = send(&app.router, delete("/api/v1/credentials/beta", GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(preview["action"], "preview");
    assert_eq!(preview["confirmation_required"], true);
    assert_eq!(preview["item_count"], 1);
    // nothing deleted yet
    assert!(app.state.store.get("user-42", "beta").await.unwrap().is_some());

    let token = preview["confirmation_token"].as_str().unwrap().to_string();
    let mut url = Url::parse("http://localhost/api/v1/credentials/beta").unwrap();
    url.query_pairs_mut().append_pair("confirmation_token", &token);
    let confirm_uri = format!("{}?{}", url.path(), url.query().unwrap());

    let (status, body) = send(&app.router, delete(&confirm_uri, GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
    assert!(app.state.store.get("user-42", "beta").await.unwrap().is_none());

    let (status, body) = send(&app.router, delete(&confirm_uri, GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "token has already been used");
}

fn confirm_uri(org: &str, token: &str) -> String {
    let mut url = Url::parse(&format!("http://localhost/api/v1/credentials/{}", org)).unwrap();
    url.query_pairs_mut().append_pair("confirmation_token", token);
    format!("{}?{}", url.path(), url.query().unwrap())
}

#[tokio::test]
async fn test_full_replay_set_refuses_confirmation() {
    let mut app = test_app_with(&[("CONFIRMATION_REPLAY_CAPACITY", "1")]).await;
    let _mock = mock_identity(&mut app.server, GOOD_TOKEN, "user-42", 1).await;
    app.state.store.store("user-42", "beta", "t").await.unwrap();
    app.state.store.store("user-42", "gamma", "t").await.unwrap();

    let (_, beta) = send(&app.router, delete("/api/v1/credentials/beta", GOOD_TOKEN)).await;
    let (_, gamma) = send(&app.router, delete("/api/v1/credentials/gamma", GOOD_TOKEN)).await;
    let beta = confirm_uri("beta", beta["confirmation_token"].as_str().unwrap());
    let gamma = confirm_uri("gamma", gamma["confirmation_token"].as_str().unwrap());

    let (status, _) = send(&app.router, delete(&beta, GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);

    // beta's token is still live, so its slot cannot be reused
    let (status, body) = send(&app.router, delete(&gamma, GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "too many outstanding confirmations, try again later");
    assert!(app.state.store.get("user-42", "gamma").await.unwrap().is_some());

    let (status, _) = send(&app.router, delete(&beta, GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_org_named_oauth_is_not_a_logged_in_principal() {
    let mut app = test_app().await;
    let _mock = mock_identity(&mut app.server, GOOD_TOKEN, "user-42", 1).await;

    let (status, _) = send(
        &app.router,
        with_body(
            "POST",
            "/api/v1/credentials",
            Some(GOOD_TOKEN),
            json!({"org_name": "oauth", "token": "org-token"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = send(&app.router, get("/auth/principals", None)).await;
    assert_eq!(body["principals"], json!([]));
    let (_, body) = send(&app.router, get("/auth/status?principal=user-42", None)).await;
    assert_eq!(body["status"]["state"], "no_credential");
}

#[tokio::test]
async fn test_confirmation_token_bound_to_operation() {
    let mut app = test_app().await;
    let _mock = mock_identity(&mut app.server, GOOD_TOKEN, "user-42", 1).await;
    app.state.store.store("user-42", "beta", "t").await.unwrap();
    app.state.store.store("user-42", "gamma", "t").await.unwrap();

    let issued = app.state.confirmation.generate(
        "delete_credential",
        json!({"user_id": "user-42", "org_name": "gamma"}),
        None,
    );
    let mut url = Url::parse("http://localhost/api/v1/credentials/beta").unwrap();
    url.query_pairs_mut().append_pair("confirmation_token", &issued.token);
    let uri = format!("{}?{}", url.path(), url.query().unwrap());

    let (status, _) = send(&app.router, delete(&uri, GOOD_TOKEN)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.state.store.get("user-42", "beta").await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_see_their_own_identity() {
    let mut app = test_app().await;
    let _a = mock_identity(&mut app.server, GOOD_TOKEN, "user-a", 1).await;
    let _b = mock_identity(&mut app.server, OTHER_TOKEN, "user-b", 1).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let router = app.router.clone();
        let (token, user) = if i % 2 == 0 {
            (GOOD_TOKEN, "user-a")
        } else {
            (OTHER_TOKEN, "user-b")
        };
        handles.push(tokio::spawn(async move {
            let (status, body) = send(&router, get("/api/v1/me", Some(token))).await;
            (status, body["user_id"].as_str().unwrap_or("").to_string(), user)
        }));
    }
    for handle in handles {
        let (status, seen, expected) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen, expected);
    }
}

#[tokio::test]
async fn test_login_callback_status_logout() {
    let mut app = test_app().await;
    let token_mock = app
        .server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"alice-access-0123456789","expires_in":3600,"refresh_token":"rt"}"#)
        .expect(1)
        .create_async()
        .await;

    let response = app
        .router
        .clone()
        .oneshot(get("/auth/login?principal=alice", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    let location = Url::parse(&location).unwrap();
    let state: String = location
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let (status, body) = send(&app.router, get("/auth/status?principal=alice", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["state"], "pending_exchange");

    let (status, body) = send(
        &app.router,
        get(&format!("/auth/callback?code=abc&state={}", state), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "authenticated");
    assert_eq!(body["token"]["principal"], "alice");
    assert!(!body.to_string().contains("alice-access"));
    token_mock.assert_async().await;

    let (_, body) = send(&app.router, get("/auth/principals", None)).await;
    assert_eq!(body["principals"], json!(["alice"]));

    let (_, body) = send(&app.router, get("/auth/status?principal=alice", None)).await;
    assert_eq!(body["status"]["state"], "authenticated");

    let (status, body) = send(
        &app.router,
        with_body("POST", "/auth/logout", None, json!({"principal": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logged_out"], true);

    let (_, body) = send(&app.router, get("/auth/principals", None)).await;
    assert_eq!(body["principals"], json!([]));
}

#[tokio::test]
async fn test_callback_with_unknown_state() {
    let mut app = test_app().await;
    let token_mock = app
        .server
        .mock("POST", "/token")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let _ = app
        .router
        .clone()
        .oneshot(get("/auth/login?principal=alice", None))
        .await
        .unwrap();

    let (status, _) = send(&app.router, get("/auth/callback?code=abc&state=forged", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = send(&app.router, get("/auth/status?principal=alice", None)).await;
    assert_ne!(body["status"]["state"], "authenticated");
    token_mock.assert_async().await;
}

#[tokio::test]
async fn test_callback_provider_error() {
    let app = test_app().await;
    let (status, body) = send(
        &app.router,
        get("/auth/callback?error=access_denied&error_description=denied", None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("access_denied"));
}

#[tokio::test]
async fn test_principal_header_uses_delegated_token() {
    let mut app = test_app().await;
    let _token = app
        .server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"alice-access-0123456789","expires_in":3600,"refresh_token":"rt"}"#)
        .create_async()
        .await;
    let identity = mock_identity(&mut app.server, "alice-access-0123456789", "alice-id", 1).await;

    let manager = app.state.provider.token_manager().unwrap();
    let start = manager.initiate_login("alice").await.unwrap();
    manager.complete_login("alice", "code", &start.state).await.unwrap();

    let request = Request::builder()
        .uri("/api/v1/me")
        .header("x-principal", "alice")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "alice-id");
    identity.assert_async().await;
}

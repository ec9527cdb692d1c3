//! Ambient per-request state.
//!
//! The context lives in a tokio task-local, so it follows one request's
//! future across `.await` points and is never visible to other tasks, even
//! when they run on the same worker thread. Open it with [`scope`]; code
//! further down the call graph reads it with [`get`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

use crate::security::identity::UserIdentity;

tokio::task_local! {
    static CONTEXT: RefCell<RequestContext>;
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub authorization_token: Option<String>,
    pub user_identity: Option<UserIdentity>,
    /// org_name → token
    pub user_tokens: BTreeMap<String, String>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("has_token", &self.authorization_token.is_some())
            .field("user_identity", &self.user_identity)
            .field("orgs", &self.user_tokens.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestContext {
    pub fn user_id(&self) -> Option<&str> {
        self.user_identity.as_ref().map(|u| u.user_id.as_str())
    }

    pub fn org_id(&self) -> Option<&str> {
        self.user_identity.as_ref().map(|u| u.org_id.as_str())
    }

    pub fn org_name(&self) -> Option<&str> {
        self.user_identity.as_ref().map(|u| u.org_name.as_str())
    }

    pub fn token_for_org(&self, org_name: &str) -> Option<&str> {
        self.user_tokens.get(org_name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self == &RequestContext::default()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("no request scope is active")]
    NoScope,
}

struct ClearOnDrop;

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        clear();
    }
}

/// Run `fut` with a fresh, empty context. The context is cleared when the
/// future completes or is dropped.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    CONTEXT
        .scope(RefCell::new(RequestContext::default()), async move {
            let _guard = ClearOnDrop;
            fut.await
        })
        .await
}

/// Run `fut` (usually about to be spawned) with a copy of the current context.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let current = get();
    CONTEXT.scope(RefCell::new(current), async move {
        let _guard = ClearOnDrop;
        fut.await
    })
}

/// Replace the whole context of the current scope.
pub fn set(
    token: Option<String>,
    identity: Option<UserIdentity>,
    user_tokens: Option<BTreeMap<String, String>>,
) -> Result<(), ContextError> {
    CONTEXT
        .try_with(|cell| {
            *cell.borrow_mut() = RequestContext {
                authorization_token: token,
                user_identity: identity,
                user_tokens: user_tokens.unwrap_or_default(),
            };
        })
        .map_err(|_| ContextError::NoScope)
}

/// Snapshot of the current context; empty outside a scope.
pub fn get() -> RequestContext {
    CONTEXT
        .try_with(|cell| cell.borrow().clone())
        .unwrap_or_default()
}

pub fn clear() {
    let _ = CONTEXT.try_with(|cell| {
        if let Ok(mut ctx) = cell.try_borrow_mut() {
            *ctx = RequestContext::default();
        }
    });
}

pub fn current_token() -> Option<String> {
    CONTEXT
        .try_with(|cell| cell.borrow().authorization_token.clone())
        .ok()
        .flatten()
}

pub fn current_user() -> Option<UserIdentity> {
    CONTEXT
        .try_with(|cell| cell.borrow().user_identity.clone())
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(user: &str, org: &str) -> UserIdentity {
        UserIdentity {
            user_id: user.to_string(),
            org_id: format!("{}-id", org),
            org_name: org.to_string(),
            email: None,
        }
    }

    #[tokio::test]
    async fn test_get_outside_scope_is_empty() {
        assert!(get().is_empty());
        assert_eq!(set(None, None, None), Err(ContextError::NoScope));
        clear();
    }

    #[tokio::test]
    async fn test_set_get_clear_inside_scope() {
        scope(async {
            let mut tokens = BTreeMap::new();
            tokens.insert("acme".to_string(), "t-acme".to_string());
            set(
                Some("bearer".to_string()),
                Some(identity("u1", "acme")),
                Some(tokens),
            )
            .unwrap();

            let ctx = get();
            assert_eq!(ctx.user_id(), Some("u1"));
            assert_eq!(ctx.org_name(), Some("acme"));
            assert_eq!(ctx.org_id(), Some("acme-id"));
            assert_eq!(ctx.token_for_org("acme"), Some("t-acme"));
            assert_eq!(ctx.token_for_org("other"), None);
            assert_eq!(current_token().as_deref(), Some("bearer"));

            clear();
            assert!(get().is_empty());
            assert!(current_user().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_context_survives_await_points() {
        scope(async {
            set(Some("t".to_string()), Some(identity("u1", "acme")), None).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::task::yield_now().await;
            assert_eq!(get().user_id(), Some("u1"));
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scopes_are_isolated() {
        let mut handles = Vec::new();
        for i in 0..16 {
            handles.push(tokio::spawn(scope(async move {
                let user = format!("user-{}", i);
                set(Some(format!("token-{}", i)), Some(identity(&user, "org")), None).unwrap();
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                    assert_eq!(get().user_id(), Some(user.as_str()));
                }
                get().authorization_token
            })));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(format!("token-{}", i)));
        }
        assert!(get().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit_without_propagate() {
        scope(async {
            set(Some("t".to_string()), Some(identity("u1", "acme")), None).unwrap();

            let plain = tokio::spawn(async { get() }).await.unwrap();
            assert!(plain.is_empty());

            let carried = tokio::spawn(propagate(async { get() })).await.unwrap();
            assert_eq!(carried.user_id(), Some("u1"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_scope_starts_empty_each_time() {
        scope(async {
            set(Some("first".to_string()), None, None).unwrap();
        })
        .await;
        scope(async {
            assert!(get().is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn test_failed_scope_returns_error_and_leaves_no_context() {
        let result: Result<(), ContextError> = scope(async {
            set(Some("t".to_string()), Some(identity("u1", "acme")), None)?;
            Err(ContextError::NoScope)
        })
        .await;
        assert_eq!(result, Err(ContextError::NoScope));
        assert!(get().is_empty());
    }

    #[tokio::test]
    async fn test_inner_scope_does_not_leak_on_error_or_cancel() {
        scope(async {
            set(Some("outer".to_string()), Some(identity("u-outer", "acme")), None).unwrap();

            let failed: Result<(), &str> = scope(async {
                set(Some("inner".to_string()), Some(identity("u-inner", "beta")), None).unwrap();
                Err("handler failed")
            })
            .await;
            assert!(failed.is_err());
            assert_eq!(current_token().as_deref(), Some("outer"));

            let cancelled = tokio::time::timeout(
                Duration::from_millis(10),
                scope(async {
                    set(Some("inner".to_string()), Some(identity("u-inner", "beta")), None).unwrap();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }),
            )
            .await;
            assert!(cancelled.is_err());
            assert_eq!(get().user_id(), Some("u-outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_drop_guard_clears_populated_context() {
        scope(async {
            set(Some("t".to_string()), Some(identity("u1", "acme")), None).unwrap();
            drop(ClearOnDrop);
            assert!(get().is_empty());
        })
        .await;
    }

    #[test]
    fn test_debug_hides_tokens() {
        let mut tokens = BTreeMap::new();
        tokens.insert("acme".to_string(), "super-secret".to_string());
        let ctx = RequestContext {
            authorization_token: Some("bearer-secret".to_string()),
            user_identity: None,
            user_tokens: tokens,
        };
        let rendered = format!("{:?}", ctx);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("acme"));
    }
}

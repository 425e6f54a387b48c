//! Credential resolution and the authorization gates.
//!
//! Resolution rules, applied strictly in order:
//!
//! 1. no credential → anonymous, not an error
//! 2. not a two-token `Bearer <token>` value → `MalformedCredential`
//! 3. token fails the structural check → `InvalidTokenFormat`, before any
//!    store traffic
//! 4. token unknown to the store, or expired → `UnknownOrExpiredToken`
//! 5. otherwise the authenticated user
//!
//! Authorization is three chained gates: authenticated → activated → holds
//! the permission code. Each gate short-circuits with its own error kind so
//! a protected handler body never runs on denial.

pub mod principal;

pub use principal::Principal;

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, VARY},
        HeaderValue,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use crate::api::{
    error::ApiError,
    store::{CredentialStore, PermissionStore, UserRecord, SCOPE_AUTHENTICATION},
    AppState,
};

/// Tokens are 16 random bytes, base32-encoded without padding.
const TOKEN_LENGTH: usize = 26;

/// Hash a token so raw values never touch the store.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

fn token_is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LENGTH
        && token
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}

/// Resolve an `Authorization` header value into a [`Principal`].
///
/// Pure aside from the single credential-store lookup; performs no
/// mutation.
///
/// # Errors
///
/// Returns the credential-stage error kinds described in the module docs
pub async fn resolve(
    header: Option<&str>,
    credentials: &dyn CredentialStore,
) -> Result<Principal, ApiError> {
    let Some(header) = header.filter(|value| !value.is_empty()) else {
        return Ok(Principal::Anonymous);
    };

    let parts: Vec<&str> = header.split(' ').collect();
    if parts.len() != 2 || parts[0] != "Bearer" {
        return Err(ApiError::MalformedCredential);
    }

    let token = parts[1];
    if !token_is_well_formed(token) {
        return Err(ApiError::InvalidTokenFormat);
    }

    match credentials
        .lookup(&hash_token(token), SCOPE_AUTHENTICATION)
        .await?
    {
        Some(user) => Ok(Principal::Authenticated(user)),
        None => Err(ApiError::UnknownOrExpiredToken),
    }
}

/// Gate 1: the principal must not be anonymous.
///
/// # Errors
///
/// Returns [`ApiError::Unauthenticated`] for anonymous callers
pub fn require_authenticated(principal: &Principal) -> Result<&UserRecord, ApiError> {
    principal.user().ok_or(ApiError::Unauthenticated)
}

/// Gate 2: authenticated and activated.
///
/// # Errors
///
/// Returns the gate-1 error first, then [`ApiError::AccountNotActivated`]
pub fn require_activated(principal: &Principal) -> Result<&UserRecord, ApiError> {
    let user = require_authenticated(principal)?;
    if !user.activated {
        return Err(ApiError::AccountNotActivated);
    }
    Ok(user)
}

/// Gate 3: authenticated, activated, and granted `code`. Codes are matched
/// exactly, case-sensitively, with no wildcard semantics.
///
/// # Errors
///
/// Returns the inner gate errors first, then [`ApiError::PermissionDenied`]
pub async fn require_permission<'p>(
    principal: &'p Principal,
    code: &str,
    permissions: &dyn PermissionStore,
) -> Result<&'p UserRecord, ApiError> {
    let user = require_activated(principal)?;
    let granted = permissions.permissions_for(user.id).await?;
    if !granted.iter().any(|granted| granted == code) {
        return Err(ApiError::PermissionDenied);
    }
    Ok(user)
}

/// Pipeline stage 2: attach the resolved [`Principal`] to the request, or
/// reject. Responses vary on `Authorization` either way.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = match request.headers().get(AUTHORIZATION) {
        None => None,
        Some(value) => match value.to_str() {
            Ok(value) => Some(value),
            Err(_) => return with_vary(ApiError::MalformedCredential.into_response()),
        },
    };

    let principal = match resolve(header, state.credentials.as_ref()).await {
        Ok(principal) => principal,
        Err(err) => return with_vary(err.into_response()),
    };

    request.extensions_mut().insert(principal);
    with_vary(next.run(request).await)
}

fn with_vary(mut response: Response) -> Response {
    response
        .headers_mut()
        .append(VARY, HeaderValue::from_static("Authorization"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::store::{memory::MemoryStore, StoreError};
    use axum::async_trait;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use uuid::Uuid;

    struct CountingStore {
        inner: MemoryStore,
        lookups: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn lookup(
            &self,
            token_hash: &[u8],
            scope: &str,
        ) -> Result<Option<UserRecord>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(token_hash, scope).await
        }
    }

    fn user(activated: bool) -> UserRecord {
        UserRecord {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            activated,
        }
    }

    #[tokio::test]
    async fn test_absent_or_empty_credential_is_anonymous() {
        let store = MemoryStore::new();
        assert_eq!(resolve(None, &store).await.unwrap(), Principal::Anonymous);
        assert_eq!(
            resolve(Some(""), &store).await.unwrap(),
            Principal::Anonymous
        );
    }

    #[tokio::test]
    async fn test_malformed_credential_shapes() {
        let store = MemoryStore::new();
        for header in ["Bearer", "Basic abc", "Bearer a b", "token"] {
            let err = resolve(Some(header), &store).await.unwrap_err();
            assert!(
                matches!(err, ApiError::MalformedCredential),
                "header {header:?} should be malformed"
            );
        }
    }

    #[tokio::test]
    async fn test_structural_check_runs_before_any_lookup() {
        let store = CountingStore::new();

        let err = resolve(Some("Bearer not-a-real-token"), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidTokenFormat));

        // 25 and 27 chars bracket the fixed length; lowercase fails encoding
        for token in [
            "ABCDEFGHIJKLMNOPQRSTUVWXY",
            "ABCDEFGHIJKLMNOPQRSTUVWXYZ2",
            "abcdefghijklmnopqrstuvwxyz",
        ] {
            let header = format!("Bearer {token}");
            let err = resolve(Some(&header), &store).await.unwrap_err();
            assert!(matches!(err, ApiError::InvalidTokenFormat));
        }

        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_token_after_store_miss() {
        let store = CountingStore::new();
        let err = resolve(Some("Bearer AAAAAAAAAAAAAAAAAAAAAAAAAA"), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownOrExpiredToken));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_valid_token_resolves_user() {
        let store = MemoryStore::new();
        let record = store.add_user("a@example.com", true);
        let token = store.issue_token(record.id, SCOPE_AUTHENTICATION, Duration::from_secs(60));

        let header = format!("Bearer {token}");
        let principal = resolve(Some(&header), &store).await.unwrap();
        assert_eq!(principal, Principal::Authenticated(record));
    }

    #[tokio::test]
    async fn test_gate_order_and_short_circuit() {
        let store = MemoryStore::new();

        // anonymous fails the outermost gate, whatever else would hold
        let anon = Principal::Anonymous;
        assert!(matches!(
            require_permission(&anon, "resources:read", &store)
                .await
                .unwrap_err(),
            ApiError::Unauthenticated
        ));

        // not activated outranks the missing permission
        let dormant = Principal::Authenticated(user(false));
        assert!(matches!(
            require_activated(&dormant).unwrap_err(),
            ApiError::AccountNotActivated
        ));
        assert!(matches!(
            require_permission(&dormant, "resources:read", &store)
                .await
                .unwrap_err(),
            ApiError::AccountNotActivated
        ));
    }

    #[tokio::test]
    async fn test_permission_match_is_exact() {
        let store = MemoryStore::new();
        let record = store.add_user("a@example.com", true);
        store.grant(record.id, &["resources:read"]);
        let principal = Principal::Authenticated(record);

        assert!(require_permission(&principal, "resources:read", &store)
            .await
            .is_ok());
        // no case folding, no prefixes
        assert!(matches!(
            require_permission(&principal, "RESOURCES:READ", &store)
                .await
                .unwrap_err(),
            ApiError::PermissionDenied
        ));
        assert!(matches!(
            require_permission(&principal, "resources:write", &store)
                .await
                .unwrap_err(),
            ApiError::PermissionDenied
        ));
    }
}

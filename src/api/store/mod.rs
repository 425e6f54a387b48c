//! Collaborator interfaces consumed by the pipeline.
//!
//! The serving core only ever talks to storage through these traits: a
//! credential store for token lookups, a permission store for flat
//! permission codes, and a versioned resource store implementing the
//! compare-and-set update contract. `postgres` is the production
//! implementation, `memory` the hermetic one used in tests and local
//! development.

pub mod memory;
pub mod postgres;

use axum::async_trait;
use serde::Serialize;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

/// Deadline applied to every external store call so a slow dependency can
/// never pin a request indefinitely.
pub const STORE_DEADLINE: Duration = Duration::from_secs(3);

/// Token scope consulted during authentication lookups.
pub const SCOPE_AUTHENTICATION: &str = "authentication";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("edit conflict")]
    EditConflict,
    #[error("store call exceeded its deadline")]
    DependencyTimeout,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Run one store future under [`STORE_DEADLINE`].
pub(crate) async fn with_deadline<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(STORE_DEADLINE, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::DependencyTimeout),
    }
}

/// Identity attributes behind a resolved token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub activated: bool,
}

/// A stored resource with its version stamp. Versions start at 1 and
/// increase by exactly 1 on every successful mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub version: i32,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the user behind a hashed token within `scope`. `Ok(None)`
    /// covers both unknown and expired tokens; the caller cannot tell them
    /// apart and must not try.
    async fn lookup(&self, token_hash: &[u8], scope: &str)
        -> Result<Option<UserRecord>, StoreError>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// All permission codes granted to a user. Codes are opaque strings,
    /// matched exactly and case-sensitively.
    async fn permissions_for(&self, user_id: Uuid) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create a resource at version 1.
    async fn create(&self, payload: serde_json::Value) -> Result<ResourceRecord, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ResourceRecord>, StoreError>;

    /// Apply `payload` only if the stored version still equals
    /// `expected_version`; returns the incremented version on success and
    /// [`StoreError::EditConflict`] (applying nothing) when the version has
    /// moved or the resource is gone. No auto-retry.
    async fn update(
        &self,
        id: Uuid,
        expected_version: i32,
        payload: serde_json::Value,
    ) -> Result<i32, StoreError>;

    /// Delete is not versioned. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

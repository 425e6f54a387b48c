//! Postgres-backed store implementations.

use axum::async_trait;
use sqlx::{PgPool, Row};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{
    with_deadline, CredentialStore, PermissionStore, ResourceRecord, ResourceStore, StoreError,
    UserRecord,
};

/// One pool, three collaborator interfaces.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn lookup(
        &self,
        token_hash: &[u8],
        scope: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let query = r"
            SELECT users.id, users.email, users.activated
            FROM users
            INNER JOIN tokens ON users.id = tokens.user_id
            WHERE tokens.hash = $1
              AND tokens.scope = $2
              AND tokens.expiry > now()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = with_deadline(
            sqlx::query(query)
                .bind(token_hash)
                .bind(scope)
                .fetch_optional(&self.pool)
                .instrument(span),
        )
        .await?;

        Ok(row.map(|row| UserRecord {
            id: row.get("id"),
            email: row.get("email"),
            activated: row.get("activated"),
        }))
    }
}

#[async_trait]
impl PermissionStore for PgStore {
    async fn permissions_for(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let query = r"
            SELECT permissions.code
            FROM permissions
            INNER JOIN users_permissions ON users_permissions.permission_id = permissions.id
            WHERE users_permissions.user_id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = with_deadline(
            sqlx::query(query)
                .bind(user_id)
                .fetch_all(&self.pool)
                .instrument(span),
        )
        .await?;

        Ok(rows.iter().map(|row| row.get("code")).collect())
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn create(&self, payload: serde_json::Value) -> Result<ResourceRecord, StoreError> {
        let query = r"
            INSERT INTO resources (payload)
            VALUES ($1)
            RETURNING id, version
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = with_deadline(
            sqlx::query(query)
                .bind(&payload)
                .fetch_one(&self.pool)
                .instrument(span),
        )
        .await?;

        Ok(ResourceRecord {
            id: row.get("id"),
            payload,
            version: row.get("version"),
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<ResourceRecord>, StoreError> {
        let query = r"
            SELECT id, payload, version
            FROM resources
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = with_deadline(
            sqlx::query(query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(span),
        )
        .await?;

        Ok(row.map(|row| ResourceRecord {
            id: row.get("id"),
            payload: row.get("payload"),
            version: row.get("version"),
        }))
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: i32,
        payload: serde_json::Value,
    ) -> Result<i32, StoreError> {
        // The version predicate is the whole concurrency story: zero rows
        // means another editor won the race (or the row is gone)
        let query = r"
            UPDATE resources
            SET payload = $1, version = version + 1
            WHERE id = $2 AND version = $3
            RETURNING version
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = with_deadline(
            sqlx::query(query)
                .bind(&payload)
                .bind(id)
                .bind(expected_version)
                .fetch_optional(&self.pool)
                .instrument(span),
        )
        .await?;

        match row {
            Some(row) => Ok(row.get("version")),
            None => Err(StoreError::EditConflict),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let query = r"
            DELETE FROM resources
            WHERE id = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = with_deadline(
            sqlx::query(query)
                .bind(id)
                .execute(&self.pool)
                .instrument(span),
        )
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

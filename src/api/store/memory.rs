//! In-memory store implementations.
//!
//! Hermetic counterparts to the Postgres stores, used by the test suite and
//! handy for local development. Same contracts, same error kinds, a mutexed
//! map instead of a pool.

use axum::async_trait;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};
use uuid::Uuid;

use super::{
    CredentialStore, PermissionStore, ResourceRecord, ResourceStore, StoreError, UserRecord,
};
use crate::api::auth::hash_token;

#[derive(Debug)]
struct TokenEntry {
    user_id: Uuid,
    scope: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<Uuid, UserRecord>>,
    tokens: Mutex<HashMap<Vec<u8>, TokenEntry>>,
    permissions: Mutex<HashMap<Uuid, Vec<String>>>,
    resources: Mutex<HashMap<Uuid, ResourceRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and return its record.
    pub fn add_user(&self, email: &str, activated: bool) -> UserRecord {
        let record = UserRecord {
            id: Uuid::new_v4(),
            email: email.to_string(),
            activated,
        };
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        record
    }

    /// Mint a plaintext token for a user; only its hash is retained, like
    /// the real store.
    pub fn issue_token(&self, user_id: Uuid, scope: &str, ttl: Duration) -> String {
        let plaintext = base32_no_pad(Uuid::new_v4().as_bytes());
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).insert(
            hash_token(&plaintext),
            TokenEntry {
                user_id,
                scope: scope.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        plaintext
    }

    pub fn grant(&self, user_id: Uuid, codes: &[&str]) {
        self.permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id)
            .or_default()
            .extend(codes.iter().map(ToString::to_string));
    }
}

/// Unpadded RFC 4648 base32, the shape tokens travel in on the wire.
fn base32_no_pad(bytes: &[u8; 16]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(26);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn lookup(
        &self,
        token_hash: &[u8],
        scope: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = tokens.get(token_hash) else {
            return Ok(None);
        };
        if entry.scope != scope || entry.expires_at <= Instant::now() {
            return Ok(None);
        }
        let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(users.get(&entry.user_id).cloned())
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn permissions_for(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(self
            .permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create(&self, payload: serde_json::Value) -> Result<ResourceRecord, StoreError> {
        let record = ResourceRecord {
            id: Uuid::new_v4(),
            payload,
            version: 1,
        };
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: i32,
        payload: serde_json::Value,
    ) -> Result<i32, StoreError> {
        // Check-and-mutate under one lock acquisition, the in-memory twin of
        // the SQL version predicate
        let mut resources = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match resources.get_mut(&id) {
            Some(record) if record.version == expected_version => {
                record.payload = payload;
                record.version += 1;
                Ok(record.version)
            }
            _ => Err(StoreError::EditConflict),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some())
    }
}

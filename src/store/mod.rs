//! Secret/user/audit storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database holding the `users`, `secrets` and `audit_log` relations
//!
//! The code paths that stream or push codes only ever read secrets through this trait.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Role;
use crate::vault::SealedSeed;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External push target settings stored alongside a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncTargetConfig {
    pub enabled: bool,
    pub url: String,
    pub credential: String,
    pub target_key: String,
}

impl SyncTargetConfig {
    /// The push target, if sync is enabled and every field is filled in.
    pub fn target(&self) -> Option<SyncTarget> {
        if !self.enabled
            || self.url.trim().is_empty()
            || self.credential.trim().is_empty()
            || self.target_key.trim().is_empty()
        {
            return None;
        }
        Some(SyncTarget {
            url: self.url.trim().to_string(),
            credential: self.credential.trim().to_string(),
            target_key: self.target_key.trim().to_string(),
        })
    }
}

/// A fully configured push target.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub url: String,
    pub credential: String,
    pub target_key: String,
}

impl std::fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTarget")
            .field("url", &self.url)
            .field("credential", &"<redacted>")
            .field("target_key", &self.target_key)
            .finish()
    }
}

/// A stored secret row. Derivation parameters are kept as stored so that one bad
/// row fails on its own when codes are derived, not when the table is read.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub id: i64,
    pub label: String,
    pub issuer: String,
    pub sealed: SealedSeed,
    pub algorithm: String,
    pub digits: u32,
    pub period: u64,
    pub owner_id: Option<i64>,
    pub created_at: String,
    pub sync: SyncTargetConfig,
}

/// Input for [`SecretStore::insert_secret`].
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub label: String,
    pub issuer: String,
    pub sealed: SealedSeed,
    pub algorithm: String,
    pub digits: u32,
    pub period: u64,
    pub owner_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: String,
}

/// One row of the audit log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub user_id: Option<i64>,
    pub action: String,
    pub secret_id: Option<i64>,
    pub ip_address: String,
    pub timestamp: String,
}

impl AuditEntry {
    pub fn new(
        user_id: Option<i64>,
        action: &str,
        secret_id: Option<i64>,
        ip_address: &str,
    ) -> Self {
        Self {
            user_id,
            action: action.to_string(),
            secret_id,
            ip_address: ip_address.to_string(),
            timestamp: now_string(),
        }
    }
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Storage trait - implemented by all backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// All secrets, in id order.
    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, StoreError>;

    /// Secrets with sync enabled and a fully configured target.
    async fn list_sync_targets(&self) -> Result<Vec<(SecretRecord, SyncTarget)>, StoreError> {
        Ok(self
            .list_secrets()
            .await?
            .into_iter()
            .filter_map(|record| {
                let target = record.sync.target()?;
                Some((record, target))
            })
            .collect())
    }

    async fn get_secret(&self, id: i64) -> Result<Option<SecretRecord>, StoreError>;

    async fn insert_secret(&self, secret: NewSecret) -> Result<i64, StoreError>;

    /// Returns `false` if no such secret existed.
    async fn delete_secret(&self, id: i64) -> Result<bool, StoreError>;

    /// Returns `false` if no such secret existed.
    async fn update_sync_target(
        &self,
        id: i64,
        config: SyncTargetConfig,
    ) -> Result<bool, StoreError>;

    /// All users, oldest first.
    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError>;

    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>, StoreError>;

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn insert_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<i64, StoreError>;

    /// Returns `false` if no such user existed.
    async fn delete_user(&self, id: i64) -> Result<bool, StoreError>;

    async fn count_admins(&self) -> Result<usize, StoreError>;

    async fn log_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, url: &str, credential: &str, key: &str) -> SyncTargetConfig {
        SyncTargetConfig {
            enabled,
            url: url.to_string(),
            credential: credential.to_string(),
            target_key: key.to_string(),
        }
    }

    #[test]
    fn target_requires_every_field() {
        assert!(config(true, "https://x.test", "cred", "key").target().is_some());
        assert!(config(false, "https://x.test", "cred", "key").target().is_none());
        assert!(config(true, "", "cred", "key").target().is_none());
        assert!(config(true, "https://x.test", " ", "key").target().is_none());
        assert!(config(true, "https://x.test", "cred", "").target().is_none());
    }

    #[test]
    fn sync_target_debug_hides_credential() {
        let target = config(true, "https://x.test", "hunter2", "key").target().unwrap();
        assert!(!format!("{:?}", target).contains("hunter2"));
    }
}

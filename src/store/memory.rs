//! In-memory store (non-persistent).

use super::{
    now_string, AuditEntry, NewSecret, SecretRecord, SecretStore, StoreError, SyncTargetConfig,
    UserRecord,
};
use crate::session::Role;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    secrets: BTreeMap<i64, SecretRecord>,
    users: BTreeMap<i64, UserRecord>,
    audit: Vec<AuditEntry>,
    next_secret_id: i64,
    next_user_id: i64,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit log, oldest first.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.read().await.audit.clone()
    }

    /// Overwrite a stored row in place (used to simulate corrupted records).
    pub async fn replace_secret(&self, record: SecretRecord) {
        self.state.write().await.secrets.insert(record.id, record);
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, StoreError> {
        Ok(self.state.read().await.secrets.values().cloned().collect())
    }

    async fn get_secret(&self, id: i64) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.state.read().await.secrets.get(&id).cloned())
    }

    async fn insert_secret(&self, secret: NewSecret) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        state.next_secret_id += 1;
        let id = state.next_secret_id;
        state.secrets.insert(
            id,
            SecretRecord {
                id,
                label: secret.label,
                issuer: secret.issuer,
                sealed: secret.sealed,
                algorithm: secret.algorithm,
                digits: secret.digits,
                period: secret.period,
                owner_id: secret.owner_id,
                created_at: now_string(),
                sync: SyncTargetConfig::default(),
            },
        );
        Ok(id)
    }

    async fn delete_secret(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.state.write().await.secrets.remove(&id).is_some())
    }

    async fn update_sync_target(
        &self,
        id: i64,
        config: SyncTargetConfig,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        match state.secrets.get_mut(&id) {
            Some(record) => {
                record.sync = config;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn insert_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.write().await;
        if state.users.values().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!("user {} already exists", username)));
        }
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.insert(
            id,
            UserRecord {
                id,
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                role,
                created_at: now_string(),
            },
        );
        Ok(id)
    }

    async fn delete_user(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.users.remove(&id).is_none() {
            return Ok(false);
        }
        for secret in state.secrets.values_mut() {
            if secret.owner_id == Some(id) {
                secret.owner_id = None;
            }
        }
        Ok(true)
    }

    async fn count_admins(&self) -> Result<usize, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .filter(|u| u.role == Role::Admin)
            .count())
    }

    async fn log_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.state.write().await.audit.push(entry);
        Ok(())
    }
}

//! SQLite-backed store for users, secrets and the audit log.

use super::{
    now_string, AuditEntry, NewSecret, SecretRecord, SecretStore, StoreError, SyncTarget,
    SyncTargetConfig, UserRecord,
};
use crate::session::Role;
use crate::vault::SealedSeed;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'viewer',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS secrets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    issuer TEXT NOT NULL DEFAULT '',
    encrypted_secret BLOB NOT NULL,
    iv BLOB NOT NULL,
    auth_tag BLOB NOT NULL,
    algorithm TEXT NOT NULL DEFAULT 'SHA1',
    digits INTEGER NOT NULL DEFAULT 6,
    period INTEGER NOT NULL DEFAULT 30,
    added_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    action TEXT NOT NULL,
    secret_id INTEGER,
    ip_address TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC);
"#;

/// Columns added after the first schema version, with their definitions.
const SYNC_COLUMNS: [(&str, &str); 4] = [
    ("sync_enabled", "INTEGER NOT NULL DEFAULT 0"),
    ("sync_url", "TEXT NOT NULL DEFAULT ''"),
    ("sync_credential", "TEXT NOT NULL DEFAULT ''"),
    ("sync_target_key", "TEXT NOT NULL DEFAULT ''"),
];

const SECRET_COLUMNS: &str = "id, label, issuer, encrypted_secret, iv, auth_tag, algorithm, digits,
     period, added_by, created_at, sync_enabled, sync_url, sync_credential, sync_target_key";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Open database in blocking task
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Self::run_migrations(&conn)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Add columns missing from databases created by older versions.
    /// CREATE TABLE IF NOT EXISTS doesn't add columns to existing tables.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        for (column, definition) in SYNC_COLUMNS {
            let exists: bool = conn
                .prepare("SELECT 1 FROM pragma_table_info('secrets') WHERE name = ?1")?
                .exists(params![column])?;
            if !exists {
                tracing::info!("Running migration: adding '{}' column to secrets table", column);
                conn.execute(
                    &format!("ALTER TABLE secrets ADD COLUMN {} {}", column, definition),
                    [],
                )?;
            }
        }
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn secret_from_row(row: &Row<'_>) -> rusqlite::Result<SecretRecord> {
    let digits: i64 = row.get(7)?;
    let period: i64 = row.get(8)?;
    Ok(SecretRecord {
        id: row.get(0)?,
        label: row.get(1)?,
        issuer: row.get(2)?,
        sealed: SealedSeed {
            ciphertext: row.get(3)?,
            iv: row.get(4)?,
            auth_tag: row.get(5)?,
        },
        algorithm: row.get(6)?,
        // Out-of-range values become 0 and fail derivation for this row only.
        digits: u32::try_from(digits).unwrap_or(0),
        period: u64::try_from(period).unwrap_or(0),
        owner_id: row.get(9)?,
        created_at: row.get(10)?,
        sync: SyncTargetConfig {
            enabled: row.get::<_, i64>(11)? != 0,
            url: row.get(12)?,
            credential: row.get(13)?,
            target_key: row.get(14)?,
        },
    })
}

/// Collect the rows that decode, logging and skipping the rest.
fn readable_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>, table: &str) -> Vec<T> {
    rows.enumerate()
        .filter_map(|(index, row)| match row {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(table, index, "Skipping unreadable row: {}", e);
                None
            }
        })
        .collect()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let role: String = row.get(3)?;
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: role.parse().unwrap_or(Role::Viewer),
        created_at: row.get(4)?,
    })
}

#[async_trait]
impl SecretStore for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn list_secrets(&self) -> Result<Vec<SecretRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM secrets ORDER BY id", SECRET_COLUMNS))?;
            let rows = stmt.query_map([], secret_from_row)?;
            Ok(readable_rows(rows, "secrets"))
        })
        .await
    }

    async fn list_sync_targets(&self) -> Result<Vec<(SecretRecord, SyncTarget)>, StoreError> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM secrets
                     WHERE sync_enabled = 1
                       AND sync_url != ''
                       AND sync_credential != ''
                       AND sync_target_key != ''
                     ORDER BY id",
                    SECRET_COLUMNS
                ))?;
                let rows = stmt.query_map([], secret_from_row)?;
                Ok(readable_rows(rows, "secrets"))
            })
            .await?;

        // Whitespace-only fields pass the SQL filter; `target()` drops them.
        Ok(rows
            .into_iter()
            .filter_map(|record| {
                let target = record.sync.target()?;
                Some((record, target))
            })
            .collect())
    }

    async fn get_secret(&self, id: i64) -> Result<Option<SecretRecord>, StoreError> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {} FROM secrets WHERE id = ?1", SECRET_COLUMNS),
                    params![id],
                    secret_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn insert_secret(&self, secret: NewSecret) -> Result<i64, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO secrets
                    (label, issuer, encrypted_secret, iv, auth_tag, algorithm, digits, period,
                     added_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    secret.label,
                    secret.issuer,
                    secret.sealed.ciphertext,
                    secret.sealed.iv,
                    secret.sealed.auth_tag,
                    secret.algorithm,
                    secret.digits as i64,
                    secret.period as i64,
                    secret.owner_id,
                    now_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn delete_secret(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM secrets WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn update_sync_target(
        &self,
        id: i64,
        config: SyncTargetConfig,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE secrets
                 SET sync_enabled = ?1, sync_url = ?2, sync_credential = ?3, sync_target_key = ?4
                 WHERE id = ?5",
                params![
                    config.enabled as i64,
                    config.url,
                    config.credential,
                    config.target_key,
                    id
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password_hash, role, created_at
                 FROM users ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], user_from_row)?;
            Ok(readable_rows(rows, "users"))
        })
        .await
    }

    async fn get_user(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, username, password_hash, role, created_at
                     FROM users WHERE id = ?1",
                    params![id],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, username, password_hash, role, created_at
                     FROM users WHERE username = ?1",
                    params![username],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn insert_user(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<i64, StoreError> {
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO users (username, password_hash, role, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![username, password_hash, role.as_str(), now_string()],
            );
            match result {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!("user {} already exists", username)))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn delete_user(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn count_admins(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE role = ?1",
                params![Role::Admin.as_str()],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn log_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (user_id, action, secret_id, ip_address, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.user_id,
                    entry.action,
                    entry.secret_id,
                    entry.ip_address,
                    entry.timestamp
                ],
            )?;
            Ok(())
        })
        .await
    }
}

//! SQLite-backed [`KeyStore`].
//!
//! Schema lives in `migrations/001_keyring.sql` and is applied inline on open.
//! Status transitions never delete rows; revocation is an `UPDATE`.

use std::path::Path;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{IdentityRecord, KeyStore, Roles, StoreError, TrustStatus};

const SCHEMA: &str = include_str!("../../migrations/001_keyring.sql");

const SELECT_COLUMNS: &str =
    "SELECT ae_id, pubkey_b64, fingerprint, roles, status, expires_at FROM keyring";

/// Identity records persisted in a SQLite `keyring` table.
#[derive(Debug, Clone)]
pub struct SqliteKeyStore {
    pool: SqlitePool,
}

impl SqliteKeyStore {
    /// Open (or create) the keyring database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, database or schema cannot be created.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!(
                        "failed to create keyring directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database, for tests and ephemeral deployments.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool or schema cannot be created.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_one_where(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE {column} = ?1 ORDER BY ae_id LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<IdentityRecord, StoreError> {
    let id: String = row.try_get("ae_id")?;
    let status_text: String = row.try_get("status")?;
    let status = TrustStatus::parse(&status_text)
        .map_err(|e| StoreError::Corrupt(format!("{id}: {e}")))?;
    let roles_text: String = row.try_get("roles")?;
    let expires_at: Option<i64> = row.try_get("expires_at")?;
    let expires_at = match expires_at {
        Some(secs) => Some(DateTime::from_timestamp(secs, 0).ok_or_else(|| {
            StoreError::Corrupt(format!("{id}: expires_at out of range: {secs}"))
        })?),
        None => None,
    };

    Ok(IdentityRecord {
        public_key_b64: row.try_get("pubkey_b64")?,
        fingerprint: row.try_get("fingerprint")?,
        roles: Roles::parse(&roles_text),
        status,
        expires_at,
        id,
    })
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn get(&self, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        self.fetch_one_where("ae_id", id).await
    }

    async fn upsert(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO keyring (ae_id, pubkey_b64, fingerprint, roles, status, expires_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6)
              ON CONFLICT(ae_id) DO UPDATE SET
                pubkey_b64 = excluded.pubkey_b64,
                fingerprint = excluded.fingerprint,
                roles = excluded.roles,
                status = excluded.status,
                expires_at = excluded.expires_at",
        )
        .bind(&record.id)
        .bind(&record.public_key_b64)
        .bind(&record.fingerprint)
        .bind(record.roles.to_wire())
        .bind(record.status.as_str())
        .bind(record.expires_at.map(|at| at.timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE keyring SET status = 'revoked' WHERE ae_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY ae_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        self.fetch_one_where("fingerprint", fingerprint).await
    }

    async fn find_by_public_key(
        &self,
        public_key_b64: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        self.fetch_one_where("pubkey_b64", public_key_b64).await
    }
}

//! The SQLite-backed key→value store for `CacheFingerprint`s.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Error;
use crate::key::CacheFingerprint;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS fingerprints (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// A single SQLite database holding `key -> CacheFingerprint` entries for
/// one cache scope (persistent or transient).
pub struct DependencyCache {
    pool: SqlitePool,
    transient_file: Option<PathBuf>,
}

impl DependencyCache {
    /// Opens (creating if absent) a persistent cache database at `path`.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new().filename(path.as_ref()).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, transient_file: None })
    }

    /// Opens a fresh per-process SQLite database in a temp directory,
    /// deleted when this handle is dropped.
    #[tracing::instrument(skip_all)]
    pub async fn open_transient() -> Result<Self, Error> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("gradecore-cache-{}.sqlite3", uuid::Uuid::new_v4()));
        let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            transient_file: Some(path),
        })
    }

    /// Looks up the fingerprint stored at `key`, if any. A row whose value
    /// fails to deserialize is treated as absent (and logged), matching the
    /// "any corrupted local state is repaired by one more run" recovery
    /// policy.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn lookup(&self, key: &str) -> Result<Option<CacheFingerprint>, Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM fingerprints WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some((value,)) = row else {
            return Ok(None);
        };
        match serde_json::from_str(&value) {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(source) => {
                tracing::warn!(key, %source, "dropping corrupt cache entry");
                self.evict(key).await?;
                Ok(None)
            }
        }
    }

    /// Stores `fingerprint` under `key`, overwriting any existing entry.
    #[tracing::instrument(skip(self, fingerprint), fields(key = %key))]
    pub async fn store(&self, key: &str, fingerprint: &CacheFingerprint) -> Result<(), Error> {
        let value = serde_json::to_string(fingerprint).expect("CacheFingerprint always serializes");
        let updated_at = chrono::Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO fingerprints (key, value, updated_at) VALUES (?, ?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at")
            .bind(key)
            .bind(value)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the entry at `key`, if present.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn evict(&self, key: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM fingerprints WHERE key = ?").bind(key).execute(&self.pool).await?;
        Ok(())
    }
}

impl Drop for DependencyCache {
    fn drop(&mut self) {
        if let Some(path) = &self.transient_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

//! Persistent deduplication cache.
//!
//! One SQLite table keyed by content fingerprint records what the pipeline
//! has already handled and which remote document each upload produced. The
//! cache is the single local source of truth for "have we seen this content";
//! it is safe to delete and rebuild at the cost of re-querying the remote
//! authority for every subsequently re-observed file.

mod fingerprint;

pub use fingerprint::Fingerprint;

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::instrument;

/// One row per distinct content fingerprint ever observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: Fingerprint,
    /// Source path or mail message id. Informational only.
    pub provenance: String,
    pub size_bytes: i64,
    /// Set only after a confirmed successful upload.
    pub remote_document_id: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl FingerprintRecord {
    /// True when a confirmed upload stands behind this record.
    pub fn is_uploaded(&self) -> bool {
        self.remote_document_id
            .as_deref()
            .map_or(false, |id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub total: i64,
    pub uploaded: i64,
    /// Records seen but never confirmed uploaded (in flight or failed).
    pub pending: i64,
}

#[derive(Clone)]
pub struct DedupCache {
    pool: SqlitePool,
}

type RecordRow = (String, String, i64, Option<String>, String, String);

impl DedupCache {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let cache = Self { pool };
        cache.init_schema().await?;
        Ok(cache)
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS fingerprints (\
                fingerprint TEXT PRIMARY KEY,\
                provenance TEXT NOT NULL,\
                size_bytes INTEGER NOT NULL,\
                remote_document_id TEXT,\
                first_seen_at TEXT NOT NULL,\
                last_seen_at TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read-only lookup; never performs remote I/O.
    pub async fn lookup(&self, fp: &Fingerprint) -> Result<Option<FingerprintRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT fingerprint, provenance, size_bytes, remote_document_id, \
             first_seen_at, last_seen_at FROM fingerprints WHERE fingerprint = ?1",
        )
        .bind(fp.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(record_from_row))
    }

    /// Idempotent upsert. Creates the record when absent; when present only
    /// `last_seen_at` moves. `provenance`, `size_bytes`, `first_seen_at` and
    /// `remote_document_id` keep their original values.
    #[instrument(skip(self))]
    pub async fn record_seen(
        &self,
        fp: &Fingerprint,
        provenance: &str,
        size_bytes: i64,
    ) -> Result<FingerprintRecord> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query_as::<_, RecordRow>(
            "INSERT INTO fingerprints \
             (fingerprint, provenance, size_bytes, remote_document_id, first_seen_at, last_seen_at) \
             VALUES (?1, ?2, ?3, NULL, ?4, ?4) \
             ON CONFLICT(fingerprint) DO UPDATE SET last_seen_at = excluded.last_seen_at \
             RETURNING fingerprint, provenance, size_bytes, remote_document_id, \
             first_seen_at, last_seen_at",
        )
        .bind(fp.as_str())
        .bind(provenance)
        .bind(size_bytes)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(record_from_row(row))
    }

    /// Commit the remote id after a confirmed upload. Errors when no record
    /// exists; callers must `record_seen` first.
    #[instrument(skip(self))]
    pub async fn record_uploaded(&self, fp: &Fingerprint, remote_document_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE fingerprints SET remote_document_id = ?1 WHERE fingerprint = ?2",
        )
        .bind(remote_document_id)
        .bind(fp.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("no fingerprint record for {fp}; record_seen must run first");
        }
        Ok(())
    }

    /// Drop one record, forcing re-verification the next time the content is
    /// observed. Returns whether a record existed.
    #[instrument(skip(self))]
    pub async fn forget(&self, fp: &Fingerprint) -> Result<bool> {
        let result = sqlx::query("DELETE FROM fingerprints WHERE fingerprint = ?1")
            .bind(fp.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fingerprints")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let (total, uploaded): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
             COUNT(CASE WHEN remote_document_id IS NOT NULL AND remote_document_id != '' THEN 1 END) \
             FROM fingerprints",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats {
            total,
            uploaded,
            pending: total - uploaded,
        })
    }

    /// Wipe every record. Returns how many were dropped.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fingerprints")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: RecordRow) -> FingerprintRecord {
    let (fingerprint, provenance, size_bytes, remote_document_id, first_seen_at, last_seen_at) = row;
    FingerprintRecord {
        fingerprint: Fingerprint::from_storage(fingerprint),
        provenance,
        size_bytes,
        remote_document_id,
        first_seen_at: parse_ts(&first_seen_at),
        last_seen_at: parse_ts(&last_seen_at),
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_cache() -> (tempfile::TempDir, DedupCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DedupCache::open(&dir.path().join("dedup.db")).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn record_seen_inserts_then_only_touches_last_seen() {
        let (_dir, cache) = temp_cache().await;
        let fp = Fingerprint::of(b"content");

        let first = cache.record_seen(&fp, "/inbox/a.pdf", 7).await.unwrap();
        assert_eq!(first.provenance, "/inbox/a.pdf");
        assert_eq!(first.size_bytes, 7);
        assert!(!first.is_uploaded());

        cache.record_uploaded(&fp, "42").await.unwrap();

        // Re-observe with different provenance and size: nothing but
        // last_seen_at may move, and the remote id survives.
        let again = cache.record_seen(&fp, "/elsewhere/b.pdf", 99).await.unwrap();
        assert_eq!(again.provenance, "/inbox/a.pdf");
        assert_eq!(again.size_bytes, 7);
        assert_eq!(again.first_seen_at, first.first_seen_at);
        assert_eq!(again.remote_document_id.as_deref(), Some("42"));
        assert!(again.last_seen_at >= first.last_seen_at);
    }

    #[tokio::test]
    async fn record_uploaded_requires_existing_record() {
        let (_dir, cache) = temp_cache().await;
        let fp = Fingerprint::of(b"never seen");
        let err = cache.record_uploaded(&fp, "7").await.unwrap_err();
        assert!(err.to_string().contains("record_seen"));
    }

    #[tokio::test]
    async fn lookup_roundtrip_and_forget() {
        let (_dir, cache) = temp_cache().await;
        let fp = Fingerprint::of(b"roundtrip");

        assert!(cache.lookup(&fp).await.unwrap().is_none());
        cache.record_seen(&fp, "msg-1#1", 11).await.unwrap();

        let record = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(record.fingerprint, fp);
        assert_eq!(record.provenance, "msg-1#1");
        assert!(!record.is_uploaded());

        assert!(cache.forget(&fp).await.unwrap());
        assert!(!cache.forget(&fp).await.unwrap());
        assert!(cache.lookup(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_split_uploaded_from_pending() {
        let (_dir, cache) = temp_cache().await;
        let done = Fingerprint::of(b"done");
        let pending = Fingerprint::of(b"pending");

        cache.record_seen(&done, "a", 1).await.unwrap();
        cache.record_uploaded(&done, "9").await.unwrap();
        cache.record_seen(&pending, "b", 2).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(cache.count().await.unwrap(), 2);

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.db");
        let fp = Fingerprint::of(b"durable");

        {
            let cache = DedupCache::open(&path).await.unwrap();
            cache.record_seen(&fp, "x", 3).await.unwrap();
            cache.record_uploaded(&fp, "17").await.unwrap();
        }

        let cache = DedupCache::open(&path).await.unwrap();
        let record = cache.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(record.remote_document_id.as_deref(), Some("17"));
    }
}

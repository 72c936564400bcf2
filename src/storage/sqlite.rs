//! SQLite persistent buffer
//!
//! Values are stored one row per result in `buffered_values`, keyed by
//! value id. The database runs in WAL mode so a crash mid-spill loses at
//! most the batch being written.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::PersistentBuffer;
use super::error::{StorageError, StorageResult};
use super::schema::BufferedValue;

pub struct SqliteBuffer {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBuffer {
    /// Open (or create) the buffer file and apply migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("opening persistent buffer at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        // a single writer; more connections only add lock contention
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Open {
                path: db_path_str.clone(),
                reason: e.to_string(),
            })?;

        debug!("running persistent buffer migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn from_row(row: &SqliteRow) -> StorageResult<BufferedValue> {
        let non_negative = |name: &str, value: i64| {
            u64::try_from(value)
                .map_err(|_| StorageError::CorruptRow(format!("negative {name}: {value}")))
        };

        let id: i64 = row.try_get("id")?;
        let itemid: i64 = row.try_get("itemid")?;
        let lastlogsize: Option<i64> = row.try_get("lastlogsize")?;
        let ns: i64 = row.try_get("ns")?;

        Ok(BufferedValue {
            id: non_negative("id", id)?,
            itemid: non_negative("itemid", itemid)?,
            value: row.try_get("value")?,
            state: row.try_get("state")?,
            lastlogsize: lastlogsize
                .map(|size| non_negative("lastlogsize", size))
                .transpose()?,
            mtime: row.try_get("mtime")?,
            clock: row.try_get("clock")?,
            ns: u32::try_from(ns)
                .map_err(|_| StorageError::CorruptRow(format!("invalid ns: {ns}")))?,
        })
    }
}

#[async_trait]
impl PersistentBuffer for SqliteBuffer {
    #[instrument(skip(self, values), fields(count = values.len()))]
    async fn push_batch(&self, values: Vec<BufferedValue>) -> StorageResult<()> {
        if values.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for value in values {
            sqlx::query(
                r#"
                INSERT INTO buffered_values (id, itemid, value, state, lastlogsize, mtime, clock, ns)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(value.id as i64)
            .bind(value.itemid as i64)
            .bind(value.value)
            .bind(value.state)
            .bind(value.lastlogsize.map(|v| v as i64))
            .bind(value.mtime)
            .bind(value.clock)
            .bind(i64::from(value.ns))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("spill complete");
        Ok(())
    }

    async fn oldest(&self, limit: usize) -> StorageResult<Vec<BufferedValue>> {
        let rows = sqlx::query(
            r#"
            SELECT id, itemid, value, state, lastlogsize, mtime, clock, ns
            FROM buffered_values
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn remove(&self, ids: &[u64]) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM buffered_values WHERE id = ?")
                .bind(*id as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_before(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM buffered_values WHERE clock < ?")
            .bind(before.timestamp())
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("deleted {} expired buffered values", deleted);
        }
        Ok(deleted)
    }

    async fn count(&self) -> StorageResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM buffered_values")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0) as u64)
    }

    async fn max_id(&self) -> StorageResult<Option<u64>> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM buffered_values")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.map(|id| id.max(0) as u64))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing persistent buffer");
        self.pool.close().await;
        Ok(())
    }
}

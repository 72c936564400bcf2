//! In-memory persistent buffer (no persistence)
//!
//! Behaves like the SQLite backend but keeps everything in a `BTreeMap`.
//! Used by tests and when the `persistent-buffer` feature is disabled.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::backend::PersistentBuffer;
use super::error::StorageResult;
use super::schema::BufferedValue;

#[derive(Debug, Default)]
pub struct MemoryBuffer {
    values: Mutex<BTreeMap<u64, BufferedValue>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, BufferedValue>> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl PersistentBuffer for MemoryBuffer {
    async fn push_batch(&self, values: Vec<BufferedValue>) -> StorageResult<()> {
        let mut stored = self.values();
        for value in values {
            stored.insert(value.id, value);
        }
        Ok(())
    }

    async fn oldest(&self, limit: usize) -> StorageResult<Vec<BufferedValue>> {
        Ok(self.values().values().take(limit).cloned().collect())
    }

    async fn remove(&self, ids: &[u64]) -> StorageResult<u64> {
        let mut stored = self.values();
        Ok(ids.iter().filter(|id| stored.remove(id).is_some()).count() as u64)
    }

    async fn cleanup_before(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let cutoff = before.timestamp();
        let mut stored = self.values();
        let size = stored.len();
        stored.retain(|_, value| value.clock >= cutoff);
        Ok((size - stored.len()) as u64)
    }

    async fn count(&self) -> StorageResult<u64> {
        Ok(self.values().len() as u64)
    }

    async fn max_id(&self) -> StorageResult<Option<u64>> {
        Ok(self.values().keys().next_back().copied())
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory buffer (no-op)");
        Ok(())
    }
}

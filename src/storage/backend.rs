//! Persistent buffer trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::BufferedValue;

/// Durable FIFO of values waiting for delivery
///
/// Implementations must be `Send + Sync`; the result cache actor owns the
/// only handle but calls it across await points.
#[async_trait]
pub trait PersistentBuffer: Send + Sync {
    /// Append values; ids are unique and increase with insertion order
    async fn push_batch(&self, values: Vec<BufferedValue>) -> StorageResult<()>;

    /// Up to `limit` values with the lowest ids
    async fn oldest(&self, limit: usize) -> StorageResult<Vec<BufferedValue>>;

    /// Delete delivered values, returning how many were removed
    async fn remove(&self, ids: &[u64]) -> StorageResult<u64>;

    /// Delete values collected before `before`
    async fn cleanup_before(&self, before: DateTime<Utc>) -> StorageResult<u64>;

    async fn count(&self) -> StorageResult<u64>;

    /// Highest stored id, so a restarted agent keeps ids increasing
    async fn max_id(&self) -> StorageResult<Option<u64>>;

    async fn close(&self) -> StorageResult<()>;
}

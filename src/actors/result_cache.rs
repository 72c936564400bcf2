//! ResultCacheActor - Buffers check results until they are delivered
//!
//! ## Flush Triggers
//!
//! - **Size**: the buffer reaches `buffer_size` values
//! - **Time**: every `send_period`
//! - **Explicit**: `flush()` / `flush_output()` and shutdown
//!
//! Values are dropped from the buffer only after the server accepted them,
//! so delivery is at-least-once. When the buffer grows past its capacity
//! the oldest values are either dropped or spilled to the persistent
//! buffer, which is always delivered first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{CacheStats, ResultCacheCommand};
use crate::protocol::TransportError;
use crate::storage::{BufferedValue, PersistentBuffer};
use crate::task::ResultWriter;
use crate::{CheckResult, VERSION};

/// Retention cleanup period of the persistent buffer
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no active server address")]
    NoAddress,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid server response: {0}")]
    InvalidResponse(String),

    #[error("server rejected data: {0}")]
    Rejected(String),
}

/// Delivery target for result envelopes
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, envelope: &DataEnvelope) -> Result<(), UploadError>;
}

/// `agent data` request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub request: String,
    pub data: Vec<BufferedValue>,
    pub sessionid: String,
    pub host: String,
    pub version: String,
    pub clock: i64,
    pub ns: u32,
}

impl DataEnvelope {
    pub fn new(host: &str, session: &str, data: Vec<BufferedValue>) -> Self {
        let now = Utc::now();
        Self {
            request: "agent data".to_string(),
            data,
            sessionid: session.to_string(),
            host: host.to_string(),
            version: VERSION.to_string(),
            clock: now.timestamp(),
            ns: now.timestamp_subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub hostname: String,
    /// Size trigger
    pub buffer_size: usize,
    /// Values kept in memory while delivery fails
    pub capacity: usize,
    /// Time trigger
    pub send_period: Duration,
    /// How long spilled values are kept
    pub persistent_period: Duration,
}

impl CacheConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            buffer_size: 100,
            capacity: 1000,
            send_period: Duration::from_secs(5),
            persistent_period: Duration::from_secs(60 * 60),
        }
    }
}

pub struct ResultCacheActor {
    config: CacheConfig,
    session: String,
    memory: VecDeque<BufferedValue>,
    persistent: Option<Arc<dyn PersistentBuffer>>,
    output: Option<Arc<dyn Uploader>>,
    command_rx: mpsc::Receiver<ResultCacheCommand>,
    last_id: u64,
    /// Size-triggered flushes wait until this instant after a failure
    backoff_until: Option<Instant>,
    delivered: u64,
    dropped: u64,
    flush_count: u64,
}

impl ResultCacheActor {
    pub fn new(
        config: CacheConfig,
        output: Option<Arc<dyn Uploader>>,
        persistent: Option<Arc<dyn PersistentBuffer>>,
        command_rx: mpsc::Receiver<ResultCacheCommand>,
    ) -> Self {
        let capacity = config.capacity.max(config.buffer_size).max(1);
        Self {
            config: CacheConfig { capacity, ..config },
            session: uuid::Uuid::new_v4().simple().to_string(),
            memory: VecDeque::with_capacity(capacity),
            persistent,
            output,
            command_rx,
            last_id: 0,
            backoff_until: None,
            delivered: 0,
            dropped: 0,
            flush_count: 0,
        }
    }

    #[instrument(skip(self), fields(host = %self.config.hostname))]
    pub async fn run(mut self) {
        debug!(
            "starting result cache (size trigger {}, capacity {}, persistent: {})",
            self.config.buffer_size,
            self.config.capacity,
            self.persistent.is_some()
        );

        if let Some(persistent) = &self.persistent {
            match persistent.max_id().await {
                Ok(Some(id)) => {
                    info!("continuing after {} buffered value ids", id);
                    self.last_id = id;
                }
                Ok(None) => {}
                Err(e) => error!("failed to read persistent buffer: {}", e),
            }
        }

        let mut send_timer = time::interval_at(
            Instant::now() + self.config.send_period,
            self.config.send_period,
        );
        send_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_timer = time::interval(CLEANUP_INTERVAL);
        let has_persistent = self.persistent.is_some();

        let shutdown_ack = loop {
            tokio::select! {
                _ = send_timer.tick() => {
                    self.backoff_until = None;
                    if let Err(e) = self.flush(None).await {
                        trace!("time-based flush failed: {:#}", e);
                    }
                }

                _ = cleanup_timer.tick(), if has_persistent => {
                    self.cleanup().await;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ResultCacheCommand::Write(result)) => {
                            self.write(result).await;
                        }

                        Some(ResultCacheCommand::Flush { target, respond_to }) => {
                            debug!("manual flush requested");
                            let _ = respond_to.send(self.flush(target).await);
                        }

                        Some(ResultCacheCommand::SetOutput(output)) => {
                            self.output = Some(output);
                        }

                        Some(ResultCacheCommand::GetStats { respond_to }) => {
                            let _ = respond_to.send(self.stats().await);
                        }

                        Some(ResultCacheCommand::Shutdown { respond_to }) => {
                            debug!("received shutdown command");
                            break Some(respond_to);
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            break None;
                        }
                    }
                }
            }
        };

        // final delivery attempt; whatever is left goes to disk if possible
        if !self.memory.is_empty() {
            debug!("final flush before shutdown ({} values)", self.memory.len());
            if let Err(e) = self.flush(None).await {
                warn!("final flush failed: {:#}", e);
                let remaining = self.memory.len();
                if self.spill(remaining).await {
                    info!("kept {} undelivered values in the persistent buffer", remaining);
                } else if remaining > 0 {
                    warn!("{} undelivered values lost on shutdown", remaining);
                }
            }
        }

        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.close().await {
                error!("error closing persistent buffer: {}", e);
            }
        }

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        debug!("result cache stopped");
    }

    async fn write(&mut self, result: CheckResult) {
        self.last_id += 1;
        let value = BufferedValue::from_result(self.last_id, &result);
        trace!("buffering value {} of item {}", value.id, value.itemid);
        self.memory.push_back(value);

        let excess = self.memory.len().saturating_sub(self.config.capacity);
        if excess > 0 && !self.spill(excess).await {
            for _ in 0..excess {
                self.memory.pop_front();
            }
            self.dropped += excess as u64;
            warn!("result buffer full, dropped {} oldest values", excess);
        }

        let backing_off = self.backoff_until.is_some_and(|until| Instant::now() < until);
        if self.memory.len() >= self.config.buffer_size && !backing_off {
            trace!("size-based flush triggered ({} values)", self.memory.len());
            if let Err(e) = self.flush(None).await {
                trace!("size-based flush failed: {:#}", e);
            }
        }
    }

    /// Move the `count` oldest memory values to the persistent buffer
    async fn spill(&mut self, count: usize) -> bool {
        let Some(persistent) = &self.persistent else {
            return false;
        };
        let batch: Vec<BufferedValue> = self.memory.iter().take(count).cloned().collect();
        match persistent.push_batch(batch).await {
            Ok(()) => {
                self.memory.drain(..count.min(self.memory.len()));
                trace!("spilled {} values to the persistent buffer", count);
                true
            }
            Err(e) => {
                error!("failed to spill values: {}", e);
                false
            }
        }
    }

    /// Deliver spilled values, oldest first, then the memory buffer
    async fn flush(&mut self, target: Option<Arc<dyn Uploader>>) -> Result<usize> {
        let Some(output) = target.or_else(|| self.output.clone()) else {
            return Err(anyhow!("no output configured"));
        };

        let result = self.deliver(output.as_ref()).await;
        match &result {
            Ok(count) => {
                self.backoff_until = None;
                if *count > 0 {
                    self.flush_count += 1;
                    debug!("flush #{} delivered {} values", self.flush_count, count);
                }
            }
            Err(_) => {
                self.backoff_until = Some(Instant::now() + self.config.send_period);
            }
        }
        result
    }

    async fn deliver(&mut self, output: &dyn Uploader) -> Result<usize> {
        let mut delivered = 0;

        if let Some(persistent) = self.persistent.clone() {
            loop {
                let batch = persistent
                    .oldest(self.config.buffer_size.max(1))
                    .await
                    .context("failed to read persistent buffer")?;
                if batch.is_empty() {
                    break;
                }
                let ids: Vec<u64> = batch.iter().map(|v| v.id).collect();
                let envelope = DataEnvelope::new(&self.config.hostname, &self.session, batch);
                output
                    .upload(&envelope)
                    .await
                    .context("failed to deliver persisted values")?;

                persistent
                    .remove(&ids)
                    .await
                    .context("failed to remove delivered values")?;
                delivered += ids.len();
                self.delivered += ids.len() as u64;
            }
        }

        while !self.memory.is_empty() {
            let count = self.memory.len().min(self.config.capacity);
            let batch: Vec<BufferedValue> = self.memory.iter().take(count).cloned().collect();
            let envelope = DataEnvelope::new(&self.config.hostname, &self.session, batch);
            output
                .upload(&envelope)
                .await
                .context("failed to deliver values")?;

            self.memory.drain(..count);
            delivered += count;
            self.delivered += count as u64;
        }

        Ok(delivered)
    }

    async fn cleanup(&mut self) {
        let Some(persistent) = &self.persistent else {
            return;
        };
        let retention = chrono::Duration::from_std(self.config.persistent_period)
            .unwrap_or(chrono::Duration::hours(1));
        let cutoff = Utc::now() - retention;
        match persistent.cleanup_before(cutoff).await {
            Ok(0) => trace!("retention cleanup: nothing expired"),
            Ok(deleted) => info!("retention cleanup removed {} expired values", deleted),
            Err(e) => error!("failed to clean up persistent buffer: {}", e),
        }
    }

    async fn stats(&self) -> CacheStats {
        let persisted = match &self.persistent {
            Some(persistent) => persistent.count().await.unwrap_or(0),
            None => 0,
        };
        CacheStats {
            buffered: self.memory.len(),
            persisted,
            delivered: self.delivered,
            dropped: self.dropped,
            flush_count: self.flush_count,
            last_id: self.last_id,
        }
    }
}

/// Handle for controlling the ResultCacheActor
#[derive(Clone)]
pub struct ResultCacheHandle {
    sender: mpsc::Sender<ResultCacheCommand>,
}

impl ResultCacheHandle {
    pub fn spawn(
        config: CacheConfig,
        output: Option<Arc<dyn Uploader>>,
        persistent: Option<Arc<dyn PersistentBuffer>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let actor = ResultCacheActor::new(config, output, persistent, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    pub async fn write(&self, result: CheckResult) -> Result<()> {
        self.sender
            .send(ResultCacheCommand::Write(result))
            .await
            .context("failed to send Write command")?;
        Ok(())
    }

    /// Deliver everything buffered now; returns the number of values sent
    pub async fn flush(&self) -> Result<usize> {
        self.send_flush(None).await
    }

    /// Like [`flush`](Self::flush) but to a one-off target
    pub async fn flush_output(&self, target: Arc<dyn Uploader>) -> Result<usize> {
        self.send_flush(Some(target)).await
    }

    async fn send_flush(&self, target: Option<Arc<dyn Uploader>>) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ResultCacheCommand::Flush {
                target,
                respond_to: tx,
            })
            .await
            .context("failed to send Flush command")?;

        rx.await.context("failed to receive flush result")?
    }

    pub async fn set_output(&self, output: Arc<dyn Uploader>) -> Result<()> {
        self.sender
            .send(ResultCacheCommand::SetOutput(output))
            .await
            .context("failed to send SetOutput command")?;
        Ok(())
    }

    pub async fn stats(&self) -> Option<CacheStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ResultCacheCommand::GetStats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Stop after a final delivery attempt
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ResultCacheCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await.context("result cache stopped without acknowledging")?;
        Ok(())
    }
}

#[async_trait]
impl ResultWriter for ResultCacheHandle {
    async fn write(&self, result: CheckResult) {
        if let Err(e) = ResultCacheHandle::write(self, result).await {
            warn!("result dropped: {:#}", e);
        }
    }
}

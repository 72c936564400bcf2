//! Message types for actor communication
//!
//! Every actor owns one bounded mpsc command channel carrying a closed enum;
//! request/response pairs use a oneshot `respond_to` sender. `Shutdown` is
//! an ordinary variant, handled in arrival order like everything else.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::result_cache::Uploader;
use crate::CheckResult;
use crate::expression::Expressions;
use crate::task::{ItemRequest, ResultWriter};

/// Commands accepted by the SchedulerActor
pub enum SchedulerCommand {
    /// Replace the desired item list of one client
    Update {
        client_id: u64,
        writer: Arc<dyn ResultWriter>,
        requests: Vec<ItemRequest>,
        expressions: Arc<Expressions>,
        respond_to: oneshot::Sender<UpdateSummary>,
    },

    /// Evaluate one key once, outside the periodic queue
    ///
    /// The result goes to `writer`; the caller owns the timeout.
    CheckOnce {
        key: String,
        writer: Arc<dyn ResultWriter>,
    },

    GetStats {
        respond_to: oneshot::Sender<SchedulerStats>,
    },

    Shutdown,
}

/// Outcome of an `Update`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Items skipped because their key or delay could not be used
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Live tasks of every kind
    pub tasks: usize,
    /// Tasks currently dispatched
    pub running: usize,
    pub clients: usize,
    pub completed: u64,
}

/// Commands accepted by the ResultCacheActor
pub enum ResultCacheCommand {
    Write(CheckResult),

    /// Attempt delivery now, optionally to a different target
    Flush {
        target: Option<Arc<dyn Uploader>>,
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    SetOutput(Arc<dyn Uploader>),

    GetStats {
        respond_to: oneshot::Sender<CacheStats>,
    },

    /// Final delivery attempt, then stop; acknowledged once done
    Shutdown { respond_to: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Values held in memory
    pub buffered: usize,
    /// Values spilled to the persistent buffer
    pub persisted: u64,
    pub delivered: u64,
    /// Values discarded because the buffer was full
    pub dropped: u64,
    pub flush_count: u64,
    pub last_id: u64,
}

/// Commands accepted by the ActiveChecksActor
#[derive(Debug)]
pub enum ConnectorCommand {
    /// Refresh the active check list immediately
    RefreshNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    Shutdown,
}

/// Commands accepted by the ListenerActor
#[derive(Debug)]
pub enum ListenerCommand {
    Shutdown,
}

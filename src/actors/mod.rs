//! Actor-based agent core
//!
//! Each actor runs as an independent async task and is driven through a
//! handle that wraps its command channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!   ListenerActor ──check_once──┐
//!                               ▼
//!   ActiveChecksActor ──update──► SchedulerActor ──plugin calls──► plugins
//!          │                        │
//!          │ ServerLink             │ results (ResultWriter)
//!          ▼                        ▼
//!       server ◄──── upload ─── ResultCacheActor ◄──► PersistentBuffer
//! ```
//!
//! One ActiveChecksActor and one ResultCacheActor run per server cluster;
//! they share that cluster's [`active_checks::ServerLink`].
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each actor owns an mpsc channel of a closed command enum
//! 2. **Request/Response**: oneshot channels for replies and acknowledgements
//! 3. **Results**: plugins write through the [`crate::task::ResultWriter`] of
//!    the client that owns the item

pub mod active_checks;
pub mod listener;
pub mod messages;
pub mod result_cache;
pub mod scheduler;

//! Persistent result buffer
//!
//! When the server stays unreachable long enough for the in-memory result
//! buffer to fill up, overflowing values are spilled here instead of being
//! dropped. Spilled values are delivered first, oldest first, once the
//! server is reachable again.
//!
//! ## Backends
//!
//! - **SQLite** (`persistent-buffer` feature): WAL-mode database file
//! - **In-memory**: no persistence, used in tests and when the feature is off

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "persistent-buffer")]
pub mod sqlite;

pub use backend::PersistentBuffer;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBuffer;
pub use schema::BufferedValue;

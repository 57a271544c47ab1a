//! Storage - backends for checkpoint records, shards and tracker files
//!
//! Paths are `/`-separated and relative to the backend root. Writes are
//! atomic, so a reader never observes a half-written record or tracker.
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.ensure_dir("run/iter_0000100").await?;
//! storage.write("run/latest_checkpointed_iteration.txt", Bytes::from("100")).await?;
//! let tracker = storage.read("run/latest_checkpointed_iteration.txt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::{join, parent, StorageBackend};
pub use local::LocalStorage;

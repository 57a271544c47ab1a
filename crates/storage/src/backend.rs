//! Storage backend trait definition
//!
//! Defines the async interface checkpoint persistence runs on.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;

/// Async trait for storage backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the whole object at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing exists at `path`
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write `data` to `path`, replacing any previous object
    ///
    /// Creates parent directories if they don't exist. The write is atomic:
    /// readers see either the old object or the complete new one.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Check whether an object or directory exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create `path` and its parents; succeeds if it already exists
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    /// Names of the immediate entries of directory `path`, sorted.
    ///
    /// A missing directory lists as empty.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;
}

/// Join two storage paths with a single `/`
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Parent directory of a storage path, or `""` at the root
pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

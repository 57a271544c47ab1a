//! Local filesystem storage backend
//!
//! Writes go to a uniquely named temp file next to the target, are synced,
//! then renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory all paths are relative to
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Root directory of this backend
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path.trim_start_matches('/'))
    }

    /// Temp file in the target's directory so the final rename never
    /// crosses filesystems
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    fn storage_error(action: &str, path: &Path, e: std::io::Error) -> Error {
        Error::Storage {
            message: format!("Failed to {} {:?}: {}", action, path, e),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);

        match fs::read(&full_path).await {
            Ok(data) => {
                debug!(?full_path, size = data.len(), "Read file");
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Self::storage_error("read", &full_path, e)),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::storage_error("create directory", parent, e))?;
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Self::storage_error("create temp file", &temp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| Self::storage_error("write", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| Self::storage_error("sync", &temp_path, e))?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::storage_error("rename into", &full_path, e));
        }

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        Ok(fs::metadata(&full_path).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| Self::storage_error("create directory", &full_path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let full_path = self.resolve_path(path);
        let mut entries = match fs::read_dir(&full_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::storage_error("list", &full_path, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::storage_error("list", &full_path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            // In-flight atomic writes
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            names.push(name);
        }

        names.sort();
        debug!(?full_path, count = names.len(), "Listed directory");
        Ok(names)
    }
}

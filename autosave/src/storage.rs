//! File I/O backend behind the permission gate.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Contents of `path`, or `None` if it does not exist.
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replace `path` with `data`. Readers never observe a partial file.
    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Modification time of `path`, or `None` if it does not exist.
    async fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>>;

    /// Names of `*.json` files directly inside `dir`, sorted.
    async fn list_json(&self, dir: &Path) -> io::Result<Vec<String>>;
}

/// Local filesystem storage on `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl FsStorage {
    /// Temp sibling used for atomic replacement. Hidden so it never shows up
    /// in `list_json`, and unique so concurrent writers cannot collide.
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let tmp = Self::temp_path(path);
        if let Err(err) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.modified().map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_json(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && name.to_ascii_lowercase().ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

//! File operations on the workspace
//!
//! Every operation resolves its path through the sandbox first; a rejected
//! path never reaches the disk.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::server::path_guard::{resolve_safe_path, PathError};

/// Suffix of the hidden files used for atomic writes
pub const TEMP_FILE_SUFFIX: &str = ".cy-tmp";

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("Invalid file path: {0}")]
    Rejected(#[from] PathError),
    #[error("File not found")]
    NotFound,
    #[error("Target is a directory")]
    IsDirectory,
    #[error("File is not valid UTF-8")]
    InvalidUtf8,
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FileStoreError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            FileStoreError::NotFound
        } else {
            FileStoreError::Io(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: u64,
}

/// True for the transient files [`FileStore::write`] renames into place
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_FILE_SUFFIX))
        .unwrap_or(false)
}

/// Workspace-bound file store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Arc<PathBuf>,
}

impl FileStore {
    /// `root` should already be canonical; see [`crate::server::ws::prepare_workspace`].
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only sandbox violations are `Rejected`; a disk error met while
    /// resolving (e.g. a file used as a directory) is reported as I/O.
    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf, FileStoreError> {
        match resolve_safe_path(&self.root, relative_path) {
            Ok(path) => Ok(path),
            Err(PathError::Io(e)) => Err(e.into()),
            Err(e) => Err(FileStoreError::Rejected(e)),
        }
    }

    pub async fn stat(&self, relative_path: &str) -> Result<FileStat, FileStoreError> {
        let path = self.resolve(relative_path)?;
        let metadata = fs::metadata(&path).await?;
        Ok(FileStat {
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        })
    }

    /// Read file content as UTF-8 string
    pub async fn read(&self, relative_path: &str) -> Result<String, FileStoreError> {
        let path = self.resolve(relative_path)?;
        debug!(path = ?path, "Reading file");

        if fs::metadata(&path).await?.is_dir() {
            return Err(FileStoreError::IsDirectory);
        }
        let content = fs::read(&path).await?;
        String::from_utf8(content).map_err(|_| FileStoreError::InvalidUtf8)
    }

    /// Replace the whole file content, creating it (and parents) if needed.
    ///
    /// Content is written to a hidden sibling temp file and renamed over the
    /// target, so readers see either the old or the new content.
    pub async fn write(&self, relative_path: &str, content: &str) -> Result<u64, FileStoreError> {
        let path = self.resolve(relative_path)?;
        debug!(path = ?path, bytes = content.len(), "Writing file");

        let permissions = match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => return Err(FileStoreError::IsDirectory),
            Ok(metadata) => Some(metadata.permissions()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(FileStoreError::Io(e)),
        };
        // The root itself has no file name and is always a directory.
        if path.file_name().is_none() {
            return Err(FileStoreError::IsDirectory);
        }

        let parent = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&parent).await?;

        // Fixed-length name: any name the target can have, the temp file can too.
        let temp_path = parent.join(format!(
            ".{}{}",
            Uuid::new_v4().simple(),
            TEMP_FILE_SUFFIX
        ));
        if let Err(e) = write_temp(&temp_path, content.as_bytes(), permissions).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(content.len() as u64)
    }

    /// Remove exactly one file
    pub async fn delete(&self, relative_path: &str) -> Result<(), FileStoreError> {
        let path = self.resolve(relative_path)?;
        debug!(path = ?path, "Deleting file");

        if fs::symlink_metadata(&path).await?.is_dir() {
            return Err(FileStoreError::IsDirectory);
        }
        fs::remove_file(&path).await?;
        Ok(())
    }
}

/// Write and sync the temp file; an overwrite keeps the target's mode bits
async fn write_temp(
    path: &Path,
    bytes: &[u8],
    permissions: Option<std::fs::Permissions>,
) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    if let Some(permissions) = permissions {
        file.set_permissions(permissions).await?;
    }
    file.sync_all().await
}

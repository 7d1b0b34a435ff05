//! Recursive workspace snapshot for the file explorer
//!
//! Serializes as nested JSON objects: a file is `null`, a directory is an
//! object of its children.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tracing::debug;

use crate::server::file_store::is_temp_file;

/// Children of a directory, ordered by name
pub type FileTree = BTreeMap<String, FileNode>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileNode {
    Directory(FileTree),
    File,
}

/// Snapshot everything under `root`.
///
/// Symlinks are listed as leaves and never followed. Entries deleted while
/// the walk is running are skipped; the result is best effort, not a
/// consistent cut of the filesystem.
pub async fn build_tree(root: &Path) -> io::Result<FileTree> {
    build_dir(root.to_path_buf()).await
}

type TreeFuture = Pin<Box<dyn Future<Output = io::Result<FileTree>> + Send>>;

fn build_dir(dir: PathBuf) -> TreeFuture {
    Box::pin(async move {
        let mut tree = FileTree::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp_file(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            if file_type.is_dir() {
                match build_dir(path).await {
                    Ok(children) => {
                        tree.insert(name, FileNode::Directory(children));
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(dir = %name, "Directory vanished during tree build");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tree.insert(name, FileNode::File);
            }
        }

        Ok(tree)
    })
}

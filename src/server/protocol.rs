use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::server::watcher::{ChangeEvent, ChangeKind};

// ============================================================================
// Realtime channel: one JSON text frame per event, {"event": ..., "data": ...}
// ============================================================================

/// Server → client events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Re-fetch tree and open files; the hub keeps no backlog
    #[serde(rename = "file:refresh")]
    FileRefresh,
    #[serde(rename = "file:added")]
    FileAdded(String),
    #[serde(rename = "file:changed")]
    FileChanged(String),
    #[serde(rename = "file:deleted")]
    FileDeleted(String),
    /// Shell output
    #[serde(rename = "terminal:data")]
    TerminalData(String),
}

/// Client → server events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Overwrite a file with `content`
    #[serde(rename = "file:change")]
    FileChange { path: String, content: String },
    /// Shell input
    #[serde(rename = "terminal:write")]
    TerminalWrite(String),
}

impl ServerEvent {
    /// Output frames never split a character (see the terminal reader), so
    /// lossy decoding only touches bytes that were never valid UTF-8.
    pub fn terminal_data(frame: &Bytes) -> Self {
        ServerEvent::TerminalData(String::from_utf8_lossy(frame).into_owned())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::FileRefresh => "file:refresh",
            ServerEvent::FileAdded(_) => "file:added",
            ServerEvent::FileChanged(_) => "file:changed",
            ServerEvent::FileDeleted(_) => "file:deleted",
            ServerEvent::TerminalData(_) => "terminal:data",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ChangeEvent> for ServerEvent {
    fn from(change: ChangeEvent) -> Self {
        match change.kind {
            ChangeKind::Added => ServerEvent::FileAdded(change.path),
            ChangeKind::Changed => ServerEvent::FileChanged(change.path),
            ChangeKind::Deleted => ServerEvent::FileDeleted(change.path),
        }
    }
}

impl ClientEvent {
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

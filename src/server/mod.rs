pub mod context;
pub mod file_store;
pub mod file_tree;
pub mod hub;
pub mod path_guard;
pub mod protocol;
pub mod rest;
pub mod watcher;
pub mod ws;

pub use context::{ApiError, AppContext};
pub use file_store::{FileStat, FileStore, FileStoreError};
pub use file_tree::{build_tree, FileNode, FileTree};
pub use hub::{BroadcastHub, ClientHandle, ClientId, SharedHub};
pub use path_guard::{resolve_safe_path, PathError, MAX_PATH_LENGTH};
pub use protocol::{ClientEvent, ServerEvent};
pub use watcher::{ChangeEvent, ChangeKind, DirectoryWatcher, WatchError, WatchOptions};
pub use ws::{prepare_workspace, router, run_server, serve, Runtime};

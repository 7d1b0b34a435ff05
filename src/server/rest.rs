//! REST queries for the file explorer. These bypass the hub.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::server::context::{ApiError, AppContext};
use crate::server::file_store::FileStoreError;
use crate::server::file_tree::{build_tree, FileTree};

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TreeResponse {
    pub tree: FileTree,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentResponse {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// GET /files
pub async fn get_tree(State(ctx): State<AppContext>) -> Result<Json<TreeResponse>, ApiError> {
    match build_tree(ctx.store.root()).await {
        Ok(tree) => Ok(Json(TreeResponse { tree })),
        Err(e) => {
            error!(error = %e, "Failed to build file tree");
            Err(ApiError::Internal("Failed to generate file tree".to_string()))
        }
    }
}

/// GET /files/content?path=
pub async fn get_content(
    State(ctx): State<AppContext>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ContentResponse>, ApiError> {
    match ctx.store.read(&query.path).await {
        Ok(content) => {
            debug!(path = %query.path, bytes = content.len(), "Served file content");
            Ok(Json(ContentResponse { content }))
        }
        Err(FileStoreError::Rejected(e)) => {
            warn!(path = %query.path, error = %e, "Rejected read");
            Err(ApiError::InvalidPath)
        }
        Err(e) => {
            debug!(path = %query.path, error = %e, "Read failed");
            Err(ApiError::NotFound)
        }
    }
}

/// DELETE /files with `{"path": ...}`
pub async fn delete_file(
    State(ctx): State<AppContext>,
    Json(body): Json<PathQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    match ctx.store.delete(&body.path).await {
        Ok(()) => {
            info!(path = %body.path, "File deleted");
            Ok(Json(MessageResponse {
                message: "File deleted successfully".to_string(),
            }))
        }
        Err(FileStoreError::Rejected(e)) => {
            warn!(path = %body.path, error = %e, "Rejected delete");
            Err(ApiError::InvalidPath)
        }
        Err(e) => {
            error!(path = %body.path, error = %e, "Delete failed");
            Err(ApiError::Internal("File deletion failed".to_string()))
        }
    }
}

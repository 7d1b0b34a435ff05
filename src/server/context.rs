//! Shared handler state and the REST error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::server::file_store::FileStore;
use crate::server::hub::SharedHub;

/// Everything a request handler needs; cheap to clone per request
#[derive(Clone)]
pub struct AppContext {
    pub store: FileStore,
    pub hub: SharedHub,
}

impl AppContext {
    pub fn new(hub: SharedHub) -> Self {
        Self {
            store: hub.store().clone(),
            hub,
        }
    }
}

/// REST failures. The display text is the body's `error` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 400 - path rejected by the sandbox
    #[error("Invalid file path")]
    InvalidPath,
    /// 404 - file absent or unreadable
    #[error("File not found or inaccessible")]
    NotFound,
    /// 500
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPath => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

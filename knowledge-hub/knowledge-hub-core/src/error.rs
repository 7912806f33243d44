use crate::backend::VersionToken;
use serde::Serialize;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed failures returned by every storage operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("access denied for {principal} on {path}")]
    AccessDenied { principal: String, path: String },

    #[error("version conflict on {path} (current: {})", display_token(.current))]
    VersionConflict {
        path: String,
        current: Option<VersionToken>,
    },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("sync failure: {0}")]
    SyncFailure(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

fn display_token(token: &Option<VersionToken>) -> String {
    token
        .map(|t| t.to_string())
        .unwrap_or_else(|| "absent".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    VersionConflict,
    AlreadyExists,
    BackendUnavailable,
    InvalidPath,
    SyncFailure,
    DeadlineExceeded,
    Internal,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::AccessDenied { .. } => ErrorKind::AccessDenied,
            StoreError::VersionConflict { .. } => ErrorKind::VersionConflict,
            StoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            StoreError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            StoreError::InvalidPath { .. } => ErrorKind::InvalidPath,
            StoreError::SyncFailure(_) => ErrorKind::SyncFailure,
            StoreError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            StoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        StoreError::NotFound { path: path.into() }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        StoreError::InvalidPath {
            path: path.into(),
            reason,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Internal(format!("sqlite: {e}"))
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::BackendUnavailable(format!("connection pool: {e}"))
    }
}

impl From<git2::Error> for StoreError {
    fn from(e: git2::Error) -> Self {
        StoreError::SyncFailure(e.message().to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Internal(format!("serialization: {e}"))
    }
}

impl From<tantivy::TantivyError> for StoreError {
    fn from(e: tantivy::TantivyError) -> Self {
        StoreError::Internal(format!("search index: {e}"))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Internal(format!("worker task failed: {e}"))
    }
}

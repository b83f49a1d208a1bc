use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

// Errors raised by the Content Fetcher. Classified at the edge from
// whatever the underlying git subprocess / transport produced - see
// classify() below and fetch.rs's use of it.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("disk space exhausted: {0}")]
    DiskSpace(String),
    #[error("out of memory: {0}")]
    Memory(String),
    #[error("fetch aborted")]
    Aborted,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    // Classify a raw, unstructured error (subprocess stderr, io::Error
    // Display, etc.) into one of the typed variants above. Already-typed
    // errors should be passed through unchanged rather than re-classified -
    // callers should only call this at the boundary where a raw error first
    // appears.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("404") {
            return FetchError::RepositoryNotFound(message.to_owned());
        }
        if lower.contains("could not find") && lower.contains("branch") {
            return FetchError::BranchNotFound(message.to_owned());
        }
        if lower.contains("enotfound")
            || lower.contains("network is unreachable")
            || lower.contains("could not resolve host")
            || lower.contains("name or service not known")
        {
            return FetchError::Network(message.to_owned());
        }
        if lower.contains("enospc") || lower.contains("no space left on device") {
            return FetchError::DiskSpace(message.to_owned());
        }
        if lower.contains("enomem") || lower.contains("cannot allocate memory") {
            return FetchError::Memory(message.to_owned());
        }
        FetchError::Other(anyhow::anyhow!(message.to_owned()))
    }
}

#[derive(Error, Debug)]
pub enum FsManagerError {
    #[error("filesystem corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// Errors that propagate out of the document/cache serving path to the
// HTTP layer.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timed out waiting for content to become ready")]
    Timeout,
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

impl ServeError {
    fn code(&self) -> &'static str {
        match self {
            ServeError::NotFound(_) => "NOT_FOUND",
            ServeError::Config(_) => "VALIDATION_ERROR",
            ServeError::Timeout => "TIMEOUT_ERROR",
            ServeError::Unauthorized => "UNAUTHORIZED",
            ServeError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::Config(_) => StatusCode::BAD_REQUEST,
            ServeError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                target: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

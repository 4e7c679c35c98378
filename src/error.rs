use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

use crate::models::FailureReason;

/// Rejections raised before an item ever enters the queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("URL is required")]
    EmptyUrl,
    #[error("unsupported URL (expected a YouTube link): {0}")]
    InvalidUrlPrefix(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClearError {
    #[error("cannot clear the queue while a download is in progress")]
    Busy,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("a download is already in progress")]
    AlreadyRunning,
}

/// Terminal outcomes of one fetch agent invocation other than a clean exit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("fetch agent `{0}` was not found")]
    AgentUnavailable(String),
    #[error("failed to launch fetch agent: {0}")]
    LaunchFailed(String),
    #[error("fetch agent exited with code {code:?}")]
    ExitNonZero { code: Option<i32> },
    #[error("fetch agent was cancelled")]
    Cancelled,
}

impl From<AgentError> for FailureReason {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::AgentUnavailable(_) => FailureReason::AgentUnavailable,
            AgentError::LaunchFailed(message) => FailureReason::LaunchFailed { message },
            AgentError::ExitNonZero { code } => FailureReason::ExitNonZero { code },
            AgentError::Cancelled => FailureReason::Cancelled,
        }
    }
}

// HTTP-facing error type for the API listener.
pub enum AppError {
    Internal(anyhow::Error),
    BadRequest(String),
}

// This implementation allows us to convert our AppError into a valid HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(e) => {
                // Log the full error for debugging
                tracing::error!("Internal server error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
        };

        let body = Json(json!({ "status": "error", "message": error_message }));
        (status, body).into_response()
    }
}

// Lets handlers use `?` on anything anyhow can wrap; validation errors are mapped explicitly.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

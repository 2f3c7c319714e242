//! Error kinds shared across the orchestrator, stores, and HTTP surface.
//!
//! The variants are semantic: handlers decide HTTP status codes from the kind,
//! worker-level provider failures never become one of these (they are isolated
//! as `error` chunks inside the merged stream), and `Cancelled` exists so the
//! turn driver can tell "the SSE consumer went away" apart from a real
//! failure.

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Error kinds for council operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouncilError {
    /// Conversation or message missing.
    NotFound(String),
    /// Malformed body, illegal retry state, missing required field.
    BadRequest(String),
    /// A provider call exceeded its deadline.
    UpstreamTimeout(String),
    /// A provider call failed for a non-timeout reason.
    UpstreamFailure(String),
    /// Stage 1 has zero available council members.
    NoMembersAvailable,
    /// Stage 1 produced zero successful responses.
    AllModelsFailed,
    /// The event consumer disappeared mid-run; the turn was abandoned.
    Cancelled,
    /// Anything unexpected.
    Internal(String),
}

impl fmt::Display for CouncilError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CouncilError::NotFound(what) => write!(f, "{} not found", what),
            CouncilError::BadRequest(msg) => write!(f, "{}", msg),
            CouncilError::UpstreamTimeout(msg) => write!(f, "upstream timeout: {}", msg),
            CouncilError::UpstreamFailure(msg) => write!(f, "upstream failure: {}", msg),
            CouncilError::NoMembersAvailable => write!(f, "no council members available"),
            CouncilError::AllModelsFailed => write!(f, "all council models failed to respond"),
            CouncilError::Cancelled => write!(f, "request cancelled by client"),
            CouncilError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for CouncilError {}

impl CouncilError {
    /// HTTP status for this kind. `AllModelsFailed` never reaches this mapping
    /// on the message path (the handler persists an error assistant and
    /// returns 200); the mapping below is the fallback for other surfaces.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CouncilError::NotFound(_) => StatusCode::NOT_FOUND,
            CouncilError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CouncilError::NoMembersAvailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CouncilError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

//! Error types for request context access

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Raised by strict accessors outside of a request's processing scope
    #[error("no request context in scope")]
    NotInScope,
}

impl IntoResponse for ContextError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

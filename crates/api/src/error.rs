//! Error taxonomy for the registration API.
//!
//! Every failure a handler can surface falls into one of six kinds, each
//! with a fixed status mapping. Auth failures deliberately carry short
//! generic messages: a caller probing the endpoint cannot tell "no such
//! nonce" from "wrong sender" from "bad signature" by the response body,
//! and emails or nonces never appear in a response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug)]
pub enum AppError {
    /// Malformed input: undecodable JSON or failed field validation.
    /// The detail string is safe to echo (it describes the request
    /// shape, not any stored state).
    BadRequest(String),
    /// The identity proof was rejected: expired or consumed nonce,
    /// sender/claim mismatch, invalid signature. Message must stay
    /// generic.
    AuthFailure(&'static str),
    /// The email already has a registered identity.
    Conflict(&'static str),
    /// The verification window closed before the email arrived.
    Timeout(&'static str),
    /// A bounded resource (ephemeral store, worker queue) refused new
    /// work. Only reachable from the completion flow, where it surfaces
    /// as a 500; the client restarts the whole exchange with a new nonce.
    Capacity(&'static str),
    /// Everything else. Logged in full, reported generically.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::AuthFailure(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            AppError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, msg).into_response(),
            AppError::Capacity(msg) => {
                tracing::warn!("capacity exhausted: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
            AppError::Internal(err) => {
                tracing::error!("internal error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

/// Stray errors from collaborators (database, RNG) that a handler did not
/// map explicitly are internal by definition.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}

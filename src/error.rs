//! Error types for the session proxy

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the session proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Session proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal before the server starts)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token signing failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Upstream (application or provider) could not be reached
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Interactive login failed
    #[error("Login failed: {0}")]
    Login(#[from] LoginError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JWT encoding/decoding error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures of the interactive OAuth2 login
#[derive(Error, Debug)]
pub enum LoginError {
    /// The callback carried a `state` that does not match the one we issued
    #[error("state mismatch in OAuth2 callback - possible CSRF attack")]
    StateMismatch,

    /// The callback carried neither a code nor an error
    #[error("authorization code missing from OAuth2 callback")]
    MissingCode,

    /// The provider redirected back with an OAuth2 error
    #[error("provider returned {error}: {description}")]
    Provider {
        /// OAuth2 error code
        error: String,
        /// Human readable description
        description: String,
    },

    /// Exchanging the code (or refresh token) for tokens failed
    #[error("token exchange failed: {0}")]
    Exchange(String),

    /// None of the candidate callback ports could be bound
    #[error("unable to bind a local callback listener on any of the ports {0:?}")]
    NoListener(Vec<u16>),

    /// The surrounding command was cancelled
    #[error("login cancelled")]
    Cancelled,
}

impl Error {
    /// HTTP status used when this error terminates a proxied request
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details are logged, not leaked to the client
        let message = match &self {
            Self::Upstream(_) | Self::Http(_) => "The upstream server could not be reached",
            _ => "An internal server error occurred, please contact the system administrator",
        };
        tracing::error!(error = %self, status = status.as_u16(), "Request failed");

        (
            status,
            Json(json!({
                "error": {
                    "code": status.as_u16(),
                    "status": status.canonical_reason().unwrap_or("Error"),
                    "message": message,
                }
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_error_maps_to_500() {
        let err = Error::Signing("no key".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn upstream_error_maps_to_502() {
        let err = Error::Upstream("connection refused".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn login_error_converts_into_error() {
        let err: Error = LoginError::StateMismatch.into();
        assert!(err.to_string().contains("CSRF"));
    }
}

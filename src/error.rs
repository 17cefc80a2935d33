#![allow(dead_code)]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application-wide error types.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("no healthy backends: {0}")]
    NoHealthyBackend(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoHealthyBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short plain-text body sent to the client. Details stay in the logs.
    fn body(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "Internal Server Error",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::RateLimited => "Too Many Requests",
            GatewayError::CircuitOpen => "Service Unavailable",
            GatewayError::NoHealthyBackend(_) => "No healthy backends available",
            GatewayError::RouteNotFound(_) => "No matching route found",
            GatewayError::Upstream(_) => "Bad Gateway",
            GatewayError::Internal(_) => "Internal Server Error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.body()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(
            GatewayError::Unauthorized("bad key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(GatewayError::CircuitOpen.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            GatewayError::NoHealthyBackend("/api".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Upstream("connect refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::RouteNotFound("/nope".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}

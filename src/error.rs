// Gateway error taxonomy and its mapping onto HTTP responses.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced while serving a stream request.
///
/// `Clone` so that one resolution outcome can be delivered to every caller
/// attached to the same in-flight resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid magnet locator: {0}")]
    InvalidLocator(String),

    #[error("content {info_hash} is blocked")]
    ContentBlocked { info_hash: String },

    #[error("no swarm metadata within {}s", timeout.as_secs())]
    ResolutionTimeout { timeout: Duration },

    #[error("swarm engine failed: {message}")]
    ResolutionError { message: String },

    #[error("swarm has no playable file")]
    NoPlayableFile,

    #[error("range not satisfiable for length {length}")]
    RangeNotSatisfiable { length: u64 },

    /// Connection bookkeeping only; never rendered as a response.
    #[error("stream aborted")]
    StreamAborted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidLocator(_) => StatusCode::BAD_REQUEST,
            GatewayError::ContentBlocked { .. } => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            GatewayError::ResolutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::ResolutionError { .. }
            | GatewayError::NoPlayableFile
            | GatewayError::StreamAborted
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients. Engine internals stay in the logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::ResolutionTimeout { .. } => "content is not available".to_string(),
            GatewayError::ResolutionError { .. } | GatewayError::Internal(_) => {
                "server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::RangeNotSatisfiable { length } = self {
            let content_range = HeaderValue::from_str(&format!("bytes */{}", length))
                .unwrap_or_else(|_| HeaderValue::from_static("bytes */0"));
            return (self.status(), [(header::CONTENT_RANGE, content_range)]).into_response();
        }
        (self.status(), self.public_message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::InvalidLocator("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ContentBlocked { info_hash: "AB".into() }.status().as_u16(),
            451
        );
        assert_eq!(
            GatewayError::ResolutionTimeout { timeout: Duration::from_secs(8) }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayError::NoPlayableFile.status().as_u16(), 500);
    }

    #[test]
    fn test_unsatisfiable_response_has_content_range() {
        let resp = GatewayError::RangeNotSatisfiable { length: 1000 }.into_response();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            resp.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }
}

//! Proxy error types.
//!
//! Every failure inside the proxy is one of these variants. They are turned
//! into Ollama's `{"error": "..."}` envelope at the router boundary, so no
//! transport-level error ever reaches a client verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// Malformed or incomplete client request. Never reaches the backend.
    #[error("invalid request: {0}")]
    ClientInput(String),

    #[error(
        "backend unavailable at {url}: {reason}. Check that the backend base URL \
         (BACKEND_BASE_URL) points at the running model server and that both \
         services agree on host and port"
    )]
    BackendUnavailable { url: String, reason: String },

    #[error("backend did not respond within {timeout_secs}s")]
    BackendTimeout { timeout_secs: u64 },

    /// The backend answered, but with an error envelope.
    #[error("{message}")]
    BackendProtocol { status: u16, message: String },

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("model registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),
}

impl ProxyError {
    pub fn client_input(message: impl Into<String>) -> Self {
        Self::ClientInput(message.into())
    }

    /// Classify a `reqwest` failure that happened while talking to `url`.
    pub fn from_transport(url: &str, err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Self::BackendTimeout { timeout_secs }
        } else if err.is_connect() || err.is_request() {
            Self::BackendUnavailable {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            Self::StreamInterrupted(err.to_string())
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientInput(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnavailable { .. } | Self::RegistryUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendProtocol { status, .. } => backend_status_to_client(*status),
            Self::StreamInterrupted(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// 4xx answers keep their status; anything else from the backend is a bad gateway.
fn backend_status_to_client(status: u16) -> StatusCode {
    match StatusCode::from_u16(status) {
        Ok(code) if code.is_client_error() => code,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_status_mapping() {
        let not_found = ProxyError::BackendProtocol {
            status: 404,
            message: "no such model".into(),
        };
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let internal = ProxyError::BackendProtocol {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(internal.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(internal.to_string(), "boom");
    }

    #[test]
    fn test_unavailable_message_carries_hint() {
        let err = ProxyError::BackendUnavailable {
            url: "http://localhost:4000".into(),
            reason: "connection refused".into(),
        };
        let text = err.to_string();
        assert!(text.contains("http://localhost:4000"));
        assert!(text.contains("BACKEND_BASE_URL"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

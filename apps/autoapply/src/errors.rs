use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::cache::upstream::UpstreamError;
use crate::cache::CacheError;
use crate::session::SessionError;

/// Classified outcome of a failed call to the remote API.
///
/// Callers branch on the variant, never on the raw status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No token stored locally; nothing was sent.
    #[error("Not logged in")]
    Unauthenticated,

    /// 401 from the server. The stored session has already been cleared.
    #[error("Session rejected by server: {message}")]
    AuthRejected { message: String, body: Value },

    #[error("{message}")]
    Client {
        status: u16,
        message: String,
        body: Value,
    },

    #[error("{message}")]
    Server {
        status: u16,
        message: String,
        body: Value,
    },

    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Transport failure before any response arrived.
    #[error("Network error: {0}")]
    Network(String),

    /// 2xx response whose body did not have the expected shape.
    #[error("Unexpected response from {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    AuthRejected,
    Client,
    Server,
    Timeout,
    Network,
    Decode,
    Session,
}

impl ApiError {
    /// Builds the typed error for a non-2xx response.
    pub fn from_response(status: u16, body: Value) -> Self {
        let message = response_message(status, &body);
        match status {
            401 => ApiError::AuthRejected { message, body },
            500..=599 => ApiError::Server {
                status,
                message,
                body,
            },
            _ => ApiError::Client {
                status,
                message,
                body,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Unauthenticated => ErrorKind::Unauthenticated,
            ApiError::AuthRejected { .. } => ErrorKind::AuthRejected,
            ApiError::Client { .. } => ErrorKind::Client,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Decode { .. } => ErrorKind::Decode,
            ApiError::Session(_) => ErrorKind::Session,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthRejected { .. } => Some(401),
            ApiError::Client { status, .. } | ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Likely to succeed if the same call is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Server { .. } | ApiError::Timeout { .. } | ApiError::Network(_)
        )
    }

    /// The caller has to send the user back through login.
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::Unauthenticated | ApiError::AuthRejected { .. })
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind(),
            status: self.status(),
            message: self.to_string(),
        }
    }
}

/// Serializable view of an [`ApiError`] for reports and CLI output.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

/// Server-supplied `detail` or `message`, else a generic line with the status.
fn response_message(status: u16, body: &Value) -> String {
    ["detail", "message"]
        .iter()
        .filter_map(|field| body.get(*field).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Request failed ({status})"))
}

/// Errors the offline proxy answers with itself, as opposed to upstream
/// responses it relays.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Offline and nothing cached for {0}")]
    Offline(String),

    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Cache activation failed: {0}")]
    Activation(#[from] CacheError),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ProxyError::Upstream(UpstreamError::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT"),
            ProxyError::Upstream(UpstreamError::Invalid(_)) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ProxyError::Upstream(UpstreamError::Connect(_)) => (StatusCode::BAD_GATEWAY, "UPSTREAM_UNREACHABLE"),
            ProxyError::Offline(_) => (StatusCode::SERVICE_UNAVAILABLE, "OFFLINE"),
            ProxyError::BodyTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "BODY_TOO_LARGE"),
            ProxyError::Activation(e) => {
                tracing::error!("Cache activation error: {e}");
                (StatusCode::BAD_GATEWAY, "ACTIVATION_FAILED")
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_401_is_auth_rejected() {
        let err = ApiError::from_response(401, json!({"detail": "Could not validate credentials"}));
        assert_eq!(err.kind(), ErrorKind::AuthRejected);
        assert!(err.requires_login());
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(401));
    }

    #[test]
    fn test_4xx_and_5xx_classification() {
        let client = ApiError::from_response(404, json!({"detail": "Job not found"}));
        assert_eq!(client.kind(), ErrorKind::Client);
        assert_eq!(client.to_string(), "Job not found");
        assert!(!client.is_transient());

        let server = ApiError::from_response(503, Value::Null);
        assert_eq!(server.kind(), ErrorKind::Server);
        assert!(server.is_transient());
    }

    #[test]
    fn test_message_falls_back_to_message_field_then_generic() {
        let err = ApiError::from_response(400, json!({"message": "Bad payload"}));
        assert_eq!(err.to_string(), "Bad payload");

        // FastAPI validation errors carry a list in `detail`
        let err = ApiError::from_response(422, json!({"detail": [{"msg": "field required"}]}));
        assert_eq!(err.to_string(), "Request failed (422)");
    }

    #[test]
    fn test_error_summary_serializes_kind_snake_case() {
        let summary = ApiError::Timeout { after_ms: 20000 }.summary();
        let value = serde_json::to_value(summary).unwrap();
        assert_eq!(value["kind"], "timeout");
        assert_eq!(value["status"], Value::Null);
    }

    #[test]
    fn test_proxy_error_status_codes() {
        let timeout = ProxyError::Upstream(UpstreamError::Timeout).into_response();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let refused = ProxyError::Upstream(UpstreamError::Connect("refused".into())).into_response();
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);

        let offline = ProxyError::Offline("/jobs".into()).into_response();
        assert_eq!(offline.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

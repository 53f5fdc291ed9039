/// Request Orchestrator: the single path every call to the remote API takes.
///
/// ARCHITECTURAL RULE: no other module builds HTTP requests to the API.
/// Auth injection, deadlines, retry and error classification live here and
/// nowhere else; endpoint quirks (form-encoded login, opt-in retries for
/// keyed POSTs) are expressed as `CallOptions`, not as separate code paths.
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::session::SessionStore;

pub mod endpoints;
pub mod transport;

pub use transport::{RequestBody, ReqwestTransport, Transport, TransportError, TransportRequest};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_MAX_RETRIES: u32 = 1;
/// Fixed pause between attempts of a retried call.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(600);

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub body: Option<RequestBody>,
    pub auth_required: bool,
    pub timeout: Duration,
    pub max_retries: u32,
    /// `None` means "decide from the method": GET/HEAD/OPTIONS are idempotent,
    /// everything else must opt in.
    pub idempotent: Option<bool>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            auth_required: true,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            idempotent: None,
        }
    }
}

impl CallOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post_json(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(RequestBody::Json(body)),
            ..Self::default()
        }
    }

    pub fn post_form(fields: &[(&str, &str)]) -> Self {
        let fields = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            method: Method::POST,
            body: Some(RequestBody::Form(fields)),
            ..Self::default()
        }
    }

    /// No credential is attached and none is required.
    pub fn public(mut self) -> Self {
        self.auth_required = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent
            .unwrap_or_else(|| matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS))
    }
}

/// One logical call, alive across its retry attempts.
#[derive(Debug)]
struct PendingRequest {
    method: Method,
    path: String,
    body: Option<RequestBody>,
    auth_required: bool,
    timeout: Duration,
    idempotent: bool,
    retries_remaining: u32,
}

impl PendingRequest {
    fn new(path: &str, options: CallOptions) -> Self {
        let idempotent = options.is_idempotent();
        Self {
            method: options.method,
            path: path.to_string(),
            body: options.body,
            auth_required: options.auth_required,
            timeout: options.timeout,
            idempotent,
            retries_remaining: options.max_retries,
        }
    }

    fn should_retry(&self, error: &ApiError) -> bool {
        self.idempotent && error.is_transient() && self.retries_remaining > 0
    }
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    base_url: String,
    session: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    backoff: Duration,
}

impl RequestOrchestrator {
    pub fn new(base_url: &str, session: Arc<SessionStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            transport,
            backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Performs one logical call and returns the normalized response body.
    ///
    /// A 401 clears the session before the error is returned, whichever
    /// endpoint produced it.
    pub async fn call(&self, path: &str, options: CallOptions) -> Result<Value, ApiError> {
        let mut pending = PendingRequest::new(path, options);

        let authorization = if pending.auth_required {
            match self.session.get_token() {
                Some(token) => Some(format!("Bearer {token}")),
                None => {
                    debug!("{} {} refused locally: no token", pending.method, pending.path);
                    return Err(ApiError::Unauthenticated);
                }
            }
        } else {
            None
        };
        let url = self.url_for(&pending.path);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            debug!("{} {} attempt {}", pending.method, pending.path, attempt);

            let error = match self.attempt(&pending, &url, authorization.clone()).await {
                Ok(body) => return Ok(body),
                Err(error) => error,
            };

            if matches!(error, ApiError::AuthRejected { .. }) {
                warn!("{} {} rejected with 401, clearing session", pending.method, pending.path);
                self.session.clear_session();
                return Err(error);
            }

            if !pending.should_retry(&error) {
                if error.is_transient() {
                    warn!(
                        "{} {} failed after {} attempt(s): {}",
                        pending.method, pending.path, attempt, error
                    );
                }
                return Err(error);
            }

            pending.retries_remaining -= 1;
            warn!(
                "{} {} attempt {} failed ({}), retrying after {}ms...",
                pending.method,
                pending.path,
                attempt,
                error,
                self.backoff.as_millis()
            );
            tokio::time::sleep(self.backoff).await;
        }
    }

    async fn attempt(
        &self,
        pending: &PendingRequest,
        url: &str,
        authorization: Option<String>,
    ) -> Result<Value, ApiError> {
        let request = TransportRequest {
            method: pending.method.clone(),
            url: url.to_string(),
            authorization,
            body: pending.body.clone(),
        };
        let timed_out = ApiError::Timeout {
            after_ms: pending.timeout.as_millis() as u64,
        };

        // Elapsing the deadline drops the in-flight future, which aborts it.
        let response = match tokio::time::timeout(pending.timeout, self.transport.send(request)).await {
            Err(_elapsed) => return Err(timed_out),
            Ok(Err(TransportError::Timeout)) => return Err(timed_out),
            Ok(Err(TransportError::Connect(reason))) => return Err(ApiError::Network(reason)),
            Ok(Ok(response)) => response,
        };

        let body = normalize_body(response.content_type.as_deref(), &response.body);
        if (200..300).contains(&response.status) {
            Ok(body)
        } else {
            Err(ApiError::from_response(response.status, body))
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// JSON when the server declares it, otherwise the text wrapped as
/// `{"detail": text}`; an empty or unparseable body is `null`.
pub fn normalize_body(content_type: Option<&str>, body: &[u8]) -> Value {
    let is_json = content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("application/json") || ct.contains("+json")
        })
        .unwrap_or(false);

    if is_json {
        return serde_json::from_slice(body).unwrap_or(Value::Null);
    }
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        Value::Null
    } else {
        json!({ "detail": text })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::Value;

    use super::transport::{Transport, TransportError, TransportRequest, TransportResponse};

    pub enum FakeReply {
        Json(u16, Value),
        Text(u16, &'static str),
        ConnectionRefused,
        /// Never answers; only the orchestrator deadline ends it.
        Hang,
        /// Answers with JSON after a delay.
        Slow(std::time::Duration, u16, Value),
    }

    fn json_response(status: u16, body: Value) -> TransportResponse {
        TransportResponse {
            status,
            content_type: Some("application/json".into()),
            body: Bytes::from(body.to_string()),
        }
    }

    type Handler = Box<dyn Fn(&TransportRequest) -> FakeReply + Send + Sync>;

    /// Scripted transport that records every request it sees.
    pub struct FakeTransport {
        handler: Handler,
        pub requests: Mutex<Vec<TransportRequest>>,
    }

    impl FakeTransport {
        pub fn new(handler: impl Fn(&TransportRequest) -> FakeReply + Send + Sync + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn paths(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.url.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            let reply = (self.handler)(&request);
            self.requests.lock().unwrap().push(request);
            match reply {
                FakeReply::Json(status, body) => Ok(json_response(status, body)),
                FakeReply::Text(status, body) => Ok(TransportResponse {
                    status,
                    content_type: Some("text/plain; charset=utf-8".into()),
                    body: Bytes::from_static(body.as_bytes()),
                }),
                FakeReply::ConnectionRefused => {
                    Err(TransportError::Connect("connection refused".into()))
                }
                FakeReply::Hang => std::future::pending().await,
                FakeReply::Slow(delay, status, body) => {
                    tokio::time::sleep(delay).await;
                    Ok(json_response(status, body))
                }
            }
        }
    }
}

//! Typed calls for the endpoints the client uses. Each one is a thin
//! description handed to [`RequestOrchestrator::call`].

use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{CallOptions, RequestOrchestrator, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use crate::errors::ApiError;
use crate::models::job::{ApplicationStatus, ApplyPayload, SearchResponse, SearchResults};
use crate::models::user::UserProfile;
use crate::session::Session;

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const SIGNUP_PATH: &str = "/api/auth/signup";
pub const ME_PATH: &str = "/api/auth/me";
pub const SEARCH_PATH: &str = "/jobs/search";
pub const APPLY_PATH: &str = "/jobs/apply";
pub const APPLICATIONS_PATH: &str = "/jobs/applications";
pub const APPLICATION_STATUS_PATH: &str = "/jobs/applications/status";
pub const PLANS_PATH: &str = "/billing/plans";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
    token_type: Option<String>,
}

#[derive(Clone)]
pub struct JobsApi {
    orchestrator: RequestOrchestrator,
    timeout: Duration,
    max_retries: u32,
}

impl JobsApi {
    pub fn new(orchestrator: RequestOrchestrator) -> Self {
        Self {
            orchestrator,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Overrides the per-call deadline and retry bound used by every endpoint
    /// except `apply`, which is never retried here.
    pub fn with_limits(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.timeout = timeout;
        self.max_retries = max_retries;
        self
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    /// Exchanges credentials for a token, stores the session, then tries to
    /// cache the profile. A failed profile fetch does not undo the login.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ApiError> {
        let options = self
            .limits(CallOptions::post_form(&[("username", username), ("password", password)]))
            .public();
        let body = self.orchestrator.call(LOGIN_PATH, options).await?;
        let login: LoginResponse = decode(LOGIN_PATH, body)?;

        let session = self.orchestrator.session();
        session.set_session(login.access_token.as_deref(), login.token_type.as_deref(), None)?;
        info!("Logged in as {username}");

        if let Err(e) = self.me().await {
            warn!("Logged in but could not load profile: {e}");
        }
        Ok(session.snapshot())
    }

    pub async fn signup(&self, full_name: &str, email: &str, password: &str) -> Result<Value, ApiError> {
        let body = json!({ "full_name": full_name, "email": email, "password": password });
        let options = self.limits(CallOptions::post_json(body)).public();
        self.orchestrator.call(SIGNUP_PATH, options).await
    }

    pub fn logout(&self) {
        self.orchestrator.session().clear_session();
    }

    /// Fetches the profile and replaces the cached copy in the session.
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        let body = self.orchestrator.call(ME_PATH, self.limits(CallOptions::get())).await?;
        let profile = UserProfile(body);
        self.orchestrator.session().set_user(profile.clone())?;
        Ok(profile)
    }

    pub async fn search_jobs(&self, query: &str, country: Option<&str>) -> Result<SearchResults, ApiError> {
        let mut params = vec![("q", query)];
        if let Some(country) = country.filter(|c| !c.is_empty()) {
            params.push(("country", country));
        }
        let path = with_query(SEARCH_PATH, &params);
        let body = self.orchestrator.call(&path, self.limits(CallOptions::get())).await?;
        let response: SearchResponse = decode(SEARCH_PATH, body)?;
        Ok(response.into())
    }

    /// Submits one application. Non-idempotent and never retried: the apply
    /// queue is the retry mechanism, across runs.
    pub async fn apply(&self, payload: &ApplyPayload) -> Result<Value, ApiError> {
        let body = serde_json::to_value(payload).map_err(|e| ApiError::Decode {
            path: APPLY_PATH.to_string(),
            reason: e.to_string(),
        })?;
        let options = CallOptions::post_json(body)
            .timeout(self.timeout)
            .max_retries(0)
            .idempotent(false);
        self.orchestrator.call(APPLY_PATH, options).await
    }

    /// The server's authoritative list. Anything but an array reads as empty.
    pub async fn list_applications(&self) -> Result<Vec<Value>, ApiError> {
        let body = self
            .orchestrator
            .call(APPLICATIONS_PATH, self.limits(CallOptions::get()))
            .await?;
        Ok(match body {
            Value::Array(items) => items,
            _ => Vec::new(),
        })
    }

    /// Keyed by a stable application id, so safe to retry.
    pub async fn update_application_status(
        &self,
        application_id: &str,
        status: ApplicationStatus,
    ) -> Result<Value, ApiError> {
        let body = json!({ "application_id": application_id, "status": status });
        let options = self.limits(CallOptions::post_json(body)).idempotent(true);
        self.orchestrator.call(APPLICATION_STATUS_PATH, options).await
    }

    pub async fn plans(&self) -> Result<Value, ApiError> {
        self.orchestrator.call(PLANS_PATH, self.limits(CallOptions::get())).await
    }

    pub async fn health(&self) -> Result<Value, ApiError> {
        self.orchestrator
            .call(HEALTH_PATH, self.limits(CallOptions::get()).public())
            .await
    }

    fn limits(&self, options: CallOptions) -> CallOptions {
        options.timeout(self.timeout).max_retries(self.max_retries)
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Decode {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Appends url-encoded query parameters to a path.
fn with_query(path: &str, params: &[(&str, &str)]) -> String {
    // The host is a placeholder; only path and query are kept.
    let Ok(mut url) = Url::parse("http://placeholder") else {
        return path.to_string();
    };
    url.set_path(path);
    url.query_pairs_mut().extend_pairs(params.iter());
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    }
}

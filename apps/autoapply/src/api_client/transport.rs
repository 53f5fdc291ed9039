//! The network seam under the request orchestrator.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;

/// Outgoing body: JSON for most endpoints, form-encoded for login.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A single attempt, fully resolved: absolute URL and auth header included.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub authorization: Option<String>,
    pub body: Option<RequestBody>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timed out")]
    Timeout,

    #[error("{0}")]
    Connect(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and reads the full response body.
    /// Dropping the returned future aborts the attempt.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("autoapply/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .header(ACCEPT, "application/json");

        if let Some(value) = &request.authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder = match request.body {
            Some(RequestBody::Json(json)) => builder.json(&json),
            Some(RequestBody::Form(fields)) => builder.form(&fields),
            None => builder,
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[tokio::test]
    async fn test_sends_bearer_and_json_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/jobs/apply")
            .match_header("authorization", "Bearer T1")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({"job_id": "1"})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"app-1"}"#)
            .create_async()
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let response = transport
            .send(TransportRequest {
                method: Method::POST,
                url: format!("{}/jobs/apply", server.url()),
                authorization: Some("Bearer T1".into()),
                body: Some(RequestBody::Json(json!({"job_id": "1"}))),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(&response.body[..], br#"{"id":"app-1"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_sends_form_encoded_login() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/login")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "a@b.com".into()),
                Matcher::UrlEncoded("password".into(), "x".into()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let transport = ReqwestTransport::new().unwrap();
        transport
            .send(TransportRequest {
                method: Method::POST,
                url: format!("{}/api/auth/login", server.url()),
                authorization: None,
                body: Some(RequestBody::Form(vec![
                    ("username".into(), "a@b.com".into()),
                    ("password".into(), "x".into()),
                ])),
            })
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let transport = ReqwestTransport::new().unwrap();
        let result = transport
            .send(TransportRequest {
                method: Method::GET,
                url: format!("http://127.0.0.1:{port}/health"),
                authorization: None,
                body: None,
            })
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}

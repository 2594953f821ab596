//! Transport types and the reqwest-backed client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP method for engine requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET request (reads)
    Get,
    /// POST request (creates)
    Post,
    /// PUT request (updates)
    Put,
    /// DELETE request
    Delete,
}

impl Method {
    /// Method name as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request the engine wants performed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Headers to send
    pub headers: HashMap<String, String>,
    /// JSON body, if any
    pub body: Option<Value>,
}

impl Request {
    /// Create a request with an explicit method
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), headers: HashMap::new(), body: None }
    }

    /// Create a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Create a POST request
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Create a PUT request
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    /// Create a DELETE request
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Attach a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a JSON body
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A completed response
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Parsed JSON body; absent for 304 and empty bodies
    pub body: Option<Value>,
    /// ETag validator, if the server sent one
    pub etag: Option<String>,
    /// Last-Modified validator, if the server sent one
    pub last_modified: Option<String>,
}

impl Response {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the server confirmed the cached copy (304)
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

/// Transport failure taxonomy.
///
/// Replay policy hangs off [`TransportError::is_retryable`]: retryable
/// failures consume a retry, permanent rejections fail the item
/// immediately.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The call did not complete in time
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established or broke mid-call
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server rejected the credentials (401/403)
    #[error("authentication rejected (status {status})")]
    Auth {
        /// HTTP status
        status: u16,
    },

    /// Transient server-side status (5xx, 408, 425, 429)
    #[error("server unavailable (status {status})")]
    Unavailable {
        /// HTTP status
        status: u16,
    },

    /// Any other 4xx: the request itself is bad and will never succeed
    #[error("request rejected (status {status})")]
    Rejected {
        /// HTTP status
        status: u16,
    },

    /// The response body was not valid JSON
    #[error("invalid response body: {0}")]
    InvalidBody(String),
}

impl TransportError {
    /// Whether a later identical attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::Connection(_)
                | TransportError::Unavailable { .. }
        )
    }

    /// Whether this failure is an authentication problem
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth { .. })
    }
}

/// Statuses worth retrying later: request timeout, too-early, rate
/// limiting, and the whole 5xx range.
fn retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500..=599)
}

/// Asynchronous transport the engine performs calls through
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one attempt of `request`
    async fn execute(&self, request: Request) -> Result<Response, TransportError>;
}

/// Configuration for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Per-call timeout
    pub timeout: Duration,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), user_agent: "tidepool/0.1".to_string() }
    }
}

/// reqwest-backed transport with pooled connections
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the configured timeout
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|err| TransportError::Connection(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let etag = header_value(&response, reqwest::header::ETAG);
        let last_modified = header_value(&response, reqwest::header::LAST_MODIFIED);

        if status == 304 {
            return Ok(Response { status, body: None, etag, last_modified });
        }

        if !(200..300).contains(&status) {
            tracing::debug!(status, url = %request.url, "transport call failed");
            return Err(match status {
                401 | 403 => TransportError::Auth { status },
                s if retryable_status(s) => TransportError::Unavailable { status: s },
                s => TransportError::Rejected { status: s },
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))?;
        let body = if bytes.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(&bytes)
                    .map_err(|err| TransportError::InvalidBody(err.to_string()))?,
            )
        };

        Ok(Response { status, body, etag, last_modified })
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(HttpTransportConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_get_parses_body_and_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .set_body_json(json!({"items": [1, 2]})),
            )
            .mount(&server)
            .await;

        let response = transport()
            .execute(Request::get(format!("{}/items", server.uri())))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.body, Some(json!({"items": [1, 2]})));
        assert_eq!(response.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            response.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_conditional_get_reads_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304).insert_header("ETag", "\"v1\""))
            .mount(&server)
            .await;

        let response = transport()
            .execute(
                Request::get(format!("{}/items", server.uri())).header("If-None-Match", "\"v1\""),
            )
            .await
            .unwrap();

        assert!(response.is_not_modified());
        assert_eq!(response.body, None);
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .and(body_json(json!({"title": "x"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "t1"})))
            .mount(&server)
            .await;

        let response = transport()
            .execute(Request::post(format!("{}/tasks", server.uri())).body(json!({"title": "x"})))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.body, Some(json!({"id": "t1"})));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = transport()
            .execute(Request::get(format!("{}/flaky", server.uri())))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Unavailable { status: 503 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = transport()
            .execute(Request::get(format!("{}/missing", server.uri())))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Rejected { status: 404 }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_auth_failures_are_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/private"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = transport()
            .execute(Request::get(format!("{}/private", server.uri())))
            .await
            .unwrap_err();

        assert!(err.is_auth());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_body_reads_as_none() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/tasks/t1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let response = transport()
            .execute(Request::delete(format!("{}/tasks/t1", server.uri())))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.body, None);
    }
}

//! HTTP transport.
//!
//! One request at a time, issued by the agent client. Cancellation is
//! aborting the task that awaits [`Transport::send`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::Error;
use crate::Result;

/// Outgoing request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one POST and reports status and body.
///
/// Non-2xx statuses are responses, not errors; errors mean the exchange
/// itself failed (connection, timeout).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport backed by reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("POST {} ({} bytes)", request.url, request.body.len());

        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Transport(format!("Request timed out: {}", e))
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await
            .map_err(|e| Error::Transport(format!("Failed to read response body: {}", e)))?;

        debug!("Response status {} ({} bytes)", status, body.len());
        Ok(HttpResponse { status, body })
    }
}

/// Fake transport for testing: serves queued responses and records requests.
#[cfg(test)]
pub struct FakeTransport {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<HttpResponse>>>,
    requests: std::sync::Mutex<Vec<HttpRequest>>,
}

#[cfg(test)]
impl FakeTransport {
    pub fn new(responses: Vec<Result<HttpResponse>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create with 200 responses carrying the given JSON bodies.
    pub fn with_bodies(bodies: Vec<serde_json::Value>) -> Self {
        Self::new(bodies.into_iter().map(|b| Ok(HttpResponse::new(200, b.to_string()))).collect())
    }

    /// Requests sent so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Request bodies sent so far, parsed
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.requests()
            .iter()
            .map(|r| serde_json::from_str(&r.body).unwrap())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Transport("No more fake responses".to_string())))
    }
}

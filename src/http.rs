//! HTTP collaborator: the crawler's only network boundary, abstracted so the
//! dispatcher can be exercised without real sockets.
//!
//! Grounded on `batcher::http`: same `HttpClient` trait shape, same
//! `ReqwestHttpClient`/`MockHttpClient` split, adapted from the teacher's
//! fixed `endpoint + path + model` request shape to the crawler's arbitrary
//! `url + method + headers + payload`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CrawlerError, Result};
use crate::request::RequestData;

/// Response from an HTTP fetch.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// The URL actually served, which may differ from the requested URL
    /// after redirects (spec §3's `loaded_url`).
    pub final_url: String,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Trait for executing a single request's fetch. One implementation makes
/// real network calls; another replays canned responses for tests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(
        &self,
        request: &RequestData,
        proxy_url: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse>;
}

/// Production HTTP client using reqwest.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, method = %request.method, url = %request.url))]
    async fn execute(
        &self,
        request: &RequestData,
        proxy_url: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|e| CrawlerError::Other(anyhow::anyhow!("invalid http method '{}': {e}", request.method)))?;

        let client = match proxy_url {
            Some(url) => {
                let proxy = reqwest::Proxy::all(url)
                    .map_err(|e| CrawlerError::Other(anyhow::anyhow!("invalid proxy url '{url}': {e}")))?;
                reqwest::Client::builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| CrawlerError::Other(anyhow::anyhow!(e)))?
            }
            None => self.client.clone(),
        };

        let mut req = client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if let Some(payload) = &request.payload {
            req = req.body(payload.clone());
        }

        let response = req.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.bytes().await?.to_vec();

        tracing::debug!(status, bytes = body.len(), "fetch completed");

        Ok(HttpResponse {
            status,
            headers,
            body,
            final_url,
        })
    }
}

impl From<reqwest::Error> for CrawlerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CrawlerError::InternalTimeout(Duration::from_secs(0))
        } else {
            CrawlerError::Other(anyhow::anyhow!(e))
        }
    }
}

/// Record of a call made to [`MockHttpClient`], for assertions in tests.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
}

/// Canned-response HTTP client for tests. Responses are queued per
/// `"METHOD url"` key and consumed in FIFO order.
#[derive(Default)]
pub struct MockHttpClient {
    responses: Mutex<HashMap<String, Vec<Result<HttpResponse>>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, method: &str, url: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(format!("{method} {url}"))
            .or_default()
            .push(response);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

pub fn ok_response(status: u16, body: impl Into<Vec<u8>>) -> Result<HttpResponse> {
    Ok(HttpResponse {
        status,
        headers: HashMap::new(),
        body: body.into(),
        final_url: String::new(),
    })
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(
        &self,
        request: &RequestData,
        _proxy_url: Option<&str>,
        _timeout: Duration,
    ) -> Result<HttpResponse> {
        self.calls.lock().push(MockCall {
            method: request.method.clone(),
            url: request.url.clone(),
        });

        let key = format!("{} {}", request.method, request.url);
        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&key) {
            if !queue.is_empty() {
                let mut response = queue.remove(0);
                if let Ok(r) = &mut response {
                    if r.final_url.is_empty() {
                        r.final_url = request.url.clone();
                    }
                }
                return response;
            }
        }

        Err(CrawlerError::Other(anyhow::anyhow!(
            "no mock response configured for {} {}",
            request.method,
            request.url
        )))
    }
}

/// Shared handle type used across the dispatcher and session pool.
pub type SharedHttpClient = Arc<dyn HttpClient>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    #[tokio::test]
    async fn mock_replays_in_fifo_order() {
        let mock = MockHttpClient::new();
        mock.add_response("GET", "https://example.com/", ok_response(200, "first"));
        mock.add_response("GET", "https://example.com/", ok_response(200, "second"));

        let request = RequestInput::new("https://example.com/").build().unwrap();
        let a = mock.execute(&request, None, Duration::from_secs(1)).await.unwrap();
        let b = mock.execute(&request, None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.text(), "first");
        assert_eq!(b.text(), "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_errors_on_unconfigured_url() {
        let mock = MockHttpClient::new();
        let request = RequestInput::new("https://example.com/").build().unwrap();
        let result = mock.execute(&request, None, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}

//! The deal-import API as seen by the load generator.
//!
//! The engine only needs "issue a request, get status, duration and body";
//! [`RequestIssuer`] is that capability. [`HttpIssuer`] implements it over
//! reqwest, tests substitute their own.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::ErrorCategory;
use crate::generator::DealPayload;

pub const IMPORT_SINGLE_PATH: &str = "/api/v1/deals/import/single";
pub const IMPORT_BATCH_PATH: &str = "/api/v1/deals/import/batch";
pub const DEALS_PATH: &str = "/api/v1/deals";
pub const DEFAULT_HEALTH_PATH: &str = "/actuator/health/liveness";

/// Response bytes kept for diagnostics; the rest of the body is drained and dropped.
const MAX_BODY_CAPTURE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
}

/// One request against the API, relative to the base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub path: String,
    pub body: Option<String>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: ApiMethod::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post_json<T: serde::Serialize + ?Sized>(
        path: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: ApiMethod::Post,
            path: path.into(),
            body: Some(serde_json::to_string(body)?),
        })
    }

    pub fn import_single(deal: &DealPayload) -> Result<Self, serde_json::Error> {
        Self::post_json(IMPORT_SINGLE_PATH, deal)
    }

    pub fn import_batch(deals: &[DealPayload]) -> Result<Self, serde_json::Error> {
        Self::post_json(IMPORT_BATCH_PATH, deals)
    }

    pub fn get_all_deals() -> Self {
        Self::get(DEALS_PATH)
    }

    pub fn health(path: &str) -> Self {
        Self::get(path)
    }
}

/// Outcome of a request that reached the server.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub duration: Duration,
    /// At most the first kilobyte of the body.
    pub body: String,
}

/// A request that never produced a status code.
#[derive(Error, Debug, Clone)]
#[error("{category}: {message}")]
pub struct TransportError {
    pub category: ErrorCategory,
    pub message: String,
    pub duration: Duration,
}

#[async_trait]
pub trait RequestIssuer: Send + Sync {
    async fn issue(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Configuration for building the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// Builds a reqwest client that sends JSON content headers on every request.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout);

    if let Some(keepalive) = config.tcp_keepalive {
        builder = builder.tcp_keepalive(keepalive);
    }

    builder.build()
}

/// [`RequestIssuer`] over a shared reqwest client.
#[derive(Clone)]
pub struct HttpIssuer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIssuer {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RequestIssuer for HttpIssuer {
    async fn issue(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path);
        let builder = match request.method {
            ApiMethod::Get => self.client.get(&url),
            ApiMethod::Post => self.client.post(&url),
        };
        let builder = match &request.body {
            Some(body) => builder.body(body.clone()),
            None => builder,
        };

        let start = Instant::now();
        let transport_error = |e: reqwest::Error| TransportError {
            category: ErrorCategory::from_reqwest_error(&e),
            message: e.to_string(),
            duration: start.elapsed(),
        };

        let mut response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();

        // Drain the body in chunks so large listings are never buffered whole.
        let mut captured = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            let room = MAX_BODY_CAPTURE.saturating_sub(captured.len());
            captured.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
        let duration = start.elapsed();

        debug!(url = %url, status_code = status, duration_ms = duration.as_millis() as u64, "Request completed");

        Ok(ApiResponse {
            status,
            duration,
            body: String::from_utf8_lossy(&captured).into_owned(),
        })
    }
}

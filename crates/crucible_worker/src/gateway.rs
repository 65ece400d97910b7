//! Egress-gateway client.
//!
//! The gateway is the only path from a worker to a defense container: the
//! worker POSTs to the gateway with `X-Target-Url` naming the container and
//! `X-Gateway-Auth` carrying the shared secret; the gateway mirrors the
//! upstream response (502 when the upstream is unreachable).

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crucible_protocol::{HEADER_GATEWAY_AUTH, HEADER_TARGET_URL};

/// Transport failures, classed for the retry policy: only `Connect` earns a
/// retry, and only one.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("http timeout")]
    Timeout,

    #[error("unexpected error: {0}")]
    Other(String),
}

/// What came back from the defense (via the gateway), undecoded.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// One authenticated hop to a defense container.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// POST `body` as `application/octet-stream` to `target_url`.
    async fn post(
        &self,
        target_url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError>;

    /// GET `target_url`; used only for readiness polling.
    async fn get(&self, target_url: &str, timeout: Duration)
        -> Result<GatewayResponse, GatewayError>;
}

/// reqwest-backed gateway client.
pub struct HttpGateway {
    client: reqwest::Client,
    gateway_url: String,
    secret: String,
}

impl HttpGateway {
    /// Timeouts are per-request, so the shared client carries none.
    pub fn new(gateway_url: &str, secret: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateway_url: gateway_url.to_string(),
            secret: secret.to_string(),
        }
    }

    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
        target_url: &str,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let response = builder
            .header(HEADER_TARGET_URL, target_url)
            .header(HEADER_GATEWAY_AUTH, &self.secret)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(classify)?;

        Ok(GatewayResponse { status, content_type, body })
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn post(
        &self,
        target_url: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let builder = self
            .client
            .post(&self.gateway_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.execute(builder, target_url, timeout).await
    }

    async fn get(
        &self,
        target_url: &str,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let builder = self.client.get(&self.gateway_url);
        self.execute(builder, target_url, timeout).await
    }
}

fn classify(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else if e.is_connect() {
        GatewayError::Connect(e.to_string())
    } else {
        GatewayError::Other(e.to_string())
    }
}

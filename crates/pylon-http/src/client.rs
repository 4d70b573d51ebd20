//! REST request core
//!
//! Sends authorized JSON requests through the rate limiter, retrying
//! retryable failures with jittered backoff.

use crate::error::HttpError;
use crate::rate_limit::{RateLimitInfo, RateLimiter};
use crate::routes::{Route, GET_GATEWAY_BOT};
use pylon_common::ClientConfig;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Retries allowed for 429 and server-error responses.
const MAX_RETRIES: u32 = 5;

/// Response of the gateway bootstrap route.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBotInfo {
    /// WebSocket URL to connect to
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Server-imposed cap on new session starts per period.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    /// Session starts left in the current period; 0 means wait for reset
    pub remaining: u32,
    /// Milliseconds until the limit resets
    pub reset_after: u64,
}

/// HTTP client for the REST API.
///
/// Owns the process-wide rate limiter; the gateway send path shares it
/// through [`HttpClient::limiter`].
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    authorization: String,
    limiter: Arc<RateLimiter>,
}

impl HttpClient {
    /// Build a client from configuration.
    pub fn new(config: &ClientConfig) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .user_agent(Self::user_agent())
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.http.base_url.trim_end_matches('/').to_string(),
            authorization: format!("Bot {}", config.token),
            limiter: Arc::new(RateLimiter::new()),
        })
    }

    fn user_agent() -> String {
        format!(
            "DiscordBot (pylon, v{}) / rust {}",
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION"),
        )
    }

    /// The rate limiter shared with the gateway send path.
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Fetch the gateway bootstrap payload (URL, shards, session-start limit).
    pub async fn get_gateway_bot(&self) -> Result<GatewayBotInfo, HttpError> {
        let value = self.request(&GET_GATEWAY_BOT, &[], None).await?;
        serde_json::from_value(value).map_err(|e| HttpError::InvalidResponse(e.to_string()))
    }

    /// Perform a request to a route, honoring rate limits and retrying
    /// retryable failures.
    pub async fn request(
        &self,
        route: &Route,
        params: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, HttpError> {
        self.request_with_reason(route, params, body, None).await
    }

    /// Like [`HttpClient::request`] but attaches an audit-log reason header.
    pub async fn request_with_reason(
        &self,
        route: &Route,
        params: &[(&str, &str)],
        body: Option<&Value>,
        reason: Option<&str>,
    ) -> Result<Value, HttpError> {
        let bucket = route.bucket(params);
        let url = format!("{}{}", self.base_url, route.format(params));

        for attempt in 1..=MAX_RETRIES {
            let waited = self.limiter.acquire(&bucket).await;
            if waited > Duration::ZERO {
                tracing::debug!(bucket = %bucket, waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX), "Bucket cooled down");
            }

            let mut request = self
                .http
                .request(route.method.clone(), &url)
                .header("Authorization", &self.authorization);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(reason) = reason {
                request = request.header("X-Audit-Log-Reason", reason);
            }

            let response = request.send().await?;
            let status = response.status();
            self.limiter
                .update(&bucket, &RateLimitInfo::from_headers(response.headers()));

            if status.is_success() {
                tracing::debug!(bucket = %bucket, status = status.as_u16(), "Request succeeded");
                // 204-style responses have no body
                let bytes = response.bytes().await?;
                if bytes.is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_slice(&bytes)
                    .map_err(|e| HttpError::InvalidResponse(e.to_string()));
            }

            let data = response.json::<Value>().await.unwrap_or(Value::Null);

            if status.as_u16() != 429 && status.is_client_error() {
                // The request itself is wrong; another attempt cannot fix it
                return Err(HttpError::RequestFailed {
                    bucket: bucket.to_string(),
                    status: status.as_u16(),
                    code: data.get("code").and_then(Value::as_u64),
                    message: data
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                });
            }

            if attempt == MAX_RETRIES {
                return Err(HttpError::RetriesExhausted {
                    bucket: bucket.to_string(),
                    status: status.as_u16(),
                    attempts: MAX_RETRIES,
                });
            }

            let backoff = Duration::from_millis(rand::thread_rng().gen_range(100..=50_000));
            tracing::debug!(
                bucket = %bucket,
                status = status.as_u16(),
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "Request failed, retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
        }

        unreachable!("retry loop always returns")
    }
}

//! Delivery clients shipping formatted documents to the intake

use crate::config::Config;
use crate::errors::{Result, SinkError};
use crate::tcp::TcpTransport;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

/// Maximum number of delivery attempts per batch.
pub const MAX_RETRIES: u32 = 5;

/// Maximum delay between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Sends batches of JSON documents to the intake.
///
/// `send` resolves once the batch was written or every attempt failed; a
/// batch is never partially sent.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(&self, documents: &[String]) -> Result<()>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self);
}

/// Attempt count and quadratic backoff schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            max_backoff,
        }
    }

    /// Delay before attempt `retry` (0-based): `min(retry², max_backoff)` seconds.
    pub fn backoff(&self, retry: u32) -> Duration {
        let secs = u64::from(retry).saturating_mul(u64::from(retry));
        Duration::from_secs(secs).min(self.max_backoff)
    }

    /// Sleep before attempt `retry`; the first attempt never waits.
    pub async fn wait(&self, retry: u32) {
        if retry > 0 {
            sleep(self.backoff(retry)).await;
        }
    }
}

/// Build the delivery client selected by the configuration.
pub fn build_client(config: &Config) -> Result<Arc<dyn DeliveryClient>> {
    let retry = RetryPolicy::new(config.max_retries, config.max_backoff);

    if config.use_tcp {
        Ok(Arc::new(TcpTransport::new(
            config.tcp_host(),
            config.resolved_port(),
            config.use_ssl,
            config.api_key.clone(),
            retry,
        )))
    } else {
        Ok(Arc::new(HttpTransport::new(
            config.http_url(),
            config.api_key.clone(),
            config.http_timeout,
            retry,
        )?))
    }
}

/// Request/response delivery over the HTTP intake API
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    intake_url: String,
    api_key: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(
        base_url: String,
        api_key: String,
        http_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("datadog_log_sink/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(SinkError::Http)?;

        info!("Creating HTTP client with config: URL: {}", base_url);

        Ok(Self {
            client,
            intake_url: format!("{}/v1/input", base_url.trim_end_matches('/')),
            api_key,
            timeout: http_timeout,
            retry,
        })
    }

    /// Single attempt to post a payload
    async fn send_attempt(&self, payload: &str) -> Result<()> {
        let request = self
            .client
            .post(&self.intake_url)
            .header("DD-API-KEY", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send();

        let response = timeout(self.timeout, request)
            .await
            .map_err(|_| SinkError::Connect("Request timeout".to_string()))?
            .map_err(SinkError::Http)?;

        self.handle_response(response).await
    }

    /// Classify the intake response
    async fn handle_response(&self, response: Response) -> Result<()> {
        let status = response.status();

        if status.is_success() {
            debug!("Payload accepted by intake");
            return Ok(());
        }

        let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Err(SinkError::Unavailable(format!(
                    "Intake throttled or timed out ({}): {}",
                    status, error_body
                )))
            }
            s if s.is_server_error() => Err(SinkError::Unavailable(format!(
                "Intake server error {}: {}",
                status, error_body
            ))),
            StatusCode::BAD_REQUEST => {
                Err(SinkError::Transport(format!("Bad request: {}", error_body)))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SinkError::Transport(format!(
                "API key rejected ({}): {}",
                status, error_body
            ))),
            StatusCode::PAYLOAD_TOO_LARGE => {
                Err(SinkError::Transport(format!("Payload too large: {}", error_body)))
            }
            _ => Err(SinkError::Transport(format!(
                "Unexpected response {}: {}",
                status, error_body
            ))),
        }
    }
}

#[async_trait]
impl DeliveryClient for HttpTransport {
    async fn send(&self, documents: &[String]) -> Result<()> {
        let payload = format!("[{}]", documents.join(","));

        for retry in 0..self.retry.max_retries {
            self.retry.wait(retry).await;

            trace!("Sending payload to Datadog: {}", payload);
            match self.send_attempt(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retriable() => {
                    warn!("Could not send data to Datadog (attempt {}): {}", retry + 1, e);
                }
                Err(e) => {
                    error!("Datadog rejected payload, not retrying: {}", e);
                    return Err(e);
                }
            }
        }

        error!("Could not send payload to Datadog: {}", payload);
        Err(SinkError::RetriesExhausted {
            attempts: self.retry.max_retries,
        })
    }

    async fn close(&self) {}
}

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::message::{EmailPayload, DEFAULT_EMAIL_STATUS};
use crate::events::{LogRecord, RunLog};
use crate::feed::FeedItem;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Error bodies are kept for the log, but only this much of them.
const MAX_ERROR_BODY: usize = 512;

/// Errors from the newsletter API.
///
/// Only [`NotifyError::Retryable`] is retried; everything else ends the
/// attempt for this post immediately.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// 429 or 5xx: transient on the server side
    #[error("Newsletter API returned {status} (transient): {body}")]
    Retryable { status: u16, body: String },
    /// Any other non-2xx status: the request itself was refused
    #[error("Newsletter API rejected the email with {status}: {body}")]
    Rejected { status: u16, body: String },
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Payload could not be serialized
    #[error("Failed to encode email payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl NotifyError {
    /// Classifies a non-2xx response.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || (500..600).contains(&status) {
            NotifyError::Retryable { status, body }
        } else {
            NotifyError::Rejected { status, body }
        }
    }

    /// Returns true if the request should be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Retryable { .. })
    }

    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            NotifyError::Retryable { status, .. } | NotifyError::Rejected { status, .. } => {
                Some(*status)
            }
            NotifyError::Transport(_) | NotifyError::Timeout | NotifyError::Encode(_) => None,
        }
    }
}

/// Exponential backoff settings for transient API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry + 1`: `base × 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Successful API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub status: u16,
    /// Identifier the API assigned to the email, when it returns one.
    pub email_id: Option<String>,
}

/// Delivers the announcement for one post.
pub trait Announce {
    fn announce(
        &self,
        item: &FeedItem,
        log: &dyn RunLog,
    ) -> impl Future<Output = Result<Acknowledgement, NotifyError>>;
}

impl Announce for Notifier {
    fn announce(
        &self,
        item: &FeedItem,
        log: &dyn RunLog,
    ) -> impl Future<Output = Result<Acknowledgement, NotifyError>> {
        self.notify(item, log)
    }
}

/// Client for the newsletter API's create-email endpoint.
pub struct Notifier {
    client: reqwest::Client,
    api_url: String,
    /// Full `Authorization` header value, scheme included.
    authorization: SecretString,
    email_status: String,
    footer: String,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        auth_scheme: &str,
        api_key: &SecretString,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            authorization: SecretString::from(format!(
                "{} {}",
                auth_scheme.trim(),
                api_key.expose_secret()
            )),
            email_status: DEFAULT_EMAIL_STATUS.to_string(),
            footer: String::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_email_status(mut self, status: impl Into<String>) -> Self {
        self.email_status = status.into();
        self
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = footer.into();
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// The payload [`Notifier::notify`] would send for `item`.
    pub fn payload_for(&self, item: &FeedItem) -> EmailPayload {
        EmailPayload::for_item(item, &self.footer, &self.email_status)
    }

    /// Sends the announcement email for one post.
    ///
    /// Transient failures (429, 5xx) are retried with exponential backoff up to
    /// the policy's ceiling; each retry is reported to `log` with its delay.
    /// The last error is returned once retries run out.
    pub async fn notify(
        &self,
        item: &FeedItem,
        log: &dyn RunLog,
    ) -> Result<Acknowledgement, NotifyError> {
        let body = serde_json::to_vec(&self.payload_for(item))?;
        let mut retry_count = 0;

        loop {
            match self.send_once(&body).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && retry_count < self.retry.max_retries => {
                    let delay = self.retry.delay_for(retry_count);
                    log.record(
                        LogRecord::warn("Retrying notification after transient error")
                            .with("title", &item.title)
                            .with("status", e.status().unwrap_or_default())
                            .with("retry", retry_count + 1)
                            .with("delay_ms", delay.as_millis()),
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, body: &[u8]) -> Result<Acknowledgement, NotifyError> {
        let request = self
            .client
            .post(&self.api_url)
            .header(AUTHORIZATION, self.authorization.expose_secret())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        let response = tokio::time::timeout(REQUEST_TIMEOUT, request.send())
            .await
            .map_err(|_| NotifyError::Timeout)?
            .map_err(NotifyError::Transport)?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(NotifyError::from_status(
                status.as_u16(),
                truncate_chars(&text, MAX_ERROR_BODY),
            ));
        }

        let email_id = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));

        Ok(Acknowledgement {
            status: status.as_u16(),
            email_id,
        })
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

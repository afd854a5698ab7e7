//! Retrying HTTP fetcher shared by every upstream call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// `max_retries` retries after the first attempt; the n-th retry waits `base_delay * 2^n`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.max_retries).unwrap_or(u32::MAX).saturating_add(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: u32,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Transport { attempts, .. } | FetchError::HttpStatus { attempts, .. } => *attempts,
            FetchError::Closed => 0,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the last failure was retryable, i.e. the retry budget ran out.
    pub fn is_exhausted(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Closed => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url`, retrying transport failures, 5xx and 429 with exponential backoff.
    ///
    /// Any other non-2xx status (404 included) is returned immediately.
    pub async fn get(&self, kind: &'static str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", kind, url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0usize;

        loop {
            let attempts = attempt as u32 + 1;
            debug!(attempt = attempts, max_attempts = self.backoff.max_attempts(), "sending request");

            let failure = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    attempts,
                                })
                            }
                            Err(err) => (
                                classify_reqwest_error(&err),
                                FetchError::Transport {
                                    url: url.to_string(),
                                    attempts,
                                    source: err,
                                },
                            ),
                        }
                    } else {
                        (
                            classify_status(status),
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                                attempts,
                            },
                        )
                    }
                }
                Err(err) => (
                    classify_reqwest_error(&err),
                    FetchError::Transport {
                        url: url.to_string(),
                        attempts,
                        source: err,
                    },
                ),
            };

            let (disposition, err) = failure;
            if disposition == RetryDisposition::Retryable && attempt < max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(err);
        }
    }
}

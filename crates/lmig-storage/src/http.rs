//! Outbound HTTP for legacy systems that are only reachable through a paged API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};

use crate::{BackoffPolicy, RetryDisposition};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// In-flight requests across every legacy host.
    pub global_concurrency: usize,
    /// In-flight requests against any single legacy host.
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid legacy api url `{0}`")]
    Url(String),
    #[error("legacy api transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("legacy api returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("undecodable payload from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// Throttling, gateway trouble and dropped connections are worth another try; a
    /// rejected request or a payload we cannot read is not.
    pub fn disposition(&self) -> RetryDisposition {
        let retryable = match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || (500..600).contains(status)
            }
            Self::Url(_) | Self::Decode { .. } => false,
        };
        if retryable {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    host_permits: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building legacy api client")?,
            in_flight: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            host_permits: config.per_source_concurrency.max(1),
            hosts: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn permits(&self, url: &Url) -> (Option<OwnedSemaphorePermit>, Option<OwnedSemaphorePermit>) {
        let host = url.host_str().unwrap_or_default().to_string();
        let host_limit = {
            let mut hosts = self.hosts.lock().await;
            Arc::clone(
                hosts
                    .entry(host)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.host_permits))),
            )
        };
        // Neither semaphore is ever closed.
        let global = Arc::clone(&self.in_flight).acquire_owned().await.ok();
        let local = host_limit.acquire_owned().await.ok();
        (global, local)
    }

    /// GET `url` and decode the JSON body, retrying transient failures with backoff.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::Url(url.to_string()))?;
        let _permits = self.permits(&parsed).await;
        let span = info_span!("legacy_api_get", host = parsed.host_str().unwrap_or_default());
        async {
            let body = self.send_with_retries(parsed.clone(), query).await?;
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
                url: parsed.to_string(),
                message: e.to_string(),
            })
        }
        .instrument(span)
        .await
    }

    /// Single attempt, no retry; used for health probes.
    pub async fn probe(&self, url: &str) -> Result<(), FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::Url(url.to_string()))?;
        let _permits = self.permits(&parsed).await;
        let resp = self.client.get(parsed.clone()).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(FetchError::Status {
                status: resp.status().as_u16(),
                url: parsed.to_string(),
            })
        }
    }

    async fn send_with_retries(&self, url: Url, query: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            let outcome = match self.client.get(url.clone()).query(query).send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) => return Ok(bytes.to_vec()),
                    Err(err) => FetchError::Transport(err),
                },
                Ok(resp) => FetchError::Status {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                },
                Err(err) => FetchError::Transport(err),
            };
            if outcome.disposition() == RetryDisposition::NonRetryable
                || attempt >= self.backoff.max_retries
            {
                return Err(outcome);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt = attempt + 1, ?delay, error = %outcome, "legacy api call failed; backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

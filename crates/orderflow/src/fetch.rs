//! Polling client for the upstream invoice service.
//!
//! The invoice service renders asynchronously after an order is placed, so
//! the endpoint answers non-200 for a while. [`RemoteResourceFetcher`] keeps
//! asking at a fixed interval until it gets a 200, runs out of attempts, or is
//! cancelled.

use crate::invoice::{InvoiceDocument, InvoicePayload};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Fixed wait between attempts. Not applied after the last attempt.
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(4 * 60),
            max_attempts: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("resource not ready after {attempts} attempts")]
    NotReady { attempts: u32 },

    #[error("fetch cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

#[derive(Debug, Clone)]
pub enum EndpointAuth {
    None,
    Bearer(String),
    /// Legacy endpoints authenticate by a secret path segment.
    PathSecret(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// `GET {base}/{order_id}` returns ready-made invoice HTML.
    Html,
    /// `GET {base}/{order_id}/json` returns the structured invoice.
    Json,
}

impl FromStr for PayloadFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown payload format {other:?} (expected html or json)"),
        }
    }
}

enum AttemptFailure {
    Status(StatusCode),
    Transport(reqwest::Error),
}

#[derive(Clone)]
pub struct RemoteResourceFetcher {
    client: reqwest::Client,
    auth: EndpointAuth,
}

impl RemoteResourceFetcher {
    pub fn new(client: reqwest::Client, auth: EndpointAuth) -> Self {
        Self { client, auth }
    }

    /// Poll `url` until it answers 200 with a body `decode` accepts.
    ///
    /// Non-200 answers, transport errors and undecodable bodies all count as
    /// "not ready yet". At most `policy.max_attempts` requests are sent and at
    /// most `max_attempts - 1` sleeps happen between them.
    pub async fn fetch<T, D>(
        &self,
        url: &str,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
        decode: D,
    ) -> Result<T, FetchError>
    where
        D: Fn(String) -> anyhow::Result<T>,
    {
        let max = policy.max_attempts;
        let backoff_secs = policy.poll_interval.as_secs();

        for attempt in 1..=max {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { attempts: attempt - 1 });
                }
                res = self.try_once(url, policy.timeout) => res,
            };

            match outcome {
                Ok(body) => match decode(body) {
                    Ok(value) => {
                        debug!(%url, attempt, "remote resource ready");
                        return Ok(value);
                    }
                    Err(e) => warn!(
                        %url, attempt, max, backoff_secs, error = %e,
                        "remote resource returned an unreadable body, retrying"
                    ),
                },
                Err(AttemptFailure::Status(status)) => warn!(
                    %url, attempt, max, backoff_secs, status = status.as_u16(),
                    "remote resource not ready, retrying"
                ),
                Err(AttemptFailure::Transport(e)) => warn!(
                    %url, attempt, max, backoff_secs, error = %e,
                    "remote resource request failed, retrying"
                ),
            }

            if attempt < max {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(FetchError::Cancelled { attempts: attempt });
                    }
                    _ = tokio::time::sleep(policy.poll_interval) => {}
                }
            }
        }

        info!(%url, attempts = max, "remote resource still not ready, giving up");
        Err(FetchError::NotReady { attempts: max })
    }

    async fn try_once(&self, url: &str, timeout: Duration) -> Result<String, AttemptFailure> {
        let mut req = self.client.get(url).timeout(timeout);
        if let EndpointAuth::Bearer(token) = &self.auth {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(AttemptFailure::Transport)?;
        if resp.status() != StatusCode::OK {
            return Err(AttemptFailure::Status(resp.status()));
        }

        resp.text().await.map_err(AttemptFailure::Transport)
    }

    fn auth(&self) -> &EndpointAuth {
        &self.auth
    }
}

/// Where invoice documents come from. Both the artifact store and the
/// notifier's email body go through this seam.
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    async fn fetch_invoice(
        &self,
        order_id: &str,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
    ) -> Result<InvoiceDocument, FetchError>;
}

pub struct HttpInvoiceSource {
    fetcher: RemoteResourceFetcher,
    base_url: String,
    format: PayloadFormat,
}

impl HttpInvoiceSource {
    pub fn new(fetcher: RemoteResourceFetcher, base_url: impl Into<String>, format: PayloadFormat) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            format,
        }
    }

    pub fn url_for(&self, order_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let mut url = match self.format {
            PayloadFormat::Html => format!("{base}/{order_id}"),
            PayloadFormat::Json => format!("{base}/{order_id}/json"),
        };
        if let EndpointAuth::PathSecret(secret) = self.fetcher.auth() {
            url.push('/');
            url.push_str(secret);
        }
        url
    }
}

#[async_trait]
impl InvoiceSource for HttpInvoiceSource {
    async fn fetch_invoice(
        &self,
        order_id: &str,
        policy: &FetchPolicy,
        cancel: &CancellationToken,
    ) -> Result<InvoiceDocument, FetchError> {
        let url = self.url_for(order_id);
        match self.format {
            PayloadFormat::Html => {
                self.fetcher
                    .fetch(&url, policy, cancel, |body| Ok(InvoiceDocument::Html(body)))
                    .await
            }
            PayloadFormat::Json => {
                self.fetcher
                    .fetch(&url, policy, cancel, |body| {
                        let payload: InvoicePayload = serde_json::from_str(&body)?;
                        Ok(InvoiceDocument::Structured(payload))
                    })
                    .await
            }
        }
    }
}

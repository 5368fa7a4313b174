//! HTTP probes: one GET plus a response check, shaped as a poller action.
//!
//! Connection failures and check mismatches are both ordinary, retryable
//! failures: targets are expected to be unreachable early in an environment's
//! life. Every request carries its own timeout, smaller than the poller's
//! overall budget, so a single hung request cannot eat the whole budget.

use crate::poller::{PollError, Poller};
use reqwest::{Client, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Per-request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Floor for the per-request timeout inside [`HttpProbe::wait`].
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(10);

/// Errors produced by a single probe attempt.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The request never produced a response (refused, reset, timed out...).
    #[error("GET {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A response arrived but did not satisfy the check.
    #[error("GET {url}: {reason}")]
    Mismatch { url: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// A predicate over an HTTP response.
///
/// Returns a human-readable reason when the response is not acceptable.
pub trait ResponseCheck: Send + Sync {
    fn check(&self, response: &Response) -> Result<(), String>;
}

impl<F> ResponseCheck for F
where
    F: Fn(&Response) -> Result<(), String> + Send + Sync,
{
    fn check(&self, response: &Response) -> Result<(), String> {
        self(response)
    }
}

/// Accepts exactly one status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodeIs(pub StatusCode);

impl ResponseCheck for StatusCodeIs {
    fn check(&self, response: &Response) -> Result<(), String> {
        let actual = response.status();
        if actual == self.0 {
            Ok(())
        } else {
            Err(format!("expected status {}, got {}", self.0, actual))
        }
    }
}

/// Shorthand for [`StatusCodeIs`].
pub fn status_code_is(status: StatusCode) -> StatusCodeIs {
    StatusCodeIs(status)
}

/// A GET request against one URL with a set of response checks.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
    checks: Vec<Arc<dyn ResponseCheck>>,
    request_timeout: Duration,
}

impl fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProbe")
            .field("url", &self.url)
            .field("checks", &self.checks.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl HttpProbe {
    /// Creates a probe with its own HTTP client.
    pub fn get(url: impl Into<String>) -> Result<Self, ProbeError> {
        let client = Client::builder().build().map_err(ProbeError::Client)?;
        Ok(Self::with_client(client, url))
    }

    /// Creates a probe sharing an existing client.
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            checks: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Adds a check the response must pass. With no checks any response passes.
    pub fn expect(mut self, check: impl ResponseCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Sets the timeout applied to each individual request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the probed URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issues one request and evaluates every check against the response.
    pub async fn attempt(&self) -> Result<StatusCode, ProbeError> {
        self.attempt_within(self.request_timeout).await
    }

    /// Polls the probe until its checks pass or `timeout` elapses.
    ///
    /// Individual requests are capped so that a hung request still leaves
    /// room for another attempt inside `timeout`.
    pub async fn wait(
        &self,
        poller: &Poller,
        timeout: Duration,
    ) -> Result<StatusCode, PollError<ProbeError>> {
        let per_request = per_request_timeout(self.request_timeout, poller.interval(), timeout);
        poller.execute(|| self.attempt_within(per_request), timeout).await
    }

    async fn attempt_within(&self, request_timeout: Duration) -> Result<StatusCode, ProbeError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(request_timeout)
            .send()
            .await
            .map_err(|source| ProbeError::Request {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        debug!(url = %self.url, %status, "probe response");

        for check in &self.checks {
            check.check(&response).map_err(|reason| ProbeError::Mismatch {
                url: self.url.clone(),
                reason,
            })?;
        }

        Ok(status)
    }
}

/// Timeout for one request polled with `interval` under a `budget`.
///
/// At most half of what the budget leaves after one interval, so a request
/// that hangs is followed by at least one more attempt before the deadline.
/// Never above `configured`.
fn per_request_timeout(configured: Duration, interval: Duration, budget: Duration) -> Duration {
    let share = if budget > interval {
        (budget - interval) / 2
    } else {
        budget / 2
    };
    configured.min(share.max(MIN_REQUEST_TIMEOUT))
}

/// Polls `url` until the response has `status`, mirroring the common
/// "GET until status N" wait.
pub async fn get_request(
    poller: &Poller,
    url: &str,
    timeout: Duration,
    status: StatusCode,
) -> Result<StatusCode, PollError<ProbeError>> {
    let probe = HttpProbe::get(url)
        .map_err(|last| PollError::Exhausted {
            last,
            attempts: 0,
            timeout,
        })?
        .expect(status_code_is(status));
    probe.wait(poller, timeout).await
}

//! HTTP transport for webhook delivery.
//!
//! Performs exactly one bounded POST per call and reports the result as a
//! value. Connection-level problems of every kind (DNS, refused connection,
//! TLS, timeout, broken body stream) collapse into a single
//! [`TransportFault::ConnectionFailure`]; retrying is left to the caller.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Response,
};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    DEFAULT_TIMEOUT_SECONDS, USER_AGENT,
};

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hard deadline covering connect, request and response body.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Response bodies beyond this size are truncated before recording.
    pub max_response_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            user_agent: USER_AGENT.to_string(),
            max_redirects: 3,
            verify_tls: true,
            max_response_body_bytes: 64 * 1024,
        }
    }
}

/// Response received from an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lower-case names.
    pub headers: BTreeMap<String, String>,
    /// Response body (possibly truncated).
    pub body: String,
    /// Total duration of the exchange.
    pub duration: Duration,
}

/// Kind of transport fault. Deliberately a single variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// The endpoint could not be reached or did not answer in time.
    ConnectionFailure,
}

/// Result of one transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    /// The endpoint answered with a status line and a readable body.
    Completed(DeliveryResponse),
    /// No complete response was obtained.
    Faulted {
        /// Fault kind
        kind: TransportFault,
    },
}

impl TransportResult {
    /// Shorthand for `Faulted { kind: ConnectionFailure }`.
    pub const fn connection_failure() -> Self {
        Self::Faulted { kind: TransportFault::ConnectionFailure }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a str,
    payload: &'a serde_json::Value,
}

/// HTTP client for webhook delivery.
///
/// Wraps a pooled `reqwest::Client`; cloning is cheap and clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs `{"event": event_type, "payload": payload}` to `url`.
    ///
    /// Never fails and never hangs: the whole exchange runs under the
    /// configured deadline and anything short of a complete response is
    /// reported as [`TransportResult::Faulted`].
    pub async fn send(
        &self,
        url: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> TransportResult {
        let span = info_span!("webhook_delivery", url = %url, event_type = %event_type);

        async move {
            let start_time = Instant::now();
            tracing::debug!("sending webhook");

            let exchange = async {
                let response = self
                    .client
                    .post(url)
                    .header(CONTENT_TYPE, "application/json")
                    .json(&Envelope { event: event_type, payload })
                    .send()
                    .await?;
                self.read_response(response, start_time).await
            };

            match tokio::time::timeout(self.config.timeout, exchange).await {
                Ok(Ok(response)) => {
                    tracing::debug!(
                        status = response.status_code,
                        duration_ms = response.duration.as_millis(),
                        "received response"
                    );
                    TransportResult::Completed(response)
                },
                Ok(Err(e)) => {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        timeout = e.is_timeout(),
                        connect = e.is_connect(),
                        "request failed: {e}"
                    );
                    TransportResult::connection_failure()
                },
                Err(_elapsed) => {
                    tracing::warn!(
                        timeout_ms = self.config.timeout.as_millis(),
                        "request exceeded delivery deadline"
                    );
                    TransportResult::connection_failure()
                },
            }
        }
        .instrument(span)
        .await
    }

    /// Reads status, headers and a bounded body.
    ///
    /// Stops pulling chunks once the limit is exceeded, so oversized bodies
    /// are never buffered in full.
    async fn read_response(
        &self,
        mut response: Response,
        start_time: Instant,
    ) -> std::result::Result<DeliveryResponse, reqwest::Error> {
        let status_code = response.status().as_u16();
        let headers = extract_headers(response.headers());
        let limit = self.config.max_response_body_bytes;

        let mut bytes = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            bytes.extend_from_slice(&chunk);
            if bytes.len() > limit {
                truncated = true;
                break;
            }
        }

        let body = if truncated {
            let kept = String::from_utf8_lossy(&bytes[..limit]);
            format!("{kept}{TRUNCATION_SUFFIX}")
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };

        Ok(DeliveryResponse { status_code, headers, body, duration: start_time.elapsed() })
    }
}

/// Collects headers into an ordered map.
///
/// Names are already lower-case in `HeaderMap`. Values that are not valid
/// visible ASCII are skipped; repeated headers are joined with `", "`.
fn extract_headers(header_map: &HeaderMap) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();

    for (key, value) in header_map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(key.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    headers
}

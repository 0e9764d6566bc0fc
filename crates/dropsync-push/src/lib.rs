//! Multicast push delivery: one consolidated message per user.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use dropsync_core::Deal;
use dropsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "dropsync-push";

/// Data key carrying the JSON-encoded list of matched deals.
pub const DEALS_DATA_KEY: &str = "deals";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("encoding push payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("push gateway request failed: {0}")]
    Gateway(#[from] FetchError),
    #[error("decoding push gateway response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Data-only push addressed to every device token of a single user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub data: BTreeMap<String, String>,
    pub tokens: Vec<String>,
}

impl PushMessage {
    pub fn for_deals(deals: &[Deal], tokens: Vec<String>) -> Result<Self, PushError> {
        let encoded = serde_json::to_string(deals).map_err(PushError::Encode)?;
        Ok(Self {
            data: BTreeMap::from([(DEALS_DATA_KEY.to_string(), encoded)]),
            tokens,
        })
    }

    /// Decode the deal list back out of the data payload.
    pub fn deals(&self) -> Result<Vec<Deal>, serde_json::Error> {
        let encoded = self.data.get(DEALS_DATA_KEY).map(String::as_str).unwrap_or("[]");
        serde_json::from_str(encoded)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-recipient outcome of one multicast call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastReport {
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failure_count: usize,
    #[serde(default)]
    pub responses: Vec<SendResponse>,
}

impl MulticastReport {
    /// Fill in counts from `responses` when the provider only sent the list.
    fn reconcile(mut self) -> Self {
        if self.success_count == 0 && self.failure_count == 0 && !self.responses.is_empty() {
            self.success_count = self.responses.iter().filter(|r| r.success).count();
            self.failure_count = self.responses.len() - self.success_count;
        }
        self
    }

    /// Tokens whose delivery failed; `responses` is positionally aligned with `tokens`.
    pub fn failed_tokens<'a>(&self, tokens: &'a [String]) -> Vec<&'a str> {
        self.responses
            .iter()
            .zip(tokens)
            .filter(|(response, _)| !response.success)
            .map(|(_, token)| token.as_str())
            .collect()
    }
}

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Deliver `message` to all of its tokens in a single provider call.
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastReport, PushError>;
}

/// HTTP push gateway accepting `{ data, tokens }` multicast requests.
#[derive(Clone)]
pub struct HttpPushGateway {
    http: HttpFetcher,
    endpoint: String,
    server_key: String,
}

impl HttpPushGateway {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            server_key: server_key.into(),
        }
    }
}

impl fmt::Debug for HttpPushGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPushGateway")
            .field("endpoint", &self.endpoint)
            .field("server_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl PushSender for HttpPushGateway {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastReport, PushError> {
        let response = self
            .http
            .post_json(&self.endpoint, Some(&self.server_key), message)
            .await?;
        debug!(status = %response.status, tokens = message.tokens.len(), "push gateway accepted multicast");

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(MulticastReport {
                success_count: message.tokens.len(),
                ..Default::default()
            });
        }
        let report: MulticastReport =
            serde_json::from_slice(&response.body).map_err(PushError::Decode)?;
        Ok(report.reconcile())
    }
}

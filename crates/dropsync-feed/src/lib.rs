//! Giveaway feed contract + the GamerPower HTTP implementation.

use async_trait::async_trait;
use dropsync_core::Deal;
use dropsync_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "dropsync-feed";

pub const DEFAULT_FEED_URL: &str = "https://www.gamerpower.com/api/giveaways";

#[derive(Debug, Error)]
pub enum FeedFetchError {
    #[error("fetching giveaway feed from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
}

/// Source of the current set of active giveaways.
#[async_trait]
pub trait FeedClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// The full current feed, in upstream order.
    ///
    /// A response that is not a JSON array yields an empty feed rather than an error.
    async fn fetch(&self) -> Result<Vec<Deal>, FeedFetchError>;
}

#[derive(Debug, Clone)]
pub struct GamerPowerFeed {
    http: HttpFetcher,
    url: String,
}

impl GamerPowerFeed {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedClient for GamerPowerFeed {
    fn source_id(&self) -> &'static str {
        "gamerpower"
    }

    async fn fetch(&self) -> Result<Vec<Deal>, FeedFetchError> {
        let response = self
            .http
            .get_bytes(&self.url)
            .await
            .map_err(|source| FeedFetchError::Fetch {
                url: self.url.clone(),
                source,
            })?;

        debug!(
            status = %response.status,
            bytes = response.body.len(),
            url = %response.final_url,
            "feed response received"
        );
        let deals = parse_feed(&response.body);
        info!(source = self.source_id(), deals = deals.len(), "fetched giveaway feed");
        Ok(deals)
    }
}

/// Decode a feed body into deals.
///
/// Undecodable bodies and non-array payloads (GamerPower answers
/// `{"status":0,"status_message":...}` when nothing is live) produce an empty
/// feed. Individual entries that are not valid deals are skipped.
pub fn parse_feed(body: &[u8]) -> Vec<Deal> {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "feed body is not valid JSON; treating as empty");
            return Vec::new();
        }
    };

    let items = match value {
        JsonValue::Array(items) => items,
        other => {
            let status_message = other
                .get("status_message")
                .and_then(|m| m.as_str())
                .unwrap_or("non-array payload");
            warn!(status_message, "feed did not return a list of giveaways; treating as empty");
            return Vec::new();
        }
    };

    if items.is_empty() {
        info!("feed returned no giveaways");
    }

    items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<Deal>(item) {
            Ok(deal) => Some(deal),
            Err(err) => {
                warn!(index, error = %err, "skipping malformed feed entry");
                None
            }
        })
        .collect()
}

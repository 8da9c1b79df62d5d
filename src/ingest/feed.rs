//! HTTP JSON feed scraper
//!
//! Pages through a feed with `from`, `to`, `skip` and `limit` query
//! parameters until a short page comes back. A page is either a bare array
//! of events or an object with an `events` array.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ScrapeError, ScraperAdapter, SourceConfig, SourceParameters, TimeRange};
use crate::models::RawEvent;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPage {
    List(Vec<RawEvent>),
    Wrapped { events: Vec<RawEvent> },
}

impl FeedPage {
    fn into_events(self) -> Vec<RawEvent> {
        match self {
            Self::List(events) | Self::Wrapped { events } => events,
        }
    }
}

pub struct JsonFeedScraper {
    name: String,
    feed_url: String,
    page_size: u32,
    max_pages: u32,
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl JsonFeedScraper {
    pub fn new(config: &SourceConfig) -> Result<Self, ScrapeError> {
        Self::with_timeout(config, Duration::from_secs(30))
    }

    pub fn with_timeout(config: &SourceConfig, timeout: Duration) -> Result<Self, ScrapeError> {
        config.validate().map_err(ScrapeError::Config)?;

        let client = Client::builder().timeout(timeout).gzip(true).build()?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            name: config.name.clone(),
            feed_url: config.feed_url.clone(),
            page_size: config.page_size,
            max_pages: config.max_pages,
            client,
            rate_limiter,
        })
    }

    async fn fetch_page(&self, range: &TimeRange, skip: u32) -> Result<Vec<RawEvent>, ScrapeError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(&self.feed_url)
            .query(&[
                ("from", range.from.to_rfc3339()),
                ("to", range.to.to_rfc3339()),
                ("skip", skip.to_string()),
                ("limit", self.page_size.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                status: status.as_u16(),
                url: self.feed_url.clone(),
            });
        }

        let body = response.text().await?;
        let page: FeedPage =
            serde_json::from_str(&body).map_err(|e| ScrapeError::Parse(e.to_string()))?;
        Ok(page.into_events())
    }
}

#[async_trait]
impl ScraperAdapter for JsonFeedScraper {
    fn source(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, range: &TimeRange) -> Result<Vec<RawEvent>, ScrapeError> {
        let mut events = Vec::new();
        let mut skip = 0u32;

        for page in 0..self.max_pages {
            let batch = self.fetch_page(range, skip).await?;
            let count = batch.len() as u32;
            debug!(source = %self.name, page, count, "Fetched feed page");
            events.extend(batch);

            if count < self.page_size {
                return Ok(events);
            }
            skip += count;
        }

        warn!(source = %self.name, max_pages = self.max_pages, "Feed truncated at page limit");
        Ok(events)
    }
}

/// Fetch a source's parameters document
pub async fn fetch_parameters(client: &Client, url: &str) -> Result<SourceParameters, ScrapeError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ScrapeError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ScrapeError::Parse(e.to_string()))
}

//! Optional poller for an external weather/seismic reading feed.
//!
//! The feed is a cursor-paginated JSON endpoint returning
//! `{"results": [RawReading...], "next_cursor": "..."}`. Every item that
//! parses is handed to the [`ReadingIngester`]; items that do not parse or
//! fail validation are logged and skipped.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::ingest::ReadingIngester;
use crate::models::RawReading;

// ---

pub struct FeedPoller {
    client: reqwest::Client,
    base_url: String,
    max_pages: u32,
    interval: Duration,
}

/// Counters for one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub pages: u32,
    pub accepted: u32,
    pub rejected: u32,
}

impl FeedPoller {
    // ---
    /// `request_timeout` bounds each page fetch, connect included.
    pub fn new(
        base_url: String,
        max_pages: u32,
        interval: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        // ---
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            max_pages,
            interval,
        })
    }

    /// Poll until `shutdown` flips to true. A poll in progress is abandoned.
    pub async fn run(self, ingester: ReadingIngester, mut shutdown: watch::Receiver<bool>) {
        // ---
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(url = %self.base_url, interval_secs = self.interval.as_secs(), "Feed poller started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let polled = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        polled = self.poll_once(&ingester) => polled,
                    };
                    match polled {
                        Ok(stats) => tracing::info!(
                            pages = stats.pages,
                            accepted = stats.accepted,
                            rejected = stats.rejected,
                            "Feed poll complete"
                        ),
                        Err(e) => tracing::error!("Failed to poll reading feed: {}", e),
                    }
                }
            }
        }

        tracing::info!("Feed poller stopped");
    }

    /// Fetch every page of the feed once and ingest the readings.
    pub async fn poll_once(&self, ingester: &ReadingIngester) -> Result<PollStats> {
        // ---
        let mut stats = PollStats::default();
        let mut cursor: Option<String> = None;

        loop {
            if stats.pages >= self.max_pages {
                tracing::debug!(
                    "Hit page limit of {}, stopping pagination. Accepted {} readings so far.",
                    self.max_pages,
                    stats.accepted
                );
                break;
            }
            stats.pages += 1;

            let mut request = self.client.get(&self.base_url);
            if let Some(ref cursor) = cursor {
                request = request.query(&[("cursor", cursor)]);
            }

            tracing::debug!("Fetching feed page {} (cursor: {:?})", stats.pages, cursor);
            let response: serde_json::Value = request.send().await?.error_for_status()?.json().await?;

            let (readings, skipped) = parse_page(&response);
            stats.rejected += skipped;
            for raw in &readings {
                match ingester.ingest(raw) {
                    Ok(()) => stats.accepted += 1,
                    Err(_) => stats.rejected += 1,
                }
            }

            cursor = response
                .get("next_cursor")
                .and_then(|c| c.as_str())
                .map(String::from);

            if cursor.is_none() {
                break;
            }
        }

        Ok(stats)
    }
}

/// Extract raw readings from one feed page, counting items that do not parse.
fn parse_page(response: &serde_json::Value) -> (Vec<RawReading>, u32) {
    // ---
    let Some(items) = response.get("results").and_then(|d| d.as_array()) else {
        tracing::debug!("Feed response missing 'results' field or not an array");
        return (Vec::new(), 0);
    };

    let mut readings = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for (i, item) in items.iter().enumerate() {
        match serde_json::from_value::<RawReading>(item.clone()) {
            Ok(reading) => readings.push(reading),
            Err(e) => {
                tracing::debug!("Failed to parse feed item {}: {} - Raw item: {}", i, e, item);
                skipped += 1;
            }
        }
    }
    (readings, skipped)
}

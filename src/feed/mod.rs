// Signal feed: a spreadsheet published as CSV
pub mod parse;

pub use parse::{parse_row, parse_signals, RowDefaults};

use reqwest::Client;

use crate::error::FeedError;
use crate::models::Signal;

/// Client for the published signal sheet
#[derive(Clone)]
pub struct SheetFeed {
    client: Client,
    url: String,
    defaults: RowDefaults,
}

impl SheetFeed {
    pub fn new(client: Client, url: impl Into<String>, defaults: RowDefaults) -> Self {
        Self {
            client,
            url: url.into(),
            defaults,
        }
    }

    /// Fetch and parse the whole sheet
    ///
    /// Only an unreachable or unreadable feed is an error; individual bad
    /// rows are logged and dropped.
    pub async fn fetch_signals(&self) -> Result<Vec<Signal>, FeedError> {
        tracing::info!("Fetching signal feed...");

        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status));
        }
        let body = response.text().await?;

        let (signals, rejected) = parse_signals(&body, &self.defaults)?;

        for e in &rejected {
            tracing::warn!(row = e.row, "Skipping malformed feed row: {}", e.reason);
        }
        tracing::info!(
            "Feed returned {} signals ({} rows skipped)",
            signals.len(),
            rejected.len()
        );

        Ok(signals)
    }
}

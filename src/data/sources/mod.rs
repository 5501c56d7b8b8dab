//! Remote data sources
//!
//! A source answers three kinds of request for a ticker: a daily range, a single
//! intraday quote, and the fundamentals table. Payload parsing lives here so every
//! source shares it:
//! - range bodies are newline-delimited `date,open,high,low,close,volume` records
//! - intraday bodies are one JSON object
//! - fundamentals are a tab-delimited table (see [`crate::data::fundamentals`])

#[cfg(feature = "http")]
pub mod http;
pub mod memory;

#[cfg(feature = "http")]
pub use http::HttpSource;
pub use memory::MemorySource;

use crate::data::fundamentals::FundamentalReports;
use crate::error::{ChartError, Result};
use crate::types::{parse_record, session_reader, Bar};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

/// Trait for remote price and fundamentals providers
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &str;

    /// Daily bars for `[start, end]`, newest first
    async fn fetch_range(&self, ticker: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<Bar>>;

    /// Latest intraday quote
    async fn fetch_intraday(&self, ticker: &str) -> Result<IntradayQuote>;

    /// Fundamental reports for the requested metric keys
    async fn fetch_fundamentals(&self, ticker: &str, keys: &[String])
        -> Result<FundamentalReports>;
}

/// Intraday quote as returned by the provider
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntradayQuote {
    pub ticker: String,
    pub last_sale_year: i32,
    pub last_sale_month: u32,
    pub last_sale_day: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub prev_close: f64,
    pub volume: f64,
}

impl IntradayQuote {
    /// Session date of the last sale
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.last_sale_year, self.last_sale_month, self.last_sale_day)
    }

    /// Synthetic daily bar for the session in progress
    pub fn to_bar(&self) -> Option<Bar> {
        Some(Bar::new(
            self.date()?,
            self.open,
            self.high,
            self.low,
            self.last,
            self.volume,
        ))
    }
}

/// Parse a range response body into newest-first bars
///
/// Records that fail [`parse_record`] (including a header row) are skipped.
pub fn parse_range_body(body: &str) -> Vec<Bar> {
    let mut skipped = 0usize;
    let mut bars = Vec::new();
    for record in session_reader(body.as_bytes()).records() {
        match record.ok().as_ref().and_then(parse_record) {
            Some(bar) => bars.push(bar),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        log::warn!("Skipped {} unparseable range rows", skipped);
    }

    bars.sort_by(|a, b| b.date.cmp(&a.date));
    bars.dedup_by(|later, earlier| later.date == earlier.date);
    bars
}

/// Decode an intraday response body
pub fn decode_intraday(body: &str) -> Result<IntradayQuote> {
    serde_json::from_str(body)
        .map_err(|e| ChartError::Decode(format!("Intraday quote: {}", e)))
}

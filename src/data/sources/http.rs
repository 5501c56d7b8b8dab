//! HTTP data source
//!
//! Talks to the chart data API: `/ohlcv`, `/intraday` and `/fundamentalTSV`.

use super::{decode_intraday, parse_range_body, IntradayQuote, RemoteSource};
use crate::config::ApiConfig;
use crate::data::fundamentals::{parse_fundamental_tsv, FundamentalReports};
use crate::error::{ChartError, Result};
use crate::types::Bar;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use std::time::Duration;

/// Remote source backed by the chart data HTTP API
pub struct HttpSource {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpSource {
    /// Create a new HTTP source
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChartError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn range_url(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/ohlcv/{}?startDate={}&endDate={}&token={}",
            self.base_url,
            ticker,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            self.token
        )
    }

    fn intraday_url(&self, ticker: &str) -> String {
        format!("{}/intraday/{}?token={}", self.base_url, ticker, self.token)
    }

    fn fundamentals_url(&self, ticker: &str, keys: &[String]) -> String {
        format!(
            "{}/fundamentalTSV/{}/{}?&token={}",
            self.base_url,
            ticker,
            keys.join(","),
            self.token
        )
    }

    /// GET a URL and return its body, mapping transport and status failures
    async fn get_text(&self, url: &str) -> Result<String> {
        // Keep the token out of logs and errors
        let display_url = url.split('?').next().unwrap_or(url).to_string();
        log::debug!("GET {}", display_url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ChartError::Network(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChartError::HttpStatus {
                status: response.status().as_u16(),
                url: display_url,
            });
        }

        response
            .text()
            .await
            .map_err(|e| ChartError::Network(format!("Failed to read response: {}", e)))
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_range(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let body = self.get_text(&self.range_url(ticker, start, end)).await?;
        Ok(parse_range_body(&body))
    }

    async fn fetch_intraday(&self, ticker: &str) -> Result<IntradayQuote> {
        let body = self.get_text(&self.intraday_url(ticker)).await?;
        decode_intraday(&body)
    }

    async fn fetch_fundamentals(
        &self,
        ticker: &str,
        keys: &[String],
    ) -> Result<FundamentalReports> {
        let body = self.get_text(&self.fundamentals_url(ticker, keys)).await?;
        parse_fundamental_tsv(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> HttpSource {
        HttpSource::new(&ApiConfig {
            base_url: "https://api.example.com/api/".to_string(),
            token: "t0k".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_source_creation() {
        assert_eq!(source().name(), "http");
    }

    #[test]
    fn test_urls() {
        let source = source();
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 6, 28).unwrap();
        assert_eq!(
            source.range_url("AAPL", start, end),
            "https://api.example.com/api/ohlcv/AAPL?startDate=2024-01-02&endDate=2024-06-28&token=t0k"
        );
        assert_eq!(
            source.intraday_url("AAPL"),
            "https://api.example.com/api/intraday/AAPL?token=t0k"
        );
        let keys = vec!["EPS".to_string(), "Revenue".to_string()];
        assert_eq!(
            source.fundamentals_url("AAPL", &keys),
            "https://api.example.com/api/fundamentalTSV/AAPL/EPS,Revenue?&token=t0k"
        );
    }
}

//! In-memory data source
//!
//! Serves scripted responses per ticker. Used for offline replay of CSV files and by
//! tests, which can also hold a ticker's range request open until released.

use super::{decode_intraday, parse_range_body, IntradayQuote, RemoteSource};
use crate::data::fundamentals::FundamentalReports;
use crate::error::{ChartError, Result};
use crate::types::Bar;
use async_trait::async_trait;
use chrono::NaiveDate;
use hashbrown::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Default)]
struct MemoryState {
    bars: HashMap<String, Vec<Bar>>,
    intraday: HashMap<String, String>,
    fundamentals: HashMap<String, FundamentalReports>,
    range_failures: HashMap<String, ChartError>,
    gates: HashMap<String, Arc<Notify>>,
    range_calls: HashMap<String, usize>,
    intraday_calls: HashMap<String, usize>,
}

/// Scripted remote source
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<MemoryState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one `TICKER.csv` file per ticker from a directory
    pub fn from_csv_dir(dir: &Path) -> Result<Self> {
        let source = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Some(ticker) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path)?;
            let bars = parse_range_body(&body);
            log::info!("Loaded {} bars for {} from {}", bars.len(), ticker, path.display());
            source.set_bars(&ticker.to_uppercase(), bars);
        }
        Ok(source)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the daily history served for a ticker
    pub fn set_bars(&self, ticker: &str, mut bars: Vec<Bar>) {
        bars.sort_by(|a, b| b.date.cmp(&a.date));
        self.lock().bars.insert(ticker.to_string(), bars);
    }

    /// Serve this raw JSON body for intraday requests
    pub fn set_intraday_body(&self, ticker: &str, body: &str) {
        self.lock()
            .intraday
            .insert(ticker.to_string(), body.to_string());
    }

    pub fn set_fundamentals(&self, ticker: &str, reports: FundamentalReports) {
        self.lock()
            .fundamentals
            .insert(ticker.to_string(), reports);
    }

    /// Fail range requests for a ticker until cleared
    pub fn fail_ranges(&self, ticker: &str, error: ChartError) {
        self.lock()
            .range_failures
            .insert(ticker.to_string(), error);
    }

    pub fn clear_failures(&self, ticker: &str) {
        self.lock().range_failures.remove(ticker);
    }

    /// Hold range requests for a ticker until [`MemorySource::release`]
    pub fn hold(&self, ticker: &str) {
        self.lock()
            .gates
            .insert(ticker.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, ticker: &str) {
        if let Some(gate) = self.lock().gates.remove(ticker) {
            gate.notify_one();
        }
    }

    pub fn range_calls(&self, ticker: &str) -> usize {
        self.lock().range_calls.get(ticker).copied().unwrap_or(0)
    }

    pub fn intraday_calls(&self, ticker: &str) -> usize {
        self.lock().intraday_calls.get(ticker).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_range(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let gate = {
            let mut state = self.lock();
            *state.range_calls.entry(ticker.to_string()).or_insert(0) += 1;
            state.gates.get(ticker).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.lock();
        if let Some(error) = state.range_failures.get(ticker) {
            return Err(error.clone());
        }
        Ok(state
            .bars
            .get(ticker)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_intraday(&self, ticker: &str) -> Result<IntradayQuote> {
        let body = {
            let mut state = self.lock();
            *state.intraday_calls.entry(ticker.to_string()).or_insert(0) += 1;
            state.intraday.get(ticker).cloned()
        };
        match body {
            Some(body) => decode_intraday(&body),
            None => Err(ChartError::HttpStatus {
                status: 404,
                url: format!("memory://intraday/{}", ticker),
            }),
        }
    }

    async fn fetch_fundamentals(
        &self,
        ticker: &str,
        _keys: &[String],
    ) -> Result<FundamentalReports> {
        self.lock()
            .fundamentals
            .get(ticker)
            .cloned()
            .ok_or_else(|| ChartError::EmptyResult(format!("{} fundamentals", ticker)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_range_is_filtered_and_counted() {
        let source = MemorySource::new();
        let bars = (0..10)
            .map(|i| Bar::new(date(2024, 1, 20) - Duration::days(i), 1.0, 2.0, 0.5, 1.5, 10.0))
            .collect();
        source.set_bars("AAPL", bars);

        let got = source
            .fetch_range("AAPL", date(2024, 1, 15), date(2024, 1, 18))
            .await
            .unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].date, date(2024, 1, 18));
        assert_eq!(source.range_calls("AAPL"), 1);
        assert!(source
            .fetch_range("MSFT", date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let source = MemorySource::new();
        source.fail_ranges("AAPL", ChartError::Network("offline".into()));
        let err = source
            .fetch_range("AAPL", date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let source = Arc::new(MemorySource::new());
        source.hold("AAPL");
        let task = {
            let source = source.clone();
            tokio::spawn(async move {
                source
                    .fetch_range("AAPL", date(2024, 1, 1), date(2024, 2, 1))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        source.release("AAPL");
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_from_csv_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("msft.csv")).unwrap();
        writeln!(file, "2024-01-02,370.0,371.0,366.5,370.87,25258600").unwrap();
        writeln!(file, "2024-01-03,369.0,373.2,368.5,370.6,23083500").unwrap();

        let source = MemorySource::from_csv_dir(dir.path()).unwrap();
        assert_eq!(source.lock().bars.get("MSFT").map(Vec::len), Some(2));
    }
}

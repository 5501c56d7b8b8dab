//! In-memory local store

use super::{LocalStore, SEARCH_LIMIT};
use crate::comparison::{Comparison, Instrument};
use crate::error::{ChartError, Result};
use crate::types::{Bar, ComparisonId, StockId};
use async_trait::async_trait;
use chrono::NaiveDate;
use hashbrown::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct StoreState {
    listings: Vec<Instrument>,
    bars: HashMap<StockId, Vec<Bar>>,
    comparisons: Vec<Comparison>,
    next_comparison_id: ComparisonId,
    next_instrument_id: i64,
    fail_loads: bool,
    saves: usize,
}

/// Local store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every `load_bars` call fail
    pub fn fail_loads(&self, fail: bool) {
        self.lock().fail_loads = fail;
    }

    /// Number of `save_bars` calls so far
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    /// Every cached bar for a stock, newest first
    pub fn cached(&self, stock_id: StockId) -> Vec<Bar> {
        self.lock().bars.get(&stock_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load_bars(&self, stock_id: StockId, since: NaiveDate) -> Result<Vec<Bar>> {
        let state = self.lock();
        if state.fail_loads {
            return Err(ChartError::Store("load_bars disabled".to_string()));
        }
        Ok(state
            .bars
            .get(&stock_id)
            .map(|bars| bars.iter().filter(|b| b.date >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn save_bars(&self, stock_id: StockId, bars: &[Bar]) -> Result<()> {
        let mut state = self.lock();
        state.saves += 1;
        let cached = state.bars.entry(stock_id).or_default();
        for bar in bars {
            match cached.iter_mut().find(|b| b.date == bar.date) {
                Some(existing) => *existing = bar.clone(),
                None => cached.push(bar.clone()),
            }
        }
        cached.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(())
    }

    async fn save_listing(&self, listing: &Instrument) -> Result<StockId> {
        let mut state = self.lock();
        if let Some(existing) = state
            .listings
            .iter_mut()
            .find(|l| l.ticker == listing.ticker)
        {
            let stock_id = existing.stock_id;
            *existing = listing.clone();
            existing.stock_id = stock_id;
            return Ok(stock_id);
        }
        let stock_id = state.listings.len() as StockId + 1;
        let mut saved = listing.clone();
        saved.stock_id = stock_id;
        state.listings.push(saved);
        Ok(stock_id)
    }

    async fn search_instruments(&self, text: &str) -> Result<Vec<Instrument>> {
        let upper = text.trim().to_uppercase();
        let mut found: Vec<Instrument> = self
            .lock()
            .listings
            .iter()
            .filter(|l| l.ticker.starts_with(&upper) || l.name.to_uppercase().contains(&upper))
            .cloned()
            .collect();
        found.sort_by(|a, b| (b.ticker == upper).cmp(&(a.ticker == upper)).then(a.ticker.cmp(&b.ticker)));
        found.truncate(SEARCH_LIMIT);
        Ok(found)
    }

    async fn load_comparisons(&self) -> Result<Vec<Comparison>> {
        Ok(self.lock().comparisons.clone())
    }

    async fn save_comparison(&self, comparison: &Comparison) -> Result<Comparison> {
        let mut state = self.lock();
        let mut saved = comparison.clone();

        if saved.instruments.is_empty() {
            if let Some(id) = saved.id.take() {
                state.comparisons.retain(|c| c.id != Some(id));
            }
            return Ok(saved);
        }

        saved.refresh_title();
        if saved.id.is_none() {
            state.next_comparison_id += 1;
            saved.id = Some(state.next_comparison_id);
        }
        for instrument in saved.instruments.iter_mut() {
            if instrument.id.is_none() {
                state.next_instrument_id += 1;
                instrument.id = Some(state.next_instrument_id);
            }
        }

        match state.comparisons.iter_mut().find(|c| c.id == saved.id) {
            Some(existing) => *existing = saved.clone(),
            None => state.comparisons.push(saved.clone()),
        }
        Ok(saved)
    }

    async fn delete_comparison(&self, id: ComparisonId) -> Result<()> {
        self.lock().comparisons.retain(|c| c.id != Some(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_bars_upsert() {
        let store = MemoryStore::new();
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar::new(date(2024, 3, 10) - Duration::days(i), 1.0, 2.0, 0.5, 1.5, 10.0))
            .collect();
        store.save_bars(1, &bars).await.unwrap();
        store.save_bars(1, &bars[..2]).await.unwrap();
        assert_eq!(store.cached(1).len(), 5);
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load_bars(1, date(2024, 3, 9)).await.unwrap().len(), 2);

        store.fail_loads(true);
        assert!(store.load_bars(1, date(2024, 3, 9)).await.is_err());
    }

    #[tokio::test]
    async fn test_comparisons() {
        let store = MemoryStore::new();
        let mut comparison = Comparison::new();
        comparison.add(Instrument::new(1, "AAPL", "Apple Inc.", date(1980, 12, 12)));
        let saved = store.save_comparison(&comparison).await.unwrap();
        assert_eq!(saved.id, Some(1));
        assert_eq!(saved.instruments[0].id, Some(1));

        store.delete_comparison(1).await.unwrap();
        assert!(store.load_comparisons().await.unwrap().is_empty());
    }
}

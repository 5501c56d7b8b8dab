//! Local persistence
//!
//! The store caches daily bars per instrument, lists tradable instruments for search,
//! and keeps saved comparisons. Bars are keyed by (stock id, date) and saving is an
//! idempotent upsert.

pub mod memory;
#[cfg(feature = "rusqlite-support")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "rusqlite-support")]
pub use sqlite::SqliteStore;

use crate::comparison::{Comparison, Instrument};
use crate::error::Result;
use crate::types::{Bar, ComparisonId, StockId};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Maximum rows returned by an instrument search
pub const SEARCH_LIMIT: usize = 50;

/// Load/save contract for cached bars, listings and comparisons
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Bars on or after `since`, newest first
    async fn load_bars(&self, stock_id: StockId, since: NaiveDate) -> Result<Vec<Bar>>;

    /// Insert or replace bars keyed by (stock id, date)
    async fn save_bars(&self, stock_id: StockId, bars: &[Bar]) -> Result<()>;

    /// Register a tradable instrument, returning its stock id
    async fn save_listing(&self, listing: &Instrument) -> Result<StockId>;

    /// Listings whose ticker starts with, or whose name contains, `text`
    async fn search_instruments(&self, text: &str) -> Result<Vec<Instrument>>;

    async fn load_comparisons(&self) -> Result<Vec<Comparison>>;

    /// Save a comparison and its instruments, returning it with ids assigned
    ///
    /// A comparison without instruments is deleted instead.
    async fn save_comparison(&self, comparison: &Comparison) -> Result<Comparison>;

    async fn delete_comparison(&self, id: ComparisonId) -> Result<()>;
}

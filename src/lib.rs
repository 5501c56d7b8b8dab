//! # Rusty-Chart
//!
//! Charting core for comparing the price history of several instruments on one
//! scrolling, zoomable viewport.
//!
//! Each instrument is owned by a worker task that loads cached and remote daily bars,
//! resamples them to weekly or monthly bars, computes moving averages and Bollinger
//! bands, aligns fundamental reports and builds pixel geometry. The orchestrator fans
//! pan and zoom requests out to every worker, keeps all instruments on one shared
//! vertical scale, and publishes an immutable frame once every worker is ready.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_chart::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> rusty_chart::Result<()> {
//! let config = ChartConfig::default();
//! let services = DataServices::new(
//!     Arc::new(MemorySource::new()),
//!     Arc::new(MemoryStore::new()),
//! );
//! let mut orchestrator = Orchestrator::new(services, &config);
//! let frames = orchestrator.subscribe();
//!
//! let mut comparison = Comparison::new();
//! comparison.add(Instrument::new(1, "AAPL", "Apple Inc.", chrono::NaiveDate::MIN));
//! orchestrator.update_comparison(comparison).await?;
//! orchestrator.wait_until_ready().await?;
//!
//! for chart in &frames.borrow().charts {
//!     println!("{} last {}", chart.ticker, chart.last_price);
//! }
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod calendar;
pub mod comparison;
pub mod config;
pub mod data;
pub mod error;
pub mod geometry;
pub mod orchestrator;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{ChartError, Result};

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::acquisition::{AcquisitionService, DataServices};
    pub use crate::calendar::{Clock, ManualClock, NYSECalendar, SystemClock, TradingCalendar};
    pub use crate::comparison::{ChartStyle, Comparison, Instrument, MetricRanges, TechnicalSet};
    pub use crate::config::ChartConfig;
    pub use crate::data::sources::MemorySource;
    pub use crate::data::{BarUnit, DailySeries, FundamentalReports, RemoteSource};
    pub use crate::error::{ChartError, Result};
    pub use crate::geometry::{ChartElements, ChartLayout};
    pub use crate::orchestrator::{Frame, Notice, Orchestrator};
    pub use crate::store::{LocalStore, MemoryStore};
    pub use crate::types::*;
    pub use crate::worker::{Readiness, WorkerHandle};
}

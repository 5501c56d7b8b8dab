//! Market data handling
//!
//! Daily series maintenance, resampling, indicators, fundamentals and the remote
//! data sources that feed them.

pub mod fundamentals;
pub mod indicators;
pub mod resample;
pub mod series;
pub mod sources;

pub use fundamentals::{align_reports, parse_fundamental_tsv, FundamentalReports};
pub use indicators::{calculate_bollinger_bands, calculate_sma};
pub use resample::{group_by_month, group_by_week, period_series, BarUnit};
pub use series::{DailySeries, MergeOutcome};
pub use sources::{IntradayQuote, RemoteSource};

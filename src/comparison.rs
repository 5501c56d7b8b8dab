//! Instruments and comparisons
//!
//! A comparison is an ordered set of instruments charted on one shared viewport. It
//! also carries the per-metric min/max table used to scale fundamental sparklines
//! consistently across its instruments.

use crate::types::{ComparisonId, StockId};
use chrono::NaiveDate;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Default up color (green); the matching down color is red
pub const DEFAULT_UP_COLOR: &str = "009900";
pub const DEFAULT_DOWN_COLOR: &str = "ff0000";

/// Metric keys selected for a newly added instrument
pub const DEFAULT_FUNDAMENTALS: &[&str] = &[
    "CIRevenuePerShare",
    "EarningsPerShareBasic",
    "CINetCashFromOpsPerShare",
];

/// Price drawing style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChartStyle {
    #[default]
    Ohlc,
    Hlc,
    Candle,
    Close,
}

impl ChartStyle {
    /// Integer code used by the local store
    pub fn code(self) -> i64 {
        match self {
            ChartStyle::Ohlc => 0,
            ChartStyle::Hlc => 1,
            ChartStyle::Candle => 2,
            ChartStyle::Close => 3,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ChartStyle::Hlc,
            2 => ChartStyle::Candle,
            3 => ChartStyle::Close,
            _ => ChartStyle::Ohlc,
        }
    }
}

/// Technical overlays selected for an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalSet {
    pub sma50: bool,
    pub sma200: bool,
    pub bollinger: bool,
}

impl Default for TechnicalSet {
    fn default() -> Self {
        Self {
            sma50: false,
            sma200: true,
            bollinger: false,
        }
    }
}

impl TechnicalSet {
    /// Parse a comma-separated list such as `"sma200,bb20,"`
    pub fn from_list(list: &str) -> Self {
        let mut set = Self {
            sma50: false,
            sma200: false,
            bollinger: false,
        };
        for item in list.split(',').map(str::trim) {
            match item {
                "sma50" => set.sma50 = true,
                "sma200" => set.sma200 = true,
                "bb20" => set.bollinger = true,
                "" => {}
                other => log::debug!("Ignoring unknown technical '{}'", other),
            }
        }
        set
    }

    /// Comma-terminated list form used by the local store
    pub fn to_list(self) -> String {
        let mut list = String::new();
        if self.sma50 {
            list.push_str("sma50,");
        }
        if self.sma200 {
            list.push_str("sma200,");
        }
        if self.bollinger {
            list.push_str("bb20,");
        }
        list
    }

    pub fn any(self) -> bool {
        self.sma50 || self.sma200 || self.bollinger
    }
}

/// One charted instrument with its display settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Row id once the instrument is saved in a comparison
    pub id: Option<i64>,
    pub stock_id: StockId,
    pub ticker: String,
    pub name: String,
    pub style: ChartStyle,
    pub up_color: String,
    pub down_color: String,
    pub technicals: TechnicalSet,
    pub fundamental_keys: Vec<String>,
    /// First session with price history
    pub start_date: NaiveDate,
    pub has_fundamentals: bool,
}

impl Instrument {
    /// Create an unsaved instrument with default settings
    pub fn new(stock_id: StockId, ticker: &str, name: &str, start_date: NaiveDate) -> Self {
        Self {
            id: None,
            stock_id,
            ticker: ticker.to_string(),
            name: name.to_string(),
            style: ChartStyle::default(),
            up_color: DEFAULT_UP_COLOR.to_string(),
            down_color: DEFAULT_DOWN_COLOR.to_string(),
            technicals: TechnicalSet::default(),
            fundamental_keys: DEFAULT_FUNDAMENTALS.iter().map(|k| k.to_string()).collect(),
            start_date,
            has_fundamentals: true,
        }
    }

    /// Mark the listing as lacking fundamentals, clearing any selected metrics
    pub fn without_fundamentals(mut self) -> Self {
        self.has_fundamentals = false;
        self.fundamental_keys.clear();
        self
    }

    pub fn with_style(mut self, style: ChartStyle) -> Self {
        self.style = style;
        self
    }

    /// Whether a fundamentals request is worth making
    pub fn wants_fundamentals(&self) -> bool {
        self.has_fundamentals && !self.fundamental_keys.is_empty()
    }

    pub fn add_fundamental(&mut self, key: &str) {
        if !self.fundamental_keys.iter().any(|k| k == key) {
            self.fundamental_keys.push(key.to_string());
        }
    }

    pub fn remove_fundamental(&mut self, key: &str) {
        self.fundamental_keys.retain(|k| k != key);
    }

    /// Comma-terminated metric list used by the local store
    pub fn fundamental_list(&self) -> String {
        self.fundamental_keys
            .iter()
            .map(|k| format!("{},", k))
            .collect()
    }

    /// Parse a comma-separated metric list
    pub fn parse_fundamental_list(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Running min/max per fundamental metric across the visible reports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricRanges {
    min: HashMap<String, f64>,
    max: HashMap<String, f64>,
}

impl MetricRanges {
    pub fn reset(&mut self) {
        self.min.clear();
        self.max.clear();
    }

    /// Fold one report value into the table; non-finite values are ignored
    ///
    /// The first value for a key sets the max and a min no greater than zero, so bars
    /// of positive metrics grow from a zero baseline.
    pub fn update_min_max(&mut self, key: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        if let (Some(min), Some(max)) = (self.min.get_mut(key), self.max.get_mut(key)) {
            *min = min.min(value);
            *max = max.max(value);
            return;
        }
        self.min.insert(key.to_string(), value.min(0.0));
        self.max.insert(key.to_string(), value);
    }

    pub fn min(&self, key: &str) -> Option<f64> {
        self.min.get(key).copied()
    }

    pub fn max(&self, key: &str) -> Option<f64> {
        self.max.get(key).copied()
    }

    /// Vertical extent needed to draw every value for `key`; `None` without values
    pub fn range(&self, key: &str) -> Option<f64> {
        let (min, max) = (self.min(key)?, self.max(key)?);
        Some(if max > 0.0 && min > 0.0 {
            max
        } else if max > 0.0 {
            max - min
        } else {
            -min
        })
    }
}

/// Instruments sharing one viewport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Row id once saved
    pub id: Option<ComparisonId>,
    pub title: String,
    pub instruments: Vec<Instrument>,
    #[serde(skip)]
    pub metric_ranges: MetricRanges,
}

impl Comparison {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether two values describe the same saved comparison
    pub fn same_identity(&self, other: &Comparison) -> bool {
        self.id == other.id
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Add an instrument and refresh the title
    pub fn add(&mut self, instrument: Instrument) {
        self.instruments.push(instrument);
        self.refresh_title();
    }

    /// Remove the instrument with this ticker, returning it
    pub fn remove(&mut self, ticker: &str) -> Option<Instrument> {
        let index = self.instruments.iter().position(|i| i.ticker == ticker)?;
        let removed = self.instruments.remove(index);
        self.refresh_title();
        Some(removed)
    }

    /// Title is the space-separated list of tickers
    pub fn refresh_title(&mut self) {
        self.title = self
            .instruments
            .iter()
            .map(|i| i.ticker.as_str())
            .collect::<Vec<_>>()
            .join(" ");
    }

    /// Union of the instruments' metric keys, in order of first appearance
    pub fn sparkline_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for instrument in &self.instruments {
            for key in &instrument.fundamental_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(1980, 12, 12).unwrap()
    }

    #[test]
    fn test_technical_list_round_trip() {
        let set = TechnicalSet::from_list("sma50,bb20,");
        assert!(set.sma50 && set.bollinger && !set.sma200);
        assert_eq!(set.to_list(), "sma50,bb20,");
        assert_eq!(TechnicalSet::default().to_list(), "sma200,");
        assert!(!TechnicalSet::from_list("").any());
    }

    #[test]
    fn test_instrument_fundamentals() {
        let mut aapl = Instrument::new(1, "AAPL", "Apple Inc.", start());
        assert!(aapl.wants_fundamentals());
        aapl.add_fundamental("EarningsPerShareBasic");
        assert_eq!(aapl.fundamental_keys.len(), 3);
        aapl.remove_fundamental("CIRevenuePerShare");
        assert_eq!(
            aapl.fundamental_list(),
            "EarningsPerShareBasic,CINetCashFromOpsPerShare,"
        );
        assert_eq!(
            Instrument::parse_fundamental_list(&aapl.fundamental_list()),
            aapl.fundamental_keys
        );

        let spy = Instrument::new(2, "SPY", "SPDR S&P 500", start()).without_fundamentals();
        assert!(!spy.wants_fundamentals());
    }

    #[test]
    fn test_chart_style_codes() {
        for style in [ChartStyle::Ohlc, ChartStyle::Hlc, ChartStyle::Candle, ChartStyle::Close] {
            assert_eq!(ChartStyle::from_code(style.code()), style);
        }
        assert_eq!(ChartStyle::from_code(42), ChartStyle::Ohlc);
    }

    #[test]
    fn test_metric_ranges() {
        let mut ranges = MetricRanges::default();
        assert!(ranges.range("EPS").is_none());

        ranges.update_min_max("EPS", 2.0);
        assert_relative_eq!(ranges.min("EPS").unwrap(), 0.0);
        assert_relative_eq!(ranges.range("EPS").unwrap(), 2.0);

        ranges.update_min_max("EPS", -1.0);
        ranges.update_min_max("EPS", 3.0);
        ranges.update_min_max("EPS", f64::NAN);
        assert_relative_eq!(ranges.range("EPS").unwrap(), 4.0);

        ranges.update_min_max("Loss", -5.0);
        assert_relative_eq!(ranges.range("Loss").unwrap(), 5.0);

        ranges.reset();
        assert!(ranges.max("EPS").is_none());
    }

    #[test]
    fn test_comparison_title_and_keys() {
        let mut comparison = Comparison::new();
        let mut msft = Instrument::new(2, "MSFT", "Microsoft", start());
        msft.fundamental_keys = vec!["EarningsPerShareBasic".into(), "Revenue".into()];
        comparison.add(Instrument::new(1, "AAPL", "Apple Inc.", start()));
        comparison.add(msft);
        assert_eq!(comparison.title, "AAPL MSFT");
        assert_eq!(comparison.sparkline_keys().len(), 4);

        assert!(comparison.remove("AAPL").is_some());
        assert_eq!(comparison.title, "MSFT");
        assert!(comparison.remove("AAPL").is_none());
    }
}

//! Core types and constants

use chrono::{Datelike, NaiveDate};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};

/// Price type (using f64 for precision)
pub type Price = f64;

/// Quantity/volume type
pub type Quantity = f64;

/// Identifier of a listed instrument in the local store
pub type StockId = i64;

/// Identifier of a saved comparison
pub type ComparisonId = i64;

/// Oldest year accepted from a remote price record
pub const MIN_SESSION_YEAR: i32 = 1990;

/// Rolling indicator values attached to a bar
///
/// `None` means the indicator has not been computed for this bar, or there is not
/// enough history behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub bollinger_mid: Option<f64>,
    pub bollinger_std_dev: Option<f64>,
}

impl Indicators {
    /// Upper Bollinger band (mean + 2 standard deviations)
    pub fn upper_band(&self) -> Option<f64> {
        Some(self.bollinger_mid? + 2.0 * self.bollinger_std_dev?)
    }

    /// Lower Bollinger band (mean - 2 standard deviations)
    pub fn lower_band(&self) -> Option<f64> {
        Some(self.bollinger_mid? - 2.0 * self.bollinger_std_dev?)
    }
}

/// OHLCV bar for one trading session or aggregated period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub adj_close: Price,
    pub volume: Quantity,
    #[serde(default)]
    pub indicators: Indicators,
}

impl Bar {
    /// Create a new bar; adjusted close defaults to close
    pub fn new(
        date: NaiveDate,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        volume: Quantity,
    ) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            adj_close: close,
            volume,
            indicators: Indicators::default(),
        }
    }

    /// Date as a `yyyymmdd` integer, the key used by the local store
    pub fn date_int(&self) -> i64 {
        date_to_int(self.date)
    }

    /// Three-letter English month name
    pub fn month_name(&self) -> &'static str {
        month_name(self.date.month())
    }

    /// Whether the bar closed above its open
    pub fn is_up(&self) -> bool {
        self.close >= self.open
    }

    /// Price range of the bar
    pub fn range(&self) -> Price {
        self.high - self.low
    }
}

// Bars are identified by their trading session only.
impl PartialEq for Bar {
    fn eq(&self, other: &Self) -> bool {
        self.date == other.date
    }
}

impl Eq for Bar {}

/// Parse one `date,open,high,low,close,volume` line
///
/// Returns `None` for header rows, rows with the wrong number of columns, non-numeric
/// fields, or sessions dated 1990 or earlier.
pub fn parse_session(line: &str) -> Option<Bar> {
    let mut reader = session_reader(line.trim().as_bytes());
    let record = reader.records().next()?.ok()?;
    parse_record(&record)
}

/// Parse one `date,open,high,low,close,volume` record
pub fn parse_record(record: &StringRecord) -> Option<Bar> {
    if record.len() != 6 {
        return None;
    }

    let date = NaiveDate::parse_from_str(record.get(0)?, "%Y-%m-%d").ok()?;
    if date.year() <= MIN_SESSION_YEAR {
        return None;
    }

    let mut values = [0.0f64; 5];
    for (slot, field) in values.iter_mut().zip(record.iter().skip(1)) {
        *slot = field.parse::<f64>().ok()?;
        if !slot.is_finite() {
            return None;
        }
    }

    Some(Bar::new(
        date, values[0], values[1], values[2], values[3], values[4],
    ))
}

/// Headerless, trimmed reader for price records of any width
pub fn session_reader<R: std::io::Read>(input: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input)
}

/// Convert a date to a `yyyymmdd` integer
pub fn date_to_int(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}

/// Convert a `yyyymmdd` integer back to a date
pub fn int_to_date(value: i64) -> Option<NaiveDate> {
    let year = (value / 10_000) as i32;
    let month = ((value / 100) % 100) as u32;
    let day = (value % 100) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Three-letter English month name for a 1-based month
pub fn month_name(month: u32) -> &'static str {
    const NAMES: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    NAMES
        .get(month.saturating_sub(1) as usize)
        .copied()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_session() {
        let bar = parse_session("2023-06-15,179.9650,180.1200,177.4300,179.2100,64848374")
            .expect("valid record");
        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2023, 6, 15).unwrap());
        assert_relative_eq!(bar.open, 179.965);
        assert_relative_eq!(bar.close, 179.21);
        assert_relative_eq!(bar.adj_close, 179.21);
        assert_relative_eq!(bar.volume, 64848374.0);
        assert!(bar.indicators.sma50.is_none());
    }

    #[test]
    fn test_parse_session_rejects_bad_rows() {
        assert!(parse_session("date,open,high,low,close,volume").is_none());
        assert!(parse_session("2023-06-15,179.96,180.12,177.43,179.21").is_none());
        assert!(parse_session("2023-06-15,179.96,180.12,abc,179.21,100").is_none());
        assert!(parse_session("1990-06-15,1,2,0.5,1.5,100").is_none());
        assert!(parse_session("").is_none());
    }

    #[test]
    fn test_parse_session_accepts_quoted_fields() {
        let bar = parse_session("\"2023-06-15\",\"179.9650\",\"180.12\",\"177.43\",\"179.21\",\"64848374\"")
            .expect("quoted record");
        assert_eq!(bar.date, NaiveDate::from_ymd_opt(2023, 6, 15).unwrap());
        assert_relative_eq!(bar.close, 179.21);
    }

    #[test]
    fn test_bar_equality_is_by_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let a = Bar::new(date, 1.0, 2.0, 0.5, 1.5, 10.0);
        let b = Bar::new(date, 9.0, 9.0, 9.0, 9.0, 99.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_date_int_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 11, 28).unwrap();
        assert_eq!(date_to_int(date), 20241128);
        assert_eq!(int_to_date(20241128), Some(date));
        assert_eq!(int_to_date(20241332), None);
    }

    #[test]
    fn test_bands() {
        let ind = Indicators {
            bollinger_mid: Some(10.0),
            bollinger_std_dev: Some(1.5),
            ..Default::default()
        };
        assert_relative_eq!(ind.upper_band().unwrap(), 13.0);
        assert_relative_eq!(ind.lower_band().unwrap(), 7.0);
        assert!(Indicators::default().upper_band().is_none());
        assert_eq!(month_name(1), "Jan");
        assert_eq!(month_name(13), "");
    }
}

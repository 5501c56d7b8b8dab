//! Data frequency resampling
//!
//! Converts a newest-first daily series into weekly or monthly period bars. Each
//! period bar takes its open from the oldest day absorbed, its close and date from
//! the newest day, and aggregates high, low and volume.

use crate::types::Bar;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Resolution of a period series, valued in trading days per bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BarUnit {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl BarUnit {
    /// Approximate number of trading days in one bar
    pub fn days(self) -> f64 {
        match self {
            BarUnit::Daily => 1.0,
            BarUnit::Weekly => 5.0,
            BarUnit::Monthly => 19.0,
        }
    }
}

/// OHLCV aggregation helper
///
/// Bars are fed newest first, so every new bar is older than the ones before it.
#[derive(Debug)]
struct OHLCVAggregator {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    adj_close: f64,
    volume: f64,
}

impl OHLCVAggregator {
    /// Start a period from its newest day
    fn new(bar: &Bar) -> Self {
        Self {
            date: bar.date,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            adj_close: bar.adj_close,
            volume: bar.volume,
        }
    }

    /// Absorb an older day into the period
    fn add_bar(&mut self, bar: &Bar) {
        self.open = bar.open;
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.volume += bar.volume;
    }

    /// Build the aggregated bar
    fn build(self) -> Bar {
        let mut bar = Bar::new(
            self.date,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        );
        bar.adj_close = self.adj_close;
        bar
    }
}

/// Weekday with Sunday = 1 through Saturday = 7
fn weekday_from_sunday(date: NaiveDate) -> i64 {
    date.weekday().number_from_sunday() as i64
}

/// Last Friday strictly before the week containing `anchor`
fn week_boundary(anchor: NaiveDate) -> NaiveDate {
    anchor - Duration::days(1 + weekday_from_sunday(anchor))
}

/// Group a newest-first daily series into trading weeks
///
/// `start_date` anchors the first (newest) week, normally the newest session. Every
/// following week is anchored on the first day that falls on or before the previous
/// boundary.
pub fn group_by_week(daily: &[Bar], start_date: NaiveDate) -> Vec<Bar> {
    let Some(first) = daily.first() else {
        return Vec::new();
    };

    let mut weeks = Vec::with_capacity(daily.len() / 5 + 1);
    let mut boundary = week_boundary(start_date.max(first.date));
    let mut current = OHLCVAggregator::new(first);

    for bar in &daily[1..] {
        if bar.date > boundary {
            current.add_bar(bar);
        } else {
            weeks.push(current.build());
            boundary = week_boundary(bar.date);
            current = OHLCVAggregator::new(bar);
        }
    }
    weeks.push(current.build());
    weeks
}

/// Group a newest-first daily series into calendar months
pub fn group_by_month(daily: &[Bar]) -> Vec<Bar> {
    let Some(first) = daily.first() else {
        return Vec::new();
    };

    let mut months = Vec::with_capacity(daily.len() / 19 + 1);
    let mut key = (first.date.year(), first.date.month());
    let mut current = OHLCVAggregator::new(first);

    for bar in &daily[1..] {
        let bar_key = (bar.date.year(), bar.date.month());
        if bar_key == key {
            current.add_bar(bar);
        } else {
            months.push(current.build());
            key = bar_key;
            current = OHLCVAggregator::new(bar);
        }
    }
    months.push(current.build());
    months
}

/// Derive the period series for a resolution
pub fn period_series(daily: &[Bar], unit: BarUnit) -> Vec<Bar> {
    match unit {
        BarUnit::Daily => daily.to_vec(),
        BarUnit::Weekly => match daily.first() {
            Some(newest) => group_by_week(daily, newest.date),
            None => Vec::new(),
        },
        BarUnit::Monthly => group_by_month(daily),
    }
}

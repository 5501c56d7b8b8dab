//! Newest-first daily price series

use crate::types::Bar;
use chrono::NaiveDate;

/// Which side of the series a merge extended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The series was empty and now holds the incoming bars
    FirstLoad(usize),
    /// Bars newer than the previous newest were prepended
    Newer(usize),
    /// Bars older than the previous oldest were appended
    Older(usize),
    /// Nothing outside the existing date range arrived
    Unchanged,
}

/// Daily bars for one instrument, strictly decreasing by date
#[derive(Debug, Clone, Default)]
pub struct DailySeries {
    bars: Vec<Bar>,
}

impl DailySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from bars in any order
    pub fn from_bars(bars: Vec<Bar>) -> Self {
        Self {
            bars: normalize(bars),
        }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn newest(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn oldest(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn newest_date(&self) -> Option<NaiveDate> {
        self.newest().map(|b| b.date)
    }

    pub fn oldest_date(&self) -> Option<NaiveDate> {
        self.oldest().map(|b| b.date)
    }

    /// Merge fetched bars by date
    ///
    /// Bars newer than the current newest are prepended, bars older than the current
    /// oldest are appended, and a bar dated on the current newest session replaces it
    /// so settled data supersedes an intraday quote. Everything else already present
    /// is kept. Merging the same bars twice leaves the series unchanged.
    pub fn merge(&mut self, incoming: Vec<Bar>) -> MergeOutcome {
        let incoming = normalize(incoming);
        if incoming.is_empty() {
            return MergeOutcome::Unchanged;
        }

        let (Some(newest), Some(oldest)) = (self.newest_date(), self.oldest_date()) else {
            let count = incoming.len();
            self.bars = incoming;
            return MergeOutcome::FirstLoad(count);
        };

        let mut newer = Vec::new();
        let mut older = Vec::new();
        for bar in incoming {
            if bar.date > newest {
                newer.push(bar);
            } else if bar.date < oldest {
                older.push(bar);
            } else if bar.date == newest {
                self.bars[0] = bar;
            }
        }

        let prepended = newer.len();
        let appended = older.len();
        if prepended > 0 {
            newer.append(&mut self.bars);
            self.bars = newer;
        }
        self.bars.append(&mut older);

        if prepended > 0 {
            MergeOutcome::Newer(prepended)
        } else if appended > 0 {
            MergeOutcome::Older(appended)
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Apply a synthetic intraday bar: replace the newest session or prepend
    pub fn apply_intraday(&mut self, bar: Bar) {
        match self.newest_date() {
            Some(date) if date == bar.date => self.bars[0] = bar,
            Some(date) if date > bar.date => {}
            _ => self.bars.insert(0, bar),
        }
    }
}

/// Sort newest first and drop duplicate dates, keeping the first occurrence
fn normalize(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by(|a, b| b.date.cmp(&a.date));
    bars.dedup_by(|later, earlier| later.date == earlier.date);
    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn bars(newest: NaiveDate, count: i64, close: f64) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                Bar::new(
                    newest - Duration::days(i),
                    close,
                    close + 1.0,
                    close - 1.0,
                    close,
                    10.0,
                )
            })
            .collect()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_first_load() {
        let mut series = DailySeries::new();
        let outcome = series.merge(bars(date(2024, 3, 10), 5, 10.0));
        assert_eq!(outcome, MergeOutcome::FirstLoad(5));
        assert_eq!(series.newest_date(), Some(date(2024, 3, 10)));
    }

    #[test]
    fn test_newer_bars_prepend_without_duplicates() {
        let mut series = DailySeries::from_bars(bars(date(2024, 3, 10), 5, 10.0));
        let outcome = series.merge(bars(date(2024, 3, 12), 4, 11.0));
        assert_eq!(outcome, MergeOutcome::Newer(2));
        assert_eq!(series.len(), 7);
        assert_eq!(series.newest_date(), Some(date(2024, 3, 12)));
        // Overlapping newest session takes the fetched value
        assert_relative_eq!(series.bars()[2].close, 11.0);
        assert_relative_eq!(series.bars()[3].close, 10.0);
    }

    #[test]
    fn test_older_bars_append_with_dedupe() {
        let mut series = DailySeries::from_bars(bars(date(2024, 3, 10), 5, 10.0));
        let outcome = series.merge(bars(date(2024, 3, 7), 6, 9.0));
        assert_eq!(outcome, MergeOutcome::Older(4));
        assert_eq!(series.len(), 9);
        assert_eq!(series.oldest_date(), Some(date(2024, 3, 2)));
        let dates: Vec<_> = series.bars().iter().map(|b| b.date).collect();
        assert!(dates.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut series = DailySeries::from_bars(bars(date(2024, 3, 10), 5, 10.0));
        let remote = bars(date(2024, 3, 14), 9, 12.0);
        series.merge(remote.clone());
        let once: Vec<_> = series.bars().iter().map(|b| (b.date, b.close)).collect();
        assert_eq!(series.merge(remote), MergeOutcome::Unchanged);
        let twice: Vec<_> = series.bars().iter().map(|b| (b.date, b.close)).collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_intraday() {
        let mut series = DailySeries::from_bars(bars(date(2024, 3, 10), 3, 10.0));
        series.apply_intraday(Bar::new(date(2024, 3, 11), 10.0, 12.0, 9.0, 11.5, 5.0));
        assert_eq!(series.len(), 4);

        series.apply_intraday(Bar::new(date(2024, 3, 11), 10.0, 12.5, 9.0, 12.0, 6.0));
        assert_eq!(series.len(), 4);
        assert_relative_eq!(series.newest().unwrap().close, 12.0);

        // A quote older than the newest session is ignored
        series.apply_intraday(Bar::new(date(2024, 3, 9), 1.0, 1.0, 1.0, 1.0, 1.0));
        assert_eq!(series.len(), 4);
    }
}

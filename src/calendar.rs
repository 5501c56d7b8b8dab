//! Trading calendar and clock
//!
//! The calendar decides which dates have a session and when that session closes.
//! The clock abstracts "now" so acquisition timing can be driven from tests.

use crate::error::{ChartError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// NYSE full-day closures, 2023 through 2026
const NYSE_HOLIDAYS: &[(i32, u32, u32)] = &[
    (2023, 6, 19),
    (2023, 7, 4),
    (2023, 9, 4),
    (2023, 11, 23),
    (2023, 12, 25),
    (2024, 1, 1),
    (2024, 1, 15),
    (2024, 2, 19),
    (2024, 3, 29),
    (2024, 5, 27),
    (2024, 6, 19),
    (2024, 7, 4),
    (2024, 9, 2),
    (2024, 11, 28),
    (2024, 12, 25),
    (2025, 1, 1),
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

/// Trading session times
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionTimes {
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,
}

/// Trading calendar trait
pub trait TradingCalendar: Send + Sync {
    /// Get the timezone for this calendar
    fn timezone(&self) -> Tz;

    /// Check if a date is a trading day
    fn is_trading_day(&self, date: NaiveDate) -> bool;

    /// Get session times for a date
    fn session_times(&self, date: NaiveDate) -> Option<SessionTimes>;

    /// Get the next trading day after the given date
    fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate> {
        let mut current = date + Duration::days(1);
        for _ in 0..365 {
            if self.is_trading_day(current) {
                return Ok(current);
            }
            current += Duration::days(1);
        }
        Err(ChartError::Calendar(format!(
            "No trading day found within 365 days of {}",
            date
        )))
    }

    /// Close of the session on `date`, in UTC
    fn close_time(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let times = self.session_times(date)?;
        self.timezone()
            .from_local_datetime(&date.and_time(times.market_close))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Close of the first session after `date`
    fn next_close(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let next = self.next_trading_day(date).ok()?;
        self.close_time(next)
    }
}

/// NYSE trading calendar
#[derive(Debug, Clone)]
pub struct NYSECalendar {
    /// List of holiday dates
    holidays: Vec<NaiveDate>,
}

impl NYSECalendar {
    /// Create a new NYSE calendar
    pub fn new() -> Self {
        Self {
            holidays: Self::default_holidays(),
        }
    }

    fn default_holidays() -> Vec<NaiveDate> {
        NYSE_HOLIDAYS
            .iter()
            .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
            .collect()
    }

    /// Add a custom holiday
    pub fn add_holiday(&mut self, date: NaiveDate) {
        if let Err(pos) = self.holidays.binary_search(&date) {
            self.holidays.insert(pos, date);
        }
    }

    /// Check if date is a weekend
    fn is_weekend(date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

impl Default for NYSECalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingCalendar for NYSECalendar {
    fn timezone(&self) -> Tz {
        chrono_tz::America::New_York
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !Self::is_weekend(date) && self.holidays.binary_search(&date).is_err()
    }

    fn session_times(&self, date: NaiveDate) -> Option<SessionTimes> {
        if !self.is_trading_day(date) {
            return None;
        }
        Some(SessionTimes {
            market_open: NaiveTime::from_hms_opt(9, 30, 0)?,
            market_close: NaiveTime::from_hms_opt(16, 0, 0)?,
        })
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_nyse_calendar() {
        let calendar = NYSECalendar::new();

        let monday = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        assert!(calendar.is_trading_day(monday));

        let saturday = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        assert!(!calendar.is_trading_day(saturday));

        let new_years = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(!calendar.is_trading_day(new_years));

        let good_friday = NaiveDate::from_ymd_opt(2025, 4, 18).unwrap();
        assert!(!calendar.is_trading_day(good_friday));
    }

    #[test]
    fn test_next_trading_day_skips_weekend_and_holiday() {
        let calendar = NYSECalendar::new();

        let friday = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(
            calendar.next_trading_day(friday).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()
        );

        // Friday before MLK day lands on Tuesday
        let before_mlk = NaiveDate::from_ymd_opt(2024, 1, 12).unwrap();
        assert_eq!(
            calendar.next_trading_day(before_mlk).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap()
        );

        // Wednesday before Thanksgiving lands on Friday
        let wednesday = NaiveDate::from_ymd_opt(2023, 11, 22).unwrap();
        assert_eq!(
            calendar.next_trading_day(wednesday).unwrap(),
            NaiveDate::from_ymd_opt(2023, 11, 24).unwrap()
        );
    }

    #[test]
    fn test_close_time_is_new_york_four_pm() {
        let calendar = NYSECalendar::new();

        // Standard time: UTC-5
        let winter = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        assert_eq!(calendar.close_time(winter).unwrap().hour(), 21);

        // Daylight time: UTC-4
        let summer = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert_eq!(calendar.close_time(summer).unwrap().hour(), 20);

        let sunday = NaiveDate::from_ymd_opt(2024, 6, 9).unwrap();
        assert!(calendar.close_time(sunday).is_none());
        assert_eq!(calendar.next_close(sunday), calendar.close_time(summer));
    }

    #[test]
    fn test_add_holiday() {
        let mut calendar = NYSECalendar::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 12).unwrap();
        assert!(calendar.is_trading_day(day));
        calendar.add_holiday(day);
        calendar.add_holiday(day);
        assert!(!calendar.is_trading_day(day));
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());
    }
}

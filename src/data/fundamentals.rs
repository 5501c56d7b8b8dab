//! Fundamental report parsing and bar alignment
//!
//! Reports arrive as a tab-delimited table: a header row `y m d q key...` followed by
//! one row per report. Values are kept columnar, keyed by metric.

use crate::error::{ChartError, Result};
use crate::types::Bar;
use chrono::{Datelike, NaiveDate};
use csv::ReaderBuilder;
use hashbrown::HashMap;

/// Number of leading date columns (year, month, day, quarter)
const DATE_PARTS: usize = 4;

/// Fundamental reports for one instrument, newest first
#[derive(Debug, Clone, Default)]
pub struct FundamentalReports {
    dates: Vec<NaiveDate>,
    keys: Vec<String>,
    columns: HashMap<String, Vec<Option<f64>>>,
    alignments: Vec<Option<usize>>,
}

impl FundamentalReports {
    /// Build from report dates and per-key values in matching order
    ///
    /// Reports are reordered newest first if needed.
    pub fn new(
        dates: Vec<NaiveDate>,
        keys: Vec<String>,
        columns: HashMap<String, Vec<Option<f64>>>,
    ) -> Self {
        let mut order: Vec<usize> = (0..dates.len()).collect();
        order.sort_by(|&a, &b| dates[b].cmp(&dates[a]));

        let sorted_dates = order.iter().map(|&i| dates[i]).collect();
        let sorted_columns = columns
            .into_iter()
            .map(|(key, values)| {
                let sorted = order
                    .iter()
                    .map(|&i| values.get(i).copied().flatten())
                    .collect();
                (key, sorted)
            })
            .collect();

        Self {
            alignments: vec![None; dates.len()],
            dates: sorted_dates,
            keys,
            columns: sorted_columns,
        }
    }

    pub fn report_count(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Metric keys in the order the provider returned them
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn date(&self, report: usize) -> Option<NaiveDate> {
        self.dates.get(report).copied()
    }

    /// Value of `key` for a report; `None` when not a number or absent
    pub fn value(&self, report: usize, key: &str) -> Option<f64> {
        self.columns.get(key)?.get(report).copied().flatten()
    }

    pub fn alignments(&self) -> &[Option<usize>] {
        &self.alignments
    }

    /// Bar index a report was aligned to
    pub fn bar_alignment(&self, report: usize) -> Option<usize> {
        self.alignments.get(report).copied().flatten()
    }

    /// Re-align every report against a period series
    pub fn align_to(&mut self, period: &[Bar]) {
        self.alignments = align_reports(period, &self.dates);
    }
}

/// Parse the tab-delimited fundamentals table
pub fn parse_fundamental_tsv(body: &str) -> Result<FundamentalReports> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut keys: Vec<String> = Vec::new();
    let mut dates = Vec::new();
    let mut columns: HashMap<String, Vec<Option<f64>>> = HashMap::new();

    for record in reader.records() {
        let record = record.map_err(|e| ChartError::Decode(format!("Bad TSV row: {}", e)))?;
        if record.len() <= DATE_PARTS {
            continue;
        }

        if record.get(0) == Some("y") {
            keys = record.iter().skip(DATE_PARTS).map(str::to_string).collect();
            for key in &keys {
                columns.entry(key.clone()).or_default();
            }
            continue;
        }

        let date = match parse_report_date(&record) {
            Some(date) => date,
            None => {
                log::warn!("Skipping fundamentals row without a valid date: {:?}", record);
                continue;
            }
        };
        dates.push(date);

        for (index, key) in keys.iter().enumerate() {
            let value = record
                .get(DATE_PARTS + index)
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .and_then(|cell| cell.parse::<f64>().ok())
                .filter(|v| v.is_finite());
            columns.entry(key.clone()).or_default().push(value);
        }
    }

    if keys.is_empty() {
        return Err(ChartError::Decode(
            "Fundamentals table has no metric header".to_string(),
        ));
    }

    Ok(FundamentalReports::new(dates, keys, columns))
}

fn parse_report_date(record: &csv::StringRecord) -> Option<NaiveDate> {
    let year = record.get(0)?.trim().parse().ok()?;
    let month = record.get(1)?.trim().parse().ok()?;
    let day = record.get(2)?.trim().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Align newest-first report dates to a newest-first period series
///
/// A cursor walks the series towards older bars, stopping at the first bar whose
/// (year, month) is not after the report's. The report aligns to that bar when the
/// months match and is unaligned otherwise. The cursor never moves backward, so the
/// whole pass is linear in reports plus bars.
pub fn align_reports(period: &[Bar], report_dates: &[NaiveDate]) -> Vec<Option<usize>> {
    let mut cursor = 0;
    report_dates
        .iter()
        .map(|date| {
            let target = (date.year(), date.month());
            while cursor < period.len() && month_key(&period[cursor]) > target {
                cursor += 1;
            }
            (cursor < period.len() && month_key(&period[cursor]) == target).then_some(cursor)
        })
        .collect()
}

fn month_key(bar: &Bar) -> (i32, u32) {
    (bar.date.year(), bar.date.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TSV: &str = "y\tm\td\tq\tEarningsPerShareBasic\tRevenue\n\
                       2024\t3\t31\t1\t1.53\t90753\n\
                       2023\t12\t31\t4\t2.19\t\n\
                       2023\t9\t30\t3\t1.47\t89498\n";

    fn month_bar(y: i32, m: u32) -> Bar {
        let date = NaiveDate::from_ymd_opt(y, m, 28).unwrap();
        Bar::new(date, 1.0, 1.0, 1.0, 1.0, 1.0)
    }

    #[test]
    fn test_parse_tsv() {
        let reports = parse_fundamental_tsv(TSV).unwrap();
        assert_eq!(reports.report_count(), 3);
        assert_eq!(reports.keys(), &["EarningsPerShareBasic", "Revenue"]);
        assert_eq!(reports.date(0), NaiveDate::from_ymd_opt(2024, 3, 31));
        assert_relative_eq!(reports.value(0, "EarningsPerShareBasic").unwrap(), 1.53);
        assert!(reports.value(1, "Revenue").is_none());
        assert!(reports.value(0, "Unknown").is_none());
    }

    #[test]
    fn test_parse_tsv_orders_newest_first() {
        let ascending = "y\tm\td\tq\tEPS\n2023\t6\t30\t2\t1.0\n2023\t9\t30\t3\t2.0\n";
        let reports = parse_fundamental_tsv(ascending).unwrap();
        assert_eq!(reports.date(0), NaiveDate::from_ymd_opt(2023, 9, 30));
        assert_relative_eq!(reports.value(0, "EPS").unwrap(), 2.0);
    }

    #[test]
    fn test_parse_tsv_without_header_fails() {
        assert!(matches!(
            parse_fundamental_tsv("2023\t6\t30\t2\t1.0\n"),
            Err(ChartError::Decode(_))
        ));
    }

    #[test]
    fn test_align_reports() {
        let period = vec![
            month_bar(2024, 4),
            month_bar(2024, 3),
            month_bar(2024, 2),
            month_bar(2024, 1),
            month_bar(2023, 12),
        ];
        let dates = [
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            NaiveDate::from_ymd_opt(2023, 9, 30).unwrap(),
        ];
        let aligned = align_reports(&period, &dates);
        assert_eq!(aligned, vec![Some(1), Some(4), None]);
        assert_eq!(align_reports(&period, &dates), aligned);
    }

    #[test]
    fn test_align_reports_gap_in_bars() {
        // No February bar: the report for February stays unaligned
        let period = vec![month_bar(2024, 3), month_bar(2024, 1)];
        let dates = [
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        ];
        assert_eq!(align_reports(&period, &dates), vec![None, Some(1)]);
    }
}

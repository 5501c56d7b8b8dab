//! Rolling technical indicators
//!
//! Both passes walk a newest-first series from its oldest bar towards the newest,
//! carrying rolling sums so each bar costs O(1).

use crate::types::Bar;

/// Short moving average window
pub const SMA_SHORT: usize = 50;
/// Long moving average window
pub const SMA_LONG: usize = 200;
/// Bollinger band window
pub const BOLLINGER_PERIOD: usize = 20;

/// Compute the 50 and 200 period simple moving averages in place
///
/// The 200 window is carried as two sums: the 50 most recent closes, and the 150
/// closes behind them. The average at index `i` covers bars `[i, i + 199]`. Bars
/// without enough history keep `None`.
pub fn calculate_sma(series: &mut [Bar]) {
    let n = series.len();
    let tail = SMA_LONG - SMA_SHORT;
    let mut sum_short = 0.0;
    let mut sum_tail = 0.0;

    for i in (0..n).rev() {
        sum_short += series[i].close;
        if i + SMA_SHORT < n {
            let leaving = series[i + SMA_SHORT].close;
            sum_short -= leaving;
            sum_tail += leaving;
        }
        if i + SMA_SHORT + tail < n {
            sum_tail -= series[i + SMA_SHORT + tail].close;
        }

        let available = n - i;
        let indicators = &mut series[i].indicators;
        indicators.sma50 = (available >= SMA_SHORT).then(|| sum_short / SMA_SHORT as f64);
        indicators.sma200 =
            (available >= SMA_LONG).then(|| (sum_short + sum_tail) / SMA_LONG as f64);
    }
}

/// Compute the 20 period Bollinger mean and standard deviation in place
///
/// Keeps a rolling sum of closes and a rolling mean of squared closes. While the
/// window is still filling the mean of squares is reweighted by the number of bars
/// seen so far.
pub fn calculate_bollinger_bands(series: &mut [Bar]) {
    let n = series.len();
    let period = BOLLINGER_PERIOD as f64;
    let mut sum = 0.0;
    let mut mean_sq = 0.0;

    for i in (0..n).rev() {
        let close = series[i].close;
        let seen = n - i;
        sum += close;

        if seen <= BOLLINGER_PERIOD {
            let k = seen as f64;
            mean_sq = (mean_sq * (k - 1.0) + close * close) / k;
        } else {
            let leaving = series[i + BOLLINGER_PERIOD].close;
            sum -= leaving;
            mean_sq += (close * close - leaving * leaving) / period;
        }

        let indicators = &mut series[i].indicators;
        if seen >= BOLLINGER_PERIOD {
            let mean = sum / period;
            let variance = (mean_sq - mean * mean).max(0.0);
            indicators.bollinger_mid = Some(mean);
            indicators.bollinger_std_dev = Some(variance.sqrt());
        } else {
            indicators.bollinger_mid = None;
            indicators.bollinger_std_dev = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};
    use statrs::statistics::Statistics;

    fn series(closes: &[f64]) -> Vec<Bar> {
        let newest = NaiveDate::from_ymd_opt(2024, 6, 28).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar::new(newest - Duration::days(i as i64), c, c + 1.0, c - 1.0, c, 1.0))
            .collect()
    }

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 10.0 * ((i as f64) * 0.37).sin() + i as f64 * 0.05)
            .collect()
    }

    #[test]
    fn test_sma_matches_direct_mean() {
        let closes = wave(260);
        let mut bars = series(&closes);
        calculate_sma(&mut bars);

        let direct200 = closes[0..200].iter().copied().mean();
        let direct50 = closes[0..50].iter().copied().mean();
        assert_relative_eq!(bars[0].indicators.sma200.unwrap(), direct200, epsilon = 1e-9);
        assert_relative_eq!(bars[0].indicators.sma50.unwrap(), direct50, epsilon = 1e-9);

        let direct_mid = closes[30..230].iter().copied().mean();
        assert_relative_eq!(bars[30].indicators.sma200.unwrap(), direct_mid, epsilon = 1e-9);

        // Oldest 199 bars lack a full 200 window
        assert!(bars[60].indicators.sma200.is_some());
        assert!(bars[61].indicators.sma200.is_none());
        assert!(bars[210].indicators.sma50.is_some());
        assert!(bars[211].indicators.sma50.is_none());
    }

    #[test]
    fn test_sma_short_series_leaves_unset() {
        let mut bars = series(&wave(40));
        calculate_sma(&mut bars);
        assert!(bars.iter().all(|b| b.indicators.sma50.is_none()));
        assert!(bars.iter().all(|b| b.indicators.sma200.is_none()));
    }

    #[test]
    fn test_bollinger_matches_population_std_dev() {
        let closes = wave(80);
        let mut bars = series(&closes);
        calculate_bollinger_bands(&mut bars);

        for i in [0usize, 17, 60] {
            let window = &closes[i..i + BOLLINGER_PERIOD];
            let mean = window.iter().copied().mean();
            let std = window.iter().copied().population_std_dev();
            assert_relative_eq!(bars[i].indicators.bollinger_mid.unwrap(), mean, epsilon = 1e-9);
            assert_relative_eq!(
                bars[i].indicators.bollinger_std_dev.unwrap(),
                std,
                epsilon = 1e-6
            );
        }
        assert!(bars[61].indicators.bollinger_mid.is_none());
    }

    #[test]
    fn test_bollinger_flat_series_has_zero_width() {
        let mut bars = series(&[50.0; 25]);
        calculate_bollinger_bands(&mut bars);
        let ind = bars[0].indicators;
        assert_relative_eq!(ind.bollinger_std_dev.unwrap(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(ind.upper_band().unwrap(), 50.0, epsilon = 1e-6);
    }
}

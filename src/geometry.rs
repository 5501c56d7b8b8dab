//! Render-ready chart geometry
//!
//! [`compute_chart`] walks the visible window of a period series from the oldest bar
//! to the newest and emits price paths, overlays, volume and month grid lines in
//! pixel coordinates. The result is a [`ChartElements`] value; callers clone it before
//! handing it to a renderer.
//!
//! Screen coordinates grow downward, so a price `p` maps to `y_floor - y_factor * p`.

use crate::comparison::{ChartStyle, Instrument, TechnicalSet};
use crate::config::LabelPolicy;
use crate::data::fundamentals::FundamentalReports;
use crate::data::resample::BarUnit;
use crate::types::Bar;
use chrono::Datelike;
use serde::{Deserialize, Serialize};

/// Volume pane height in points, before device scaling
pub const VOLUME_HEIGHT: f64 = 40.0;

/// Height of one fundamental sparkline row
pub const SPARKLINE_ROW_HEIGHT: f64 = 100.0;

/// Candle body width as a fraction of the bar width
const CANDLE_WIDTH: f64 = 0.8;

/// Vertical scale used when the visible high equals the scaled low
const FLAT_Y_FACTOR: f64 = 50.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle; `height` may be negative to extend upward
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Vertical layout of one chart pane
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChartLayout {
    pub height: f64,
    pub sparkline_height: f64,
    pub volume_height: f64,
    /// Baseline of the volume bars
    pub volume_base: f64,
    /// Pixels available to the price range
    pub chart_base: f64,
}

impl ChartLayout {
    pub fn new(height: f64, sparkline_height: f64, scale: f64) -> Self {
        let volume_height = VOLUME_HEIGHT * scale;
        let volume_base = height - volume_height / 2.0;
        Self {
            height,
            sparkline_height,
            volume_height,
            volume_base,
            chart_base: volume_base - volume_height / 2.0 - sparkline_height,
        }
    }

    /// Sparkline pane height for a number of metric rows
    pub fn sparkline_height_for(rows: usize) -> f64 {
        SPARKLINE_ROW_HEIGHT * rows as f64
    }
}

/// Geometry snapshot for one instrument
#[derive(Debug, Clone, Default)]
pub struct ChartElements {
    pub ticker: String,
    pub style: ChartStyle,
    pub up_color: String,
    pub down_color: String,

    pub month_labels: Vec<String>,
    /// Pairs of points, one vertical line per label
    pub month_lines: Vec<Point>,

    pub up_points: Vec<Point>,
    pub down_points: Vec<Point>,
    pub filled_up_bars: Vec<Rect>,
    pub up_bars: Vec<Rect>,
    pub hollow_down_bars: Vec<Rect>,
    pub down_bars: Vec<Rect>,

    pub sma50: Vec<Point>,
    pub sma200: Vec<Point>,
    pub upper_band: Vec<Point>,
    pub middle_band: Vec<Point>,
    pub lower_band: Vec<Point>,

    pub up_volume: Vec<Rect>,
    pub down_volume: Vec<Rect>,

    /// Reports loaded for this instrument; kept across rebuilds
    pub reports: FundamentalReports,
    /// Pixel x per report, `None` when off screen
    pub report_x: Vec<Option<f64>>,
    pub newest_report_in_view: usize,
    pub oldest_report_in_view: usize,

    pub y_factor: f64,
    pub y_floor: f64,
    pub max_high: f64,
    pub min_low: f64,
    pub scaled_low: f64,
    pub max_volume: f64,
    pub last_price: f64,
    pub percent_change: f64,
}

impl ChartElements {
    pub fn new(instrument: &Instrument) -> Self {
        Self {
            ticker: instrument.ticker.clone(),
            style: instrument.style,
            up_color: instrument.up_color.clone(),
            down_color: instrument.down_color.clone(),
            max_high: 1.0,
            last_price: 1.0,
            percent_change: 1.0,
            ..Self::default()
        }
    }

    /// Pick up display settings after an instrument edit
    pub fn restyle(&mut self, instrument: &Instrument) {
        self.ticker = instrument.ticker.clone();
        self.style = instrument.style;
        self.up_color = instrument.up_color.clone();
        self.down_color = instrument.down_color.clone();
    }

    /// Drop all drawn geometry, keeping reports and axis scalars
    pub fn clear(&mut self) {
        self.month_labels.clear();
        self.month_lines.clear();
        self.up_points.clear();
        self.down_points.clear();
        self.filled_up_bars.clear();
        self.up_bars.clear();
        self.hollow_down_bars.clear();
        self.down_bars.clear();
        self.sma50.clear();
        self.sma200.clear();
        self.upper_band.clear();
        self.middle_band.clear();
        self.lower_band.clear();
        self.up_volume.clear();
        self.down_volume.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.up_points.is_empty() && self.down_points.is_empty()
    }

    /// Screen y of a price
    pub fn price_y(&self, price: f64) -> f64 {
        self.y_floor - self.y_factor * price
    }

    pub fn report_count(&self) -> usize {
        self.reports.report_count()
    }

    /// Value of a metric for a report in this snapshot
    pub fn report_value(&self, report: usize, key: &str) -> Option<f64> {
        self.reports.value(report, key)
    }
}

/// Center a stroked line on a pixel
///
/// The fractional part of `input` is replaced by `align_to` unless it already matches.
pub fn px_align(input: f64, align_to: f64) -> f64 {
    let int_part = input.trunc();
    if input - int_part != align_to {
        int_part + align_to
    } else {
        input
    }
}

/// Price and volume extremes of the visible window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VisibleRange {
    pub max_high: f64,
    /// Lowest positive low; zero when no bar has one
    pub min_low: f64,
    pub max_volume: f64,
}

impl VisibleRange {
    /// `max_high / min_low`, or `None` without a positive low
    pub fn percent_change(&self) -> Option<f64> {
        (self.min_low > 0.0).then(|| self.max_high / self.min_low)
    }
}

/// Scan bars `newest..=oldest` of a period series
pub fn visible_range(period: &[Bar], newest: usize, oldest: usize) -> VisibleRange {
    let mut range = VisibleRange::default();
    let Some(last) = period.len().checked_sub(1) else {
        return range;
    };
    if newest > oldest {
        return range;
    }
    for bar in period[newest.min(last)..=oldest.min(last)].iter().rev() {
        range.max_volume = range.max_volume.max(bar.volume);
        if bar.low > 0.0 && (range.min_low == 0.0 || bar.low < range.min_low) {
            range.min_low = bar.low;
        }
        range.max_high = range.max_high.max(bar.high);
    }
    range
}

/// Scaled low and pixels per price unit for a shared percent change
pub fn y_scale(max_high: f64, chart_percent_change: f64, chart_base: f64) -> (f64, f64) {
    let scaled_low = max_high / chart_percent_change;
    let span = max_high - scaled_low;
    let y_factor = if span != 0.0 {
        chart_base / span
    } else {
        log::debug!("Flat range at {}, using default y factor", max_high);
        FLAT_Y_FACTOR
    };
    (scaled_low, y_factor)
}

/// Everything [`compute_chart`] reads besides the snapshot itself
#[derive(Debug, Clone, Copy)]
pub struct GeometryRequest<'a> {
    pub period: &'a [Bar],
    /// Length of the underlying daily series
    pub daily_len: usize,
    pub oldest: usize,
    pub newest: usize,
    /// Pixels per period bar
    pub x_factor: f64,
    pub unit: BarUnit,
    pub style: ChartStyle,
    pub technicals: TechnicalSet,
    pub layout: &'a ChartLayout,
    pub labels: &'a LabelPolicy,
}

/// Rebuild the geometry in `elements` for the requested window
///
/// `elements.y_factor` and `elements.max_high` must already be set for the window.
/// A window scrolled past the oldest bar anchors on that bar and shifts the x origin
/// right by the missing bars.
pub fn compute_chart(elements: &mut ChartElements, request: &GeometryRequest<'_>) {
    elements.clear();
    let period = request.period;
    let mut x_raw = request.x_factor / 2.0;

    if request.oldest < 1 || period.is_empty() {
        return;
    }

    let last = period.len() - 1;
    let (oldest_valid, oldest_close) = if request.oldest <= last {
        let close = if request.oldest < last {
            period[request.oldest + 1].close
        } else {
            period[request.oldest].open
        };
        (request.oldest, close)
    } else {
        x_raw += request.x_factor * (request.oldest - last) as f64;
        (last, period[last].open)
    };

    place_reports(elements, oldest_valid, request.newest, request.x_factor, x_raw);
    build_elements(elements, request, oldest_valid, oldest_close, x_raw);
}

fn month_label(request: &GeometryRequest<'_>, bar: &Bar) -> String {
    let label = bar.month_name();
    if bar.date.month() == 1 {
        let year = format!("{:02}", bar.date.year() % 100);
        if request.period.len() < request.daily_len
            || request.x_factor < request.labels.year_only_below
        {
            year
        } else {
            format!("{}{}", label, year)
        }
    } else if request.unit == BarUnit::Monthly {
        String::new()
    } else if request.unit == BarUnit::Weekly || request.x_factor < request.labels.initial_only_below {
        label.chars().take(1).collect()
    } else {
        label.to_string()
    }
}

fn build_elements(
    elements: &mut ChartElements,
    request: &GeometryRequest<'_>,
    oldest_valid: usize,
    mut oldest_close: f64,
    mut x_raw: f64,
) {
    let period = request.period;
    let layout = request.layout;
    let xf = request.x_factor;
    let volume_factor = elements.max_volume / layout.volume_height;

    elements.y_floor = elements.y_factor * elements.max_high + layout.sparkline_height;
    let y_floor = elements.y_floor;
    let y_factor = elements.y_factor;
    let y = |price: f64| y_floor - y_factor * price;

    let mut last_month = period[oldest_valid].date.month();

    for index in (request.newest..=oldest_valid).rev() {
        let bar = &period[index];
        let center = px_align(x_raw, 0.5);

        if bar.date.month() != last_month {
            let label = month_label(request, bar);
            if !label.is_empty() {
                elements.month_labels.push(label);
                elements.month_lines.push(Point::new(center - 2.0, layout.sparkline_height));
                elements.month_lines.push(Point::new(center - 2.0, layout.volume_base));
            }
        }
        last_month = bar.date.month();

        match request.style {
            ChartStyle::Ohlc | ChartStyle::Hlc => {
                let points = if oldest_close > bar.close {
                    &mut elements.down_points
                } else {
                    &mut elements.up_points
                };
                if request.style == ChartStyle::Ohlc {
                    points.push(Point::new(center - xf / 2.0, y(bar.open)));
                    points.push(Point::new(center, y(bar.open)));
                }
                points.extend([
                    Point::new(center, y(bar.high)),
                    Point::new(center, y(bar.low)),
                    Point::new(center, y(bar.close)),
                    Point::new(center + xf / 2.0, y(bar.close)),
                ]);
            }
            ChartStyle::Candle => {
                let mut body = y_factor * (bar.open - bar.close);
                if body.abs() < 1.0 {
                    body = if body > 0.0 { 1.0 } else { -1.0 };
                }
                let rect = Rect::new(
                    center - xf * CANDLE_WIDTH / 2.0,
                    y(bar.open),
                    CANDLE_WIDTH * xf,
                    body,
                );

                if bar.open >= bar.close {
                    let wick = [Point::new(center, y(bar.high)), Point::new(center, y(bar.low))];
                    if oldest_close < bar.close {
                        elements.filled_up_bars.push(rect);
                        elements.up_points.extend(wick);
                    } else {
                        elements.down_bars.push(rect);
                        elements.down_points.extend(wick);
                    }
                } else {
                    // Hollow bodies draw their wicks in two pieces around the body
                    let wick = [
                        Point::new(center, y(bar.high)),
                        Point::new(center, y(bar.close)),
                        Point::new(center, y(bar.open)),
                        Point::new(center, y(bar.low)),
                    ];
                    if oldest_close > bar.close {
                        elements.hollow_down_bars.push(rect);
                        elements.down_points.extend(wick);
                    } else {
                        elements.up_bars.push(rect);
                        elements.up_points.extend(wick);
                    }
                }
            }
            ChartStyle::Close => {
                elements.up_points.push(Point::new(center, y(bar.close)));
            }
        }

        let ind = &bar.indicators;
        if request.technicals.sma50 {
            if let Some(sma) = ind.sma50.filter(|v| *v > 0.0) {
                elements.sma50.push(Point::new(center, y(sma)));
            }
        }
        if request.technicals.sma200 {
            if let Some(sma) = ind.sma200.filter(|v| *v > 0.0) {
                elements.sma200.push(Point::new(center, y(sma)));
            }
        }
        if request.technicals.bollinger {
            if let (Some(mid), Some(upper), Some(lower)) =
                (ind.bollinger_mid.filter(|v| *v > 0.0), ind.upper_band(), ind.lower_band())
            {
                elements.upper_band.push(Point::new(center, y(upper)));
                elements.middle_band.push(Point::new(center, y(mid)));
                elements.lower_band.push(Point::new(center, y(lower)));
            }
        }

        if bar.volume > 0.0 && volume_factor > 0.0 {
            let rect = Rect::new(
                center - xf / 2.0,
                layout.volume_base,
                xf,
                -bar.volume / volume_factor,
            );
            if oldest_close > bar.close {
                elements.down_volume.push(rect);
            } else {
                elements.up_volume.push(rect);
            }
        }

        oldest_close = bar.close;
        x_raw += xf;
    }
}

/// Position each report in view over its aligned bar
///
/// One report beyond each edge of the window is kept so sparklines run off screen
/// instead of stopping short.
fn place_reports(
    elements: &mut ChartElements,
    oldest_valid: usize,
    newest: usize,
    x_factor: f64,
    x_raw: f64,
) {
    let count = elements.reports.report_count();
    elements.report_x = vec![None; count];
    if count == 0 {
        elements.newest_report_in_view = 0;
        elements.oldest_report_in_view = 0;
        return;
    }

    let mut oldest_report = count - 1;
    let mut newest_report = 0;
    for report in 0..count {
        let alignment = elements.reports.bar_alignment(report);
        match alignment {
            None if newest_report > 0 => {
                log::debug!("{} ran out of bars after report {}", elements.ticker, newest_report)
            }
            Some(bar) if bar > 0 && bar <= newest => newest_report = report,
            _ => {}
        }
        if alignment.map_or(true, |bar| bar > oldest_valid) {
            oldest_report = report;
            break;
        }
    }
    if oldest_report == newest_report {
        if newest_report > 0 {
            newest_report -= 1;
        } else {
            oldest_report += 1;
        }
    }

    elements.newest_report_in_view = newest_report;
    let mut report = newest_report;
    while report <= oldest_report {
        let Some(bar) = elements.reports.bar_alignment(report) else {
            break;
        };
        let x = (oldest_valid as f64 - bar as f64 + 1.0) * x_factor + x_raw;
        elements.report_x[report] = Some(x);
        report += 1;
    }
    elements.oldest_report_in_view = report;
}

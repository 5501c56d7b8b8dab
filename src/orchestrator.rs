//! Comparison orchestrator
//!
//! Owns the workers of the active comparison and fans pan, zoom and resize requests
//! out to all of them concurrently. It keeps the shared percent change so every
//! instrument is drawn on the same vertical scale, and publishes a [`Frame`] only
//! once every worker is ready.
//!
//! Worker progress arrives as [`WorkerEvent`]s on a channel the caller drains with
//! [`Orchestrator::process_next_event`] or [`Orchestrator::pump_events`]. Events from a
//! previous comparison carry an older generation and are dropped.

use crate::acquisition::DataServices;
use crate::comparison::{Comparison, Instrument, MetricRanges};
use crate::config::{ChartConfig, LabelPolicy};
use crate::data::resample::BarUnit;
use crate::error::{ChartError, Result};
use crate::geometry::{ChartElements, ChartLayout};
use crate::worker::{
    BarLookup, Readiness, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerSettings,
};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Narrowest bar width before monthly bars stop shrinking
pub const MIN_X_FACTOR: f64 = 0.25;
/// Widest bar width
pub const MAX_X_FACTOR: f64 = 50.0;

/// Immutable render input for one publish
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Increments on every publish
    pub sequence: u64,
    pub generation: u64,
    pub charts: Vec<ChartElements>,
    pub metric_ranges: MetricRanges,
    pub sparkline_keys: Vec<String>,
}

/// Progress indicator updates
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    RequestStarted { ticker: String },
    RequestCanceled { ticker: String },
    RequestFailed { ticker: String, error: ChartError },
}

async fn fan_out<'a, T, Fut>(
    workers: &'a [WorkerHandle],
    op: impl FnMut(&'a WorkerHandle) -> Fut,
) -> Result<Vec<T>>
where
    Fut: Future<Output = Result<T>> + 'a,
{
    join_all(workers.iter().map(op)).await.into_iter().collect()
}

/// Multi-instrument chart controller
pub struct Orchestrator {
    services: DataServices,
    labels: LabelPolicy,
    comparison: Option<Comparison>,
    workers: Vec<WorkerHandle>,
    generation: u64,

    unit: BarUnit,
    /// Pixels per period bar before the unit is applied
    x_factor: f64,
    contents_scale: f64,
    axis_width: f64,
    axis_count: usize,
    px_width: f64,
    px_height: f64,
    sparkline_height: f64,
    chart_percent_change: f64,

    sequence: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    frames: watch::Sender<Arc<Frame>>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: Option<mpsc::UnboundedReceiver<Notice>>,
}

impl Orchestrator {
    pub fn new(services: DataServices, config: &ChartConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (frames, _) = watch::channel(Arc::new(Frame::default()));
        Self {
            services,
            labels: config.labels,
            comparison: None,
            workers: Vec::new(),
            generation: 0,
            unit: BarUnit::Daily,
            x_factor: config.chart.x_factor,
            contents_scale: config.chart.contents_scale,
            axis_width: config.chart.axis_width,
            axis_count: 1,
            px_width: config.chart.px_width,
            px_height: config.chart.px_height,
            sparkline_height: 0.0,
            chart_percent_change: 1.0,
            sequence: 0,
            events_tx,
            events_rx,
            frames,
            notices_tx,
            notices_rx: Some(notices_rx),
        }
    }

    /// Receiver for published frames
    pub fn subscribe(&self) -> watch::Receiver<Arc<Frame>> {
        self.frames.subscribe()
    }

    pub fn latest_frame(&self) -> Arc<Frame> {
        self.frames.borrow().clone()
    }

    /// Progress notices; available once
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notices_rx.take()
    }

    pub fn comparison(&self) -> Option<&Comparison> {
        self.comparison.as_ref()
    }

    pub fn unit(&self) -> BarUnit {
        self.unit
    }

    pub fn x_factor(&self) -> f64 {
        self.x_factor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn chart_percent_change(&self) -> f64 {
        self.chart_percent_change
    }

    /// Worker for a ticker in the active comparison
    pub fn worker(&self, ticker: &str) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.ticker() == ticker)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Horizontal space taken by the price axes
    pub fn axis_padding(&self) -> f64 {
        self.axis_width * self.contents_scale * self.axis_count as f64
    }

    /// Bars that fit across the viewport at the current scale
    pub fn max_bar_offset(&self) -> i64 {
        let bars = ((self.px_width - self.axis_padding()) / (self.x_factor * self.unit.days())).floor();
        (bars as i64).max(0)
    }

    fn layout(&self) -> ChartLayout {
        ChartLayout::new(self.px_height, self.sparkline_height, self.contents_scale)
    }

    fn spawn_worker(&self, instrument: Instrument, oldest: i64) -> WorkerHandle {
        let settings = WorkerSettings {
            unit: self.unit,
            x_factor: self.x_factor,
            oldest,
            layout: self.layout(),
            labels: self.labels,
        };
        WorkerHandle::spawn(
            instrument,
            self.services.clone(),
            settings,
            self.generation,
            self.events_tx.clone(),
        )
    }

    fn refresh_sparkline_height(&mut self) {
        let rows = self
            .comparison
            .as_ref()
            .map_or(0, |c| c.sparkline_keys().len());
        self.sparkline_height = ChartLayout::sparkline_height_for(rows);
    }

    async fn apply_layout(&self) -> Result<()> {
        let layout = self.layout();
        fan_out(&self.workers, |w| w.set_layout(layout)).await?;
        Ok(())
    }

    /// Switch to another comparison, or sync the workers of the current one
    ///
    /// A different identity discards every worker, aborting their requests, and starts
    /// a new generation. The same identity keeps workers for unchanged tickers.
    pub async fn update_comparison(&mut self, comparison: Comparison) -> Result<()> {
        self.axis_count = comparison.instruments.len().max(1);
        let same_identity = matches!(
            &self.comparison,
            Some(current) if current.id.is_some() && current.same_identity(&comparison)
        );

        if same_identity {
            let removed: Vec<usize> = self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| !comparison.instruments.iter().any(|i| i.ticker == w.ticker()))
                .map(|(index, _)| index)
                .collect();
            for index in removed.into_iter().rev() {
                self.workers.remove(index).shutdown();
            }
            let oldest = self.max_bar_offset();
            for instrument in &comparison.instruments {
                match self.worker(&instrument.ticker) {
                    Some(worker) => worker.update_instrument(instrument.clone()).await?,
                    None => {
                        let worker = self.spawn_worker(instrument.clone(), oldest);
                        self.workers.push(worker);
                    }
                }
            }
        } else {
            log::info!(
                "Switching to comparison {:?} ({})",
                comparison.id,
                comparison.title
            );
            self.generation += 1;
            for worker in self.workers.drain(..) {
                worker.shutdown();
            }
            self.chart_percent_change = 1.0;
            let oldest = self.max_bar_offset();
            for instrument in &comparison.instruments {
                let worker = self.spawn_worker(instrument.clone(), oldest);
                self.workers.push(worker);
            }
        }

        self.comparison = Some(comparison);
        self.refresh_sparkline_height();
        self.apply_layout().await?;
        fan_out(&self.workers, |w| w.fetch_price_and_fundamentals()).await?;
        Ok(())
    }

    /// Add an instrument to the current comparison and persist it
    ///
    /// Returns false when the ticker is already charted.
    pub async fn add_to_comparison(&mut self, instrument: Instrument) -> Result<bool> {
        let mut comparison = self.comparison.clone().unwrap_or_default();
        if comparison
            .instruments
            .iter()
            .any(|i| i.ticker == instrument.ticker)
        {
            log::info!("{} is already in this comparison", instrument.ticker);
            self.notice(Notice::RequestCanceled {
                ticker: instrument.ticker,
            });
            return Ok(false);
        }

        let mut current_oldest = self.max_bar_offset();
        if !comparison.is_empty() {
            let (_, limit_oldest) = self.limit_comparison_period().await?;
            current_oldest = limit_oldest as i64;
        }

        comparison.add(instrument);
        let saved = self.services.store.save_comparison(&comparison).await?;
        let Some(added) = saved.instruments.last().cloned() else {
            return Ok(false);
        };
        if self.comparison.is_none() {
            self.generation += 1;
        }
        self.comparison = Some(saved);

        // An extra axis narrows the viewport
        self.axis_count = self.workers.len() + 1;
        current_oldest = current_oldest.min(self.max_bar_offset());
        fan_out(&self.workers, |w| w.set_oldest(current_oldest)).await?;

        self.refresh_sparkline_height();
        self.apply_layout().await?;
        let worker = self.spawn_worker(added, current_oldest);
        worker.fetch_price_and_fundamentals().await?;
        self.workers.push(worker);
        Ok(true)
    }

    /// Remove an instrument from the current comparison and persist it
    pub async fn remove_from_comparison(&mut self, ticker: &str) -> Result<Option<Instrument>> {
        let Some(mut comparison) = self.comparison.clone() else {
            return Ok(None);
        };
        if comparison.instruments.len() == 1 {
            log::warn!("Removing the last instrument deletes comparison {:?}", comparison.id);
        }
        let Some(removed) = comparison.remove(ticker) else {
            return Ok(None);
        };
        if let Some(index) = self.workers.iter().position(|w| w.ticker() == ticker) {
            self.workers.remove(index).shutdown();
        }

        let saved = self.services.store.save_comparison(&comparison).await?;
        self.axis_count = saved.instruments.len().max(1);
        self.comparison = Some(saved);
        self.refresh_sparkline_height();
        self.apply_layout().await?;
        // The removed instrument may have set the scale
        self.update_max_percent_change(0).await?;
        Ok(Some(removed))
    }

    /// Apply a style, indicator or metric edit to one instrument and redraw
    pub async fn update_instrument(&mut self, instrument: Instrument) -> Result<()> {
        let Some(mut comparison) = self.comparison.clone() else {
            return Ok(());
        };
        let Some(slot) = comparison
            .instruments
            .iter_mut()
            .find(|i| i.ticker == instrument.ticker)
        else {
            return Ok(());
        };
        *slot = instrument.clone();
        let saved = self.services.store.save_comparison(&comparison).await?;
        self.comparison = Some(saved);

        if let Some(worker) = self.worker(&instrument.ticker) {
            worker.update_instrument(instrument).await?;
        }
        self.chart_options_changed().await
    }

    /// Redraw every chart without loading data
    pub async fn chart_options_changed(&mut self) -> Result<()> {
        if self.comparison.is_none() {
            return Ok(());
        }
        self.refresh_sparkline_height();
        self.apply_layout().await?;
        let percent_change = self.chart_percent_change;
        fan_out(&self.workers, |w| w.recompute(percent_change, true)).await?;
        self.publish().await
    }

    /// Clamp every worker to the shortest loaded history
    ///
    /// Returns the smallest period count and the smallest oldest shown bar, both at the
    /// current unit. Workers without data yet are left alone.
    pub async fn limit_comparison_period(&self) -> Result<(usize, usize)> {
        let unit = self.unit;
        let supported = fan_out(&self.workers, |w| w.max_period_supported(unit)).await?;
        let loaded = || supported.iter().filter(|(count, _)| *count > 0);
        let period_limit = loaded().map(|(count, _)| *count).min().unwrap_or(0);
        let limit_oldest = loaded().map(|(_, oldest)| *oldest).min().unwrap_or(0);

        let clamp = limit_oldest.min(period_limit) as i64;
        let over_limit = self
            .workers
            .iter()
            .zip(&supported)
            .filter(|(_, (count, oldest))| *count > 0 && *oldest > period_limit)
            .map(|(worker, _)| worker.set_oldest(clamp));
        join_all(over_limit)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok((period_limit, limit_oldest))
    }

    /// Pan every worker, then rescale all of them to the widest percent change
    pub async fn update_max_percent_change(&mut self, bars_shifted: i64) -> Result<()> {
        let (period_limit, current_oldest) = self.limit_comparison_period().await?;
        if bars_shifted >= 0 && current_oldest as i64 + bars_shifted > period_limit as i64 {
            return self.publish().await;
        }

        let width = self.max_bar_offset();
        let percent_changes =
            fan_out(&self.workers, |w| w.shift_by_bars(bars_shifted, width)).await?;
        let shared = percent_changes.into_iter().fold(1.0_f64, f64::max);
        self.chart_percent_change = shared;
        fan_out(&self.workers, |w| w.recompute(shared, false)).await?;
        self.publish().await
    }

    /// Finish a pinch by rescaling bars, switching resolution as the width crosses
    /// the weekly and monthly thresholds
    ///
    /// `px_shift` is the horizontal offset the temporary transform left behind.
    pub async fn scale_chart(&mut self, new_scale: f64, px_shift: f64) -> Result<()> {
        let mut x_factor = self.x_factor * new_scale;
        let mut unit = self.unit;

        if x_factor < 1.0 {
            unit = BarUnit::Monthly;
            x_factor = x_factor.max(MIN_X_FACTOR);
        } else if x_factor < 3.0 {
            unit = BarUnit::Weekly;
        } else if unit == BarUnit::Monthly && x_factor * unit.days() > 20.0 {
            unit = BarUnit::Weekly;
        } else if unit == BarUnit::Weekly && x_factor * unit.days() > 10.0 {
            unit = BarUnit::Daily;
        } else if x_factor > MAX_X_FACTOR {
            x_factor = MAX_X_FACTOR;
        }

        if x_factor == self.x_factor {
            return Ok(());
        }
        log::debug!("Scaling to {:?} at {} px per bar", unit, x_factor);

        let supported = fan_out(&self.workers, |w| w.max_period_supported(unit)).await?;
        let max_periods = supported
            .iter()
            .map(|(count, _)| *count)
            .filter(|count| *count > 0)
            .min()
            .unwrap_or(usize::MAX);
        fan_out(&self.workers, |w| w.update_period_data(unit, x_factor, max_periods)).await?;
        self.unit = unit;
        self.x_factor = x_factor;

        let mut shift_bars = (px_shift / (unit.days() * x_factor)).floor() as i64;
        let (period_limit, current_oldest) = self.limit_comparison_period().await?;
        if current_oldest as i64 + shift_bars > period_limit as i64 {
            shift_bars = 0;
        }
        self.update_max_percent_change(shift_bars).await
    }

    /// Adopt a new viewport size
    pub async fn resize(&mut self, px_width: f64, px_height: f64) -> Result<()> {
        self.px_width = px_width;
        self.px_height = px_height;
        if self.workers.is_empty() {
            return Ok(());
        }
        let layout = self.layout();
        let width = self.max_bar_offset();
        fan_out(&self.workers, |w| async move {
            w.set_layout(layout).await?;
            let window = w.window().await?;
            w.set_newest(window.oldest - width).await
        })
        .await?;
        self.update_max_percent_change(0).await
    }

    /// Bar under a long press, `bar_offset` bars right of the oldest shown
    ///
    /// The first instrument whose bar spans `center_y` wins.
    pub async fn matched_bar_at(&self, bar_offset: i64, center_y: f64) -> Result<Option<BarLookup>> {
        let lookups = fan_out(&self.workers, |w| w.bar_at_offset(bar_offset)).await?;
        Ok(lookups
            .into_iter()
            .flatten()
            .find(|l| center_y >= l.y_high && center_y <= l.y_low))
    }

    /// Wait for one worker event and react to it
    pub async fn process_next_event(&mut self) -> Result<Option<WorkerEvent>> {
        let Some(event) = self.events_rx.recv().await else {
            return Ok(None);
        };
        self.handle_event(&event).await?;
        Ok(Some(event))
    }

    /// React to every queued worker event without waiting; returns how many were handled
    pub async fn pump_events(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(&event).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Process events until every worker of the current comparison is ready
    ///
    /// Events already queued when the last worker turns ready are handled too, so the
    /// frame for the finished cycle has been published on return.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        while !self.all_ready().await? {
            if self.process_next_event().await?.is_none() {
                return Ok(());
            }
        }
        self.pump_events().await?;
        Ok(())
    }

    fn notice(&self, notice: Notice) {
        let _ = self.notices_tx.send(notice);
    }

    async fn handle_event(&mut self, event: &WorkerEvent) -> Result<()> {
        if event.generation != self.generation {
            log::debug!(
                "Dropping {} event from generation {}",
                event.ticker,
                event.generation
            );
            return Ok(());
        }
        if self.worker(&event.ticker).is_none() {
            return Ok(());
        }

        let ticker = event.ticker.clone();
        match &event.kind {
            WorkerEventKind::RequestStarted => self.notice(Notice::RequestStarted { ticker }),
            WorkerEventKind::RequestCanceled => self.notice(Notice::RequestCanceled { ticker }),
            WorkerEventKind::RequestFailed(error) => {
                self.notice(Notice::RequestFailed {
                    ticker,
                    error: error.clone(),
                });
                self.request_finished(None).await?;
            }
            WorkerEventKind::RequestFinished { percent_change } => {
                self.request_finished(Some(*percent_change)).await?
            }
        }
        Ok(())
    }

    async fn all_ready(&self) -> Result<bool> {
        let readiness = fan_out(&self.workers, |w| w.readiness()).await?;
        Ok(readiness.iter().all(|r| *r == Readiness::Ready))
    }

    async fn request_finished(&mut self, percent_change: Option<f64>) -> Result<()> {
        if let Some(percent_change) = percent_change {
            if percent_change > self.chart_percent_change {
                self.chart_percent_change = percent_change;
            }
        }
        if !self.all_ready().await? {
            return Ok(());
        }
        self.limit_comparison_period().await?;
        let shared = self.chart_percent_change;
        fan_out(&self.workers, |w| w.recompute(shared, false)).await?;
        self.publish().await
    }

    /// Publish a frame if every worker has a snapshot
    async fn publish(&mut self) -> Result<()> {
        let snapshots = fan_out(&self.workers, |w| w.snapshot()).await?;
        let Some(charts) = snapshots.into_iter().collect::<Option<Vec<_>>>() else {
            log::debug!("Publish withheld until every worker is ready");
            return Ok(());
        };

        let sparkline_keys = self
            .comparison
            .as_ref()
            .map(|c| c.sparkline_keys())
            .unwrap_or_default();
        let mut metric_ranges = MetricRanges::default();
        for chart in &charts {
            for report in chart.newest_report_in_view..chart.oldest_report_in_view {
                for key in &sparkline_keys {
                    if let Some(value) = chart.report_value(report, key) {
                        metric_ranges.update_min_max(key, value);
                    }
                }
            }
        }
        if let Some(comparison) = self.comparison.as_mut() {
            comparison.metric_ranges = metric_ranges.clone();
        }

        self.sequence += 1;
        self.frames.send_replace(Arc::new(Frame {
            sequence: self.sequence,
            generation: self.generation,
            charts,
            metric_ranges,
            sparkline_keys,
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sources::MemorySource;
    use crate::store::MemoryStore;
    use approx::assert_relative_eq;

    fn orchestrator(px_width: f64) -> Orchestrator {
        let services = DataServices::new(Arc::new(MemorySource::new()), Arc::new(MemoryStore::new()));
        let mut config = ChartConfig::default();
        config.chart.px_width = px_width;
        config.chart.contents_scale = 1.0;
        Orchestrator::new(services, &config)
    }

    #[test]
    fn test_max_bar_offset() {
        let mut o = orchestrator(810.0);
        assert_eq!(o.max_bar_offset(), 104);
        o.axis_count = 2;
        assert_relative_eq!(o.axis_padding(), 60.0);
        assert_eq!(o.max_bar_offset(), 100);
        o.unit = BarUnit::Weekly;
        assert_eq!(o.max_bar_offset(), 20);
        o.px_width = 10.0;
        assert_eq!(o.max_bar_offset(), 0);
    }

    #[tokio::test]
    async fn test_scale_chart_switches_units() {
        let mut o = orchestrator(810.0);
        let initial = o.x_factor();

        o.scale_chart(0.4, 0.0).await.unwrap();
        assert_eq!(o.unit(), BarUnit::Daily);
        assert_relative_eq!(o.x_factor(), 0.4 * initial);

        o.scale_chart(0.4, 0.0).await.unwrap();
        assert_eq!(o.unit(), BarUnit::Weekly);
        assert_relative_eq!(o.x_factor(), 0.4 * 0.4 * initial);

        o.scale_chart(0.4, 0.0).await.unwrap();
        assert_eq!(o.unit(), BarUnit::Monthly);
        assert_relative_eq!(o.x_factor(), 0.4 * 0.4 * 0.4 * initial);

        // Floor for monthly bars
        o.scale_chart(0.1, 0.0).await.unwrap();
        assert_relative_eq!(o.x_factor(), MIN_X_FACTOR);

        o.scale_chart(100.0, 0.0).await.unwrap();
        assert_eq!(o.unit(), BarUnit::Weekly);
        o.scale_chart(2.0, 0.0).await.unwrap();
        assert_eq!(o.unit(), BarUnit::Daily);

        o.scale_chart(10.0, 0.0).await.unwrap();
        assert_relative_eq!(o.x_factor(), MAX_X_FACTOR);
    }

    #[tokio::test]
    async fn test_empty_orchestrator_publishes_empty_frame() {
        let mut o = orchestrator(810.0);
        let frames = o.subscribe();
        o.update_max_percent_change(0).await.unwrap();
        let frame = frames.borrow().clone();
        assert_eq!(frame.sequence, 1);
        assert!(frame.charts.is_empty());
        assert!(o.matched_bar_at(0, 10.0).await.unwrap().is_none());
        assert!(o.remove_from_comparison("AAPL").await.unwrap().is_none());
    }
}

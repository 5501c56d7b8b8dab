//! Instrument worker actor
//!
//! Each instrument in a comparison is owned by one worker task. The task holds the
//! daily and period series, the visible window and the latest geometry, and runs
//! commands one at a time from its channel. Fetches run on tasks spawned by the
//! [`AcquisitionService`] and report back through a second channel the worker selects
//! on, so a slow network never delays a pan or zoom.
//!
//! Callers talk to the worker through a [`WorkerHandle`]. Requests that return a value
//! carry a oneshot reply channel; progress the orchestrator needs to react to is sent
//! as a [`WorkerEvent`] tagged with the comparison generation.

use crate::acquisition::{
    AcquisitionEvent, AcquisitionService, DataServices, EventSender, FetchStatus,
};
use crate::comparison::Instrument;
use crate::config::LabelPolicy;
use crate::data::fundamentals::FundamentalReports;
use crate::data::indicators::{calculate_bollinger_bands, calculate_sma};
use crate::data::resample::{period_series, BarUnit};
use crate::data::series::DailySeries;
use crate::error::{ChartError, Result};
use crate::geometry::{
    compute_chart, visible_range, y_scale, ChartElements, ChartLayout, GeometryRequest,
};
use crate::types::Bar;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Bars shown when a window is reset
pub const DEFAULT_WINDOW_BARS: i64 = 50;

/// Shared scale movement that forces a geometry rebuild
pub const RESCALE_THRESHOLD: f64 = 0.02;

const COMMAND_BUFFER: usize = 64;
const ACQUISITION_BUFFER: usize = 16;

/// Whether a worker's snapshot may be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The first acquisition cycle has not finished
    NotReady,
    /// Geometry is being rebuilt
    Computing,
    Ready,
}

/// Progress reported to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    RequestStarted,
    RequestCanceled,
    RequestFailed(ChartError),
    RequestFinished { percent_change: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    /// Comparison generation the worker was created for
    pub generation: u64,
    pub ticker: String,
    pub kind: WorkerEventKind,
}

/// Visible window, as bar offsets from the newest period bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub oldest: i64,
    pub newest: i64,
}

/// Bar under a long press
#[derive(Debug, Clone)]
pub struct BarLookup {
    pub ticker: String,
    pub bar: Bar,
    pub month_name: &'static str,
    /// Closed at or above the prior bar's close
    pub up_close: bool,
    pub y_high: f64,
    pub y_low: f64,
}

/// Initial scale and layout for a new worker
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub unit: BarUnit,
    /// Pixels per trading day
    pub x_factor: f64,
    pub oldest: i64,
    pub layout: ChartLayout,
    pub labels: LabelPolicy,
}

enum Command {
    Fetch,
    ShiftByBars {
        delta: i64,
        width: i64,
        reply: oneshot::Sender<f64>,
    },
    Recompute {
        shared_percent_change: f64,
        force: bool,
        reply: oneshot::Sender<()>,
    },
    MaxPeriodSupported {
        unit: BarUnit,
        reply: oneshot::Sender<(usize, usize)>,
    },
    UpdatePeriodData {
        unit: BarUnit,
        x_factor: f64,
        max_periods: usize,
        reply: oneshot::Sender<()>,
    },
    SetOldest(i64, oneshot::Sender<()>),
    SetNewest(i64, oneshot::Sender<()>),
    FitWidth(i64, oneshot::Sender<()>),
    SetLayout(ChartLayout, oneshot::Sender<()>),
    UpdateInstrument(Box<Instrument>, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<Option<ChartElements>>),
    Readiness(oneshot::Sender<Readiness>),
    Window(oneshot::Sender<Window>),
    BarAt(usize, oneshot::Sender<Option<BarLookup>>),
    BarAtOffset(i64, oneshot::Sender<Option<BarLookup>>),
    Shutdown,
}

/// Handle to a running instrument worker
///
/// Dropping the handle stops the worker and aborts its outstanding requests.
pub struct WorkerHandle {
    ticker: String,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Start a worker task for one instrument
    pub fn spawn(
        instrument: Instrument,
        services: DataServices,
        settings: WorkerSettings,
        generation: u64,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (acquisition_tx, acquisition_rx) = mpsc::channel(ACQUISITION_BUFFER);
        let ticker = instrument.ticker.clone();
        let worker = InstrumentWorker::new(
            instrument,
            services,
            settings,
            generation,
            events,
            acquisition_tx,
        );
        let task = tokio::spawn(worker.run(command_rx, acquisition_rx));
        Self {
            ticker,
            commands: command_tx,
            task,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    fn closed(&self) -> ChartError {
        ChartError::WorkerClosed(self.ticker.clone())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| self.closed())
    }

    /// Start loading prices, and fundamentals when the instrument has metric keys
    pub async fn fetch_price_and_fundamentals(&self) -> Result<()> {
        self.send(Command::Fetch).await
    }

    /// Move the window by `delta` bars and return the new visible percent change
    pub async fn shift_by_bars(&self, delta: i64, width: i64) -> Result<f64> {
        self.request(|reply| Command::ShiftByBars {
            delta,
            width,
            reply,
        })
        .await
    }

    /// Apply the comparison's shared percent change
    pub async fn recompute(&self, shared_percent_change: f64, force: bool) -> Result<()> {
        self.request(|reply| Command::Recompute {
            shared_percent_change,
            force,
            reply,
        })
        .await
    }

    /// Bars available at `unit` and the oldest shown bar rescaled to it
    pub async fn max_period_supported(&self, unit: BarUnit) -> Result<(usize, usize)> {
        self.request(|reply| Command::MaxPeriodSupported { unit, reply })
            .await
    }

    /// Switch resolution and bar width, clamping the window to `max_periods`
    pub async fn update_period_data(
        &self,
        unit: BarUnit,
        x_factor: f64,
        max_periods: usize,
    ) -> Result<()> {
        self.request(|reply| Command::UpdatePeriodData {
            unit,
            x_factor,
            max_periods,
            reply,
        })
        .await
    }

    /// Move the oldest shown bar and rebuild geometry for the new window
    pub async fn set_oldest(&self, oldest: i64) -> Result<()> {
        self.request(|reply| Command::SetOldest(oldest, reply)).await
    }

    pub async fn set_newest(&self, newest: i64) -> Result<()> {
        self.request(|reply| Command::SetNewest(newest, reply)).await
    }

    /// Set the newest shown bar so the window spans `width` bars
    pub async fn fit_width(&self, width: i64) -> Result<()> {
        self.request(|reply| Command::FitWidth(width, reply)).await
    }

    pub async fn set_layout(&self, layout: ChartLayout) -> Result<()> {
        self.request(|reply| Command::SetLayout(layout, reply)).await
    }

    pub async fn update_instrument(&self, instrument: Instrument) -> Result<()> {
        self.request(|reply| Command::UpdateInstrument(Box::new(instrument), reply))
            .await
    }

    /// Copy of the current geometry, or `None` unless the worker is ready
    pub async fn snapshot(&self) -> Result<Option<ChartElements>> {
        self.request(Command::Snapshot).await
    }

    pub async fn readiness(&self) -> Result<Readiness> {
        self.request(Command::Readiness).await
    }

    pub async fn window(&self) -> Result<Window> {
        self.request(Command::Window).await
    }

    pub async fn bar_at(&self, index: usize) -> Result<Option<BarLookup>> {
        self.request(|reply| Command::BarAt(index, reply)).await
    }

    /// Bar `offset` bars newer than the oldest shown
    pub async fn bar_at_offset(&self, offset: i64) -> Result<Option<BarLookup>> {
        self.request(|reply| Command::BarAtOffset(offset, reply)).await
    }

    /// Stop the worker; pending requests are aborted
    pub fn shutdown(self) {
        let _ = self.commands.try_send(Command::Shutdown);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct InstrumentWorker {
    instrument: Instrument,
    acquisition: AcquisitionService,
    acquisition_tx: EventSender,
    events: mpsc::UnboundedSender<WorkerEvent>,
    generation: u64,

    daily: DailySeries,
    period: Vec<Bar>,
    unit: BarUnit,
    /// Pixels per period bar
    x_factor: f64,
    oldest: i64,
    newest: i64,

    percent_change: f64,
    chart_percent_change: f64,
    layout: ChartLayout,
    labels: LabelPolicy,
    elements: ChartElements,
    readiness: Readiness,
    /// The first acquisition cycle has ended
    loaded: bool,
}

impl InstrumentWorker {
    fn new(
        instrument: Instrument,
        services: DataServices,
        settings: WorkerSettings,
        generation: u64,
        events: mpsc::UnboundedSender<WorkerEvent>,
        acquisition_tx: EventSender,
    ) -> Self {
        Self {
            acquisition: AcquisitionService::new(&instrument, services),
            elements: ChartElements::new(&instrument),
            instrument,
            acquisition_tx,
            events,
            generation,
            daily: DailySeries::new(),
            period: Vec::new(),
            unit: settings.unit,
            x_factor: settings.x_factor * settings.unit.days(),
            oldest: settings.oldest.max(0),
            newest: 0,
            percent_change: 1.0,
            chart_percent_change: 1.0,
            layout: settings.layout,
            labels: settings.labels,
            readiness: Readiness::NotReady,
            loaded: false,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut acquisition: mpsc::Receiver<AcquisitionEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(event) = acquisition.recv() => self.on_acquisition(event),
            }
        }
        log::debug!("{} worker stopped", self.instrument.ticker);
        self.acquisition.cancel();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Fetch => self.fetch_price_and_fundamentals(),
            Command::ShiftByBars {
                delta,
                width,
                reply,
            } => {
                let _ = reply.send(self.shift_by_bars(delta, width));
            }
            Command::Recompute {
                shared_percent_change,
                force,
                reply,
            } => {
                self.recompute(shared_percent_change, force);
                let _ = reply.send(());
            }
            Command::MaxPeriodSupported { unit, reply } => {
                let _ = reply.send(self.max_period_supported(unit));
            }
            Command::UpdatePeriodData {
                unit,
                x_factor,
                max_periods,
                reply,
            } => {
                self.update_period_data(unit, x_factor, max_periods);
                let _ = reply.send(());
            }
            Command::SetOldest(oldest, reply) => {
                self.oldest = oldest.max(0);
                self.update_high_low();
                let _ = reply.send(());
            }
            Command::SetNewest(newest, reply) => {
                self.newest = newest.max(0);
                let _ = reply.send(());
            }
            Command::FitWidth(width, reply) => {
                self.newest = (self.oldest - width).max(0);
                let _ = reply.send(());
            }
            Command::SetLayout(layout, reply) => {
                self.layout = layout;
                let _ = reply.send(());
            }
            Command::UpdateInstrument(instrument, reply) => {
                self.update_instrument(*instrument);
                let _ = reply.send(());
            }
            Command::Snapshot(reply) => {
                let snapshot = (self.readiness == Readiness::Ready).then(|| self.elements.clone());
                let _ = reply.send(snapshot);
            }
            Command::Readiness(reply) => {
                let _ = reply.send(self.readiness);
            }
            Command::Window(reply) => {
                let _ = reply.send(Window {
                    oldest: self.oldest,
                    newest: self.newest,
                });
            }
            Command::BarAt(index, reply) => {
                let _ = reply.send(self.bar_at(index));
            }
            Command::BarAtOffset(offset, reply) => {
                let index = self.oldest - offset;
                let lookup = usize::try_from(index).ok().and_then(|i| self.bar_at(i));
                let _ = reply.send(lookup);
            }
            Command::Shutdown => {}
        }
    }

    fn notify(&self, kind: WorkerEventKind) {
        let _ = self.events.send(WorkerEvent {
            generation: self.generation,
            ticker: self.instrument.ticker.clone(),
            kind,
        });
    }

    fn fetch_price_and_fundamentals(&mut self) {
        let status = self
            .acquisition
            .fetch_newer_than(self.acquisition.last_close(), &self.acquisition_tx);
        match status {
            FetchStatus::Started => {}
            FetchStatus::AlreadyInFlight => {
                log::debug!("{} fetch already in flight", self.instrument.ticker)
            }
            FetchStatus::BackingOff | FetchStatus::Disabled => {
                self.end_cycle();
                self.notify(WorkerEventKind::RequestCanceled);
            }
        }

        if self.instrument.wants_fundamentals() && self.elements.reports.is_empty() {
            self.acquisition
                .fetch_fundamentals(self.instrument.fundamental_keys.clone(), &self.acquisition_tx);
        }
    }

    fn on_acquisition(&mut self, event: AcquisitionEvent) {
        self.acquisition.apply(&event);
        match event {
            AcquisitionEvent::CacheLoaded(bars) => self.merge(bars),
            AcquisitionEvent::RemoteRequested => self.notify(WorkerEventKind::RequestStarted),
            AcquisitionEvent::RemoteLoaded(bars) => {
                self.merge(bars);
                self.acquisition.finish_merge();
                self.finish_request();
            }
            AcquisitionEvent::UpToDate => self.finish_request(),
            AcquisitionEvent::Failed(e) => {
                log::warn!("{} price request failed: {}", self.instrument.ticker, e);
                self.end_cycle();
                self.notify(WorkerEventKind::RequestFailed(e));
            }
            AcquisitionEvent::IntradayLoaded(bar) => {
                self.daily.apply_intraday(bar);
                if let Some(newest) = self.daily.newest() {
                    self.elements.last_price = newest.close;
                }
                self.update_period();
                self.update_high_low();
                self.notify(WorkerEventKind::RequestFinished {
                    percent_change: self.percent_change,
                });
            }
            AcquisitionEvent::IntradayIgnored => {}
            AcquisitionEvent::IntradayStale(e) | AcquisitionEvent::IntradayFailed(e) => {
                self.notify(WorkerEventKind::RequestFailed(e))
            }
            AcquisitionEvent::IntradayUnavailable(_) => {
                self.notify(WorkerEventKind::RequestCanceled)
            }
            AcquisitionEvent::FundamentalsLoaded(reports) => {
                self.elements.reports = reports;
                self.elements.reports.align_to(&self.period);
                self.compute();
                self.notify(WorkerEventKind::RequestFinished {
                    percent_change: self.percent_change,
                });
            }
            AcquisitionEvent::FundamentalsFailed(e) => {
                log::warn!("{} fundamentals request failed: {}", self.instrument.ticker, e);
                self.notify(WorkerEventKind::RequestFailed(e));
            }
        }
    }

    /// Merge settled bars and rebuild everything derived from them
    fn merge(&mut self, bars: Vec<Bar>) {
        let newest_settled = bars.iter().map(|b| b.date).max();
        let outcome = self.daily.merge(bars);
        log::debug!("{} merged bars: {:?}", self.instrument.ticker, outcome);

        if let Some(date) = newest_settled {
            self.acquisition.set_last_close(date);
        }
        if let Some(newest) = self.daily.newest() {
            self.elements.last_price = newest.close;
        }
        self.update_period();
        self.update_high_low();
    }

    fn end_cycle(&mut self) {
        self.loaded = true;
        if self.readiness == Readiness::NotReady {
            self.readiness = Readiness::Ready;
        }
    }

    fn finish_request(&mut self) {
        self.end_cycle();
        if self.acquisition.should_fetch_intraday() {
            self.start_intraday();
        }
        self.notify(WorkerEventKind::RequestFinished {
            percent_change: self.percent_change,
        });
    }

    fn start_intraday(&mut self) {
        let last_close = self.acquisition.last_close();
        let settled_close = self
            .daily
            .bars()
            .iter()
            .find(|b| Some(b.date) == last_close)
            .map(|b| b.close);
        if self
            .acquisition
            .fetch_intraday_quote(settled_close, &self.acquisition_tx)
            == FetchStatus::BackingOff
        {
            self.notify(WorkerEventKind::RequestCanceled);
        }
    }

    fn update_period(&mut self) {
        self.period = period_series(self.daily.bars(), self.unit);
        let technicals = self.instrument.technicals;
        if technicals.sma50 || technicals.sma200 {
            calculate_sma(&mut self.period);
        }
        if technicals.bollinger {
            calculate_bollinger_bands(&mut self.period);
        }
        self.elements.reports.align_to(&self.period);
    }

    fn rescale(&mut self) {
        if self.elements.max_high <= 0.0 {
            return;
        }
        let (scaled_low, y_factor) = y_scale(
            self.elements.max_high,
            self.chart_percent_change,
            self.layout.chart_base,
        );
        self.elements.scaled_low = scaled_low;
        self.elements.y_factor = y_factor;
    }

    /// Clamp the window, rescan its extremes and rebuild geometry
    fn update_high_low(&mut self) {
        let count = self.period.len() as i64;
        if count == 0 {
            return;
        }
        if self.oldest <= 0 {
            log::debug!(
                "{} resetting oldest bar shown {} to {}",
                self.instrument.ticker,
                self.oldest,
                count.min(DEFAULT_WINDOW_BARS)
            );
            self.oldest = count.min(DEFAULT_WINDOW_BARS);
            self.newest = 0;
        } else if self.oldest >= count {
            self.oldest = count - 1;
        }

        let range = visible_range(&self.period, self.newest as usize, self.oldest as usize);
        self.elements.max_high = range.max_high;
        self.elements.min_low = range.min_low;
        self.elements.max_volume = range.max_volume;
        self.elements.scaled_low = range.min_low;

        if let Some(percent_change) = range.percent_change() {
            self.percent_change = percent_change;
            if percent_change > self.chart_percent_change {
                self.chart_percent_change = percent_change;
            }
            self.rescale();
        }
        self.elements.percent_change = self.percent_change;
        self.compute();
    }

    fn compute(&mut self) {
        self.readiness = Readiness::Computing;
        let request = GeometryRequest {
            period: &self.period,
            daily_len: self.daily.len(),
            oldest: self.oldest.max(0) as usize,
            newest: self.newest.max(0) as usize,
            x_factor: self.x_factor,
            unit: self.unit,
            style: self.instrument.style,
            technicals: self.instrument.technicals,
            layout: &self.layout,
            labels: &self.labels,
        };
        compute_chart(&mut self.elements, &request);
        self.readiness = if self.loaded {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
    }

    fn shift_by_bars(&mut self, delta: i64, width: i64) -> f64 {
        let count = self.period.len() as i64;
        if self.oldest + delta >= count {
            log::debug!(
                "{} oldest {} + shift {} passes {} bars",
                self.instrument.ticker,
                self.oldest,
                delta,
                count
            );
            return self.percent_change;
        }
        self.oldest += delta;
        self.newest = (self.oldest - width).max(0);

        if self.oldest <= 0 {
            self.elements.clear();
        }

        if self.newest == 0 && !self.acquisition.is_busy() {
            if self.acquisition.should_fetch_intraday() {
                self.start_intraday();
            } else if self.acquisition.should_fetch_next_close() {
                let status = self
                    .acquisition
                    .fetch_newer_than(self.acquisition.last_close(), &self.acquisition_tx);
                if status == FetchStatus::BackingOff {
                    self.notify(WorkerEventKind::RequestCanceled);
                }
            }
        }

        self.update_high_low();
        self.percent_change
    }

    /// Adopt the shared scale without squeezing below this instrument's own range
    fn recompute(&mut self, shared_percent_change: f64, force: bool) {
        if force {
            self.update_period();
        }
        let target = shared_percent_change.max(self.percent_change);
        let difference = target - self.chart_percent_change;
        if target > 0.0 {
            self.chart_percent_change = target;
        }
        self.rescale();
        if force || difference.abs() > RESCALE_THRESHOLD {
            self.compute();
        }
    }

    fn max_period_supported(&self, unit: BarUnit) -> (usize, usize) {
        let count = (self.daily.len() as f64 / unit.days()).floor() as usize;
        let oldest = (self.oldest.max(0) as f64 * self.unit.days() / unit.days()).floor() as usize;
        (count, oldest)
    }

    fn update_period_data(&mut self, unit: BarUnit, x_factor: f64, max_periods: usize) {
        if unit != self.unit {
            let ratio = self.unit.days() / unit.days();
            self.newest = (self.newest as f64 * ratio).floor() as i64;
            self.oldest = (self.oldest as f64 * ratio).floor() as i64;
            self.unit = unit;
        }
        self.x_factor = x_factor * unit.days();
        self.update_period();
        self.oldest = self
            .oldest
            .min(i64::try_from(max_periods).unwrap_or(i64::MAX));
        self.update_high_low();
    }

    fn update_instrument(&mut self, instrument: Instrument) {
        let keys_changed = instrument.fundamental_keys != self.instrument.fundamental_keys;
        self.elements.restyle(&instrument);
        self.instrument = instrument;
        if keys_changed {
            self.elements.reports = FundamentalReports::default();
            if self.instrument.wants_fundamentals() {
                self.acquisition.fetch_fundamentals(
                    self.instrument.fundamental_keys.clone(),
                    &self.acquisition_tx,
                );
            }
        }
    }

    fn bar_at(&self, index: usize) -> Option<BarLookup> {
        let bar = self.period.get(index)?.clone();
        let up_close = if index + 2 < self.period.len() {
            bar.close >= self.period[index + 1].close
        } else {
            bar.close >= bar.open
        };
        Some(BarLookup {
            ticker: self.instrument.ticker.clone(),
            month_name: bar.month_name(),
            up_close,
            y_high: self.elements.price_y(bar.high),
            y_low: self.elements.price_y(bar.low),
            bar,
        })
    }
}

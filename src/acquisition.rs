//! Per-instrument price acquisition
//!
//! The service decides when to read the local cache, when to ask the remote source for
//! newer sessions, and when an intraday quote is worth polling. Every request runs on
//! a spawned task that reports back through an [`AcquisitionEvent`] channel, so the
//! owning worker never waits on the network. State transitions happen only in
//! [`AcquisitionService::apply`], which the owner calls for each event it receives.

use crate::calendar::{Clock, NYSECalendar, SystemClock, TradingCalendar};
use crate::comparison::Instrument;
use crate::config::AcquisitionConfig;
use crate::data::fundamentals::FundamentalReports;
use crate::data::sources::RemoteSource;
use crate::error::ChartError;
use crate::store::LocalStore;
use crate::types::{Bar, StockId};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest price gap between a quote's previous close and the cached close
pub const STALE_QUOTE_TOLERANCE: f64 = 0.02;

/// Sender half used by acquisition tasks
pub type EventSender = mpsc::Sender<AcquisitionEvent>;

/// Collaborators shared by every acquisition service
#[derive(Clone)]
pub struct DataServices {
    pub source: Arc<dyn RemoteSource>,
    pub store: Arc<dyn LocalStore>,
    pub calendar: Arc<dyn TradingCalendar>,
    pub clock: Arc<dyn Clock>,
    pub timing: AcquisitionConfig,
}

impl DataServices {
    /// NYSE calendar, system clock and default timing
    pub fn new(source: Arc<dyn RemoteSource>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            source,
            store,
            calendar: Arc::new(NYSECalendar::new()),
            clock: Arc::new(SystemClock),
            timing: AcquisitionConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn TradingCalendar>) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_timing(mut self, timing: AcquisitionConfig) -> Self {
        self.timing = timing;
        self
    }
}

/// Historical request progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    LoadingCache,
    RequestingRemote,
    MergingRemote,
}

/// Intraday polling progress, independent of [`AcquisitionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntradayState {
    Idle,
    Polling,
    /// The provider has no intraday data for this instrument
    Disabled,
}

/// Outcome of asking the service to start a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Started,
    /// Another request is outstanding; its events will follow
    AlreadyInFlight,
    /// A network failure happened too recently
    BackingOff,
    /// Intraday polling is off for this instrument
    Disabled,
}

/// Progress reported by acquisition tasks
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// Bars read from the local store; a remote request may follow
    CacheLoaded(Vec<Bar>),
    RemoteRequested,
    /// Bars from the remote source, sent before they are persisted
    RemoteLoaded(Vec<Bar>),
    /// Nothing newer is available yet
    UpToDate,
    Failed(ChartError),
    IntradayLoaded(Bar),
    /// The quote is not newer than the last close
    IntradayIgnored,
    /// Not newer, and its previous close disagrees with the cached close
    IntradayStale(ChartError),
    /// The quote could not be decoded; polling stops
    IntradayUnavailable(ChartError),
    IntradayFailed(ChartError),
    FundamentalsLoaded(FundamentalReports),
    FundamentalsFailed(ChartError),
}

/// Acquisition state machine for one instrument
pub struct AcquisitionService {
    ticker: String,
    stock_id: StockId,
    start_date: NaiveDate,
    services: DataServices,
    state: AcquisitionState,
    intraday: IntradayState,
    last_close: Option<NaiveDate>,
    next_close: Option<DateTime<Utc>>,
    last_offline_error: Option<DateTime<Utc>>,
    last_intraday_fetch: Option<DateTime<Utc>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AcquisitionService {
    pub fn new(instrument: &Instrument, services: DataServices) -> Self {
        Self {
            ticker: instrument.ticker.clone(),
            stock_id: instrument.stock_id,
            start_date: instrument.start_date,
            services,
            state: AcquisitionState::Idle,
            intraday: IntradayState::Idle,
            last_close: None,
            next_close: None,
            last_offline_error: None,
            last_intraday_fetch: None,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn intraday_state(&self) -> IntradayState {
        self.intraday
    }

    /// Whether any request is outstanding
    pub fn is_busy(&self) -> bool {
        self.state != AcquisitionState::Idle || self.intraday == IntradayState::Polling
    }

    pub fn last_close(&self) -> Option<NaiveDate> {
        self.last_close
    }

    pub fn next_close(&self) -> Option<DateTime<Utc>> {
        self.next_close
    }

    /// Record the newest settled session and derive the next scheduled close
    pub fn set_last_close(&mut self, date: NaiveDate) {
        if self.last_close.map_or(false, |current| current >= date) {
            return;
        }
        self.last_close = Some(date);
        self.next_close = self.services.calendar.next_close(date);
    }

    fn seconds_since(&self, then: Option<DateTime<Utc>>) -> Option<i64> {
        then.map(|t| (self.services.clock.now() - t).num_seconds())
    }

    fn is_backing_off(&self) -> bool {
        self.seconds_since(self.last_offline_error)
            .map_or(false, |secs| secs < self.services.timing.offline_backoff_secs)
    }

    /// Whether an intraday quote is worth requesting now
    ///
    /// True when polling is enabled, the last quote is older than the refresh
    /// interval, and the next close is inside the configured window around now.
    pub fn should_fetch_intraday(&self) -> bool {
        if self.intraday != IntradayState::Idle {
            return false;
        }
        let timing = &self.services.timing;
        if self
            .seconds_since(self.last_intraday_fetch)
            .map_or(false, |secs| secs <= timing.intraday_refresh_secs)
        {
            return false;
        }
        let Some(next_close) = self.next_close else {
            return false;
        };
        let until_close = (next_close - self.services.clock.now()).num_seconds();
        until_close < timing.intraday_before_close_secs
            && until_close > -timing.intraday_after_close_secs
    }

    /// Whether settled data for the next close should be available by now
    pub fn should_fetch_next_close(&self) -> bool {
        if self.state != AcquisitionState::Idle {
            return false;
        }
        match self.next_close {
            Some(next_close) => {
                let after_close = (self.services.clock.now() - next_close).num_seconds();
                after_close > self.services.timing.settle_after_close_secs
            }
            None => true,
        }
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|handle| !handle.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    /// Load cached bars when nothing is loaded yet, then request sessions newer than
    /// `current_newest` if the next one has already closed
    pub fn fetch_newer_than(
        &mut self,
        current_newest: Option<NaiveDate>,
        tx: &EventSender,
    ) -> FetchStatus {
        if self.is_busy() {
            return FetchStatus::AlreadyInFlight;
        }
        if self.is_backing_off() {
            log::info!("{} skipping request during offline backoff", self.ticker);
            return FetchStatus::BackingOff;
        }

        self.state = AcquisitionState::LoadingCache;
        let job = HistoryJob {
            ticker: self.ticker.clone(),
            stock_id: self.stock_id,
            start_date: self.start_date,
            current_newest,
            services: self.services.clone(),
        };
        self.spawn(load_history(job, tx.clone()));
        FetchStatus::Started
    }

    /// Poll one intraday quote
    ///
    /// A quote newer than the last close is always applied. An older one is checked
    /// against `newest_close`, the close of the newest cached session, and reported
    /// as stale when its previous close disagrees.
    pub fn fetch_intraday_quote(
        &mut self,
        newest_close: Option<f64>,
        tx: &EventSender,
    ) -> FetchStatus {
        if self.intraday == IntradayState::Disabled {
            return FetchStatus::Disabled;
        }
        if self.is_busy() {
            return FetchStatus::AlreadyInFlight;
        }
        if self.is_backing_off() {
            log::info!("{} skipping intraday quote during offline backoff", self.ticker);
            return FetchStatus::BackingOff;
        }

        self.intraday = IntradayState::Polling;
        self.last_intraday_fetch = Some(self.services.clock.now());
        let job = IntradayJob {
            ticker: self.ticker.clone(),
            last_close: self.last_close,
            newest_close,
            source: self.services.source.clone(),
        };
        self.spawn(load_intraday(job, tx.clone()));
        FetchStatus::Started
    }

    /// Request fundamental reports for the given metric keys
    pub fn fetch_fundamentals(&mut self, keys: Vec<String>, tx: &EventSender) {
        let ticker = self.ticker.clone();
        let source = self.services.source.clone();
        let tx = tx.clone();
        self.spawn(async move {
            let event = match source.fetch_fundamentals(&ticker, &keys).await {
                Ok(reports) => {
                    log::debug!("{} loaded {} fundamental reports", ticker, reports.report_count());
                    AcquisitionEvent::FundamentalsLoaded(reports)
                }
                Err(e) => AcquisitionEvent::FundamentalsFailed(e),
            };
            let _ = tx.send(event).await;
        });
    }

    /// Advance the state machine for an event received from a task
    pub fn apply(&mut self, event: &AcquisitionEvent) {
        match event {
            AcquisitionEvent::CacheLoaded(_) => {}
            AcquisitionEvent::RemoteRequested => self.state = AcquisitionState::RequestingRemote,
            AcquisitionEvent::RemoteLoaded(_) => self.state = AcquisitionState::MergingRemote,
            AcquisitionEvent::UpToDate => self.state = AcquisitionState::Idle,
            AcquisitionEvent::Failed(e) => {
                self.state = AcquisitionState::Idle;
                self.note_failure(e);
            }
            AcquisitionEvent::IntradayLoaded(_)
            | AcquisitionEvent::IntradayIgnored
            | AcquisitionEvent::IntradayStale(_) => self.intraday = IntradayState::Idle,
            AcquisitionEvent::IntradayUnavailable(e) => {
                log::warn!("{} disabling intraday quotes: {}", self.ticker, e);
                self.intraday = IntradayState::Disabled;
            }
            AcquisitionEvent::IntradayFailed(e) => {
                self.intraday = IntradayState::Idle;
                self.note_failure(e);
            }
            AcquisitionEvent::FundamentalsLoaded(_) => {}
            AcquisitionEvent::FundamentalsFailed(e) => self.note_failure(e),
        }
    }

    /// Remote bars have been merged by the owner
    pub fn finish_merge(&mut self) {
        if self.state == AcquisitionState::MergingRemote {
            self.state = AcquisitionState::Idle;
        }
    }

    fn note_failure(&mut self, error: &ChartError) {
        if error.is_transient() {
            log::warn!("{} offline: {}", self.ticker, error);
            self.last_offline_error = Some(self.services.clock.now());
        }
    }

    /// Abort every outstanding request
    pub fn cancel(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
        self.state = AcquisitionState::Idle;
        if self.intraday == IntradayState::Polling {
            self.intraday = IntradayState::Idle;
        }
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }
    }
}

struct HistoryJob {
    ticker: String,
    stock_id: StockId,
    start_date: NaiveDate,
    current_newest: Option<NaiveDate>,
    services: DataServices,
}

async fn load_history(job: HistoryJob, tx: EventSender) {
    let services = &job.services;
    let mut known_newest = job.current_newest;

    if known_newest.is_none() {
        let cached = match services.store.load_bars(job.stock_id, job.start_date).await {
            Ok(bars) => bars,
            Err(e) => {
                log::warn!("{} cache unavailable, fetching remotely: {}", job.ticker, e);
                Vec::new()
            }
        };
        known_newest = cached.iter().map(|b| b.date).max();
        if !cached.is_empty() {
            log::debug!("{} loaded {} cached bars", job.ticker, cached.len());
            if tx.send(AcquisitionEvent::CacheLoaded(cached)).await.is_err() {
                return;
            }
        }
    }

    let from = match known_newest {
        Some(newest) => match services.calendar.next_trading_day(newest) {
            Ok(next) => next,
            Err(e) => {
                let _ = tx.send(AcquisitionEvent::Failed(e)).await;
                return;
            }
        },
        None => job.start_date,
    };

    if known_newest.is_some() {
        let now = services.clock.now();
        let closed = services
            .calendar
            .close_time(from)
            .map_or(true, |close| now > close);
        if !closed {
            log::debug!("{} cache is current until {}", job.ticker, from);
            let _ = tx.send(AcquisitionEvent::UpToDate).await;
            return;
        }
    }

    if tx.send(AcquisitionEvent::RemoteRequested).await.is_err() {
        return;
    }
    let to = services.clock.today();
    log::info!("{} requesting {} to {} from {}", job.ticker, from, to, services.source.name());

    let event = match services.source.fetch_range(&job.ticker, from, to).await {
        Ok(bars) if bars.is_empty() => {
            if known_newest.is_some() {
                AcquisitionEvent::UpToDate
            } else {
                AcquisitionEvent::Failed(ChartError::EmptyResult(job.ticker.clone()))
            }
        }
        Ok(bars) => {
            let to_save = bars.clone();
            if tx.send(AcquisitionEvent::RemoteLoaded(bars)).await.is_err() {
                return;
            }
            if let Err(e) = services.store.save_bars(job.stock_id, &to_save).await {
                log::warn!("{} failed to cache {} bars: {}", job.ticker, to_save.len(), e);
            }
            return;
        }
        Err(e) => AcquisitionEvent::Failed(e),
    };
    let _ = tx.send(event).await;
}

struct IntradayJob {
    ticker: String,
    last_close: Option<NaiveDate>,
    newest_close: Option<f64>,
    source: Arc<dyn RemoteSource>,
}

async fn load_intraday(job: IntradayJob, tx: EventSender) {
    let event = match job.source.fetch_intraday(&job.ticker).await {
        Ok(quote) => match quote.to_bar() {
            None => AcquisitionEvent::IntradayUnavailable(ChartError::Decode(format!(
                "{} intraday quote has no valid date",
                job.ticker
            ))),
            Some(bar) if job.last_close.map_or(true, |close| bar.date > close) => {
                AcquisitionEvent::IntradayLoaded(bar)
            }
            // No session in progress; the quote should repeat the settled close
            Some(bar) => match job.newest_close {
                Some(close) if (close - quote.prev_close).abs() > STALE_QUOTE_TOLERANCE => {
                    AcquisitionEvent::IntradayStale(ChartError::StaleQuote(format!(
                        "{} intraday prevClose {} doesn't match {}",
                        job.ticker, quote.prev_close, close
                    )))
                }
                _ => {
                    log::debug!("{} intraday quote for {} is not newer", job.ticker, bar.date);
                    AcquisitionEvent::IntradayIgnored
                }
            },
        },
        Err(e @ ChartError::Decode(_)) => AcquisitionEvent::IntradayUnavailable(e),
        Err(e) => AcquisitionEvent::IntradayFailed(e),
    };
    let _ = tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ManualClock;
    use crate::data::sources::MemorySource;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    /// Weekday sessions ending on `newest`, newest first
    fn sessions(newest: NaiveDate, count: usize) -> Vec<Bar> {
        let calendar = NYSECalendar::new();
        let mut bars = Vec::new();
        let mut day = newest;
        while bars.len() < count {
            if calendar.is_trading_day(day) {
                bars.push(Bar::new(day, 10.0, 11.0, 9.0, 10.5, 1000.0));
            }
            day -= Duration::days(1);
        }
        bars
    }

    struct Fixture {
        source: Arc<MemorySource>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        service: AcquisitionService,
        tx: EventSender,
        rx: mpsc::Receiver<AcquisitionEvent>,
    }

    fn fixture(now: DateTime<Utc>) -> Fixture {
        let source = Arc::new(MemorySource::new());
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let services = DataServices::new(source.clone(), store.clone()).with_clock(clock.clone());
        let instrument = Instrument::new(1, "AAPL", "Apple Inc.", date(2023, 1, 3));
        let (tx, rx) = mpsc::channel(16);
        Fixture {
            source,
            store,
            clock,
            service: AcquisitionService::new(&instrument, services),
            tx,
            rx,
        }
    }

    impl Fixture {
        async fn next(&mut self) -> AcquisitionEvent {
            let event = self.rx.recv().await.expect("event");
            self.service.apply(&event);
            event
        }
    }

    #[tokio::test]
    async fn test_first_load_requests_remote_then_persists() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        f.source.set_bars("AAPL", sessions(date(2024, 3, 1), 30));

        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::Started);
        assert_eq!(f.service.state(), AcquisitionState::LoadingCache);
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));
        assert_eq!(f.service.state(), AcquisitionState::RequestingRemote);
        match f.next().await {
            AcquisitionEvent::RemoteLoaded(bars) => assert_eq!(bars.len(), 30),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.service.state(), AcquisitionState::MergingRemote);
        f.service.finish_merge();
        assert_eq!(f.service.state(), AcquisitionState::Idle);

        for _ in 0..50 {
            if f.store.save_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.store.cached(1).len(), 30);
    }

    #[tokio::test]
    async fn test_current_cache_skips_remote() {
        // Friday's bars are cached and Monday has not closed yet
        let mut f = fixture(utc(2024, 3, 4, 15));
        f.store.save_bars(1, &sessions(date(2024, 3, 1), 10)).await.unwrap();

        f.service.fetch_newer_than(None, &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::CacheLoaded(ref b) if b.len() == 10));
        assert!(matches!(f.next().await, AcquisitionEvent::UpToDate));
        assert_eq!(f.source.range_calls("AAPL"), 0);
        assert_eq!(f.service.state(), AcquisitionState::Idle);
    }

    #[tokio::test]
    async fn test_stale_cache_requests_from_next_session() {
        let mut f = fixture(utc(2024, 3, 6, 12));
        f.store.save_bars(1, &sessions(date(2024, 3, 1), 10)).await.unwrap();
        f.source.set_bars("AAPL", sessions(date(2024, 3, 5), 12));

        f.service.fetch_newer_than(None, &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::CacheLoaded(_)));
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));
        match f.next().await {
            AcquisitionEvent::RemoteLoaded(bars) => {
                assert_eq!(bars.len(), 2);
                assert_eq!(bars[1].date, date(2024, 3, 4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_failure_falls_back_to_remote() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        f.store.fail_loads(true);
        f.source.set_bars("AAPL", sessions(date(2024, 3, 1), 5));

        f.service.fetch_newer_than(None, &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteLoaded(_)));
    }

    #[tokio::test]
    async fn test_empty_result_without_cache_fails() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        f.service.fetch_newer_than(None, &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));
        match f.next().await {
            AcquisitionEvent::Failed(ChartError::EmptyResult(ticker)) => assert_eq!(ticker, "AAPL"),
            other => panic!("unexpected {:?}", other),
        }
        // Not a network failure, so no backoff
        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::Started);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_in_flight() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        f.source.set_bars("AAPL", sessions(date(2024, 3, 1), 5));
        f.source.hold("AAPL");

        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::Started);
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));
        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::AlreadyInFlight);
        assert_eq!(f.service.fetch_intraday_quote(None, &f.tx), FetchStatus::AlreadyInFlight);

        f.source.release("AAPL");
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteLoaded(_)));
        assert_eq!(f.source.range_calls("AAPL"), 1);
    }

    #[tokio::test]
    async fn test_network_failure_backs_off() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        f.source.fail_ranges("AAPL", ChartError::Network("connection refused".into()));

        f.service.fetch_newer_than(None, &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));
        assert!(matches!(f.next().await, AcquisitionEvent::Failed(ChartError::Network(_))));

        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::BackingOff);
        f.clock.advance(Duration::seconds(61));
        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::Started);
    }

    #[tokio::test]
    async fn test_intraday_window() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        assert!(!f.service.should_fetch_intraday());
        assert!(f.service.should_fetch_next_close());

        // Next close is Tuesday 16:00 New York, 21:00 UTC
        f.service.set_last_close(date(2024, 3, 4));
        assert_eq!(f.service.next_close(), Some(utc(2024, 3, 5, 21)));

        f.clock.set(utc(2024, 3, 5, 12));
        assert!(!f.service.should_fetch_intraday());
        f.clock.set(utc(2024, 3, 5, 15));
        assert!(f.service.should_fetch_intraday());
        assert!(!f.service.should_fetch_next_close());

        f.clock.set(utc(2024, 3, 5, 21) + Duration::minutes(59));
        assert!(f.service.should_fetch_intraday());
        assert!(!f.service.should_fetch_next_close());

        f.clock.set(utc(2024, 3, 5, 23));
        assert!(!f.service.should_fetch_intraday());
        assert!(f.service.should_fetch_next_close());

        // An older close never moves the schedule back
        f.service.set_last_close(date(2024, 3, 1));
        assert_eq!(f.service.last_close(), Some(date(2024, 3, 4)));
    }

    #[tokio::test]
    async fn test_intraday_quote_loaded_then_rate_limited() {
        let mut f = fixture(utc(2024, 3, 5, 15));
        f.service.set_last_close(date(2024, 3, 4));
        f.source.set_intraday_body(
            "AAPL",
            r#"{"ticker":"AAPL","lastSaleYear":2024,"lastSaleMonth":3,"lastSaleDay":5,
                "open":170.0,"high":172.0,"low":169.0,"last":171.5,"prevClose":170.1,"volume":1200}"#,
        );

        assert_eq!(f.service.fetch_intraday_quote(Some(170.0), &f.tx), FetchStatus::Started);
        assert_eq!(f.service.intraday_state(), IntradayState::Polling);
        match f.next().await {
            AcquisitionEvent::IntradayLoaded(bar) => {
                assert_eq!(bar.date, date(2024, 3, 5));
                assert_eq!(bar.close, 171.5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!f.service.should_fetch_intraday());
        f.clock.advance(Duration::seconds(61));
        assert!(f.service.should_fetch_intraday());
    }

    #[tokio::test]
    async fn test_intraday_quote_checks() {
        let mut f = fixture(utc(2024, 3, 5, 15));
        f.service.set_last_close(date(2024, 3, 4));
        let body = |day: u32, prev_close: f64| {
            format!(
                r#"{{"ticker":"AAPL","lastSaleYear":2024,"lastSaleMonth":3,"lastSaleDay":{},
                    "open":1,"high":1,"low":1,"last":1,"prevClose":{},"volume":1}}"#,
                day, prev_close
            )
        };

        // Not newer and consistent with the cached close
        f.source.set_intraday_body("AAPL", &body(4, 170.01));
        f.service.fetch_intraday_quote(Some(170.0), &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::IntradayIgnored));

        // Not newer and disagreeing with the cached close
        f.clock.advance(Duration::seconds(61));
        f.source.set_intraday_body("AAPL", &body(4, 168.5));
        f.service.fetch_intraday_quote(Some(170.0), &f.tx);
        assert!(matches!(
            f.next().await,
            AcquisitionEvent::IntradayStale(ChartError::StaleQuote(_))
        ));
        assert_eq!(f.service.intraday_state(), IntradayState::Idle);

        // A newer session is accepted even after a corrected cached close
        f.clock.advance(Duration::seconds(61));
        f.source.set_intraday_body("AAPL", &body(5, 150.0));
        f.service.fetch_intraday_quote(Some(170.0), &f.tx);
        match f.next().await {
            AcquisitionEvent::IntradayLoaded(bar) => assert_eq!(bar.date, date(2024, 3, 5)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_intraday_decode_failure_disables_polling() {
        let mut f = fixture(utc(2024, 3, 5, 15));
        f.service.set_last_close(date(2024, 3, 4));
        f.source.set_intraday_body("AAPL", r#"{"ticker":"AAPL","open":1.0}"#);

        f.service.fetch_intraday_quote(None, &f.tx);
        assert!(matches!(
            f.next().await,
            AcquisitionEvent::IntradayUnavailable(ChartError::Decode(_))
        ));
        assert_eq!(f.service.intraday_state(), IntradayState::Disabled);
        assert!(!f.service.should_fetch_intraday());
        assert_eq!(f.service.fetch_intraday_quote(None, &f.tx), FetchStatus::Disabled);
        // Historical requests are unaffected
        assert_eq!(f.service.fetch_newer_than(None, &f.tx), FetchStatus::Started);
    }

    #[tokio::test]
    async fn test_cancel_aborts_outstanding_request() {
        let mut f = fixture(utc(2024, 3, 4, 12));
        f.source.set_bars("AAPL", sessions(date(2024, 3, 1), 5));
        f.source.hold("AAPL");
        f.service.fetch_newer_than(None, &f.tx);
        assert!(matches!(f.next().await, AcquisitionEvent::RemoteRequested));

        f.service.cancel();
        assert!(!f.service.is_busy());
        f.source.release("AAPL");
        let next = tokio::time::timeout(std::time::Duration::from_millis(50), f.rx.recv()).await;
        assert!(next.is_err());
    }
}

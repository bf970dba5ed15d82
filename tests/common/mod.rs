//! Shared fixtures for the integration suites: an in-memory exchange
//! adapter, an in-memory archive transport, and a handful of tiny
//! strategies exercising the replay loop.

#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, Utc};
use polars::frame::DataFrame;
use std::{
    collections::HashMap,
    io::{Cursor, Write},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use rewind::{
    ArchiveTransport, BacktestConfig, ExchangeApiAdapter,
    broker::SimBroker,
    domain::{
        Bar, CloseReason, FillingMode, Lots, Magic, OrderAction, OrderRequest, Position,
        PositionSide, Price, SymbolId, SymbolInfo, Tick, TickType, Timeframe, TradeMode,
    },
    error::{ArchiveError, RewindResult},
    replay::{EngineView, PositionMonitor, Signal, StrategyInstance},
    validation::SignalData,
};

pub const DAY_MS: i64 = 86_400_000;

/// Installs a test subscriber once; later calls are no-ops. Honors
/// `RUST_LOG` so a failing replay can be rerun with tracing on.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ================================================================================================
// Builders
// ================================================================================================

pub fn day(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

pub fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

pub fn day_start_ms(d: NaiveDate) -> i64 {
    d.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
}

pub fn quote_tick(time_ms: i64, bid: f64, ask: f64) -> Tick {
    Tick {
        time_ms,
        bid: Price(bid),
        ask: Price(ask),
        last: Price(0.0),
        volume: 0,
        flags: 0,
    }
}

pub fn eurusd_info() -> SymbolInfo {
    SymbolInfo {
        name: "EURUSD".to_string(),
        tick_size: 0.00001,
        digits: 5,
        contract_size: 100_000.0,
        volume_min: 0.01,
        volume_max: 100.0,
        volume_step: 0.01,
        stops_level: 10,
        freeze_level: 0,
        trade_mode: TradeMode::Full,
        base_currency: "EUR".to_string(),
        quote_currency: "USD".to_string(),
        spread_points: 10,
    }
}

pub fn info_for(symbol: &str) -> SymbolInfo {
    SymbolInfo {
        name: symbol.to_string(),
        ..eurusd_info()
    }
}

/// A config wired for tests: archive off, two-day pool, small stride.
pub fn test_config(cache_root: &Path, symbols: &[&str], start: &str, end: &str) -> BacktestConfig {
    let mut config = BacktestConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        start: ts(start),
        end: ts(end),
        initial_balance: 10_000.0,
        leverage: 100.0,
        parallel_days: 2,
        equity_sample_stride: 4,
        barrier_timeout_ms: 10_000,
        ..Default::default()
    };
    config.cache.cache_root = cache_root.to_path_buf();
    config.archive.tick_archive_enabled = false;
    config
}

// ================================================================================================
// Exchange Adapter Fixture
// ================================================================================================

/// Serves fixed per-(symbol, day) ticks and bars, counting every call so
/// tests can assert network silence on warm caches.
#[derive(Default)]
pub struct FixtureAdapter {
    pub ticks: HashMap<(String, NaiveDate), Vec<Tick>>,
    pub bars: HashMap<(String, NaiveDate, Timeframe), Vec<Bar>>,
    pub tick_calls: AtomicU64,
    pub bar_calls: AtomicU64,
}

impl FixtureAdapter {
    pub fn with_ticks(mut self, symbol: &str, d: NaiveDate, ticks: Vec<Tick>) -> Self {
        self.ticks.insert((symbol.to_string(), d), ticks);
        self
    }

    pub fn with_bars(mut self, symbol: &str, d: NaiveDate, tf: Timeframe, bars: Vec<Bar>) -> Self {
        self.bars.insert((symbol.to_string(), d, tf), bars);
        self
    }
}

impl ExchangeApiAdapter for FixtureAdapter {
    fn get_bars(
        &self,
        symbol: &str,
        tf: Timeframe,
        start_ms: i64,
        _end_ms: i64,
    ) -> RewindResult<Option<DataFrame>> {
        self.bar_calls.fetch_add(1, Ordering::Relaxed);
        let d = DateTime::from_timestamp_millis(start_ms).unwrap().date_naive();
        match self.bars.get(&(symbol.to_string(), d, tf)) {
            Some(bars) => Ok(Some(rewind::bars_to_frame(bars)?)),
            None => Ok(None),
        }
    }

    fn get_ticks(
        &self,
        symbol: &str,
        start_ms: i64,
        _end_ms: i64,
        _tick_type: TickType,
    ) -> RewindResult<Option<DataFrame>> {
        self.tick_calls.fetch_add(1, Ordering::Relaxed);
        let d = DateTime::from_timestamp_millis(start_ms).unwrap().date_naive();
        match self.ticks.get(&(symbol.to_string(), d)) {
            Some(ticks) => Ok(Some(rewind::ticks_to_frame(ticks)?)),
            None => Ok(None),
        }
    }

    fn symbol_info(&self, symbol: &str) -> RewindResult<SymbolInfo> {
        Ok(info_for(symbol))
    }

    fn server_name(&self) -> String {
        "fixture".to_string()
    }
}

// ================================================================================================
// Archive Transport Fixture
// ================================================================================================

/// In-memory `url -> bytes` archive; absent keys are 404. Hits are recorded
/// through a shared handle so tests can assert after the transport moved
/// into the controller.
pub struct MapTransport {
    pub objects: HashMap<String, Vec<u8>>,
    pub hits: Arc<Mutex<Vec<String>>>,
}

impl MapTransport {
    pub fn new(objects: HashMap<String, Vec<u8>>) -> Self {
        Self {
            objects,
            hits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn hits_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.hits)
    }
}

impl ArchiveTransport for MapTransport {
    fn get(&self, url: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        self.hits.lock().unwrap().push(url.to_string());
        Ok(self.objects.get(url).cloned())
    }
}

/// One ZIP entry `ticks.csv` with the given content.
pub fn zip_of_csv(csv: &str) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        writer
            .start_file("ticks.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(csv.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    buf.into_inner()
}

/// CSV covering the given days with `count` flat quotes each.
pub fn csv_for_days(days: &[&str], count: usize, bid: f64) -> String {
    let mut out = String::from("time,bid,ask\n");
    for d in days {
        let base = day_start_ms(day(d));
        for i in 0..count {
            out.push_str(&format!(
                "{},{},{}\n",
                base + (i as i64) * 1_000,
                bid,
                bid + 0.0002
            ));
        }
    }
    out
}

// ================================================================================================
// Strategy Fixtures
// ================================================================================================

/// Opens exactly one position on the first step its symbol has a quote.
pub struct OpenOnceStrategy {
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub magic: u64,
    opened: bool,
}

impl OpenOnceStrategy {
    pub fn new(symbol: &str, side: PositionSide, volume: f64, sl: Option<f64>, tp: Option<f64>) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            volume,
            sl,
            tp,
            magic: 1,
            opened: false,
        }
    }
}

impl StrategyInstance for OpenOnceStrategy {
    fn declared_timeframes(&self) -> Vec<(Timeframe, usize)> {
        vec![(Timeframe::M1, 50)]
    }

    fn on_step(&mut self, view: &EngineView<'_>, symbol: SymbolId) -> Option<Signal> {
        if self.opened {
            return None;
        }
        let quote = view.last_quote(symbol)?;
        self.opened = true;
        Some(Signal {
            request: OrderRequest {
                action: OrderAction::Open,
                symbol: self.symbol.clone(),
                side: self.side,
                volume: Lots(self.volume),
                price: quote.ask,
                sl: self.sl.map(Price),
                tp: self.tp.map(Price),
                deviation: 10,
                magic: Magic(self.magic),
                comment: String::new(),
                filling_mode: FillingMode::Ioc,
            },
            data: SignalData {
                price: quote.ask,
                volume: Lots(self.volume),
                side: Some(self.side),
                candidate_sl: self.sl.map(Price),
                candidate_tp: self.tp.map(Price),
                ..Default::default()
            },
        })
    }
}

/// Counts the steps it was scheduled with data; never trades.
pub struct CountingStrategy {
    pub steps: Arc<AtomicU64>,
}

impl StrategyInstance for CountingStrategy {
    fn declared_timeframes(&self) -> Vec<(Timeframe, usize)> {
        vec![(Timeframe::M1, 10)]
    }

    fn on_step(&mut self, _view: &EngineView<'_>, _symbol: SymbolId) -> Option<Signal> {
        self.steps.fetch_add(1, Ordering::Relaxed);
        None
    }
}

// ================================================================================================
// Monitor Fixture
// ================================================================================================

/// Counts barrier steps; optionally closes every open position after a
/// given number of steps (reason `monitor`).
pub struct StepMonitor {
    pub steps: Arc<AtomicU64>,
    pub close_after: Option<u64>,
}

impl PositionMonitor for StepMonitor {
    fn on_step(&mut self, _view: &EngineView<'_>, broker: &SimBroker) {
        let step = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(threshold) = self.close_after {
            if step >= threshold {
                let open: Vec<Position> = broker.positions(&Default::default());
                for position in open {
                    let _ = broker.close(position.ticket, CloseReason::Monitor);
                }
            }
        }
    }
}

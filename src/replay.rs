use chrono::{DateTime, Utc};
use polars::frame::DataFrame;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    archive::{ArchiveFetcher, ArchiveTransport, HttpTransport},
    broker::{PositionFilter, Quote, SimBroker},
    cache::DayCache,
    candles::CandleBuilder,
    clock::{ReplayClock, StepAdvance, SyncOutcome},
    config::BacktestConfig,
    domain::{
        Bar, OrderRequest, Position, SymbolId, SymbolInfo, TICK_FLAG_SYNTHETIC, Tick, Timeframe,
        TradeRecord, days_in_range,
    },
    error::{ConfigError, DataError, RewindResult, RuntimeError},
    loader::{DataLoader, ExchangeApiAdapter},
    recorder::{EquityPoint, Recorder, Summary},
    schema,
    stream::TickStream,
    validation::{SignalData, ValidationMode, ValidationRegistry},
};

/// Default closed-bar depth registered for preload timeframes.
const DEFAULT_TAIL_DEPTH: usize = 500;

// ================================================================================================
// Strategy Seams
// ================================================================================================

/// A trade intent produced by a strategy: the order plus the signal payload
/// the validation pipeline inspects.
#[derive(Debug, Clone)]
pub struct Signal {
    pub request: OrderRequest,
    pub data: SignalData,
}

/// A user strategy bound to one symbol. The engine passes read-only views
/// only; all mutation flows back through the returned [`Signal`].
pub trait StrategyInstance: Send {
    /// Timeframes this strategy will query, with the deepest tail it needs.
    fn declared_timeframes(&self) -> Vec<(Timeframe, usize)>;

    /// Registers this strategy's validation checks at construction time.
    fn register_validations(&self, _registry: &mut ValidationRegistry) {}

    /// Called once per barrier step in which the strategy's symbol has data.
    fn on_step(&mut self, view: &EngineView<'_>, symbol: SymbolId) -> Option<Signal>;
}

/// Optional collaborator adjusting SL/TP (breakeven, trailing). Participates
/// in the barrier like a symbol worker and may mutate positions through the
/// broker's validated entry points.
pub trait PositionMonitor: Send {
    fn on_step(&mut self, view: &EngineView<'_>, broker: &SimBroker);
}

// ================================================================================================
// Engine View
// ================================================================================================

/// The narrow read surface handed to strategies, validations, and the
/// position monitor: broker snapshots and candle tails, nothing mutable.
pub struct EngineView<'a> {
    broker: &'a SimBroker,
    candles: &'a RwLock<CandleBuilder>,
    clock: &'a ReplayClock,
}

impl EngineView<'_> {
    pub fn time_ms(&self) -> i64 {
        self.clock.current_time_ms()
    }

    pub fn time(&self) -> DateTime<Utc> {
        // Before the first step the clock sits at i64::MIN.
        DateTime::from_timestamp_millis(self.time_ms()).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn has_data(&self, symbol: SymbolId) -> bool {
        self.clock.has_data(symbol)
    }

    pub fn equity(&self) -> f64 {
        self.broker.equity()
    }

    pub fn balance(&self) -> f64 {
        self.broker.balance()
    }

    pub fn free_margin(&self) -> f64 {
        self.broker.free_margin()
    }

    pub fn margin_level(&self) -> Option<f64> {
        self.broker.margin_level()
    }

    pub fn positions(&self, filter: &PositionFilter) -> Vec<Position> {
        self.broker.positions(filter)
    }

    pub fn last_quote(&self, symbol: SymbolId) -> Option<Quote> {
        self.broker.last_quote(symbol)
    }

    pub fn symbol_info(&self, symbol: SymbolId) -> SymbolInfo {
        self.broker.symbol_info(symbol).clone()
    }

    /// Cached frame view of the last `count` closed bars.
    pub fn tail(
        &self,
        symbol: SymbolId,
        tf: Timeframe,
        count: usize,
    ) -> RewindResult<Option<Arc<DataFrame>>> {
        self.candles
            .read()
            .expect("candle lock poisoned")
            .tail(symbol, tf, count)
    }

    pub fn tail_bars(&self, symbol: SymbolId, tf: Timeframe, count: usize) -> Vec<Bar> {
        self.candles
            .read()
            .expect("candle lock poisoned")
            .tail_bars(symbol, tf, count)
    }

    pub fn current_bar(&self, symbol: SymbolId, tf: Timeframe) -> Option<Bar> {
        self.candles
            .read()
            .expect("candle lock poisoned")
            .current_bar(symbol, tf)
    }

    pub fn bar_generation(&self, symbol: SymbolId, tf: Timeframe) -> u64 {
        self.candles
            .read()
            .expect("candle lock poisoned")
            .generation(symbol, tf)
    }
}

// ================================================================================================
// Results
// ================================================================================================

/// Run-level observability surfaced next to the ledger.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// `(symbol, day)` pairs no tier could supply.
    pub missing_days: Vec<(String, String)>,
    pub cache_day_hits: u64,
    pub cache_day_misses: u64,
    pub archive_downloads: u64,
    pub barrier_generations: u64,
    pub ticks_replayed: u64,
    /// Populated when the run was cut short (equity kill, barrier timeout).
    pub abort_reason: Option<String>,
}

#[derive(Debug)]
pub struct BacktestResult {
    pub ledger: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub summary: Summary,
    pub diagnostics: Diagnostics,
}

// ================================================================================================
// ReplayController
// ================================================================================================

/// Initializes every component in dependency order, spawns the worker
/// threads, drives the replay to completion and collects the results.
pub struct ReplayController {
    config: BacktestConfig,
    adapter: Arc<dyn ExchangeApiAdapter>,
    transport: Option<Box<dyn ArchiveTransport>>,
    strategies: Vec<(String, Box<dyn StrategyInstance>)>,
    monitor: Option<Box<dyn PositionMonitor>>,
    validation_mode: ValidationMode,
}

impl ReplayController {
    pub fn new(config: BacktestConfig, adapter: Arc<dyn ExchangeApiAdapter>) -> Self {
        Self {
            config,
            adapter,
            transport: None,
            strategies: Vec::new(),
            monitor: None,
            validation_mode: ValidationMode::default(),
        }
    }

    /// Overrides the archive transport (tests inject in-memory maps).
    pub fn with_archive_transport(mut self, transport: Box<dyn ArchiveTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_position_monitor(mut self, monitor: Box<dyn PositionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    /// Binds a strategy to one configured symbol.
    pub fn register_strategy(
        mut self,
        symbol: impl Into<String>,
        strategy: Box<dyn StrategyInstance>,
    ) -> Self {
        self.strategies.push((symbol.into(), strategy));
        self
    }

    /// The single entry point: load, replay, summarize.
    #[tracing::instrument(skip(self))]
    pub fn run(self) -> RewindResult<BacktestResult> {
        let Self {
            config,
            adapter,
            transport,
            strategies,
            monitor,
            validation_mode,
        } = self;
        config.validate()?;

        // === Dependency-ordered initialization ===
        let cache = Arc::new(DayCache::new(config.cache.clone()));
        let archive = if config.archive.tick_archive_enabled && config.use_tick_data {
            let transport = match transport {
                Some(t) => t,
                None => Box::new(HttpTransport::new(config.archive.tick_archive_timeout)?),
            };
            let mapping = config.archive.symbol_name_mapping.clone();
            Some(Arc::new(ArchiveFetcher::new(
                config.archive.clone(),
                config.archive_broker(),
                config.tick_type,
                move |symbol: &str| {
                    mapping
                        .get(symbol)
                        .cloned()
                        .unwrap_or_else(|| symbol.to_string())
                },
                transport,
                Arc::clone(&cache),
            )))
        } else {
            None
        };
        let loader = DataLoader::new(&config, Arc::clone(&cache), Arc::clone(&adapter), archive.clone());

        let first_day = days_in_range(config.start, config.end)[0];
        let mut infos = Vec::with_capacity(config.symbols.len());
        for symbol in &config.symbols {
            infos.push(loader.symbol_info(symbol, first_day)?);
        }

        let symbol_index: HashMap<&str, SymbolId> = config
            .symbols
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.as_str(), SymbolId(idx)))
            .collect();

        // Strategies bind one-to-one onto configured symbols.
        let mut per_symbol: Vec<Option<Box<dyn StrategyInstance>>> =
            config.symbols.iter().map(|_| None).collect();
        let mut registry = ValidationRegistry::new(validation_mode);
        let mut candles = CandleBuilder::new(config.symbols.len());
        for (symbol_id, _) in config.symbols.iter().enumerate() {
            for tf in &config.preload_timeframes {
                candles.register(SymbolId(symbol_id), *tf, DEFAULT_TAIL_DEPTH);
            }
        }
        for (symbol, strategy) in strategies {
            let Some(&symbol_id) = symbol_index.get(symbol.as_str()) else {
                return Err(ConfigError::UnknownSymbol(symbol).into());
            };
            if per_symbol[symbol_id.0].is_some() {
                return Err(ConfigError::Invalid(format!(
                    "two strategies registered for '{symbol}'"
                ))
                .into());
            }
            for (tf, depth) in strategy.declared_timeframes() {
                candles.register(symbol_id, tf, depth);
            }
            strategy.register_validations(&mut registry);
            per_symbol[symbol_id.0] = Some(strategy);
        }
        let registry = Arc::new(registry);

        let broker = Arc::new(SimBroker::new(
            infos.clone(),
            config.initial_balance,
            config.leverage,
            config.commission_per_lot,
            config.max_positions,
        ));
        let candles = Arc::new(RwLock::new(candles));
        let recorder = Arc::new(Recorder::new(config.equity_sample_stride));

        // === Load phase ===
        let stream = self::build_stream(&config, &loader, &infos)?;
        let missing = loader.missing_days();
        if !missing.is_empty() && !config.allow_partial_data {
            let (symbol, day) = missing[0].clone();
            return Err(DataError::Unavailable {
                symbol,
                day: day.to_string(),
            }
            .into());
        }

        recorder.snapshot(
            config.start.timestamp_millis(),
            config.initial_balance,
            config.initial_balance,
        );

        // === Replay phase ===
        let exhausted = Arc::new(AtomicU64::new(0));
        let participants = config.symbols.len() + usize::from(monitor.is_some());
        let clock = Arc::new(ReplayClock::new(
            participants,
            make_advancer(
                stream,
                Arc::clone(&broker),
                Arc::clone(&candles),
                Arc::clone(&recorder),
                Arc::clone(&exhausted),
                &config,
            ),
        ));

        let abort_reason = Arc::new(Mutex::new(None::<String>));
        let timeout = Duration::from_millis(config.barrier_timeout_ms);

        thread::scope(|scope| {
            for (idx, strategy) in per_symbol.into_iter().enumerate() {
                let worker = SymbolWorker {
                    symbol: SymbolId(idx),
                    strategy,
                    broker: &broker,
                    candles: &candles,
                    clock: &clock,
                    registry: &registry,
                    exhausted: &exhausted,
                    abort_reason: &abort_reason,
                    timeout,
                };
                scope.spawn(move || worker.run());
            }
            if let Some(monitor) = monitor {
                let clock = &clock;
                let broker = &broker;
                let candles = &candles;
                let abort_reason = &abort_reason;
                scope.spawn(move || {
                    run_monitor(monitor, clock, broker, candles, abort_reason, timeout)
                });
            }
        });

        // === Collect ===
        let final_time = if clock.current_time_ms() == i64::MIN {
            config.start.timestamp_millis()
        } else {
            clock.current_time_ms()
        };
        // Settlements from the very last step have not been drained yet.
        recorder.record_trades(&broker.drain_closed());
        recorder.snapshot(final_time, broker.equity(), broker.balance());

        let (day_hits, day_misses) = cache.stats().snapshot();
        let diagnostics = Diagnostics {
            missing_days: loader
                .missing_days()
                .into_iter()
                .map(|(s, d)| (s, d.to_string()))
                .collect(),
            cache_day_hits: day_hits,
            cache_day_misses: day_misses,
            archive_downloads: archive.as_ref().map(|a| a.download_count()).unwrap_or(0),
            barrier_generations: clock.generation(),
            ticks_replayed: recorder.ticks_seen(),
            abort_reason: abort_reason.lock().expect("abort reason poisoned").clone(),
        };

        // The advancement hook inside the clock holds the other recorder
        // handle; dropping the clock releases it.
        drop(clock);
        let recorder = Arc::into_inner(recorder).expect("recorder still shared after join");
        let (ledger, equity_curve, summary) = recorder.finish();
        info!(
            trades = ledger.len(),
            generations = diagnostics.barrier_generations,
            "Backtest finished"
        );
        Ok(BacktestResult {
            ledger,
            equity_curve,
            summary,
            diagnostics,
        })
    }
}

// ================================================================================================
// Stream Construction
// ================================================================================================

fn build_stream(
    config: &BacktestConfig,
    loader: &DataLoader,
    infos: &[SymbolInfo],
) -> RewindResult<TickStream> {
    use rayon::prelude::*;

    if config.use_tick_data {
        if config.stream_ticks_from_disk {
            let sets = loader.prepare_tick_days(&config.symbols, config.start, config.end)?;
            return TickStream::open(sets, config.chunk_size);
        }
        // Eager mode materializes every symbol up front; the per-symbol
        // loads are independent, and collect preserves symbol order.
        let per_symbol = config
            .symbols
            .par_iter()
            .map(|symbol| -> RewindResult<Vec<Tick>> {
                let loaded = loader.load_ticks(symbol, config.start, config.end)?;
                match loaded.frame {
                    Some(frame) => schema::frame_to_ticks(&frame),
                    None => Ok(Vec::new()),
                }
            })
            .collect::<RewindResult<Vec<_>>>()?;
        return Ok(TickStream::from_ticks(per_symbol));
    }

    // Minute mode: M1 bars expand into synthetic open/low/high/close points.
    let per_symbol = config
        .symbols
        .par_iter()
        .enumerate()
        .map(|(idx, symbol)| -> RewindResult<Vec<Tick>> {
            let loaded = loader.load_bars(symbol, Timeframe::M1, config.start, config.end)?;
            match loaded.frame {
                Some(frame) => Ok(synthesize_minute_ticks(
                    &schema::frame_to_bars(&frame)?,
                    &infos[idx],
                )),
                None => Ok(Vec::new()),
            }
        })
        .collect::<RewindResult<Vec<_>>>()?;
    Ok(TickStream::from_ticks(per_symbol))
}

/// Expands each M1 bar into four quote points in the fixed order
/// open, low, high, close at 15-second offsets. The ordering visits the low
/// before the high, so long stops trigger before long takes inside one bar.
pub fn synthesize_minute_ticks(bars: &[Bar], info: &SymbolInfo) -> Vec<Tick> {
    let spread = info.spread_points as f64 * info.point();
    let mut ticks = Vec::with_capacity(bars.len() * 4);
    for bar in bars {
        for (slot, price) in [bar.open, bar.low, bar.high, bar.close].into_iter().enumerate() {
            ticks.push(Tick {
                time_ms: bar.start_ms + (slot as i64) * 15_000,
                bid: price,
                ask: crate::domain::Price(price.0 + spread),
                last: crate::domain::Price(0.0),
                volume: 0,
                flags: TICK_FLAG_SYNTHETIC,
            });
        }
    }
    ticks
}

// ================================================================================================
// Advancement
// ================================================================================================

/// Builds the single-owner advancement hook: pull the next tick, run the
/// SL/TP scan, update candles, sample equity, enforce the kill switches,
/// publish the new instant.
fn make_advancer(
    mut stream: TickStream,
    broker: Arc<SimBroker>,
    candles: Arc<RwLock<CandleBuilder>>,
    recorder: Arc<Recorder>,
    exhausted: Arc<AtomicU64>,
    config: &BacktestConfig,
) -> crate::clock::Advancer {
    let end_ms = config.end.timestamp_millis();
    let margin_call_level = config.margin_call_level;
    let equity_kill = config.equity_kill_threshold;

    Box::new(move || {
        let Some((symbol_id, tick)) = stream.next_tick()? else {
            return Ok(None);
        };
        if tick.time_ms > end_ms {
            return Ok(None);
        }

        // SL/TP evaluation precedes any strategy callback for this step;
        // orders submitted afterwards only meet the next tick.
        broker.on_tick(symbol_id, &tick);
        candles
            .write()
            .expect("candle lock poisoned")
            .on_tick(symbol_id, &tick);
        recorder.on_tick(tick.time_ms, || (broker.equity(), broker.balance()));

        if let Some(level) = margin_call_level {
            while broker.margin_level().is_some_and(|ml| ml < level) {
                if broker.force_close_worst().is_none() {
                    break;
                }
            }
        }
        // Pick up every settlement since the last step, whichever path
        // closed it (scan, strategy close, monitor, margin call).
        recorder.record_trades(&broker.drain_closed());
        if let Some(threshold) = equity_kill {
            let equity = broker.equity();
            if equity <= threshold {
                return Err(RuntimeError::EquityKill { equity, threshold }.into());
            }
        }

        exhausted.store(stream.dry_mask(), Ordering::Release);
        Ok(Some(StepAdvance {
            time_ms: tick.time_ms,
            availability: 1u64 << symbol_id.0,
        }))
    })
}

// ================================================================================================
// Workers
// ================================================================================================

struct SymbolWorker<'a> {
    symbol: SymbolId,
    strategy: Option<Box<dyn StrategyInstance>>,
    broker: &'a Arc<SimBroker>,
    candles: &'a Arc<RwLock<CandleBuilder>>,
    clock: &'a Arc<ReplayClock>,
    registry: &'a Arc<ValidationRegistry>,
    exhausted: &'a Arc<AtomicU64>,
    abort_reason: &'a Arc<Mutex<Option<String>>>,
    timeout: Duration,
}

impl SymbolWorker<'_> {
    fn run(mut self) {
        loop {
            match self.clock.sync(self.timeout) {
                Ok(SyncOutcome::Step { .. }) => {
                    // Process the step first: the dry bit can turn on in the
                    // same generation that delivers this symbol's final tick.
                    if self.clock.has_data(self.symbol) {
                        self.step();
                    }
                    if self.exhausted.load(Ordering::Acquire) & (1u64 << self.symbol.0) != 0 {
                        // This symbol's data ran out; exit before the next
                        // generation forms.
                        if let Err(e) = self.clock.leave() {
                            self.store_abort(&e.to_string());
                        }
                        return;
                    }
                }
                Ok(SyncOutcome::Finished) => return,
                Ok(SyncOutcome::Timeout) => {
                    warn!(symbol = self.symbol.0, "Barrier timeout; aborting run");
                    self.store_abort("barrier timeout");
                    self.clock.abort("barrier timeout");
                    return;
                }
                Err(e) => {
                    self.store_abort(&e.to_string());
                    return;
                }
            }
        }
    }

    fn step(&mut self) {
        let Some(strategy) = self.strategy.as_mut() else {
            return;
        };
        let view = EngineView {
            broker: self.broker.as_ref(),
            candles: self.candles.as_ref(),
            clock: self.clock.as_ref(),
        };
        let Some(signal) = strategy.on_step(&view, self.symbol) else {
            return;
        };

        let report = self.registry.run(&signal.data, &view);
        if !report.passed {
            return;
        }
        let outcome = self
            .broker
            .submit_annotated(&signal.request, report.annotation);
        if !outcome.check.accepted {
            // Rejections flow back through the retcode; nothing is retried.
            warn!(
                symbol = %signal.request.symbol,
                retcode = %outcome.check.retcode,
                "Order rejected by broker"
            );
        }
    }

    fn store_abort(&self, reason: &str) {
        let mut slot = self.abort_reason.lock().expect("abort reason poisoned");
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
    }
}

fn run_monitor(
    mut monitor: Box<dyn PositionMonitor>,
    clock: &Arc<ReplayClock>,
    broker: &Arc<SimBroker>,
    candles: &Arc<RwLock<CandleBuilder>>,
    abort_reason: &Arc<Mutex<Option<String>>>,
    timeout: Duration,
) {
    loop {
        match clock.sync(timeout) {
            Ok(SyncOutcome::Step { .. }) => {
                let view = EngineView {
                    broker: broker.as_ref(),
                    candles: candles.as_ref(),
                    clock: clock.as_ref(),
                };
                monitor.on_step(&view, broker);
            }
            Ok(SyncOutcome::Finished) => return,
            Ok(SyncOutcome::Timeout) => {
                warn!("Position monitor barrier timeout; aborting run");
                let mut slot = abort_reason.lock().expect("abort reason poisoned");
                if slot.is_none() {
                    *slot = Some("barrier timeout".to_string());
                }
                drop(slot);
                clock.abort("barrier timeout");
                return;
            }
            Err(e) => {
                let mut slot = abort_reason.lock().expect("abort reason poisoned");
                if slot.is_none() {
                    *slot = Some(e.to_string());
                }
                return;
            }
        }
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use crossbeam::channel;
use polars::frame::DataFrame;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
};
use tracing::{debug, info, warn};

use crate::{
    archive::ArchiveFetcher,
    cache::{DayCache, day_file},
    candles,
    config::BacktestConfig,
    domain::{
        DataKind, DataSource, SymbolInfo, TickType, Timeframe, day_end_ms, day_start_ms,
        days_in_range,
    },
    error::RewindResult,
    schema,
};

// ================================================================================================
// Exchange Adapter Seam
// ================================================================================================

/// The injected exchange-API collaborator. Implementations wrap a terminal
/// connection in live use and fixtures in tests.
pub trait ExchangeApiAdapter: Send + Sync {
    /// Bars for `[start_ms, end_ms)`; `None` when the venue has nothing.
    fn get_bars(
        &self,
        symbol: &str,
        tf: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> RewindResult<Option<DataFrame>>;

    /// Ticks for `[start_ms, end_ms)`; `None` when the venue has nothing.
    fn get_ticks(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        tick_type: TickType,
    ) -> RewindResult<Option<DataFrame>>;

    fn symbol_info(&self, symbol: &str) -> RewindResult<SymbolInfo>;

    fn server_name(&self) -> String;
}

// ================================================================================================
// Load Results
// ================================================================================================

/// A contiguous sorted frame plus the days no tier could supply.
#[derive(Debug)]
pub struct LoadedRange {
    pub frame: Option<DataFrame>,
    pub failed_days: Vec<NaiveDate>,
}

/// One symbol's ordered day files backing a lazy tick stream.
#[derive(Debug, Clone)]
pub struct DayFileSet {
    pub symbol: String,
    pub files: Vec<DayFileRef>,
}

#[derive(Debug, Clone)]
pub struct DayFileRef {
    pub day: NaiveDate,
    pub path: PathBuf,
    /// From the sidecar; feeds the stream's progress estimate.
    pub row_count: u64,
}

// ================================================================================================
// DataLoader
// ================================================================================================

/// Orchestrates the per-day fallback chain:
/// cache -> exchange adapter -> tick archive -> (bars only) derive from ticks.
///
/// Days are independent files, so repairs for one symbol run in a bounded
/// parallel pool of `parallel_days` workers.
pub struct DataLoader {
    cache: Arc<DayCache>,
    adapter: Arc<dyn ExchangeApiAdapter>,
    archive: Option<Arc<ArchiveFetcher>>,
    tick_type: TickType,
    gap_threshold_ms: i64,
    parallel_days: usize,
    /// Days that exhausted every tier, kept for the run diagnostics.
    missing: Mutex<Vec<(String, NaiveDate)>>,
}

impl DataLoader {
    pub fn new(
        config: &BacktestConfig,
        cache: Arc<DayCache>,
        adapter: Arc<dyn ExchangeApiAdapter>,
        archive: Option<Arc<ArchiveFetcher>>,
    ) -> Self {
        Self {
            cache,
            adapter,
            archive,
            tick_type: config.tick_type,
            gap_threshold_ms: (config.cache.cache_gap_threshold_days * 86_400_000.0) as i64,
            parallel_days: config.parallel_days.max(1),
            missing: Mutex::new(Vec::new()),
        }
    }

    /// Days that failed every tier so far, for diagnostics.
    pub fn missing_days(&self) -> Vec<(String, NaiveDate)> {
        self.missing.lock().expect("missing list poisoned").clone()
    }

    // ============================================================================================
    // Public Read Operations
    // ============================================================================================

    /// A single contiguous sorted bar frame over the range. Failed days are
    /// reported alongside; the orchestrator decides whether they are fatal.
    #[tracing::instrument(skip(self), fields(symbol, %tf))]
    pub fn load_bars(
        &self,
        symbol: &str,
        tf: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RewindResult<LoadedRange> {
        self.load_range(symbol, DataKind::Candles(tf), start, end)
    }

    /// Eager tick load over the range.
    #[tracing::instrument(skip(self), fields(symbol))]
    pub fn load_ticks(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RewindResult<LoadedRange> {
        self.load_range(symbol, DataKind::Ticks(self.tick_type), start, end)
    }

    /// Ensures every day of the range is cached for all symbols and returns
    /// the ordered day-file sets backing a lazy [`crate::stream::TickStream`].
    #[tracing::instrument(skip(self, symbols))]
    pub fn prepare_tick_days(
        &self,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RewindResult<Vec<DayFileSet>> {
        let mut sets = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            // Populate the cache through the normal chain first.
            self.load_range(symbol, DataKind::Ticks(self.tick_type), start, end)?;

            let mut files = Vec::new();
            for day in days_in_range(start, end) {
                let path = day_file::day_file_path(
                    self.cache.root(),
                    symbol,
                    day,
                    DataKind::Ticks(self.tick_type),
                );
                if let Some(meta) = day_file::read_meta(&path) {
                    files.push(DayFileRef {
                        day,
                        path,
                        row_count: meta.row_count,
                    });
                }
            }
            sets.push(DayFileSet {
                symbol: symbol.clone(),
                files,
            });
        }
        Ok(sets)
    }

    /// Contract specification, preferring the cached sidecar over the
    /// adapter; first load writes the sidecar for the next run.
    pub fn symbol_info(&self, symbol: &str, day: NaiveDate) -> RewindResult<SymbolInfo> {
        if let Some(info) = self.cache.load_symbol_info(symbol, day) {
            return Ok(info);
        }
        let info = self.adapter.symbol_info(symbol)?;
        self.cache.save_symbol_info(day, &info)?;
        Ok(info)
    }

    // ============================================================================================
    // Range Assembly
    // ============================================================================================

    fn load_range(
        &self,
        symbol: &str,
        kind: DataKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RewindResult<LoadedRange> {
        let cached = self.cache.load(symbol, start, end, kind)?;
        let mut frames = cached.frame.map(|f| vec![f]).unwrap_or_default();
        let mut failed_days = Vec::new();

        if !cached.missing_days.is_empty() {
            let (repaired, failed) = self.repair_days(symbol, kind, &cached.missing_days)?;
            frames.extend(repaired);
            failed_days = failed;
        }

        for day in &failed_days {
            warn!(%symbol, %day, %kind, "Day failed every tier");
            self.missing
                .lock()
                .expect("missing list poisoned")
                .push((symbol.to_string(), *day));
        }

        let frame = if frames.is_empty() {
            None
        } else {
            // Clip to the exact requested window; repaired days cover full
            // UTC days and may overhang the range edges.
            let combined = schema::concat_days(frames)?;
            Some(schema::slice_time_range(
                combined,
                start.timestamp_millis(),
                end.timestamp_millis(),
            )?)
        };

        Ok(LoadedRange { frame, failed_days })
    }

    /// Repairs missing days through the fallback chain on a bounded worker
    /// pool. Day files are disjoint, so workers never collide.
    fn repair_days(
        &self,
        symbol: &str,
        kind: DataKind,
        days: &[NaiveDate],
    ) -> RewindResult<(Vec<DataFrame>, Vec<NaiveDate>)> {
        let width = self.parallel_days.min(days.len()).max(1);
        let (work_tx, work_rx) = channel::bounded::<NaiveDate>(days.len());
        let (result_tx, result_rx) =
            channel::bounded::<(NaiveDate, RewindResult<Option<DataFrame>>)>(days.len());

        for day in days {
            work_tx.send(*day).expect("bounded above the work count");
        }
        drop(work_tx);

        thread::scope(|scope| {
            for _ in 0..width {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(day) = work_rx.recv() {
                        let outcome = self.fetch_day(symbol, day, kind);
                        if result_tx.send((day, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);
        });

        let mut repaired = Vec::new();
        let mut failed = Vec::new();
        let mut results: Vec<_> = result_rx.iter().collect();
        // Deterministic assembly regardless of worker completion order.
        results.sort_by_key(|(day, _)| *day);
        for (day, outcome) in results {
            match outcome? {
                Some(frame) => repaired.push(frame),
                None => failed.push(day),
            }
        }
        Ok((repaired, failed))
    }

    // ============================================================================================
    // Fallback Chain (single day)
    // ============================================================================================

    /// The day-granular chain. Each tier that produces data writes the day
    /// file with its `source`, so the next run short-circuits at tier one.
    fn fetch_day(
        &self,
        symbol: &str,
        day: NaiveDate,
        kind: DataKind,
    ) -> RewindResult<Option<DataFrame>> {
        // Tier 1: cache (re-checked here because pool workers may race a
        // sibling request for the same granule).
        if let Some(frame) = self.cache.load_day(symbol, day, kind)? {
            return Ok(Some(frame));
        }

        // Tier 2: exchange adapter.
        if let Some(frame) = self.fetch_day_from_exchange(symbol, day, kind)? {
            return Ok(Some(frame));
        }

        match kind {
            DataKind::Ticks(_) => {
                // Tier 3: external archive (saves through the cache itself).
                if let Some(archive) = &self.archive {
                    match archive.fetch(symbol, day) {
                        Ok(Some(frame)) => return Ok(Some(frame)),
                        Ok(None) => {}
                        Err(e) => {
                            // Archive exhaustion degrades to data-unavailable
                            // for the day; config errors still propagate.
                            if matches!(e, crate::error::RewindError::Config(_)) {
                                return Err(e);
                            }
                            warn!(%symbol, %day, error = %e, "Archive tier failed");
                        }
                    }
                }
                Ok(None)
            }
            DataKind::Candles(tf) => {
                // Tier 3 for bars: derive from the day's ticks.
                self.derive_bars_from_ticks(symbol, day, tf)
            }
        }
    }

    fn fetch_day_from_exchange(
        &self,
        symbol: &str,
        day: NaiveDate,
        kind: DataKind,
    ) -> RewindResult<Option<DataFrame>> {
        let start_ms = day_start_ms(day);
        let end_ms = day_end_ms(day);

        let fetched = match kind {
            DataKind::Candles(tf) => self.adapter.get_bars(symbol, tf, start_ms, end_ms)?,
            DataKind::Ticks(_) => self.adapter.get_ticks(symbol, start_ms, end_ms, self.tick_type)?,
        };
        let Some(frame) = fetched else {
            return Ok(None);
        };
        if frame.height() == 0 {
            return Ok(None);
        }

        // A frame that starts too deep into the day is not the day the
        // chain is trying to repair; discard and let the next tier try.
        let (first_ms, _) = schema::time_bounds(&frame)?.expect("non-empty frame has bounds");
        if first_ms - start_ms > self.gap_threshold_ms {
            debug!(
                %symbol,
                %day,
                gap_ms = first_ms - start_ms,
                "Exchange frame starts beyond the gap threshold; discarded"
            );
            return Ok(None);
        }

        let mut day_frame = schema::slice_time_range(frame, start_ms, end_ms)?;
        if day_frame.height() == 0 {
            return Ok(None);
        }
        self.cache
            .save(symbol, day, kind, &mut day_frame, DataSource::Exchange)?;
        Ok(Some(day_frame))
    }

    /// Resamples the day's ticks into bars and caches them as `derived`.
    fn derive_bars_from_ticks(
        &self,
        symbol: &str,
        day: NaiveDate,
        tf: Timeframe,
    ) -> RewindResult<Option<DataFrame>> {
        let Some(tick_frame) = self.fetch_day(symbol, day, DataKind::Ticks(self.tick_type))? else {
            return Ok(None);
        };
        let ticks = schema::frame_to_ticks(&tick_frame)?;
        let bars = candles::resample_ticks(&ticks, tf);
        if bars.is_empty() {
            return Ok(None);
        }
        let mut frame = schema::bars_to_frame(&bars)?;
        self.cache.save(
            symbol,
            day,
            DataKind::Candles(tf),
            &mut frame,
            DataSource::Derived,
        )?;
        info!(%symbol, %day, %tf, bars = frame.height(), "Bars derived from ticks");
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::CacheSettings,
        domain::{Price, Tick, TradeMode},
    };
    use std::collections::HashMap;

    /// Adapter serving fixed per-day tick sets; bars always absent.
    struct FixtureAdapter {
        ticks: HashMap<NaiveDate, Vec<Tick>>,
        tick_calls: Mutex<u64>,
    }

    impl FixtureAdapter {
        fn new(ticks: HashMap<NaiveDate, Vec<Tick>>) -> Self {
            Self {
                ticks,
                tick_calls: Mutex::new(0),
            }
        }
    }

    impl ExchangeApiAdapter for FixtureAdapter {
        fn get_bars(
            &self,
            _symbol: &str,
            _tf: Timeframe,
            _start_ms: i64,
            _end_ms: i64,
        ) -> RewindResult<Option<DataFrame>> {
            Ok(None)
        }

        fn get_ticks(
            &self,
            _symbol: &str,
            start_ms: i64,
            _end_ms: i64,
            _tick_type: TickType,
        ) -> RewindResult<Option<DataFrame>> {
            *self.tick_calls.lock().unwrap() += 1;
            let day = DateTime::from_timestamp_millis(start_ms).unwrap().date_naive();
            match self.ticks.get(&day) {
                Some(ticks) => Ok(Some(schema::ticks_to_frame(ticks)?)),
                None => Ok(None),
            }
        }

        fn symbol_info(&self, symbol: &str) -> RewindResult<SymbolInfo> {
            Ok(SymbolInfo {
                name: symbol.to_string(),
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
            })
        }

        fn server_name(&self) -> String {
            "fixture".to_string()
        }
    }

    fn day_ticks(day: &str, count: usize) -> (NaiveDate, Vec<Tick>) {
        let date: NaiveDate = day.parse().unwrap();
        let base = day_start_ms(date);
        let ticks = (0..count)
            .map(|i| Tick {
                time_ms: base + (i as i64) * 60_000,
                bid: Price(1.10),
                ask: Price(1.1002),
                last: Price(0.0),
                volume: 0,
                flags: 0,
            })
            .collect();
        (date, ticks)
    }

    fn loader_over(
        root: &std::path::Path,
        days: &[(&str, usize)],
    ) -> (DataLoader, Arc<DayCache>, Arc<FixtureAdapter>) {
        let cache = Arc::new(DayCache::new(CacheSettings {
            cache_root: root.to_path_buf(),
            ..Default::default()
        }));
        let mut ticks = HashMap::new();
        for (day, count) in days {
            let (date, t) = day_ticks(day, *count);
            ticks.insert(date, t);
        }
        let adapter = Arc::new(FixtureAdapter::new(ticks));
        let config = BacktestConfig {
            symbols: vec!["EURUSD".to_string()],
            start: "2025-01-15T00:00:00Z".parse().unwrap(),
            end: "2025-01-20T00:00:00Z".parse().unwrap(),
            parallel_days: 2,
            ..Default::default()
        };
        let loader = DataLoader::new(&config, Arc::clone(&cache), adapter.clone(), None);
        (loader, cache, adapter)
    }

    fn range(start: &str, end: &str) -> (DateTime<Utc>, DateTime<Utc>) {
        (start.parse().unwrap(), end.parse().unwrap())
    }

    #[test]
    fn second_load_hits_the_cache_without_adapter_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, _cache, adapter) =
            loader_over(dir.path(), &[("2025-01-15", 20), ("2025-01-16", 20)]);
        let (start, end) = range("2025-01-15T00:00:00Z", "2025-01-16T23:59:59Z");

        let first = loader.load_ticks("EURUSD", start, end).unwrap();
        assert!(first.failed_days.is_empty());
        assert_eq!(first.frame.unwrap().height(), 40);
        let calls_after_first = *adapter.tick_calls.lock().unwrap();
        assert!(calls_after_first >= 2);

        let second = loader.load_ticks("EURUSD", start, end).unwrap();
        assert_eq!(second.frame.unwrap().height(), 40);
        assert_eq!(
            *adapter.tick_calls.lock().unwrap(),
            calls_after_first,
            "warm cache must perform zero adapter calls"
        );
    }

    #[test]
    fn incremental_repair_fetches_only_the_hole() {
        // Cache D1, D2, D4, D5; loading [D1, D5] must fetch exactly D3.
        let dir = tempfile::tempdir().unwrap();
        let (loader, _cache, adapter) = loader_over(
            dir.path(),
            &[
                ("2025-01-15", 10),
                ("2025-01-16", 10),
                ("2025-01-17", 10),
                ("2025-01-18", 10),
                ("2025-01-19", 10),
            ],
        );

        for day in ["2025-01-15", "2025-01-16", "2025-01-18", "2025-01-19"] {
            let (start, end) = range(
                &format!("{day}T00:00:00Z"),
                &format!("{day}T23:59:59Z"),
            );
            loader.load_ticks("EURUSD", start, end).unwrap();
        }
        let warm_calls = *adapter.tick_calls.lock().unwrap();

        let (start, end) = range("2025-01-15T00:00:00Z", "2025-01-19T23:59:59Z");
        let loaded = loader.load_ticks("EURUSD", start, end).unwrap();

        assert!(loaded.failed_days.is_empty());
        assert_eq!(loaded.frame.unwrap().height(), 50);
        assert_eq!(
            *adapter.tick_calls.lock().unwrap(),
            warm_calls + 1,
            "only the missing middle day may be fetched"
        );
    }

    #[test]
    fn exhausted_tiers_surface_failed_days() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, _cache, _adapter) = loader_over(dir.path(), &[("2025-01-15", 10)]);
        let (start, end) = range("2025-01-15T00:00:00Z", "2025-01-16T23:59:59Z");

        let loaded = loader.load_ticks("EURUSD", start, end).unwrap();
        assert_eq!(loaded.failed_days, vec!["2025-01-16".parse::<NaiveDate>().unwrap()]);
        assert_eq!(loaded.frame.unwrap().height(), 10);
        assert_eq!(loader.missing_days().len(), 1);
    }

    #[test]
    fn bars_are_derived_from_ticks_when_the_venue_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, cache, _adapter) = loader_over(dir.path(), &[("2025-01-15", 120)]);
        let (start, end) = range("2025-01-15T00:00:00Z", "2025-01-15T23:59:59Z");

        let loaded = loader
            .load_bars("EURUSD", Timeframe::M5, start, end)
            .unwrap();
        assert!(loaded.failed_days.is_empty());
        let frame = loaded.frame.unwrap();
        assert_eq!(frame.height(), 24, "120 one-minute ticks make 24 M5 bars");

        // The derived day file carries its provenance.
        let path = day_file::day_file_path(
            cache.root(),
            "EURUSD",
            "2025-01-15".parse().unwrap(),
            DataKind::Candles(Timeframe::M5),
        );
        let meta = day_file::read_meta(&path).unwrap();
        assert_eq!(meta.source, DataSource::Derived);
    }

    #[test]
    fn prepare_tick_days_lists_day_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, _cache, _adapter) =
            loader_over(dir.path(), &[("2025-01-15", 10), ("2025-01-16", 12)]);
        let (start, end) = range("2025-01-15T00:00:00Z", "2025-01-16T23:59:59Z");

        let sets = loader
            .prepare_tick_days(&["EURUSD".to_string()], start, end)
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].files.len(), 2);
        assert_eq!(sets[0].files[0].row_count, 10);
        assert_eq!(sets[0].files[1].row_count, 12);
        assert!(sets[0].files[0].day < sets[0].files[1].day);
    }
}

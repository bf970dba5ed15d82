use polars::frame::DataFrame;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use crate::{
    domain::{Bar, SymbolId, Tick, Timeframe},
    error::RewindResult,
    schema,
};

/// Hard cap on the per-series ring so a greedy `tail` request cannot pin
/// unbounded history.
pub const MAX_RING: usize = 5_000;

// ================================================================================================
// Deterministic Aggregators
// ================================================================================================

/// Builds bars from a chronological tick slice. The price series is `last`
/// when positive, else `bid`; bucket boundaries are left-inclusive.
pub fn resample_ticks(ticks: &[Tick], tf: Timeframe) -> Vec<Bar> {
    let mut bars: Vec<Bar> = Vec::new();
    for tick in ticks {
        let bucket = tf.align_ms(tick.time_ms);
        match bars.last_mut() {
            Some(open) if open.start_ms == bucket => open.absorb(tick),
            _ => bars.push(Bar::open_from_tick(bucket, tick)),
        }
    }
    bars
}

/// Aggregates fine bars into a coarser timeframe. `to` must be a whole
/// multiple of `from`; aggregating T then k*T equals building k*T directly.
pub fn aggregate_bars(bars: &[Bar], to: Timeframe) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::new();
    for bar in bars {
        let bucket = to.align_ms(bar.start_ms);
        match out.last_mut() {
            Some(open) if open.start_ms == bucket => {
                if bar.high.0 > open.high.0 {
                    open.high = bar.high;
                }
                if bar.low.0 < open.low.0 {
                    open.low = bar.low;
                }
                open.close = bar.close;
                open.tick_volume += bar.tick_volume;
                if let Some(rv) = bar.real_volume {
                    *open.real_volume.get_or_insert(0) += rv;
                }
            }
            _ => out.push(Bar {
                start_ms: bucket,
                ..*bar
            }),
        }
    }
    out
}

// ================================================================================================
// Series State
// ================================================================================================

struct Series {
    tf: Timeframe,
    open_bar: Option<Bar>,
    /// Ring of closed bars, newest at the back.
    closed: VecDeque<Bar>,
    capacity: usize,
    /// Bumps once per finalized bar; stamps cached views.
    generation: u64,
    /// Materialized views per requested tail length. A view is reused while
    /// its generation matches, so repeated queries within one tick return
    /// the same object.
    views: Mutex<HashMap<usize, (u64, Arc<DataFrame>)>>,
}

impl Series {
    fn new(tf: Timeframe, capacity: usize) -> Self {
        Self {
            tf,
            open_bar: None,
            closed: VecDeque::with_capacity(capacity),
            capacity,
            generation: 0,
            views: Mutex::new(HashMap::new()),
        }
    }

    fn grow_capacity(&mut self, capacity: usize) {
        self.capacity = self.capacity.max(capacity).min(MAX_RING);
    }

    fn on_tick(&mut self, tick: &Tick) {
        let bucket = self.tf.align_ms(tick.time_ms);
        match &mut self.open_bar {
            Some(bar) if bar.start_ms == bucket => bar.absorb(tick),
            Some(bar) => {
                // Bucket changed: the open bar is complete.
                let finalized = *bar;
                self.push_closed(finalized);
                self.open_bar = Some(Bar::open_from_tick(bucket, tick));
            }
            None => self.open_bar = Some(Bar::open_from_tick(bucket, tick)),
        }
    }

    fn push_closed(&mut self, bar: Bar) {
        if self.closed.len() == self.capacity {
            self.closed.pop_front();
        }
        self.closed.push_back(bar);
        self.generation += 1;
    }

    fn tail_bars(&self, count: usize) -> Vec<Bar> {
        let n = count.min(self.closed.len());
        self.closed.iter().skip(self.closed.len() - n).copied().collect()
    }

    fn tail_view(&self, count: usize) -> RewindResult<Arc<DataFrame>> {
        let mut views = self.views.lock().expect("view cache poisoned");
        if let Some((generation, frame)) = views.get(&count) {
            if *generation == self.generation {
                return Ok(Arc::clone(frame));
            }
        }
        let frame = Arc::new(schema::bars_to_frame(&self.tail_bars(count))?);
        views.insert(count, (self.generation, Arc::clone(&frame)));
        Ok(frame)
    }
}

// ================================================================================================
// CandleBuilder
// ================================================================================================

/// Maintains, per `(symbol, timeframe)`, the current partial bar and a
/// bounded tail of closed bars, serving strategies read-only views.
///
/// Only timeframes declared at registration are built; the tick path touches
/// nothing else. The replay driver is the single writer; strategies read
/// between barrier generations.
pub struct CandleBuilder {
    series: Vec<HashMap<Timeframe, Series>>,
}

impl CandleBuilder {
    pub fn new(num_symbols: usize) -> Self {
        Self {
            series: (0..num_symbols).map(|_| HashMap::new()).collect(),
        }
    }

    /// Declares interest in a timeframe with a maximum tail depth. Repeated
    /// registration grows the ring up to [`MAX_RING`].
    pub fn register(&mut self, symbol: SymbolId, tf: Timeframe, depth: usize) {
        let depth = depth.clamp(1, MAX_RING);
        self.series[symbol.0]
            .entry(tf)
            .and_modify(|series| series.grow_capacity(depth))
            .or_insert_with(|| Series::new(tf, depth));
    }

    pub fn registered_timeframes(&self, symbol: SymbolId) -> Vec<Timeframe> {
        let mut tfs: Vec<_> = self.series[symbol.0].keys().copied().collect();
        tfs.sort();
        tfs
    }

    /// Feeds one tick into every registered timeframe of its symbol.
    pub fn on_tick(&mut self, symbol: SymbolId, tick: &Tick) {
        for series in self.series[symbol.0].values_mut() {
            series.on_tick(tick);
        }
    }

    /// Seeds a series with history (closed bars) loaded before the replay,
    /// so strategies have context from the first step.
    pub fn seed(&mut self, symbol: SymbolId, tf: Timeframe, bars: &[Bar]) {
        if let Some(series) = self.series[symbol.0].get_mut(&tf) {
            for bar in bars {
                series.push_closed(*bar);
            }
        }
    }

    /// The last `count` closed bars as a cached frame view. Identical
    /// requests between two bar closes return the same `Arc`.
    pub fn tail(
        &self,
        symbol: SymbolId,
        tf: Timeframe,
        count: usize,
    ) -> RewindResult<Option<Arc<DataFrame>>> {
        match self.series[symbol.0].get(&tf) {
            Some(series) => Ok(Some(series.tail_view(count)?)),
            None => Ok(None),
        }
    }

    /// The last `count` closed bars as plain rows.
    pub fn tail_bars(&self, symbol: SymbolId, tf: Timeframe, count: usize) -> Vec<Bar> {
        self.series[symbol.0]
            .get(&tf)
            .map(|series| series.tail_bars(count))
            .unwrap_or_default()
    }

    /// The still-forming bar, if any tick has arrived for the bucket.
    pub fn current_bar(&self, symbol: SymbolId, tf: Timeframe) -> Option<Bar> {
        self.series[symbol.0].get(&tf).and_then(|s| s.open_bar)
    }

    /// Monotonic close counter for `(symbol, tf)`, usable as a cheap
    /// "new bar?" probe by strategies.
    pub fn generation(&self, symbol: SymbolId, tf: Timeframe) -> u64 {
        self.series[symbol.0]
            .get(&tf)
            .map(|s| s.generation)
            .unwrap_or(0)
    }
}

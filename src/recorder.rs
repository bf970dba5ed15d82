use itertools::Itertools;
use polars::{df, frame::DataFrame};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::{
    domain::{CloseReason, TradeRecord},
    error::{DataError, RewindResult},
};

/// One sampled point of the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time_ms: i64,
    pub equity: f64,
    pub balance: f64,
}

/// End-of-run statistics, computable from the ledger and equity curve alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Summary {
    pub trade_count: usize,
    /// Net realized P&L (commissions included).
    pub realized_pnl: f64,
    /// Gross profit of winning trades minus nothing; used by profit factor.
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub win_rate: f64,
    /// `gross_profit / |gross_loss|`; infinity when nothing was lost.
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Peak-to-trough drawdown of the equity curve, as an absolute amount.
    pub max_drawdown: f64,
    /// Longest span between two consecutive trade closes, in milliseconds.
    pub longest_flat_ms: i64,
    /// Closures by reason, in [`CloseReason`] declaration order.
    pub closes_by_reason: Vec<(String, usize)>,
}

struct RecorderInner {
    ledger: Vec<TradeRecord>,
    equity: Vec<EquityPoint>,
    ticks_seen: u64,
}

// ================================================================================================
// Recorder
// ================================================================================================

/// Trade ledger and stride-sampled equity curve.
///
/// Appends go through one mutex; the curve and ledger are drained once at
/// the end of the run. Equity snapshots fire every `stride` ticks so the
/// sample count stays proportional to replay length.
pub struct Recorder {
    inner: Mutex<RecorderInner>,
    stride: u64,
}

impl Recorder {
    pub fn new(stride: u64) -> Self {
        Self {
            inner: Mutex::new(RecorderInner {
                ledger: Vec::new(),
                equity: Vec::new(),
                ticks_seen: 0,
            }),
            stride: stride.max(1),
        }
    }

    /// Counts one replay tick; on every `stride`-th call the `equity`
    /// closure is evaluated and the sample appended. The closure is lazy so
    /// off-stride ticks never pay for an equity computation.
    pub fn on_tick(&self, time_ms: i64, equity: impl FnOnce() -> (f64, f64)) {
        let mut inner = self.inner.lock().expect("recorder poisoned");
        inner.ticks_seen += 1;
        if inner.ticks_seen % self.stride == 0 {
            let (equity_now, balance_now) = equity();
            inner.equity.push(EquityPoint {
                time_ms,
                equity: equity_now,
                balance: balance_now,
            });
        }
    }

    /// Forces a sample regardless of stride (used at open/close of the run).
    pub fn snapshot(&self, time_ms: i64, equity: f64, balance: f64) {
        self.inner
            .lock()
            .expect("recorder poisoned")
            .equity
            .push(EquityPoint {
                time_ms,
                equity,
                balance,
            });
    }

    pub fn record_trades(&self, records: &[TradeRecord]) {
        if records.is_empty() {
            return;
        }
        self.inner
            .lock()
            .expect("recorder poisoned")
            .ledger
            .extend_from_slice(records);
    }

    pub fn ticks_seen(&self) -> u64 {
        self.inner.lock().expect("recorder poisoned").ticks_seen
    }

    /// Drains the recorder into its final artifacts.
    pub fn finish(self) -> (Vec<TradeRecord>, Vec<EquityPoint>, Summary) {
        let inner = self.inner.into_inner().expect("recorder poisoned");
        let summary = summarize(&inner.ledger, &inner.equity);
        (inner.ledger, inner.equity, summary)
    }
}

// ================================================================================================
// Summary Metrics
// ================================================================================================

pub fn summarize(ledger: &[TradeRecord], equity: &[EquityPoint]) -> Summary {
    let trade_count = ledger.len();
    let realized_pnl: f64 = ledger.iter().map(TradeRecord::net_profit).sum();

    let wins: Vec<f64> = ledger
        .iter()
        .map(TradeRecord::net_profit)
        .filter(|p| *p > 0.0)
        .collect();
    let losses: Vec<f64> = ledger
        .iter()
        .map(TradeRecord::net_profit)
        .filter(|p| *p < 0.0)
        .collect();

    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum();
    let win_rate = if trade_count == 0 {
        0.0
    } else {
        wins.len() as f64 / trade_count as f64
    };
    let profit_factor = if gross_loss == 0.0 {
        if gross_profit > 0.0 { f64::INFINITY } else { 0.0 }
    } else {
        gross_profit / gross_loss.abs()
    };
    let avg_win = if wins.is_empty() {
        0.0
    } else {
        gross_profit / wins.len() as f64
    };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        gross_loss / losses.len() as f64
    };

    // Peak-to-trough over the sampled curve.
    let mut peak = f64::MIN;
    let mut max_drawdown = 0.0f64;
    for point in equity {
        if point.equity > peak {
            peak = point.equity;
        }
        let drawdown = peak - point.equity;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
        }
    }

    // Longest gap between consecutive closes.
    let mut close_times: Vec<i64> = ledger.iter().map(|t| t.close_time_ms).collect();
    close_times.sort_unstable();
    let longest_flat_ms = close_times
        .iter()
        .tuple_windows()
        .map(|(a, b)| b - a)
        .max()
        .unwrap_or(0);

    let mut closes_by_reason = Vec::new();
    for reason in [
        CloseReason::Sl,
        CloseReason::Tp,
        CloseReason::Manual,
        CloseReason::Monitor,
        CloseReason::MarginCall,
    ] {
        let count = ledger.iter().filter(|t| t.reason == reason).count();
        if count > 0 {
            closes_by_reason.push((reason.to_string(), count));
        }
    }

    Summary {
        trade_count,
        realized_pnl,
        gross_profit,
        gross_loss,
        win_rate,
        profit_factor,
        avg_win,
        avg_loss,
        max_drawdown,
        longest_flat_ms,
        closes_by_reason,
    }
}

// ================================================================================================
// Frame Export
// ================================================================================================

/// The ledger as a frame for report tooling.
pub fn ledger_to_frame(ledger: &[TradeRecord]) -> RewindResult<DataFrame> {
    let frame = df![
        "ticket" => ledger.iter().map(|t| t.ticket.0).collect::<Vec<_>>(),
        "symbol" => ledger.iter().map(|t| t.symbol.clone()).collect::<Vec<_>>(),
        "side" => ledger.iter().map(|t| t.side.to_string()).collect::<Vec<_>>(),
        "volume" => ledger.iter().map(|t| t.volume.0).collect::<Vec<_>>(),
        "open_price" => ledger.iter().map(|t| t.open_price.0).collect::<Vec<_>>(),
        "close_price" => ledger.iter().map(|t| t.close_price.0).collect::<Vec<_>>(),
        "open_time" => ledger.iter().map(|t| t.open_time_ms).collect::<Vec<_>>(),
        "close_time" => ledger.iter().map(|t| t.close_time_ms).collect::<Vec<_>>(),
        "reason" => ledger.iter().map(|t| t.reason.to_string()).collect::<Vec<_>>(),
        "profit" => ledger.iter().map(|t| t.profit).collect::<Vec<_>>(),
        "commission" => ledger.iter().map(|t| t.commission).collect::<Vec<_>>(),
        "magic" => ledger.iter().map(|t| t.magic.0).collect::<Vec<_>>(),
        "annotations" => ledger.iter().map(|t| t.annotations.clone()).collect::<Vec<_>>(),
    ]
    .map_err(DataError::from)?;
    Ok(frame)
}

pub fn equity_to_frame(curve: &[EquityPoint]) -> RewindResult<DataFrame> {
    let frame = df![
        "time" => curve.iter().map(|p| p.time_ms).collect::<Vec<_>>(),
        "equity" => curve.iter().map(|p| p.equity).collect::<Vec<_>>(),
        "balance" => curve.iter().map(|p| p.balance).collect::<Vec<_>>(),
    ]
    .map_err(DataError::from)?;
    Ok(frame)
}

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{impl_newtype_arith, impl_newtype_conversions};

// ================================================================================================
// Domain Strong Types (NewTypes)
// ================================================================================================

/// Represents a price level in the quote currency.
///
/// Used for: bid, ask, last, open, high, low, close, stops and take profits.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Price(pub f64);
impl_newtype_conversions!(Price, f64);
impl_newtype_arith!(Price, f64);

/// Order/position volume in lots.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Lots(pub f64);
impl_newtype_conversions!(Lots, f64);
impl_newtype_arith!(Lots, f64);

/// Unique identifier of an open or closed position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Ticket(pub u64);
impl_newtype_conversions!(Ticket, u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Integer tag binding orders to a logical strategy instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Magic(pub u64);
impl_newtype_conversions!(Magic, u64);

/// Dense index of a symbol within one backtest run.
///
/// The index is assigned from the configured symbol list and doubles as the
/// bit position in the clock's availability bitmap, so the symbol order given
/// by the user is the deterministic tie-break order between synchronous ticks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SymbolId(pub usize);
impl_newtype_conversions!(SymbolId, usize);

// ================================================================================================
// Closed Enums
// ================================================================================================

/// Aggregation interval for OHLCV bars.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Length of one bar in milliseconds.
    pub const fn duration_ms(self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 300_000,
            Timeframe::M15 => 900_000,
            Timeframe::M30 => 1_800_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::H4 => 14_400_000,
            Timeframe::D1 => 86_400_000,
        }
    }

    /// Floors `ts_ms` to the open of the bar containing it.
    ///
    /// The boundary itself is left-inclusive: a tick exactly on the boundary
    /// belongs to the bar that opens there.
    pub const fn align_ms(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.duration_ms())
    }
}

/// The tick stream flavor requested from a source.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TickType {
    /// Bid/ask quote updates only.
    Info,
    /// Quotes plus executed trades (`last`/`volume` populated).
    Trade,
    /// Everything the venue publishes.
    All,
}

/// Which bucket of the day cache a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    Candles(Timeframe),
    Ticks(TickType),
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Candles(tf) => write!(f, "candles/{tf}"),
            DataKind::Ticks(tt) => write!(f, "ticks/{tt}"),
        }
    }
}

/// Where a cached day file came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Fetched from the exchange-API adapter.
    Exchange,
    /// Downloaded from the external tick archive.
    Archive,
    /// Resampled from ticks by the candle aggregator.
    Derived,
}

/// Direction of a position.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Buy,
    Sell,
}

impl PositionSide {
    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Buy => PositionSide::Sell,
            PositionSide::Sell => PositionSide::Buy,
        }
    }
}

/// Why a position left the book.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    Sl,
    Tp,
    Manual,
    Monitor,
    MarginCall,
}

/// Per-symbol trading permission as reported by the venue.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    Disabled,
    LongOnly,
    ShortOnly,
    CloseOnly,
    Full,
}

impl TradeMode {
    pub fn allows(self, side: PositionSide) -> bool {
        match self {
            TradeMode::Full => true,
            TradeMode::LongOnly => side == PositionSide::Buy,
            TradeMode::ShortOnly => side == PositionSide::Sell,
            TradeMode::Disabled | TradeMode::CloseOnly => false,
        }
    }
}

/// Stable result code of an order check, mirroring a venue `order_check`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Retcode {
    Done,
    NoMoney,
    InvalidStops,
    InvalidVolume,
    TradeDisabled,
    MaxPositions,
    UnknownSymbol,
}

// ================================================================================================
// Market Data Records
// ================================================================================================

/// Flag bit set on ticks synthesized from M1 bars in minute-granularity replay.
pub const TICK_FLAG_SYNTHETIC: u32 = 1 << 7;

/// A single quote update. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// UTC instant in epoch milliseconds.
    pub time_ms: i64,
    pub bid: Price,
    pub ask: Price,
    /// Last traded price; `0.0` when the venue sent a pure quote update.
    pub last: Price,
    pub volume: u64,
    pub flags: u32,
}

impl Tick {
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.time_ms).unwrap()
    }

    pub fn spread(&self) -> Price {
        self.ask - self.bid
    }

    /// The price series used when building bars from ticks: `last` when
    /// positive, else `bid`.
    pub fn bar_price(&self) -> Price {
        if self.last.0 > 0.0 { self.last } else { self.bid }
    }

    pub fn is_synthetic(&self) -> bool {
        self.flags & TICK_FLAG_SYNTHETIC != 0
    }
}

/// One OHLCV bar, aligned to its timeframe boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Open time in epoch milliseconds, always a multiple of the timeframe.
    pub start_ms: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub tick_volume: u64,
    pub real_volume: Option<u64>,
}

impl Bar {
    pub fn start(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.start_ms).unwrap()
    }

    /// Seeds a new bar from the first tick that lands in its bucket.
    pub fn open_from_tick(bucket_ms: i64, tick: &Tick) -> Self {
        let price = tick.bar_price();
        Self {
            start_ms: bucket_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            tick_volume: 1,
            real_volume: (tick.volume > 0).then_some(tick.volume),
        }
    }

    /// Folds one more tick of the same bucket into the bar.
    pub fn absorb(&mut self, tick: &Tick) {
        let price = tick.bar_price();
        if price.0 > self.high.0 {
            self.high = price;
        }
        if price.0 < self.low.0 {
            self.low = price;
        }
        self.close = price;
        self.tick_volume += 1;
        if tick.volume > 0 {
            *self.real_volume.get_or_insert(0) += tick.volume;
        }
    }
}

// ================================================================================================
// Symbol Metadata
// ================================================================================================

/// Per-symbol contract specification. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub tick_size: f64,
    pub digits: u32,
    pub contract_size: f64,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    /// Minimum distance from price to SL/TP, in points.
    pub stops_level: u32,
    /// Distance inside which pending modifications are frozen, in points.
    pub freeze_level: u32,
    pub trade_mode: TradeMode,
    pub base_currency: String,
    pub quote_currency: String,
    /// Static spread in points, applied around `last` when the feed carries
    /// no real bid/ask.
    pub spread_points: u32,
}

impl SymbolInfo {
    /// Size of one point in price units.
    pub fn point(&self) -> f64 {
        10f64.powi(-(self.digits as i32))
    }

    /// Minimum SL/TP distance in price units.
    pub fn stops_distance(&self) -> f64 {
        self.stops_level as f64 * self.point()
    }

    /// Checks a volume against min/step/max.
    pub fn volume_valid(&self, lots: Lots) -> bool {
        let v = lots.0;
        if v < self.volume_min || v > self.volume_max {
            return false;
        }
        let steps = (v - self.volume_min) / self.volume_step;
        (steps - steps.round()).abs() < 1e-7
    }
}

// ================================================================================================
// Orders & Positions
// ================================================================================================

/// What the strategy asks the broker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Open,
    Close,
}

/// Fill policy carried on the request; the simulated venue fills at the
/// current quote regardless, but the field round-trips into the ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FillingMode {
    #[default]
    Ioc,
    Fok,
    Return,
}

/// An order request as submitted by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub action: OrderAction,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: Lots,
    /// Requested price; informational in the simulation (fills at the quote).
    pub price: Price,
    pub sl: Option<Price>,
    pub tp: Option<Price>,
    /// Maximum acceptable slippage in points; informational in the simulation.
    pub deviation: u32,
    pub magic: Magic,
    pub comment: String,
    pub filling_mode: FillingMode,
}

/// Result of the pre-submit order validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderCheck {
    pub accepted: bool,
    pub retcode: Retcode,
    pub required_margin: f64,
    pub free_margin_after: f64,
}

/// An open position. Floating profit is computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: String,
    pub symbol_id: SymbolId,
    pub side: PositionSide,
    pub volume: Lots,
    pub open_price: Price,
    pub sl: Option<Price>,
    pub tp: Option<Price>,
    pub open_time_ms: i64,
    pub magic: Magic,
    pub comment: String,
    /// Margin reserved at open; released on close.
    pub margin: f64,
}

impl Position {
    pub fn open_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time_ms).unwrap()
    }

    /// Floating P&L against the given quote.
    ///
    /// Longs mark against `bid` (the exit side), shorts against `ask`.
    pub fn floating_profit(&self, bid: Price, ask: Price, contract_size: f64) -> f64 {
        let delta = match self.side {
            PositionSide::Buy => bid.0 - self.open_price.0,
            PositionSide::Sell => self.open_price.0 - ask.0,
        };
        delta * self.volume.0 * contract_size
    }
}

/// Ledger entry for a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: Lots,
    pub open_price: Price,
    pub close_price: Price,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub reason: CloseReason,
    /// Gross profit before commission.
    pub profit: f64,
    /// Commission charged on close (already signed, usually negative).
    pub commission: f64,
    pub magic: Magic,
    /// Compact validation-tag annotation captured at signal time.
    pub annotations: String,
}

impl TradeRecord {
    pub fn net_profit(&self) -> f64 {
        self.profit + self.commission
    }

    pub fn close_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.close_time_ms).unwrap()
    }
}

// ================================================================================================
// Calendar Helpers
// ================================================================================================

/// Enumerates the UTC days touched by `[start, end]`, inclusive of both
/// endpoint days.
pub fn days_in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start.date_naive();
    let last = end.date_naive();
    while day <= last {
        days.push(day);
        day = day.succ_opt().expect("date overflow");
    }
    days
}

/// Start of a UTC day as a millisecond instant.
pub fn day_start_ms(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
        .timestamp_millis()
}

/// Exclusive end of a UTC day as a millisecond instant.
pub fn day_end_ms(day: NaiveDate) -> i64 {
    day_start_ms(day) + Timeframe::D1.duration_ms()
}

#[cfg(test)]
mod test {
    use super::*;

    fn quote(time_ms: i64, bid: f64, ask: f64) -> Tick {
        Tick {
            time_ms,
            bid: Price(bid),
            ask: Price(ask),
            last: Price(0.0),
            volume: 0,
            flags: 0,
        }
    }

    #[test]
    fn align_is_left_inclusive_on_the_boundary() {
        // A tick exactly on a bar boundary belongs to the bar opening there.
        let boundary = 3 * Timeframe::M5.duration_ms();
        assert_eq!(Timeframe::M5.align_ms(boundary), boundary);
        assert_eq!(Timeframe::M5.align_ms(boundary + 1), boundary);
        assert_eq!(
            Timeframe::M5.align_ms(boundary - 1),
            boundary - Timeframe::M5.duration_ms()
        );
    }

    #[test]
    fn bar_price_prefers_last_over_bid() {
        let mut tick = quote(0, 1.0999, 1.1001);
        assert_eq!(tick.bar_price(), Price(1.0999), "pure quote uses bid");

        tick.last = Price(1.1000);
        assert_eq!(tick.bar_price(), Price(1.1000), "trade tick uses last");
    }

    #[test]
    fn absorb_updates_extremes_and_volume() {
        let t0 = quote(0, 1.10, 1.12);
        let mut bar = Bar::open_from_tick(0, &t0);

        bar.absorb(&quote(1, 1.15, 1.16));
        bar.absorb(&quote(2, 1.05, 1.06));

        assert_eq!(bar.open, Price(1.10));
        assert_eq!(bar.high, Price(1.15));
        assert_eq!(bar.low, Price(1.05));
        assert_eq!(bar.close, Price(1.05));
        assert_eq!(bar.tick_volume, 3);
    }

    #[test]
    fn volume_validation_honors_min_step_max() {
        let info = SymbolInfo {
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
        };

        assert!(info.volume_valid(Lots(0.01)));
        assert!(info.volume_valid(Lots(0.10)));
        assert!(!info.volume_valid(Lots(0.005)), "below minimum");
        assert!(!info.volume_valid(Lots(0.015)), "off the step grid");
        assert!(!info.volume_valid(Lots(150.0)), "above maximum");
    }

    #[test]
    fn floating_profit_marks_against_the_exit_side() {
        let long = Position {
            ticket: Ticket(1),
            symbol: "EURUSD".to_string(),
            symbol_id: SymbolId(0),
            side: PositionSide::Buy,
            volume: Lots(1.0),
            open_price: Price(1.1000),
            sl: None,
            tp: None,
            open_time_ms: 0,
            magic: Magic(7),
            comment: String::new(),
            margin: 1100.0,
        };

        // Long exits on the bid.
        let pnl = long.floating_profit(Price(1.1010), Price(1.1012), 100_000.0);
        assert!((pnl - 100.0).abs() < 1e-6);

        let short = Position {
            side: PositionSide::Sell,
            ..long
        };
        // Short exits on the ask.
        let pnl = short.floating_profit(Price(1.1010), Price(1.1012), 100_000.0);
        assert!((pnl + 120.0).abs() < 1e-6);
    }

    #[test]
    fn days_in_range_includes_both_endpoints() {
        let start = "2025-01-15T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2025-01-20T02:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let days = days_in_range(start, end);
        assert_eq!(days.len(), 6);
        assert_eq!(days[0].to_string(), "2025-01-15");
        assert_eq!(days[5].to_string(), "2025-01-20");
    }
}

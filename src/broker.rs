pub mod position;

use std::{
    collections::HashMap,
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    domain::{
        CloseReason, Lots, Magic, OrderCheck, OrderRequest, Position, PositionSide, Price,
        Retcode, SymbolId, SymbolInfo, Tick, Ticket, TradeRecord,
    },
    error::{BrokerError, RewindResult},
};
use position::PositionBook;

/// Last quote observed per symbol.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub time_ms: i64,
    pub bid: Price,
    pub ask: Price,
}

/// Snapshot filter for [`SimBroker::positions`].
#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub symbol: Option<String>,
    pub magic: Option<Magic>,
}

/// Result of an order submission: the check that was run, and the ticket
/// when the check accepted.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    pub check: OrderCheck,
    pub ticket: Option<Ticket>,
}

struct BrokerState {
    balance: f64,
    book: PositionBook,
    quotes: Vec<Option<Quote>>,
    annotations: HashMap<Ticket, String>,
    next_ticket: u64,
    /// Every settlement in order, drained by the recorder once per step so
    /// closes from any path (scan, manual, monitor, margin call) reach the
    /// ledger exactly once.
    closed_log: Vec<TradeRecord>,
}

// ================================================================================================
// SimBroker
// ================================================================================================

/// The simulated venue: order validation and margin, the position table, the
/// intra-tick SL/TP scan, and account equity.
///
/// All mutation is serialized by one mutex; every read returns copies, so
/// strategy threads never observe a half-applied transition. Floating P&L is
/// recomputed on demand and never stored per tick.
pub struct SimBroker {
    state: Mutex<BrokerState>,
    /// Contract specifications, indexed by [`SymbolId`]. Immutable after
    /// construction.
    symbols: Vec<SymbolInfo>,
    symbol_ids: HashMap<String, SymbolId>,
    leverage: f64,
    commission_per_lot: f64,
    max_positions: usize,
}

impl SimBroker {
    pub fn new(
        symbols: Vec<SymbolInfo>,
        initial_balance: f64,
        leverage: f64,
        commission_per_lot: f64,
        max_positions: usize,
    ) -> Self {
        let symbol_ids = symbols
            .iter()
            .enumerate()
            .map(|(idx, info)| (info.name.clone(), SymbolId(idx)))
            .collect();
        let quotes = vec![None; symbols.len()];
        Self {
            state: Mutex::new(BrokerState {
                balance: initial_balance,
                book: PositionBook::default(),
                quotes,
                annotations: HashMap::new(),
                next_ticket: 1,
                closed_log: Vec::new(),
            }),
            symbols,
            symbol_ids,
            leverage,
            commission_per_lot,
            max_positions,
        }
    }

    pub fn symbol_id(&self, symbol: &str) -> Option<SymbolId> {
        self.symbol_ids.get(symbol).copied()
    }

    pub fn symbol_info(&self, symbol_id: SymbolId) -> &SymbolInfo {
        &self.symbols[symbol_id.0]
    }

    // ============================================================================================
    // Order Validation
    // ============================================================================================

    /// Mirrors a venue `order_check`: margin, stops distance, volume grid,
    /// trade mode, position cap. Pure query; mutates nothing.
    pub fn check(&self, request: &OrderRequest) -> OrderCheck {
        let state = self.state.lock().expect("broker state poisoned");
        self.check_locked(&state, request)
    }

    fn check_locked(&self, state: &BrokerState, request: &OrderRequest) -> OrderCheck {
        let rejected = |retcode| OrderCheck {
            accepted: false,
            retcode,
            required_margin: 0.0,
            free_margin_after: 0.0,
        };

        let Some(symbol_id) = self.symbol_id(&request.symbol) else {
            return rejected(Retcode::UnknownSymbol);
        };
        let info = &self.symbols[symbol_id.0];

        if !info.trade_mode.allows(request.side) {
            return rejected(Retcode::TradeDisabled);
        }
        if !info.volume_valid(request.volume) {
            return rejected(Retcode::InvalidVolume);
        }
        if state.book.len() >= self.max_positions {
            return rejected(Retcode::MaxPositions);
        }

        let Some(quote) = state.quotes[symbol_id.0] else {
            // No market yet; treat as a stops violation the strategy can
            // retry once data flows.
            return rejected(Retcode::InvalidStops);
        };
        let entry = match request.side {
            PositionSide::Buy => quote.ask,
            PositionSide::Sell => quote.bid,
        };
        if !stops_valid(info, request.side, entry, request.sl, request.tp) {
            return rejected(Retcode::InvalidStops);
        }

        let required_margin = self.margin_for(info, request.volume, entry);
        let equity = self.equity_locked(state);
        let used = used_margin_locked(state);
        let free_after = equity - used - required_margin;
        if free_after < 0.0 {
            return OrderCheck {
                accepted: false,
                retcode: Retcode::NoMoney,
                required_margin,
                free_margin_after: free_after,
            };
        }

        OrderCheck {
            accepted: true,
            retcode: Retcode::Done,
            required_margin,
            free_margin_after: free_after,
        }
    }

    fn margin_for(&self, info: &SymbolInfo, volume: Lots, price: Price) -> f64 {
        volume.0 * info.contract_size * price.0 / self.leverage
    }

    // ============================================================================================
    // Submit / Close / Modify
    // ============================================================================================

    /// Validates and opens a position at the current quote. The rejection
    /// retcode flows back to the strategy; nothing is retried silently.
    pub fn submit(&self, request: &OrderRequest) -> SubmitOutcome {
        self.submit_annotated(request, String::new())
    }

    /// As [`SimBroker::submit`], carrying the signal-validation tag string
    /// that will annotate the eventual trade record.
    pub fn submit_annotated(&self, request: &OrderRequest, annotations: String) -> SubmitOutcome {
        let mut state = self.state.lock().expect("broker state poisoned");
        let check = self.check_locked(&state, request);
        if !check.accepted {
            debug!(symbol = %request.symbol, retcode = %check.retcode, "Order rejected");
            return SubmitOutcome {
                check,
                ticket: None,
            };
        }

        let symbol_id = self.symbol_id(&request.symbol).expect("checked above");
        let quote = state.quotes[symbol_id.0].expect("checked above");
        let entry = match request.side {
            PositionSide::Buy => quote.ask,
            PositionSide::Sell => quote.bid,
        };

        let ticket = Ticket(state.next_ticket);
        state.next_ticket += 1;
        let position = Position {
            ticket,
            symbol: request.symbol.clone(),
            symbol_id,
            side: request.side,
            volume: request.volume,
            open_price: entry,
            sl: request.sl,
            tp: request.tp,
            open_time_ms: quote.time_ms,
            magic: request.magic,
            comment: request.comment.clone(),
            margin: check.required_margin,
        };
        state.book.insert(position);
        if !annotations.is_empty() {
            state.annotations.insert(ticket, annotations);
        }
        debug!(%ticket, symbol = %request.symbol, side = %request.side, price = entry.0, "Position opened");
        SubmitOutcome {
            check,
            ticket: Some(ticket),
        }
    }

    /// Closes a position at the current quote for its symbol.
    pub fn close(&self, ticket: Ticket, reason: CloseReason) -> RewindResult<TradeRecord> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let position = state
            .book
            .get(ticket)
            .cloned()
            .ok_or(BrokerError::UnknownTicket(ticket.0))?;
        let quote = state.quotes[position.symbol_id.0]
            .ok_or_else(|| BrokerError::UnknownSymbol(position.symbol.clone()))?;
        let close_price = match position.side {
            PositionSide::Buy => quote.bid,
            PositionSide::Sell => quote.ask,
        };
        Ok(self.settle(&mut state, position, close_price, quote.time_ms, reason))
    }

    /// Adjusts SL/TP on an open position, re-validating the stops distance
    /// against the current quote. Used by the position monitor for breakeven
    /// and trailing behavior.
    pub fn modify_stops(
        &self,
        ticket: Ticket,
        sl: Option<Price>,
        tp: Option<Price>,
    ) -> RewindResult<Retcode> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let Some(position) = state.book.get(ticket) else {
            return Err(BrokerError::UnknownTicket(ticket.0).into());
        };
        let symbol_id = position.symbol_id;
        let side = position.side;
        let info = &self.symbols[symbol_id.0];

        let Some(quote) = state.quotes[symbol_id.0] else {
            return Ok(Retcode::InvalidStops);
        };
        // Stops move against the market price, not the open price.
        let market = match side {
            PositionSide::Buy => quote.bid,
            PositionSide::Sell => quote.ask,
        };
        if !stops_valid(info, side, market, sl, tp) {
            return Ok(Retcode::InvalidStops);
        }

        let position = state.book.get_mut(ticket).expect("present above");
        position.sl = sl;
        position.tp = tp;
        Ok(Retcode::Done)
    }

    // ============================================================================================
    // Tick Path
    // ============================================================================================

    /// Processes one tick: refreshes the symbol quote and runs the SL/TP
    /// scan over positions indexed under that symbol only. Returns the
    /// positions closed by this call.
    ///
    /// When both levels are crossed within the same tick, the stop wins.
    pub fn on_tick(&self, symbol_id: SymbolId, tick: &Tick) -> Vec<TradeRecord> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let info = &self.symbols[symbol_id.0];

        let (bid, ask) = effective_quote(info, tick);
        state.quotes[symbol_id.0] = Some(Quote {
            time_ms: tick.time_ms,
            bid,
            ask,
        });

        let mut closed = Vec::new();
        for ticket in state.book.tickets_for(symbol_id) {
            let Some(position) = state.book.get(ticket) else {
                continue;
            };
            let hit = match position.side {
                PositionSide::Buy => {
                    // Long exits on the bid; SL before TP on a tie.
                    if position.sl.is_some_and(|sl| bid.0 <= sl.0) {
                        Some(CloseReason::Sl)
                    } else if position.tp.is_some_and(|tp| bid.0 >= tp.0) {
                        Some(CloseReason::Tp)
                    } else {
                        None
                    }
                }
                PositionSide::Sell => {
                    // Short exits on the ask.
                    if position.sl.is_some_and(|sl| ask.0 >= sl.0) {
                        Some(CloseReason::Sl)
                    } else if position.tp.is_some_and(|tp| ask.0 <= tp.0) {
                        Some(CloseReason::Tp)
                    } else {
                        None
                    }
                }
            };

            if let Some(reason) = hit {
                let position = state.book.get(ticket).expect("present above").clone();
                let close_price = match position.side {
                    PositionSide::Buy => bid,
                    PositionSide::Sell => ask,
                };
                closed.push(self.settle(&mut state, position, close_price, tick.time_ms, reason));
            }
        }
        closed
    }

    fn settle(
        &self,
        state: &mut BrokerState,
        position: Position,
        close_price: Price,
        close_time_ms: i64,
        reason: CloseReason,
    ) -> TradeRecord {
        let info = &self.symbols[position.symbol_id.0];
        let delta = match position.side {
            PositionSide::Buy => close_price.0 - position.open_price.0,
            PositionSide::Sell => position.open_price.0 - close_price.0,
        };
        let profit = delta * position.volume.0 * info.contract_size;
        let commission = -self.commission_per_lot * position.volume.0;

        state.balance += profit + commission;
        state.book.remove(position.ticket);
        let annotations = state
            .annotations
            .remove(&position.ticket)
            .unwrap_or_default();

        debug!(
            ticket = %position.ticket,
            symbol = %position.symbol,
            %reason,
            profit,
            "Position closed"
        );
        let record = TradeRecord {
            ticket: position.ticket,
            symbol: position.symbol,
            side: position.side,
            volume: position.volume,
            open_price: position.open_price,
            close_price,
            open_time_ms: position.open_time_ms,
            close_time_ms,
            reason,
            profit,
            commission,
            magic: position.magic,
            annotations,
        };
        state.closed_log.push(record.clone());
        record
    }

    /// Hands out the settlements accumulated since the previous drain, in
    /// close order.
    pub fn drain_closed(&self) -> Vec<TradeRecord> {
        let mut state = self.state.lock().expect("broker state poisoned");
        std::mem::take(&mut state.closed_log)
    }

    /// Force-closes the open position with the worst floating P&L, the
    /// margin-call action. `None` when the book is empty or no symbol has a
    /// quote yet.
    pub fn force_close_worst(&self) -> Option<TradeRecord> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let worst = state
            .book
            .iter()
            .filter_map(|p| {
                let quote = state.quotes[p.symbol_id.0]?;
                let info = &self.symbols[p.symbol_id.0];
                let float = p.floating_profit(quote.bid, quote.ask, info.contract_size);
                Some((p.ticket, float, quote))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).expect("finite floats"))?;

        let (ticket, float, quote) = worst;
        warn!(%ticket, floating = float, "Margin call: force-closing worst position");
        let position = state.book.get(ticket)?.clone();
        let close_price = match position.side {
            PositionSide::Buy => quote.bid,
            PositionSide::Sell => quote.ask,
        };
        Some(self.settle(
            &mut state,
            position,
            close_price,
            quote.time_ms,
            CloseReason::MarginCall,
        ))
    }

    // ============================================================================================
    // Account Queries
    // ============================================================================================

    pub fn balance(&self) -> f64 {
        self.state.lock().expect("broker state poisoned").balance
    }

    /// Balance plus floating P&L over all open positions at current quotes.
    pub fn equity(&self) -> f64 {
        let state = self.state.lock().expect("broker state poisoned");
        self.equity_locked(&state)
    }

    fn equity_locked(&self, state: &BrokerState) -> f64 {
        let floating: f64 = state
            .book
            .iter()
            .map(|p| match state.quotes[p.symbol_id.0] {
                Some(quote) => {
                    let info = &self.symbols[p.symbol_id.0];
                    p.floating_profit(quote.bid, quote.ask, info.contract_size)
                }
                // No quote yet: mark at open, zero float.
                None => 0.0,
            })
            .sum();
        state.balance + floating
    }

    pub fn used_margin(&self) -> f64 {
        let state = self.state.lock().expect("broker state poisoned");
        used_margin_locked(&state)
    }

    pub fn free_margin(&self) -> f64 {
        let state = self.state.lock().expect("broker state poisoned");
        self.equity_locked(&state) - used_margin_locked(&state)
    }

    /// Equity / used margin, percent. `None` with no margin in use.
    pub fn margin_level(&self) -> Option<f64> {
        let state = self.state.lock().expect("broker state poisoned");
        let used = used_margin_locked(&state);
        (used > 0.0).then(|| self.equity_locked(&state) / used * 100.0)
    }

    /// Snapshot copies of open positions, sorted by ticket.
    pub fn positions(&self, filter: &PositionFilter) -> Vec<Position> {
        let state = self.state.lock().expect("broker state poisoned");
        let mut out: Vec<Position> = state
            .book
            .iter()
            .filter(|p| {
                filter
                    .symbol
                    .as_ref()
                    .is_none_or(|symbol| &p.symbol == symbol)
                    && filter.magic.is_none_or(|magic| p.magic == magic)
            })
            .cloned()
            .collect();
        out.sort_by_key(|p| p.ticket);
        out
    }

    pub fn open_position_count(&self) -> usize {
        self.state.lock().expect("broker state poisoned").book.len()
    }

    pub fn last_quote(&self, symbol_id: SymbolId) -> Option<Quote> {
        self.state.lock().expect("broker state poisoned").quotes[symbol_id.0]
    }
}

fn used_margin_locked(state: &BrokerState) -> f64 {
    state.book.iter().map(|p| p.margin).sum()
}

/// Real bid/ask when the feed carries them, otherwise a static spread from
/// the contract specification applied around `last`.
fn effective_quote(info: &SymbolInfo, tick: &Tick) -> (Price, Price) {
    if tick.bid.0 > 0.0 && tick.ask.0 > 0.0 {
        (tick.bid, tick.ask)
    } else {
        let half_spread = info.spread_points as f64 * info.point() / 2.0;
        let mid = if tick.last.0 > 0.0 { tick.last.0 } else { tick.bid.0 };
        (Price(mid - half_spread), Price(mid + half_spread))
    }
}

/// Stop legs must sit on the correct side of the entry and outside the
/// symbol's stops level. Distances exactly at the level pass (closed
/// interval).
fn stops_valid(
    info: &SymbolInfo,
    side: PositionSide,
    entry: Price,
    sl: Option<Price>,
    tp: Option<Price>,
) -> bool {
    let min_distance = info.stops_distance();
    let leg_ok = |level: Price, below_entry: bool| {
        let distance = if below_entry {
            entry.0 - level.0
        } else {
            level.0 - entry.0
        };
        distance >= min_distance && distance > 0.0
    };
    match side {
        PositionSide::Buy => {
            sl.is_none_or(|sl| leg_ok(sl, true)) && tp.is_none_or(|tp| leg_ok(tp, false))
        }
        PositionSide::Sell => {
            sl.is_none_or(|sl| leg_ok(sl, false)) && tp.is_none_or(|tp| leg_ok(tp, true))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::domain::{FillingMode, OrderAction, TradeMode};

    fn eurusd() -> SymbolInfo {
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

    fn broker() -> SimBroker {
        SimBroker::new(vec![eurusd()], 10_000.0, 100.0, 0.0, 200)
    }

    fn tick(time_ms: i64, bid: f64, ask: f64) -> Tick {
        Tick {
            time_ms,
            bid: Price(bid),
            ask: Price(ask),
            last: Price(0.0),
            volume: 0,
            flags: 0,
        }
    }

    fn buy_request(volume: f64, sl: Option<f64>, tp: Option<f64>) -> OrderRequest {
        OrderRequest {
            action: OrderAction::Open,
            symbol: "EURUSD".to_string(),
            side: PositionSide::Buy,
            volume: Lots(volume),
            price: Price(0.0),
            sl: sl.map(Price),
            tp: tp.map(Price),
            deviation: 10,
            magic: Magic(42),
            comment: String::new(),
            filling_mode: FillingMode::Ioc,
        }
    }

    fn open_long(broker: &SimBroker, sl: Option<f64>, tp: Option<f64>) -> Ticket {
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));
        let outcome = broker.submit(&buy_request(1.0, sl, tp));
        assert_eq!(outcome.check.retcode, Retcode::Done);
        outcome.ticket.unwrap()
    }

    #[test]
    fn submit_fills_at_the_ask_and_reserves_margin() {
        let broker = broker();
        let ticket = open_long(&broker, None, None);

        let positions = broker.positions(&PositionFilter::default());
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, ticket);
        assert_eq!(positions[0].open_price, Price(1.1000), "long fills at ask");
        // 1 lot * 100_000 * 1.10 / 100 = 1100.
        assert!((broker.used_margin() - 1_100.0).abs() < 1e-9);
    }

    #[test]
    fn insufficient_margin_is_rejected_with_no_money() {
        let broker = SimBroker::new(vec![eurusd()], 100.0, 100.0, 0.0, 200);
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));

        let outcome = broker.submit(&buy_request(1.0, None, None));
        assert_eq!(outcome.check.retcode, Retcode::NoMoney);
        assert!(outcome.ticket.is_none());
        assert!(outcome.check.free_margin_after < 0.0);
    }

    #[test]
    fn stops_inside_the_stops_level_are_rejected() {
        let broker = broker();
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));

        // Stops level 10 points = 0.0001; SL only 0.00005 below the ask.
        let outcome = broker.submit(&buy_request(0.1, Some(1.09995), None));
        assert_eq!(outcome.check.retcode, Retcode::InvalidStops);

        // Exactly at the level passes (closed interval).
        let outcome = broker.submit(&buy_request(0.1, Some(1.0999), None));
        assert_eq!(outcome.check.retcode, Retcode::Done);
    }

    #[test]
    fn off_grid_volume_is_rejected() {
        let broker = broker();
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));
        let outcome = broker.submit(&buy_request(0.015, None, None));
        assert_eq!(outcome.check.retcode, Retcode::InvalidVolume);
    }

    #[test]
    fn long_sl_hits_on_bid_and_closes_at_bid() {
        let broker = broker();
        open_long(&broker, Some(1.0990), Some(1.1010));

        // Bid drops through the stop.
        let closed = broker.on_tick(SymbolId(0), &tick(2_000, 1.0989, 1.0991));
        assert_eq!(closed.len(), 1);
        let record = &closed[0];
        assert_eq!(record.reason, CloseReason::Sl);
        assert_eq!(record.close_price, Price(1.0989));
        assert_eq!(record.close_time_ms, 2_000);
        assert!(record.profit < 0.0);
        assert_eq!(broker.open_position_count(), 0);
    }

    #[test]
    fn exact_touch_of_the_stop_counts_as_a_hit() {
        let broker = broker();
        open_long(&broker, Some(1.0990), Some(1.1010));

        // bid == sl: the interval is closed, and the stop leg is evaluated
        // before the take leg.
        let closed = broker.on_tick(SymbolId(0), &tick(2_000, 1.0990, 1.0992));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::Sl);
        assert_eq!(closed[0].close_price, Price(1.0990));
    }

    #[test]
    fn short_sl_hits_on_ask() {
        let broker = broker();
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));
        let request = OrderRequest {
            side: PositionSide::Sell,
            sl: Some(Price(1.1010)),
            tp: Some(Price(1.0980)),
            ..buy_request(1.0, None, None)
        };
        let outcome = broker.submit(&request);
        assert_eq!(outcome.check.retcode, Retcode::Done);

        // Ask rallies through the short's stop.
        let closed = broker.on_tick(SymbolId(0), &tick(2_000, 1.1009, 1.1011));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::Sl);
        assert_eq!(closed[0].close_price, Price(1.1011), "short exits at ask");
    }

    #[test]
    fn equity_equals_balance_plus_floating() {
        let broker = broker();
        open_long(&broker, None, None);

        broker.on_tick(SymbolId(0), &tick(2_000, 1.1049, 1.1051));
        // Long marks at bid: (1.1049 - 1.1000) * 100_000 = 490.
        assert!((broker.equity() - 10_490.0).abs() < 1e-6);
        assert!((broker.balance() - 10_000.0).abs() < 1e-9, "balance moves only on close");
    }

    #[test]
    fn manual_close_realizes_profit_into_balance() {
        let broker = broker();
        let ticket = open_long(&broker, None, None);
        broker.on_tick(SymbolId(0), &tick(2_000, 1.1049, 1.1051));

        let record = broker.close(ticket, CloseReason::Manual).unwrap();
        assert!((record.profit - 490.0).abs() < 1e-6);
        assert!((broker.balance() - 10_490.0).abs() < 1e-6);

        let err = broker.close(ticket, CloseReason::Manual).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RewindError::Broker(BrokerError::UnknownTicket(_))
        ));
    }

    #[test]
    fn commission_is_charged_per_lot_on_close() {
        let broker = SimBroker::new(vec![eurusd()], 10_000.0, 100.0, 7.0, 200);
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));
        let ticket = broker.submit(&buy_request(2.0, None, None)).ticket.unwrap();

        let record = broker.close(ticket, CloseReason::Manual).unwrap();
        assert!((record.commission + 14.0).abs() < 1e-9);
        assert!((record.net_profit() - (record.profit - 14.0)).abs() < 1e-9);
    }

    #[test]
    fn modify_stops_revalidates_against_the_market() {
        let broker = broker();
        let ticket = open_long(&broker, None, None);

        // Market bid 1.0999; a stop at 1.0998 sits inside the 10-point level.
        let retcode = broker
            .modify_stops(ticket, Some(Price(1.0998)), None)
            .unwrap();
        assert_eq!(retcode, Retcode::InvalidStops);

        let retcode = broker
            .modify_stops(ticket, Some(Price(1.0990)), Some(Price(1.1100)))
            .unwrap();
        assert_eq!(retcode, Retcode::Done);
        let positions = broker.positions(&PositionFilter::default());
        assert_eq!(positions[0].sl, Some(Price(1.0990)));
    }

    #[test]
    fn force_close_picks_the_worst_floating_position() {
        let broker = broker();
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));
        let opened_high = broker.submit(&buy_request(0.1, None, None)).ticket.unwrap();
        broker.on_tick(SymbolId(0), &tick(2_000, 1.0899, 1.0900));
        let opened_low = broker.submit(&buy_request(0.1, None, None)).ticket.unwrap();

        // Both longs are under water; the one opened at 1.1000 is deeper.
        broker.on_tick(SymbolId(0), &tick(3_000, 1.0849, 1.0850));

        let record = broker.force_close_worst().unwrap();
        assert_eq!(record.ticket, opened_high, "position opened at 1.1000 loses most");
        assert_eq!(record.reason, CloseReason::MarginCall);
        assert_eq!(broker.open_position_count(), 1);
        let remaining = broker.positions(&PositionFilter::default());
        assert_eq!(remaining[0].ticket, opened_low);
    }

    #[test]
    fn synthetic_spread_applies_when_feed_has_no_quotes() {
        let broker = broker();
        // Trade-only tick: last set, bid/ask zero.
        let trade_tick = Tick {
            time_ms: 1_000,
            bid: Price(0.0),
            ask: Price(0.0),
            last: Price(1.1000),
            volume: 10,
            flags: 0,
        };
        broker.on_tick(SymbolId(0), &trade_tick);
        let quote = broker.last_quote(SymbolId(0)).unwrap();
        // 10 points spread at 5 digits = 0.0001, half on each side.
        assert!((quote.bid.0 - 1.09995).abs() < 1e-9);
        assert!((quote.ask.0 - 1.10005).abs() < 1e-9);
    }

    #[test]
    fn position_filter_by_symbol_and_magic() {
        let broker = SimBroker::new(
            vec![eurusd(), SymbolInfo {
                name: "GBPUSD".to_string(),
                ..eurusd()
            }],
            100_000.0,
            100.0,
            0.0,
            200,
        );
        broker.on_tick(SymbolId(0), &tick(1_000, 1.0999, 1.1000));
        broker.on_tick(SymbolId(1), &tick(1_000, 1.2999, 1.3000));

        broker.submit(&buy_request(0.1, None, None));
        let mut gbp = buy_request(0.1, None, None);
        gbp.symbol = "GBPUSD".to_string();
        gbp.magic = Magic(7);
        broker.submit(&gbp);

        let eur_only = broker.positions(&PositionFilter {
            symbol: Some("EURUSD".to_string()),
            magic: None,
        });
        assert_eq!(eur_only.len(), 1);

        let magic7 = broker.positions(&PositionFilter {
            symbol: None,
            magic: Some(Magic(7)),
        });
        assert_eq!(magic7.len(), 1);
        assert_eq!(magic7[0].symbol, "GBPUSD");
    }
}

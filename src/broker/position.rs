use std::collections::{BTreeSet, HashMap};

use crate::domain::{Position, SymbolId, Ticket};

/// The broker's position table and its per-symbol index, mutated in
/// lock-step under the broker lock.
///
/// `by_symbol` uses `BTreeSet` so the intra-tick SL/TP scan walks tickets in
/// a deterministic order independent of hasher state.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<Ticket, Position>,
    by_symbol: HashMap<SymbolId, BTreeSet<Ticket>>,
}

impl PositionBook {
    pub fn insert(&mut self, position: Position) {
        let ticket = position.ticket;
        let symbol_id = position.symbol_id;
        self.positions.insert(ticket, position);
        self.by_symbol.entry(symbol_id).or_default().insert(ticket);
        self.debug_check();
    }

    pub fn remove(&mut self, ticket: Ticket) -> Option<Position> {
        let position = self.positions.remove(&ticket)?;
        if let Some(tickets) = self.by_symbol.get_mut(&position.symbol_id) {
            tickets.remove(&ticket);
            if tickets.is_empty() {
                self.by_symbol.remove(&position.symbol_id);
            }
        }
        self.debug_check();
        Some(position)
    }

    pub fn get(&self, ticket: Ticket) -> Option<&Position> {
        self.positions.get(&ticket)
    }

    pub fn get_mut(&mut self, ticket: Ticket) -> Option<&mut Position> {
        self.positions.get_mut(&ticket)
    }

    /// Tickets open under one symbol, in ascending ticket order.
    pub fn tickets_for(&self, symbol_id: SymbolId) -> Vec<Ticket> {
        self.by_symbol
            .get(&symbol_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Index invariant: `positions.keys() == union(by_symbol.values())`, and
    /// every indexed ticket points at a position under the same symbol.
    /// Checked on every mutation in debug builds.
    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        {
            let indexed: usize = self.by_symbol.values().map(BTreeSet::len).sum();
            debug_assert_eq!(indexed, self.positions.len(), "index cardinality drifted");
            for (symbol_id, tickets) in &self.by_symbol {
                for ticket in tickets {
                    let position = self
                        .positions
                        .get(ticket)
                        .expect("indexed ticket without position");
                    debug_assert_eq!(
                        position.symbol_id, *symbol_id,
                        "ticket indexed under the wrong symbol"
                    );
                }
            }
        }
    }
}

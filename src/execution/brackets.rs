use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::models::{Direction, OrderRef, Symbol};

/// What this process placed for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct BracketRecord {
    pub direction: Direction,
    pub placed_at: DateTime<Utc>,
    pub orders: Vec<OrderRef>,
}

/// In-memory record of entries and their TP/SL orders
///
/// Written by the reconciler, read and pruned by the sweeper. Clones share
/// the same map. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct BracketRegistry {
    inner: Arc<Mutex<HashMap<Symbol, BracketRecord>>>,
}

impl BracketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Symbol, BracketRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Note an entry about to be submitted; replaces any older record
    pub fn record_entry(&self, symbol: &Symbol, direction: Direction, at: DateTime<Utc>) {
        self.lock().insert(
            symbol.clone(),
            BracketRecord {
                direction,
                placed_at: at,
                orders: Vec::new(),
            },
        );
    }

    pub fn add_order(&self, order: OrderRef) {
        if let Some(record) = self.lock().get_mut(&order.symbol) {
            record.orders.push(order);
        }
    }

    pub fn get(&self, symbol: &Symbol) -> Option<BracketRecord> {
        self.lock().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.lock().keys().cloned().collect()
    }

    /// True when this process entered `symbol` in `direction` less than
    /// `grace` ago; covers the window where the exchange does not list the
    /// new position yet.
    pub fn entered_within(
        &self,
        symbol: &Symbol,
        direction: Direction,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> bool {
        self.lock()
            .get(symbol)
            .map_or(false, |r| r.direction == direction && !elapsed(r.placed_at, now, grace))
    }

    /// Drop the record unless it was replaced by a newer entry meanwhile
    pub fn remove_if_placed_at(&self, symbol: &Symbol, placed_at: DateTime<Utc>) -> bool {
        let mut map = self.lock();
        match map.get(symbol) {
            Some(r) if r.placed_at == placed_at => {
                map.remove(symbol);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// `now - since >= period`; a timestamp in the future has not elapsed
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>, period: Duration) -> bool {
    match (now - since).to_std() {
        Ok(age) => age >= period,
        Err(_) => false,
    }
}

//! In-memory exchange for reconciler and sweeper tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{MarketData, OrderExecution};
use crate::error::ExchangeError;
use crate::models::{
    Instrument, MarginMode, Order, OrderKind, OrderRef, OrderResult, OrderStatus, Position, Side,
    Symbol, TriggerOrder,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderCall {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub margin_mode: MarginMode,
}

#[derive(Default)]
pub struct FakeState {
    pub prices: HashMap<Symbol, Decimal>,
    pub instruments: HashMap<Symbol, Instrument>,
    pub positions: Vec<Position>,
    pub open_orders: Vec<Order>,

    pub leverage: HashMap<Symbol, u32>,
    pub market_orders: Vec<MarketOrderCall>,
    pub trigger_orders: Vec<TriggerOrder>,
    pub cancelled: Vec<OrderRef>,
    pub position_reads: usize,
    pub order_reads: usize,

    /// Returned by the next market order instead of a fill
    pub market_error: Option<ExchangeError>,
    /// Next market order closes with this status and no fill
    pub entry_status: Option<OrderStatus>,
    /// Returned by every trigger order of this kind
    pub trigger_error: Option<(OrderKind, ExchangeError)>,
    /// Upcoming `open_positions` calls that fail with a transport error
    pub position_failures: usize,
    /// Upcoming `open_trigger_orders` calls that see an empty book
    pub hidden_order_reads: usize,
    /// Upcoming cancels that fail with a transport error
    pub cancel_failures: usize,
    /// Market fills report neither price nor size
    pub fill_without_details: bool,
    /// Market fills do not show up in `open_positions`
    pub fill_invisible: bool,
    /// Timestamp stamped on trigger orders placed through the fake
    pub order_time: Option<DateTime<Utc>>,

    next_id: u64,
}

impl FakeState {
    fn next_ref(&mut self, symbol: &Symbol) -> OrderRef {
        self.next_id += 1;
        OrderRef {
            symbol: symbol.clone(),
            id: self.next_id.to_string(),
        }
    }
}

#[derive(Default)]
pub struct FakeExchange {
    state: Mutex<FakeState>,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_market(self, symbol: &Symbol, price: Decimal, instrument: Instrument) -> Self {
        {
            let mut state = self.state();
            state.prices.insert(symbol.clone(), price);
            state.instruments.insert(symbol.clone(), instrument);
        }
        self
    }

    pub fn add_position(&self, position: Position) {
        self.state().positions.push(position);
    }

    pub fn close_position(&self, symbol: &Symbol) {
        self.state().positions.retain(|p| &p.symbol != symbol);
    }

    /// Seed a pending trigger order, as if left behind by an earlier run
    pub fn add_trigger_order(
        &self,
        symbol: &Symbol,
        kind: OrderKind,
        reduce_only: bool,
        created_at: Option<DateTime<Utc>>,
    ) -> OrderRef {
        let mut state = self.state();
        let order = state.next_ref(symbol);
        state.open_orders.push(Order {
            order: order.clone(),
            side: Side::Sell,
            kind,
            size: Decimal::ONE,
            trigger_price: Some(Decimal::ONE),
            reduce_only,
            created_at,
        });
        order
    }
}

#[async_trait]
impl MarketData for FakeExchange {
    async fn last_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        self.state()
            .prices
            .get(symbol)
            .copied()
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| ExchangeError::PriceUnavailable(symbol.clone()))
    }

    async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let mut state = self.state();
        state.position_reads += 1;
        if state.position_failures > 0 {
            state.position_failures -= 1;
            return Err(ExchangeError::Transport("connection reset".to_string()));
        }
        Ok(state.positions.clone())
    }

    async fn instrument(&self, symbol: &Symbol) -> Result<Instrument, ExchangeError> {
        self.state()
            .instruments
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: "Invalid symbol.".to_string(),
            })
    }

    async fn open_trigger_orders(
        &self,
        symbol: Option<&Symbol>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let mut state = self.state();
        state.order_reads += 1;
        if state.hidden_order_reads > 0 {
            state.hidden_order_reads -= 1;
            return Ok(Vec::new());
        }
        Ok(state
            .open_orders
            .iter()
            .filter(|o| o.kind.is_trigger())
            .filter(|o| symbol.map_or(true, |s| &o.order.symbol == s))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderExecution for FakeExchange {
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        self.state().leverage.insert(symbol.clone(), leverage);
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        margin_mode: MarginMode,
    ) -> Result<OrderResult, ExchangeError> {
        let mut state = self.state();
        state.market_orders.push(MarketOrderCall {
            symbol: symbol.clone(),
            side,
            size,
            margin_mode,
        });
        if let Some(e) = state.market_error.take() {
            return Err(e);
        }
        if let Some(status) = state.entry_status.take() {
            let order = state.next_ref(symbol);
            return Ok(OrderResult {
                order,
                status,
                avg_price: None,
                executed_size: Decimal::ZERO,
            });
        }

        let price = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::PriceUnavailable(symbol.clone()))?;

        if !state.fill_invisible {
            state.positions.push(Position {
                symbol: symbol.clone(),
                direction: match side {
                    Side::Buy => crate::models::Direction::Long,
                    Side::Sell => crate::models::Direction::Short,
                },
                margin_mode,
                size,
                entry_price: price,
            });
        }

        let order = state.next_ref(symbol);
        Ok(if state.fill_without_details {
            OrderResult {
                order,
                status: OrderStatus::New,
                avg_price: None,
                executed_size: Decimal::ZERO,
            }
        } else {
            OrderResult {
                order,
                status: OrderStatus::Filled,
                avg_price: Some(price),
                executed_size: size,
            }
        })
    }

    async fn place_trigger_order(
        &self,
        order: &TriggerOrder,
    ) -> Result<OrderResult, ExchangeError> {
        let mut state = self.state();
        state.trigger_orders.push(order.clone());
        if let Some((kind, e)) = &state.trigger_error {
            if *kind == order.kind {
                return Err(e.clone());
            }
        }

        let order_ref = state.next_ref(&order.symbol);
        let created_at = state.order_time;
        state.open_orders.push(Order {
            order: order_ref.clone(),
            side: order.side,
            kind: order.kind,
            size: order.size,
            trigger_price: Some(order.trigger_price),
            reduce_only: order.reduce_only,
            created_at,
        });

        Ok(OrderResult {
            order: order_ref,
            status: OrderStatus::New,
            avg_price: None,
            executed_size: Decimal::ZERO,
        })
    }

    async fn cancel_order(&self, order: &OrderRef) -> Result<bool, ExchangeError> {
        let mut state = self.state();
        if state.cancel_failures > 0 {
            state.cancel_failures -= 1;
            return Err(ExchangeError::Transport("timeout".to_string()));
        }

        let before = state.open_orders.len();
        state.open_orders.retain(|o| &o.order != order);
        if state.open_orders.len() == before {
            return Ok(false);
        }
        state.cancelled.push(order.clone());
        Ok(true)
    }
}

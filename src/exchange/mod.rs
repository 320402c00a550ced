// Exchange gateways: read-only market data and order execution
pub mod binance;
pub mod normalize;

#[cfg(test)]
pub mod fake;

pub use binance::{BinanceClient, BinanceConfig};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ExchangeError;
use crate::models::{
    Instrument, MarginMode, Order, OrderRef, OrderResult, Position, Side, Symbol, TriggerOrder,
};

/// Read-only exchange calls
///
/// Implementations return fully normalized models; callers never see the
/// exchange's own field names or symbol spellings.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Fails with [`ExchangeError::PriceUnavailable`] on a missing or zero price
    async fn last_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    /// Non-flat positions only
    async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    async fn instrument(&self, symbol: &Symbol) -> Result<Instrument, ExchangeError>;

    /// Pending TP/SL trigger orders, for one symbol or all of them
    async fn open_trigger_orders(
        &self,
        symbol: Option<&Symbol>,
    ) -> Result<Vec<Order>, ExchangeError>;
}

/// Exchange calls that change account state
#[async_trait]
pub trait OrderExecution: Send + Sync {
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        margin_mode: MarginMode,
    ) -> Result<OrderResult, ExchangeError>;

    async fn place_trigger_order(&self, order: &TriggerOrder)
        -> Result<OrderResult, ExchangeError>;

    /// `Ok(false)` when the exchange no longer knows the order
    async fn cancel_order(&self, order: &OrderRef) -> Result<bool, ExchangeError>;
}

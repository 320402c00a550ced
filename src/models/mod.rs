use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical futures symbol, e.g. `BTCUSDT`
///
/// Feeds and exchanges spell the same instrument many ways (`BTC-USDT`,
/// `btc/usdt`, `BTC/USDT:USDT`, `BTC-USDT-SWAP`). Everything entering the
/// crate goes through [`Symbol::parse`] exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();

        // ccxt-style settlement suffix: BTC/USDT:USDT
        let upper = upper.split(':').next().unwrap_or_default();

        let mut trimmed = upper;
        for suffix in ["-SWAP", "_SWAP", "-PERP", "_PERP"] {
            if let Some(stripped) = trimmed.strip_suffix(suffix) {
                trimmed = stripped;
                break;
            }
        }

        let canonical: String = trimmed
            .chars()
            .filter(|c| !matches!(c, '-' | '/' | '_' | ' '))
            .collect();

        if canonical.is_empty() || !canonical.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }

        Some(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trade direction of a signal or position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "LONG" => Some(Direction::Long),
            "SHORT" => Some(Direction::Short),
            _ => None,
        }
    }

    /// Side of the order that opens a position in this direction
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side of the orders that reduce a position in this direction
    pub fn exit_side(self) -> Side {
        match self {
            Direction::Long => Side::Sell,
            Direction::Short => Side::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => f.write_str("LONG"),
            Direction::Short => f.write_str("SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_exchange_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// One row of the signal feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub direction: Direction,
    pub reference_price: Decimal,
    pub stop_loss_pct: Decimal,   // fraction: 0.02 = 2%
    pub take_profit_pct: Decimal, // fraction: 0.05 = 5%
    pub created_at: DateTime<Utc>,
    pub valid_for_minutes: u32,
}

impl Signal {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(i64::from(self.valid_for_minutes))
    }

    /// A signal exactly at the end of its window is still valid
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// Open position as reported by the exchange, after normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub direction: Direction,
    pub margin_mode: MarginMode,
    pub size: Decimal,
    pub entry_price: Decimal,
}

impl Position {
    pub fn matches(&self, symbol: &Symbol, direction: Direction, margin_mode: MarginMode) -> bool {
        &self.symbol == symbol
            && self.direction == direction
            && self.margin_mode == margin_mode
            && self.size > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    TakeProfit,
    StopLoss,
}

impl OrderKind {
    pub fn is_trigger(self) -> bool {
        matches!(self, OrderKind::TakeProfit | OrderKind::StopLoss)
    }
}

/// Exchange order identity; Binance needs the symbol to address an order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRef {
    pub symbol: Symbol,
    pub id: String,
}

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.symbol, self.id)
    }
}

/// Pending order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order: OrderRef,
    pub side: Side,
    pub kind: OrderKind,
    pub size: Decimal,
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// The order is finished and will not fill any further
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// What a placement call hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order: OrderRef,
    pub status: OrderStatus,
    pub avg_price: Option<Decimal>,
    pub executed_size: Decimal,
}

/// Request for a conditional TP/SL order
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub size: Decimal,
    pub trigger_price: Decimal,
    pub reduce_only: bool,
}

/// Contract metadata needed for sizing and price formatting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub is_tradable: bool,
    pub min_size: Decimal,
    pub size_step: Decimal,
    pub tick_size: Decimal,
    pub settle_asset: String,
}

impl Instrument {
    /// Round toward zero onto the size step; never up
    pub fn round_size_down(&self, size: Decimal) -> Decimal {
        if self.size_step <= Decimal::ZERO {
            return size.trunc();
        }
        ((size / self.size_step).floor() * self.size_step).normalize()
    }

    /// Snap onto the tick grid in the direction given by `strategy`
    pub fn round_price(&self, price: Decimal, strategy: RoundingStrategy) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        let ticks = (price / self.tick_size).round_dp_with_strategy(0, strategy);
        (ticks * self.tick_size).normalize()
    }
}

use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{ExchangeError, SignalError};
use crate::exchange::{MarketData, OrderExecution};
use crate::execution::brackets::BracketRegistry;
use crate::execution::retry::{retry, RetryError, RetryPolicy};
use crate::models::{
    Direction, Instrument, MarginMode, OrderKind, OrderRef, OrderResult, Position, Signal,
    TriggerOrder,
};

/// Sizing and safety parameters for opening positions
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub fixed_margin: Decimal,
    pub leverage: u32,
    pub settle_asset: String,
    pub retry: RetryPolicy,
    /// How long a fresh entry counts as open before the exchange lists it
    pub entry_grace: Duration,
}

impl ReconcilerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            fixed_margin: settings.fixed_margin_usdt,
            leverage: settings.leverage,
            settle_asset: settings.settle_asset.clone(),
            retry: settings.retry,
            entry_grace: settings.sweep_grace,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BracketOutcome {
    Placed {
        take_profit: OrderRef,
        stop_loss: OrderRef,
    },
    /// At least one leg failed; `placed` holds the legs that made it
    Partial {
        placed: Vec<OrderRef>,
        errors: Vec<SignalError>,
    },
    /// Filled size unknown, no TP/SL was sent
    Abandoned { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Expired,
    AlreadyOpen,
    /// Another position on the symbol would net against the entry
    Conflict(Position),
    Opened {
        entry: OrderRef,
        size: Decimal,
        entry_price: Option<Decimal>,
        brackets: BracketOutcome,
    },
    Failed(SignalError),
}

/// Outcome counts for one pass over the feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub signals: usize,
    pub expired: usize,
    pub already_open: usize,
    pub conflicting: usize,
    pub opened: usize,
    /// Opened but without a complete TP/SL pair
    pub unprotected: usize,
    pub failed: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &SignalOutcome) {
        self.signals += 1;
        match outcome {
            SignalOutcome::Expired => self.expired += 1,
            SignalOutcome::AlreadyOpen => self.already_open += 1,
            SignalOutcome::Conflict(_) => self.conflicting += 1,
            SignalOutcome::Opened { brackets, .. } => {
                self.opened += 1;
                if !matches!(brackets, BracketOutcome::Placed { .. }) {
                    self.unprotected += 1;
                }
            }
            SignalOutcome::Failed(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Error)]
enum FillLookupError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("position not visible yet")]
    NotVisible,
}

impl FillLookupError {
    fn is_retryable(&self) -> bool {
        match self {
            FillLookupError::Exchange(e) => e.is_transient(),
            FillLookupError::NotVisible => true,
        }
    }
}

/// Entry size: `margin * leverage / price`, rounded down to the lot step
pub fn order_size(
    fixed_margin: Decimal,
    leverage: u32,
    price: Decimal,
    instrument: &Instrument,
) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    instrument.round_size_down(fixed_margin * Decimal::from(leverage) / price)
}

/// Raw (take-profit, stop-loss) trigger prices, before tick rounding
pub fn bracket_prices(
    direction: Direction,
    entry: Decimal,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
) -> (Decimal, Decimal) {
    match direction {
        Direction::Long => (
            entry * (Decimal::ONE + take_profit_pct),
            entry * (Decimal::ONE - stop_loss_pct),
        ),
        Direction::Short => (
            entry * (Decimal::ONE - take_profit_pct),
            entry * (Decimal::ONE + stop_loss_pct),
        ),
    }
}

/// Tick-aligned (take-profit, stop-loss) triggers, each rounded away from entry
pub fn bracket_triggers(
    direction: Direction,
    entry: Decimal,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    instrument: &Instrument,
) -> (Decimal, Decimal) {
    let (take_profit, stop_loss) =
        bracket_prices(direction, entry, take_profit_pct, stop_loss_pct);
    let (tp_strategy, sl_strategy) = match direction {
        Direction::Long => (
            RoundingStrategy::ToPositiveInfinity,
            RoundingStrategy::ToNegativeInfinity,
        ),
        Direction::Short => (
            RoundingStrategy::ToNegativeInfinity,
            RoundingStrategy::ToPositiveInfinity,
        ),
    };
    (
        instrument.round_price(take_profit, tp_strategy),
        instrument.round_price(stop_loss, sl_strategy),
    )
}

/// Positive and strictly on the exit side of entry for this leg
fn trigger_is_valid(
    direction: Direction,
    kind: OrderKind,
    entry: Decimal,
    trigger: Decimal,
) -> bool {
    if trigger <= Decimal::ZERO {
        return false;
    }
    match (direction, kind) {
        (Direction::Long, OrderKind::TakeProfit) | (Direction::Short, OrderKind::StopLoss) => {
            trigger > entry
        }
        _ => trigger < entry,
    }
}

/// Turns feed signals into bracketed isolated positions
pub struct Reconciler {
    market: Arc<dyn MarketData>,
    orders: Arc<dyn OrderExecution>,
    clock: Arc<dyn Clock>,
    registry: BracketRegistry,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        market: Arc<dyn MarketData>,
        orders: Arc<dyn OrderExecution>,
        clock: Arc<dyn Clock>,
        registry: BracketRegistry,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            market,
            orders,
            clock,
            registry,
            config,
        }
    }

    /// Process signals strictly in order; one signal's failure never stops
    /// the rest.
    pub async fn run_pass(&self, signals: &[Signal]) -> PassReport {
        tracing::info!("Processing {} signals", signals.len());

        let mut report = PassReport::default();
        for signal in signals {
            let outcome = self.process_signal(signal).await;
            report.record(&outcome);
        }

        tracing::info!(
            "Pass complete: {} opened ({} without full TP/SL), {} already open, {} conflicting, {} expired, {} failed",
            report.opened,
            report.unprotected,
            report.already_open,
            report.conflicting,
            report.expired,
            report.failed
        );
        report
    }

    pub async fn process_signal(&self, signal: &Signal) -> SignalOutcome {
        if signal.is_expired(self.clock.now()) {
            tracing::info!(
                symbol = %signal.symbol,
                direction = %signal.direction,
                created_at = %signal.created_at,
                "Signal expired at {}, skipping",
                signal.expires_at()
            );
            return SignalOutcome::Expired;
        }

        match self.open(signal).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    symbol = %signal.symbol,
                    direction = %signal.direction,
                    created_at = %signal.created_at,
                    "Signal failed: {}",
                    e
                );
                SignalOutcome::Failed(e)
            }
        }
    }

    async fn open(&self, signal: &Signal) -> Result<SignalOutcome, SignalError> {
        let symbol = &signal.symbol;
        let direction = signal.direction;

        // Check 1: already in the market?
        let positions = self.read_positions().await?;
        let on_symbol: Vec<&Position> = positions
            .iter()
            .filter(|p| &p.symbol == symbol && p.size > Decimal::ZERO)
            .collect();
        if on_symbol
            .iter()
            .any(|p| p.matches(symbol, direction, MarginMode::Isolated))
            || self.registry.entered_within(
                symbol,
                direction,
                self.clock.now(),
                self.config.entry_grace,
            )
        {
            tracing::info!(
                symbol = %symbol,
                direction = %direction,
                created_at = %signal.created_at,
                "Position already open, no orders placed"
            );
            return Ok(SignalOutcome::AlreadyOpen);
        }

        // one-way mode: an entry would net against any other position
        if let Some(existing) = on_symbol.first() {
            tracing::warn!(
                symbol = %symbol,
                direction = %direction,
                created_at = %signal.created_at,
                "Symbol already holds a {} {:?} position of {}, skipping",
                existing.direction,
                existing.margin_mode,
                existing.size
            );
            return Ok(SignalOutcome::Conflict((*existing).clone()));
        }

        // Check 2: instrument
        let instrument = self.tradable_instrument(signal).await?;

        // Check 3: size
        let price = self.read_price(signal).await?;
        let size = order_size(
            self.config.fixed_margin,
            self.config.leverage,
            price,
            &instrument,
        );
        if size.is_zero() || size < instrument.min_size {
            return Err(SignalError::SizeBelowMinimum {
                symbol: symbol.clone(),
                size,
                min_size: instrument.min_size,
            });
        }

        // Entry
        self.configure_leverage(signal).await?;
        let entry = self.place_entry(signal, size).await?;
        tracing::info!(
            symbol = %symbol,
            direction = %direction,
            created_at = %signal.created_at,
            order = %entry.order,
            size = %size,
            "Entry order placed"
        );

        // Brackets
        let Some((entry_price, filled)) = self.resolve_fill(signal, &entry).await else {
            let reason = format!(
                "filled size of entry {} unknown, manual intervention required",
                entry.order
            );
            tracing::warn!(
                symbol = %symbol,
                direction = %direction,
                "No TP/SL placed: {}",
                reason
            );
            return Ok(SignalOutcome::Opened {
                entry: entry.order,
                size,
                entry_price: None,
                brackets: BracketOutcome::Abandoned { reason },
            });
        };

        let brackets = self
            .place_brackets(signal, &instrument, entry_price, filled)
            .await;

        Ok(SignalOutcome::Opened {
            entry: entry.order,
            size: filled,
            entry_price: Some(entry_price),
            brackets,
        })
    }

    async fn read_positions(&self) -> Result<Vec<Position>, SignalError> {
        let market = &*self.market;
        retry(
            &self.config.retry,
            &*self.clock,
            "position query",
            ExchangeError::is_transient,
            move || market.open_positions(),
        )
        .await
        .map_err(|e| SignalError::PositionQuery(e.into_inner()))
    }

    async fn tradable_instrument(&self, signal: &Signal) -> Result<Instrument, SignalError> {
        let market = &*self.market;
        let symbol = &signal.symbol;
        let rejected = |reason: String| SignalError::InstrumentRejected {
            symbol: symbol.clone(),
            reason,
        };

        let instrument = retry(
            &self.config.retry,
            &*self.clock,
            "instrument lookup",
            ExchangeError::is_transient,
            move || market.instrument(symbol),
        )
        .await
        .map_err(|e| rejected(e.into_inner().to_string()))?;

        if !instrument.is_tradable {
            return Err(rejected("not open for trading".to_string()));
        }
        if instrument.settle_asset != self.config.settle_asset {
            return Err(rejected(format!(
                "settles in {}, expected {}",
                instrument.settle_asset, self.config.settle_asset
            )));
        }
        Ok(instrument)
    }

    async fn read_price(&self, signal: &Signal) -> Result<Decimal, SignalError> {
        let market = &*self.market;
        let symbol = &signal.symbol;
        retry(
            &self.config.retry,
            &*self.clock,
            "price lookup",
            ExchangeError::is_transient,
            move || market.last_price(symbol),
        )
        .await
        .map_err(|e| {
            tracing::debug!(symbol = %symbol, "Price lookup failed: {}", e);
            SignalError::PriceUnavailable(symbol.clone())
        })
    }

    async fn configure_leverage(&self, signal: &Signal) -> Result<(), SignalError> {
        let orders = &*self.orders;
        let symbol = &signal.symbol;
        let leverage = self.config.leverage;
        retry(
            &self.config.retry,
            &*self.clock,
            "leverage update",
            ExchangeError::is_transient,
            move || orders.set_leverage(symbol, leverage),
        )
        .await
        .map_err(|e| order_error("leverage", signal, e))
    }

    async fn place_entry(&self, signal: &Signal, size: Decimal) -> Result<OrderResult, SignalError> {
        let orders = &*self.orders;
        let symbol = &signal.symbol;
        let side = signal.direction.entry_side();

        let placed_at = self.clock.now();
        self.registry.record_entry(symbol, signal.direction, placed_at);

        let result = retry(
            &self.config.retry,
            &*self.clock,
            "entry order",
            ExchangeError::is_unsent,
            move || orders.place_market_order(symbol, side, size, MarginMode::Isolated),
        )
        .await;

        match result {
            Ok(entry) if entry.status.is_closed() && entry.executed_size.is_zero() => {
                self.registry.remove_if_placed_at(symbol, placed_at);
                Err(SignalError::EntryNotFilled {
                    symbol: symbol.clone(),
                    direction: signal.direction,
                    status: entry.status,
                })
            }
            Ok(entry) => Ok(entry),
            Err(e) => {
                if matches!(
                    e,
                    RetryError::Fatal(ExchangeError::Transport(_) | ExchangeError::Decode(_))
                ) {
                    // may have executed; the record blocks re-entry
                    tracing::error!(
                        symbol = %symbol,
                        direction = %signal.direction,
                        "Entry order outcome unknown, check the exchange: manual intervention may be required"
                    );
                } else {
                    self.registry.remove_if_placed_at(symbol, placed_at);
                }
                Err(order_error("entry", signal, e))
            }
        }
    }

    /// (entry price, filled size), or `None` when the size cannot be known
    async fn resolve_fill(&self, signal: &Signal, entry: &OrderResult) -> Option<(Decimal, Decimal)> {
        let mut price = entry.avg_price;
        let mut size = Some(entry.executed_size).filter(|s| *s > Decimal::ZERO);

        if price.is_none() || size.is_none() {
            tracing::debug!(
                symbol = %signal.symbol,
                "Entry result incomplete, reading position"
            );
            match self.lookup_position(signal).await {
                Ok(position) => {
                    price = price.or(Some(position.entry_price).filter(|p| *p > Decimal::ZERO));
                    size = size.or(Some(position.size));
                }
                Err(e) => tracing::warn!(
                    symbol = %signal.symbol,
                    "Could not confirm fill from positions: {}",
                    e
                ),
            }
        }

        let size = size?;
        let price = match price {
            Some(p) => p,
            None => {
                let last = self.read_price(signal).await.ok()?;
                tracing::warn!(
                    symbol = %signal.symbol,
                    "Fill price unknown, using last price {} as bracket basis",
                    last
                );
                last
            }
        };
        Some((price, size))
    }

    async fn lookup_position(&self, signal: &Signal) -> Result<Position, RetryError<FillLookupError>> {
        let market = &*self.market;
        let symbol = &signal.symbol;
        let direction = signal.direction;
        retry(
            &self.config.retry,
            &*self.clock,
            "fill lookup",
            FillLookupError::is_retryable,
            move || async move {
                market
                    .open_positions()
                    .await?
                    .into_iter()
                    .find(|p| p.matches(symbol, direction, MarginMode::Isolated))
                    .ok_or(FillLookupError::NotVisible)
            },
        )
        .await
    }

    async fn place_brackets(
        &self,
        signal: &Signal,
        instrument: &Instrument,
        entry_price: Decimal,
        size: Decimal,
    ) -> BracketOutcome {
        let (take_profit, stop_loss) = bracket_triggers(
            signal.direction,
            entry_price,
            signal.take_profit_pct,
            signal.stop_loss_pct,
            instrument,
        );

        tracing::info!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            entry = %entry_price,
            tp = %take_profit,
            sl = %stop_loss,
            "Placing TP/SL brackets"
        );

        let tp = self
            .place_leg(signal, OrderKind::TakeProfit, size, entry_price, take_profit)
            .await;
        let sl = self
            .place_leg(signal, OrderKind::StopLoss, size, entry_price, stop_loss)
            .await;

        match (tp, sl) {
            (Ok(take_profit), Ok(stop_loss)) => BracketOutcome::Placed {
                take_profit,
                stop_loss,
            },
            (tp, sl) => {
                let mut placed = Vec::new();
                let mut errors = Vec::new();
                for leg in [tp, sl] {
                    match leg {
                        Ok(order) => placed.push(order),
                        Err(e) => errors.push(e),
                    }
                }
                tracing::warn!(
                    symbol = %signal.symbol,
                    direction = %signal.direction,
                    "Position only partially protected ({} of 2 brackets): manual intervention required",
                    placed.len()
                );
                BracketOutcome::Partial { placed, errors }
            }
        }
    }

    async fn place_leg(
        &self,
        signal: &Signal,
        kind: OrderKind,
        size: Decimal,
        entry_price: Decimal,
        trigger_price: Decimal,
    ) -> Result<OrderRef, SignalError> {
        let stage = match kind {
            OrderKind::TakeProfit => "take-profit",
            _ => "stop-loss",
        };
        if !trigger_is_valid(signal.direction, kind, entry_price, trigger_price) {
            tracing::warn!(
                symbol = %signal.symbol,
                direction = %signal.direction,
                "Refusing {} trigger {} against entry {}",
                stage,
                trigger_price,
                entry_price
            );
            return Err(SignalError::BracketPrice {
                stage,
                symbol: signal.symbol.clone(),
                direction: signal.direction,
                trigger: trigger_price,
                entry: entry_price,
            });
        }

        let request = TriggerOrder {
            symbol: signal.symbol.clone(),
            side: signal.direction.exit_side(),
            kind,
            size,
            trigger_price,
            reduce_only: true,
        };
        let orders = &*self.orders;
        let request_ref = &request;

        let placed = retry(
            &self.config.retry,
            &*self.clock,
            stage,
            ExchangeError::is_unsent,
            move || orders.place_trigger_order(request_ref),
        )
        .await
        .map_err(|e| order_error(stage, signal, e))?;

        self.registry.add_order(placed.order.clone());
        Ok(placed.order)
    }
}

fn order_error(stage: &'static str, signal: &Signal, e: RetryError<ExchangeError>) -> SignalError {
    SignalError::OrderRejected {
        stage,
        symbol: signal.symbol.clone(),
        direction: signal.direction,
        source: e.into_inner(),
    }
}

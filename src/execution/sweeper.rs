use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::ExchangeError;
use crate::exchange::{MarketData, OrderExecution};
use crate::execution::brackets::{elapsed, BracketRecord, BracketRegistry};
use crate::execution::retry::{retry, RetryPolicy};
use crate::models::{Order, Position, Symbol};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Minimum age of the last placement before its brackets may be cancelled
    pub grace: Duration,
    /// Position sizes below this count as closed
    pub position_epsilon: Decimal,
    pub retry: RetryPolicy,
}

impl SweeperConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            grace: settings.sweep_grace,
            position_epsilon: settings.position_epsilon,
            retry: settings.retry,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Positions could not be read; nothing was touched
    pub aborted: bool,
    pub symbols_checked: usize,
    pub still_open: usize,
    pub in_grace: usize,
    pub cancelled: usize,
    pub already_gone: usize,
    pub cancel_failures: usize,
}

#[derive(Debug, Error)]
enum BracketLookupError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("registered brackets not visible yet")]
    NotVisible,
}

impl BracketLookupError {
    fn is_retryable(&self) -> bool {
        match self {
            BracketLookupError::Exchange(e) => e.is_transient(),
            BracketLookupError::NotVisible => true,
        }
    }
}

/// Cancels TP/SL orders left behind by positions that have closed
pub struct Sweeper {
    market: Arc<dyn MarketData>,
    orders: Arc<dyn OrderExecution>,
    clock: Arc<dyn Clock>,
    registry: BracketRegistry,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(
        market: Arc<dyn MarketData>,
        orders: Arc<dyn OrderExecution>,
        clock: Arc<dyn Clock>,
        registry: BracketRegistry,
        config: SweeperConfig,
    ) -> Self {
        Self {
            market,
            orders,
            clock,
            registry,
            config,
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Positions first: if they cannot be read nothing is cancelled
        let market = &*self.market;
        let positions = match retry(
            &self.config.retry,
            &*self.clock,
            "sweep position query",
            ExchangeError::is_transient,
            move || market.open_positions(),
        )
        .await
        {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!("Sweep skipped, positions unavailable: {}", e);
                report.aborted = true;
                return report;
            }
        };

        let pending = match retry(
            &self.config.retry,
            &*self.clock,
            "sweep order query",
            ExchangeError::is_transient,
            move || market.open_trigger_orders(None),
        )
        .await
        {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!("Could not list pending trigger orders, sweeping registry only: {}", e);
                Vec::new()
            }
        };

        let candidates: BTreeSet<Symbol> = self
            .registry
            .symbols()
            .into_iter()
            .chain(pending.iter().map(|o| o.order.symbol.clone()))
            .collect();

        for symbol in &candidates {
            report.symbols_checked += 1;
            self.sweep_symbol(symbol, &positions, &pending, &mut report)
                .await;
        }

        if report.cancelled > 0 || report.cancel_failures > 0 {
            tracing::info!(
                "Sweep complete: {} cancelled, {} already gone, {} failed",
                report.cancelled,
                report.already_gone,
                report.cancel_failures
            );
        } else {
            tracing::debug!("Sweep complete: {} symbols checked", report.symbols_checked);
        }
        report
    }

    async fn sweep_symbol(
        &self,
        symbol: &Symbol,
        positions: &[Position],
        pending: &[Order],
        report: &mut SweepReport,
    ) {
        let open_size: Decimal = positions
            .iter()
            .filter(|p| &p.symbol == symbol)
            .map(|p| p.size)
            .sum();
        if open_size >= self.config.position_epsilon {
            report.still_open += 1;
            return;
        }

        let record = self.registry.get(symbol);
        let symbol_orders: Vec<&Order> = pending
            .iter()
            .filter(|o| &o.order.symbol == symbol)
            .collect();

        if !self.grace_elapsed(record.as_ref(), &symbol_orders) {
            tracing::debug!(symbol = %symbol, "Brackets inside grace period, leaving them");
            report.in_grace += 1;
            return;
        }

        let brackets = match self.current_brackets(symbol, record.as_ref()).await {
            Ok(orders) => orders,
            Err(e) => {
                if let Some(record) = &record {
                    tracing::warn!(
                        symbol = %symbol,
                        "{} registered brackets never became visible ({}), dropping record",
                        record.orders.len(),
                        e
                    );
                    self.registry.remove_if_placed_at(symbol, record.placed_at);
                }
                return;
            }
        };

        let mut all_cancelled = true;
        for order in brackets.iter().filter(|o| o.reduce_only) {
            let orders = &*self.orders;
            let order_ref = &order.order;
            match retry(
                &self.config.retry,
                &*self.clock,
                "bracket cancel",
                ExchangeError::is_transient,
                move || orders.cancel_order(order_ref),
            )
            .await
            {
                Ok(true) => {
                    tracing::info!(
                        symbol = %symbol,
                        order = %order.order,
                        kind = ?order.kind,
                        "Cancelled stale bracket of closed position"
                    );
                    report.cancelled += 1;
                }
                Ok(false) => report.already_gone += 1,
                Err(e) => {
                    tracing::error!(
                        symbol = %symbol,
                        order = %order.order,
                        "Failed to cancel stale bracket: {}",
                        e
                    );
                    report.cancel_failures += 1;
                    all_cancelled = false;
                }
            }
        }

        if all_cancelled {
            if let Some(record) = record {
                self.registry.remove_if_placed_at(symbol, record.placed_at);
            }
        }
    }

    /// Registry time wins; otherwise the newest pending order decides, and an
    /// order without a timestamp counts as fresh.
    fn grace_elapsed(&self, record: Option<&BracketRecord>, orders: &[&Order]) -> bool {
        let now = self.clock.now();
        let last_placement: Option<DateTime<Utc>> = match record {
            Some(record) => Some(record.placed_at),
            None => {
                if orders.iter().any(|o| o.created_at.is_none()) {
                    return false;
                }
                orders.iter().filter_map(|o| o.created_at).max()
            }
        };

        last_placement.map_or(true, |at| elapsed(at, now, self.config.grace))
    }

    /// Pending trigger orders for `symbol`; waits with backoff while the
    /// registry expects orders the exchange does not list yet.
    async fn current_brackets(
        &self,
        symbol: &Symbol,
        record: Option<&BracketRecord>,
    ) -> Result<Vec<Order>, BracketLookupError> {
        let market = &*self.market;
        let expect_visible = record.map_or(false, |r| !r.orders.is_empty());

        retry(
            &self.config.retry,
            &*self.clock,
            "bracket lookup",
            BracketLookupError::is_retryable,
            move || async move {
                let orders = market.open_trigger_orders(Some(symbol)).await?;
                if orders.is_empty() && expect_visible {
                    return Err(BracketLookupError::NotVisible);
                }
                Ok(orders)
            },
        )
        .await
        .map_err(|e| e.into_inner())
    }
}

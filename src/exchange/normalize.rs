//! Binance response shapes and their one-time mapping into crate models
//!
//! Binance returns numbers as strings, spells sides and margin modes in its
//! own vocabulary and mixes hedge-mode and one-way-mode position rows. All of
//! that is resolved here; nothing past this module looks at raw fields.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::error::ExchangeError;
use crate::models::{
    Direction, Instrument, MarginMode, Order, OrderKind, OrderRef, OrderResult, OrderStatus,
    Position, Side, Symbol,
};

#[derive(Debug, Deserialize)]
pub struct RawTicker {
    pub symbol: String,
    #[serde(default)]
    pub price: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawExchangeInfo {
    pub symbols: Vec<RawSymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub margin_asset: String,
    #[serde(default)]
    pub filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFilter {
    pub filter_type: String,
    #[serde(default)]
    pub step_size: Option<String>,
    #[serde(default)]
    pub min_qty: Option<String>,
    #[serde(default)]
    pub tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub symbol: String,
    pub position_amt: String,
    pub entry_price: String,
    #[serde(default)]
    pub margin_type: String,
    #[serde(default)]
    pub position_side: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub orig_qty: Option<String>,
    #[serde(default)]
    pub avg_price: Option<String>,
    #[serde(default)]
    pub executed_qty: Option<String>,
    #[serde(default)]
    pub stop_price: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

/// Error body: `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Deserialize)]
pub struct RawApiError {
    pub code: i64,
    pub msg: String,
}

pub fn last_price(requested: &Symbol, raw: RawTicker) -> Result<Decimal, ExchangeError> {
    if symbol(&raw.symbol)? != *requested {
        return Err(ExchangeError::Decode(format!(
            "ticker for {} returned symbol {}",
            requested, raw.symbol
        )));
    }

    raw.price
        .as_deref()
        .and_then(|p| Decimal::from_str(p).ok())
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| ExchangeError::PriceUnavailable(requested.clone()))
}

pub fn instrument(raw: &RawSymbolInfo) -> Result<Instrument, ExchangeError> {
    let mut min_size = Decimal::ZERO;
    let mut size_step = Decimal::ZERO;
    let mut tick_size = Decimal::ZERO;

    for filter in &raw.filters {
        match filter.filter_type.as_str() {
            // market orders must satisfy both lot filters; keep the stricter one
            "LOT_SIZE" | "MARKET_LOT_SIZE" => {
                if let Some(step) = optional_decimal(filter.step_size.as_deref(), "stepSize")? {
                    size_step = size_step.max(step);
                }
                if let Some(min) = optional_decimal(filter.min_qty.as_deref(), "minQty")? {
                    min_size = min_size.max(min);
                }
            }
            "PRICE_FILTER" => {
                if let Some(tick) = optional_decimal(filter.tick_size.as_deref(), "tickSize")? {
                    tick_size = tick;
                }
            }
            _ => {}
        }
    }

    if size_step <= Decimal::ZERO {
        return Err(ExchangeError::Decode(format!(
            "{} has no usable LOT_SIZE step",
            raw.symbol
        )));
    }

    Ok(Instrument {
        symbol: symbol(&raw.symbol)?,
        is_tradable: raw.status == "TRADING",
        min_size,
        size_step,
        tick_size,
        settle_asset: raw.margin_asset.to_uppercase(),
    })
}

/// `None` for flat rows, which Binance lists for every symbol
pub fn position(raw: &RawPosition) -> Result<Option<Position>, ExchangeError> {
    let amount = decimal(&raw.position_amt, "positionAmt")?;
    if amount.is_zero() {
        return Ok(None);
    }

    let direction = match raw.position_side.as_deref() {
        Some("LONG") => Direction::Long,
        Some("SHORT") => Direction::Short,
        // one-way mode reports BOTH and signs the amount
        _ if amount.is_sign_negative() => Direction::Short,
        _ => Direction::Long,
    };

    let margin_mode = match raw.margin_type.to_lowercase().as_str() {
        "isolated" => MarginMode::Isolated,
        "cross" | "crossed" => MarginMode::Cross,
        other => {
            return Err(ExchangeError::Decode(format!(
                "unknown margin type '{}' for {}",
                other, raw.symbol
            )))
        }
    };

    Ok(Some(Position {
        symbol: symbol(&raw.symbol)?,
        direction,
        margin_mode,
        size: amount.abs(),
        entry_price: decimal(&raw.entry_price, "entryPrice")?,
    }))
}

/// `None` for order types that are neither market nor TP/SL triggers
pub fn order(raw: &RawOrder) -> Result<Option<Order>, ExchangeError> {
    let Some(kind) = order_kind(&raw.order_type) else {
        return Ok(None);
    };

    Ok(Some(Order {
        order: order_ref(raw)?,
        side: side(&raw.side)?,
        kind,
        size: optional_decimal(raw.orig_qty.as_deref(), "origQty")?.unwrap_or_default(),
        trigger_price: optional_decimal(raw.stop_price.as_deref(), "stopPrice")?
            .filter(|p| *p > Decimal::ZERO),
        reduce_only: raw.reduce_only || raw.close_position,
        created_at: raw.time.or(raw.update_time).and_then(timestamp),
    }))
}

pub fn order_result(raw: &RawOrder) -> Result<OrderResult, ExchangeError> {
    let status = match raw.status.as_str() {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        other => return Err(ExchangeError::Decode(format!("unknown order status '{}'", other))),
    };

    Ok(OrderResult {
        order: order_ref(raw)?,
        status,
        avg_price: optional_decimal(raw.avg_price.as_deref(), "avgPrice")?
            .filter(|p| *p > Decimal::ZERO),
        executed_size: optional_decimal(raw.executed_qty.as_deref(), "executedQty")?
            .unwrap_or_default(),
    })
}

fn order_kind(raw: &str) -> Option<OrderKind> {
    match raw {
        "MARKET" => Some(OrderKind::Market),
        "TAKE_PROFIT_MARKET" | "TAKE_PROFIT" => Some(OrderKind::TakeProfit),
        "STOP_MARKET" | "STOP" => Some(OrderKind::StopLoss),
        _ => None,
    }
}

/// Exchange spelling of a trigger kind
pub fn trigger_type(kind: OrderKind) -> Option<&'static str> {
    match kind {
        OrderKind::TakeProfit => Some("TAKE_PROFIT_MARKET"),
        OrderKind::StopLoss => Some("STOP_MARKET"),
        OrderKind::Market => None,
    }
}

fn order_ref(raw: &RawOrder) -> Result<OrderRef, ExchangeError> {
    Ok(OrderRef {
        symbol: symbol(&raw.symbol)?,
        id: raw.order_id.to_string(),
    })
}

fn side(raw: &str) -> Result<Side, ExchangeError> {
    match raw {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(ExchangeError::Decode(format!("unknown side '{}'", other))),
    }
}

fn symbol(raw: &str) -> Result<Symbol, ExchangeError> {
    Symbol::parse(raw).ok_or_else(|| ExchangeError::Decode(format!("bad symbol '{}'", raw)))
}

fn decimal(raw: &str, field: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| ExchangeError::Decode(format!("{} '{}': {}", field, raw, e)))
}

fn optional_decimal(raw: Option<&str>, field: &str) -> Result<Option<Decimal>, ExchangeError> {
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => decimal(s, field).map(Some),
    }
}

fn timestamp(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn btc() -> Symbol {
        Symbol::parse("BTCUSDT").unwrap()
    }

    #[test]
    fn test_zero_price_is_unavailable() {
        let raw: RawTicker =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","price":"0.00"}"#).unwrap();
        assert_eq!(
            last_price(&btc(), raw),
            Err(ExchangeError::PriceUnavailable(btc()))
        );

        let raw: RawTicker = serde_json::from_str(r#"{"symbol":"BTCUSDT"}"#).unwrap();
        assert!(matches!(
            last_price(&btc(), raw),
            Err(ExchangeError::PriceUnavailable(_))
        ));
    }

    #[test]
    fn test_instrument_takes_stricter_lot_filter() {
        let raw: RawSymbolInfo = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "marginAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                    {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "minQty": "0.002"},
                    {"filterType": "MIN_NOTIONAL", "notional": "100"}
                ]
            }"#,
        )
        .unwrap();

        let inst = instrument(&raw).unwrap();
        assert!(inst.is_tradable);
        assert_eq!(inst.size_step, dec("0.001"));
        assert_eq!(inst.min_size, dec("0.002"));
        assert_eq!(inst.tick_size, dec("0.1"));
        assert_eq!(inst.settle_asset, "USDT");
    }

    #[test]
    fn test_one_way_short_position_normalized() {
        let raw: RawPosition = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","positionAmt":"-0.500","entryPrice":"3000.5",
                "marginType":"isolated","positionSide":"BOTH"}"#,
        )
        .unwrap();

        let pos = position(&raw).unwrap().unwrap();
        assert_eq!(pos.symbol.as_str(), "ETHUSDT");
        assert_eq!(pos.direction, Direction::Short);
        assert_eq!(pos.margin_mode, MarginMode::Isolated);
        assert_eq!(pos.size, dec("0.5"));
        assert_eq!(pos.entry_price, dec("3000.5"));
    }

    #[test]
    fn test_hedge_mode_and_flat_rows() {
        let hedge: RawPosition = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","positionAmt":"0.010","entryPrice":"61000",
                "marginType":"cross","positionSide":"LONG"}"#,
        )
        .unwrap();
        let pos = position(&hedge).unwrap().unwrap();
        assert_eq!(pos.direction, Direction::Long);
        assert_eq!(pos.margin_mode, MarginMode::Cross);

        let flat: RawPosition = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","positionAmt":"0.000","entryPrice":"0.0",
                "marginType":"isolated","positionSide":"BOTH"}"#,
        )
        .unwrap();
        assert_eq!(position(&flat).unwrap(), None);
    }

    #[test]
    fn test_trigger_order_normalized() {
        let raw: RawOrder = serde_json::from_str(
            r#"{"orderId":42,"symbol":"BTCUSDT","status":"NEW","side":"SELL",
                "type":"STOP_MARKET","origQty":"0.002","stopPrice":"59780",
                "reduceOnly":true,"time":1704067200000}"#,
        )
        .unwrap();

        let o = order(&raw).unwrap().unwrap();
        assert_eq!(o.order.id, "42");
        assert_eq!(o.kind, OrderKind::StopLoss);
        assert_eq!(o.side, Side::Sell);
        assert_eq!(o.trigger_price, Some(dec("59780")));
        assert!(o.reduce_only);
        assert_eq!(
            o.created_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_limit_orders_are_ignored() {
        let raw: RawOrder = serde_json::from_str(
            r#"{"orderId":7,"symbol":"BTCUSDT","status":"NEW","side":"BUY",
                "type":"LIMIT","origQty":"1"}"#,
        )
        .unwrap();
        assert_eq!(order(&raw).unwrap(), None);
    }

    #[test]
    fn test_market_result_without_fill_price() {
        let raw: RawOrder = serde_json::from_str(
            r#"{"orderId":9,"symbol":"BTCUSDT","status":"NEW","side":"BUY",
                "type":"MARKET","origQty":"0.002","avgPrice":"0.00","executedQty":"0"}"#,
        )
        .unwrap();

        let result = order_result(&raw).unwrap();
        assert_eq!(result.status, OrderStatus::New);
        assert_eq!(result.avg_price, None);
        assert_eq!(result.executed_size, Decimal::ZERO);
    }
}

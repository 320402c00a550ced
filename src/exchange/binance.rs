use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use super::normalize::{self, RawApiError, RawExchangeInfo, RawOrder, RawPosition, RawTicker};
use super::{MarketData, OrderExecution};
use crate::error::ExchangeError;
use crate::models::{
    Instrument, MarginMode, Order, OrderKind, OrderRef, OrderResult, Position, Side, Symbol,
    TriggerOrder,
};

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// Binance error codes with special handling
const ERR_TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;
const ERR_INVALID_SYMBOL: i64 = -1121;
const ERR_UNKNOWN_ORDER: i64 = -2011;
const ERR_MARGIN_TYPE_UNCHANGED: i64 = -4046;

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub requests_per_second: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

/// Binance USDⓈ-M futures REST client
///
/// Cloneable; clones share the rate limiter, the server time offset and the
/// instrument cache.
#[derive(Clone)]
pub struct BinanceClient {
    http: Client,
    config: Arc<BinanceConfig>,
    rate_limiter: Arc<BinanceRateLimiter>,
    time_offset_ms: Arc<AtomicI64>,
    instruments: Arc<RwLock<HashMap<Symbol, Instrument>>>,
}

impl BinanceClient {
    /// `http` should carry the process-wide request timeout
    pub fn new(http: Client, config: BinanceConfig) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            http,
            config: Arc::new(config),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            time_offset_ms: Arc::new(AtomicI64::new(0)),
            instruments: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Measure the offset between local and server clocks
    ///
    /// Doubles as the startup connectivity check.
    pub async fn sync_time(&self) -> Result<i64, ExchangeError> {
        let before = Utc::now().timestamp_millis();
        let time: ServerTime = self.public_get("/fapi/v1/time", &[]).await?;
        let after = Utc::now().timestamp_millis();

        let offset = time.server_time - (before + after) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);

        tracing::info!(offset_ms = offset, "Synchronized with exchange server time");
        Ok(offset)
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// HMAC-SHA256 of the query string, hex encoded
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.config.base_url, path);
        self.send(self.http.get(url).query(query)).await
    }

    /// Signed request; a stale timestamp triggers one resync and resend
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        match self.signed_once(method.clone(), path, params).await {
            Err(ExchangeError::Rejected { code, .. }) if code == ERR_TIMESTAMP_OUTSIDE_WINDOW => {
                tracing::warn!("Request timestamp rejected, resyncing server time");
                self.sync_time().await?;
                self.signed_once(method, path, params).await
            }
            other => other,
        }
    }

    async fn signed_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", self.config.recv_window_ms));
        query.push(format!("timestamp={}", self.timestamp_ms()));
        let query = query.join("&");

        let url = format!(
            "{}{}?{}&signature={}",
            self.config.base_url,
            path,
            query,
            self.sign(&query)
        );

        let request = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.config.api_key);
        self.send(request).await
    }

    /// Classify the response: 2xx decodes, 5xx/429/418 are transport
    /// failures with unknown outcome, anything else is a business rejection.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Decode(format!("{} in {}", e, body)));
        }

        if status.is_server_error() || matches!(status.as_u16(), 418 | 429) {
            return Err(ExchangeError::Transport(format!("HTTP {}: {}", status, body)));
        }

        match serde_json::from_str::<RawApiError>(&body) {
            Ok(api) => Err(ExchangeError::Rejected {
                code: api.code,
                message: api.msg,
            }),
            Err(_) => Err(ExchangeError::Rejected {
                code: i64::from(status.as_u16()),
                message: body,
            }),
        }
    }

    async fn load_instruments(&self) -> Result<(), ExchangeError> {
        let info: RawExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;

        let mut loaded = HashMap::new();
        for raw in &info.symbols {
            match normalize::instrument(raw) {
                Ok(instrument) => {
                    loaded.insert(instrument.symbol.clone(), instrument);
                }
                Err(e) => tracing::debug!("Skipping instrument {}: {}", raw.symbol, e),
            }
        }

        tracing::debug!("Loaded {} instruments", loaded.len());
        self.instruments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loaded);
        Ok(())
    }

    fn cached_instrument(&self, symbol: &Symbol) -> Option<Instrument> {
        self.instruments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned()
    }

    async fn set_margin_mode(&self, symbol: &Symbol, mode: MarginMode) -> Result<(), ExchangeError> {
        let margin_type = match mode {
            MarginMode::Isolated => "ISOLATED",
            MarginMode::Cross => "CROSSED",
        };

        let result: Result<serde_json::Value, _> = self
            .signed(
                Method::POST,
                "/fapi/v1/marginType",
                &[
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_type.to_string()),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                tracing::info!(symbol = %symbol, "Margin type set to {}", margin_type);
                Ok(())
            }
            Err(ExchangeError::Rejected { code, .. }) if code == ERR_MARGIN_TYPE_UNCHANGED => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn client_order_id(tag: &str) -> String {
    format!("sb{}{}", tag, Uuid::new_v4().simple())
}

fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn last_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let ticker: RawTicker = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        normalize::last_price(symbol, ticker)
    }

    async fn open_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let raw: Vec<RawPosition> = self.signed(Method::GET, "/fapi/v2/positionRisk", &[]).await?;

        let mut positions = Vec::new();
        for row in &raw {
            if let Some(position) = normalize::position(row)? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn instrument(&self, symbol: &Symbol) -> Result<Instrument, ExchangeError> {
        if let Some(instrument) = self.cached_instrument(symbol) {
            return Ok(instrument);
        }

        self.load_instruments().await?;

        self.cached_instrument(symbol)
            .ok_or_else(|| ExchangeError::Rejected {
                code: ERR_INVALID_SYMBOL,
                message: format!("unknown symbol {}", symbol),
            })
    }

    async fn open_trigger_orders(
        &self,
        symbol: Option<&Symbol>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let raw: Vec<RawOrder> = self.signed(Method::GET, "/fapi/v1/openOrders", &params).await?;

        let mut orders = Vec::new();
        for row in &raw {
            if let Some(order) = normalize::order(row)? {
                if order.kind.is_trigger() {
                    orders.push(order);
                }
            }
        }
        Ok(orders)
    }
}

#[async_trait]
impl OrderExecution for BinanceClient {
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;

        tracing::info!(symbol = %symbol, "Leverage set to {}x", leverage);
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        margin_mode: MarginMode,
    ) -> Result<OrderResult, ExchangeError> {
        self.set_margin_mode(symbol, margin_mode).await?;

        tracing::info!(
            symbol = %symbol,
            side = side.as_exchange_str(),
            size = %size,
            "Placing MARKET order"
        );

        let raw: RawOrder = self
            .signed(
                Method::POST,
                "/fapi/v1/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", side.as_exchange_str().to_string()),
                    ("type", "MARKET".to_string()),
                    ("quantity", format_decimal(size)),
                    ("newOrderRespType", "RESULT".to_string()),
                    ("newClientOrderId", client_order_id("e")),
                ],
            )
            .await?;

        normalize::order_result(&raw)
    }

    async fn place_trigger_order(
        &self,
        order: &TriggerOrder,
    ) -> Result<OrderResult, ExchangeError> {
        let order_type = normalize::trigger_type(order.kind).ok_or_else(|| {
            ExchangeError::InvalidRequest("market kind passed as trigger order".to_string())
        })?;
        let tag = if order.kind == OrderKind::TakeProfit { "tp" } else { "sl" };

        tracing::info!(
            symbol = %order.symbol,
            side = order.side.as_exchange_str(),
            size = %order.size,
            trigger = %order.trigger_price,
            "Placing {} order",
            order_type
        );

        let mut params = vec![
            ("symbol", order.symbol.to_string()),
            ("side", order.side.as_exchange_str().to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", format_decimal(order.trigger_price)),
            ("quantity", format_decimal(order.size)),
            ("workingType", "MARK_PRICE".to_string()),
            ("newClientOrderId", client_order_id(tag)),
        ];
        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let raw: RawOrder = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        normalize::order_result(&raw)
    }

    async fn cancel_order(&self, order: &OrderRef) -> Result<bool, ExchangeError> {
        let result: Result<serde_json::Value, _> = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                &[
                    ("symbol", order.symbol.to_string()),
                    ("orderId", order.id.clone()),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                tracing::info!(order = %order, "Order cancelled");
                Ok(true)
            }
            Err(ExchangeError::Rejected { code, .. }) if code == ERR_UNKNOWN_ORDER => {
                tracing::info!(order = %order, "Order already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

//! Error taxonomy
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow` at the top level. Per-signal errors ([`SignalError`]) are caught
//! at the signal boundary and never abort a pass.

use thiserror::Error;

use crate::models::{Direction, OrderStatus, Symbol};

/// Missing or invalid process configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),
}

/// The signal feed could not be fetched or read at all
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("feed is not readable CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// A single feed row that could not be turned into a signal
#[derive(Debug, Clone, Error, PartialEq)]
#[error("row {row}: {reason}")]
pub struct SignalParseError {
    pub row: usize,
    pub reason: String,
}

/// Failure of a single exchange call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// The request never reached the exchange; safe to resend
    #[error("could not connect to exchange: {0}")]
    Connect(String),

    /// Timeout, dropped connection, 5xx or rate limit; outcome unknown
    #[error("transport error: {0}")]
    Transport(String),

    /// Business-level rejection reported by the exchange
    #[error("exchange rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("unexpected exchange response: {0}")]
    Decode(String),

    /// The request could not be built; resending cannot help
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no usable price for {0}")]
    PriceUnavailable(Symbol),
}

impl ExchangeError {
    /// Worth retrying for idempotent reads and cancels
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Connect(_) | ExchangeError::Transport(_))
    }

    /// Worth retrying for order placement: only when nothing was sent
    pub fn is_unsent(&self) -> bool {
        matches!(self, ExchangeError::Connect(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            ExchangeError::InvalidRequest(e.to_string())
        } else if e.is_connect() {
            ExchangeError::Connect(e.to_string())
        } else if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

/// Why one signal did not result in a bracketed position
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignalError {
    #[error("price unavailable for {0}")]
    PriceUnavailable(Symbol),

    #[error("could not query open positions: {0}")]
    PositionQuery(ExchangeError),

    #[error("instrument {symbol} rejected: {reason}")]
    InstrumentRejected { symbol: Symbol, reason: String },

    #[error("computed size {size} for {symbol} is below the minimum {min_size}")]
    SizeBelowMinimum {
        symbol: Symbol,
        size: rust_decimal::Decimal,
        min_size: rust_decimal::Decimal,
    },

    #[error("{stage} order for {symbol} {direction} failed: {source}")]
    OrderRejected {
        stage: &'static str,
        symbol: Symbol,
        direction: Direction,
        source: ExchangeError,
    },

    #[error("entry order for {symbol} {direction} closed as {status:?} without a fill")]
    EntryNotFilled {
        symbol: Symbol,
        direction: Direction,
        status: OrderStatus,
    },

    #[error("{stage} trigger {trigger} for {symbol} {direction} is not on the right side of entry {entry}")]
    BracketPrice {
        stage: &'static str,
        symbol: Symbol,
        direction: Direction,
        trigger: rust_decimal::Decimal,
        entry: rust_decimal::Decimal,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbuildable_request_is_not_retried() {
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        assert!(err.is_builder());

        let e = ExchangeError::from(err);
        assert!(matches!(e, ExchangeError::InvalidRequest(_)));
        assert!(!e.is_transient());
        assert!(!e.is_unsent());
    }
}

//! Process configuration read from environment variables
//!
//! Credentials and the feed URL are required; everything else has a
//! default. A missing or malformed variable is a [`ConfigError`] and stops the
//! process before any signal is touched.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::RetryPolicy;

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub api_secret: String,
    pub spreadsheet_url: String,
    pub base_url: String,

    /// Margin committed per signal, in the settle asset
    pub fixed_margin_usdt: Decimal,
    pub leverage: u32,
    pub settle_asset: String,

    /// Used only when a feed row leaves the TP/SL cell empty (fractions)
    pub default_take_profit_pct: Decimal,
    pub default_stop_loss_pct: Decimal,

    pub http_timeout: Duration,
    pub recv_window_ms: u64,
    pub requests_per_second: u32,
    pub retry: RetryPolicy,

    pub sweep_interval: Duration,
    pub sweep_grace: Duration,
    pub pass_interval: Duration,
    pub position_epsilon: Decimal,
    pub feed_utc_offset_hours: i32,
}

impl Settings {
    /// Load `.env` values already merged into the environment by the caller
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Self::from_config(&cfg)
    }

    /// Keys are the lower-cased variable names (`binance_api_key`)
    pub fn from_config(cfg: &config::Config) -> Result<Self, ConfigError> {
        let settings = Self {
            api_key: required(cfg, "binance_api_key", "BINANCE_API_KEY")?,
            api_secret: required(cfg, "binance_api_secret", "BINANCE_API_SECRET")?,
            spreadsheet_url: required(cfg, "spreadsheet_url", "SPREADSHEET_URL")?,
            base_url: cfg
                .get_string("binance_base_url")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),

            fixed_margin_usdt: parsed(cfg, "fixed_margin_usdt", "FIXED_MARGIN_USDT", Decimal::from(20))?,
            leverage: parsed(cfg, "leverage", "LEVERAGE", 5)?,
            settle_asset: cfg
                .get_string("settle_asset")
                .unwrap_or_else(|_| "USDT".to_string())
                .to_uppercase(),

            default_take_profit_pct: parsed(
                cfg,
                "default_take_profit_pct",
                "DEFAULT_TAKE_PROFIT_PCT",
                Decimal::from(10),
            )? / Decimal::ONE_HUNDRED,
            default_stop_loss_pct: parsed(
                cfg,
                "default_stop_loss_pct",
                "DEFAULT_STOP_LOSS_PCT",
                Decimal::from(5),
            )? / Decimal::ONE_HUNDRED,

            http_timeout: Duration::from_secs(parsed(cfg, "http_timeout_secs", "HTTP_TIMEOUT_SECS", 10)?),
            recv_window_ms: parsed(cfg, "recv_window_ms", "RECV_WINDOW_MS", 5000)?,
            requests_per_second: parsed(cfg, "requests_per_second", "REQUESTS_PER_SECOND", 10)?,
            retry: RetryPolicy {
                max_attempts: parsed(cfg, "retry_max_attempts", "RETRY_MAX_ATTEMPTS", 3)?,
                base_delay: Duration::from_millis(parsed(
                    cfg,
                    "retry_base_delay_ms",
                    "RETRY_BASE_DELAY_MS",
                    500,
                )?),
                max_delay: Duration::from_millis(parsed(
                    cfg,
                    "retry_max_delay_ms",
                    "RETRY_MAX_DELAY_MS",
                    8000,
                )?),
            },

            sweep_interval: Duration::from_secs(parsed(cfg, "sweep_interval_secs", "SWEEP_INTERVAL_SECS", 60)?),
            sweep_grace: Duration::from_secs(parsed(cfg, "sweep_grace_secs", "SWEEP_GRACE_SECS", 60)?),
            pass_interval: Duration::from_secs(
                60 * parsed::<u64>(cfg, "pass_interval_minutes", "PASS_INTERVAL_MINUTES", 60)?,
            ),
            position_epsilon: parsed(
                cfg,
                "position_epsilon",
                "POSITION_EPSILON",
                Decimal::new(1, 8),
            )?,
            feed_utc_offset_hours: parsed(cfg, "feed_utc_offset_hours", "FEED_UTC_OFFSET_HOURS", 0)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fixed_margin_usdt <= Decimal::ZERO {
            return Err(invalid("FIXED_MARGIN_USDT", "must be positive"));
        }
        if self.leverage == 0 || self.leverage > 125 {
            return Err(invalid("LEVERAGE", "must be between 1 and 125"));
        }
        for (var, pct) in [
            ("DEFAULT_TAKE_PROFIT_PCT", self.default_take_profit_pct),
            ("DEFAULT_STOP_LOSS_PCT", self.default_stop_loss_pct),
        ] {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                return Err(invalid(var, "must be between 0 and 100 (exclusive)"));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.requests_per_second == 0 {
            return Err(invalid("REQUESTS_PER_SECOND", "must be at least 1"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("SWEEP_INTERVAL_SECS", "must be at least 1"));
        }
        if self.pass_interval.is_zero() {
            return Err(invalid("PASS_INTERVAL_MINUTES", "must be at least 1"));
        }
        if !(-12..=14).contains(&self.feed_utc_offset_hours) {
            return Err(invalid("FEED_UTC_OFFSET_HOURS", "must be between -12 and 14"));
        }
        Ok(())
    }
}

/// Only the feed URL; used by `check-feed`, which needs no credentials
pub fn feed_url_from_env() -> Result<(String, i32), ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::Environment::default())
        .build()?;
    let url = required(&cfg, "spreadsheet_url", "SPREADSHEET_URL")?;
    let offset = parsed(&cfg, "feed_utc_offset_hours", "FEED_UTC_OFFSET_HOURS", 0)?;
    Ok((url, offset))
}

fn required(cfg: &config::Config, key: &str, var: &'static str) -> Result<String, ConfigError> {
    match cfg.get_string(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn parsed<T>(cfg: &config::Config, key: &str, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match cfg.get_string(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| invalid(var, &format!("'{}': {}", raw, e))),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(e) => Err(ConfigError::Source(e)),
    }
}

fn invalid(var: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> config::ConfigBuilder<config::builder::DefaultState> {
        config::Config::builder()
            .set_override("binance_api_key", "key")
            .unwrap()
            .set_override("binance_api_secret", "secret")
            .unwrap()
            .set_override("spreadsheet_url", "https://example.com/sheet.csv")
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_config(&base().build().unwrap()).unwrap();

        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.fixed_margin_usdt, Decimal::from(20));
        assert_eq!(settings.leverage, 5);
        assert_eq!(settings.settle_asset, "USDT");
        assert_eq!(settings.default_take_profit_pct, Decimal::new(10, 2));
        assert_eq!(settings.default_stop_loss_pct, Decimal::new(5, 2));
        assert_eq!(settings.sweep_grace, Duration::from_secs(60));
        assert_eq!(settings.pass_interval, Duration::from_secs(3600));
        assert_eq!(settings.retry, RetryPolicy::default());
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        let cfg = config::Config::builder()
            .set_override("binance_api_key", "key")
            .unwrap()
            .build()
            .unwrap();

        let err = Settings::from_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BINANCE_API_SECRET")));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let cfg = base().set_override("spreadsheet_url", "  ").unwrap().build().unwrap();

        let err = Settings::from_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SPREADSHEET_URL")));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let cfg = base().set_override("leverage", "five").unwrap().build().unwrap();

        let err = Settings::from_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "LEVERAGE", .. }));
    }

    #[test]
    fn test_overrides() {
        let cfg = base()
            .set_override("fixed_margin_usdt", "50")
            .unwrap()
            .set_override("leverage", "10")
            .unwrap()
            .set_override("binance_base_url", "https://testnet.binancefuture.com/")
            .unwrap()
            .build()
            .unwrap();

        let settings = Settings::from_config(&cfg).unwrap();
        assert_eq!(settings.fixed_margin_usdt, Decimal::from(50));
        assert_eq!(settings.leverage, 10);
        assert_eq!(settings.base_url, "https://testnet.binancefuture.com");
    }

    #[test]
    fn test_out_of_range_leverage_rejected() {
        let cfg = base().set_override("leverage", "0").unwrap().build().unwrap();
        assert!(Settings::from_config(&cfg).is_err());
    }
}

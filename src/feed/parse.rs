use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::SignalParseError;
use crate::models::{Direction, Signal, Symbol};

/// symbol, direction, entry price, stop-loss, take-profit, created-at, validity
pub const EXPECTED_COLUMNS: usize = 7;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Settings that shape how a row is read
#[derive(Debug, Clone, Copy)]
pub struct RowDefaults {
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub utc_offset: FixedOffset,
}

impl Default for RowDefaults {
    fn default() -> Self {
        Self {
            take_profit_pct: Decimal::new(10, 2),
            stop_loss_pct: Decimal::new(5, 2),
            utc_offset: Utc.fix(),
        }
    }
}

/// Parse the CSV body; bad rows are returned next to the good ones
pub fn parse_signals(
    body: &str,
    defaults: &RowDefaults,
) -> Result<(Vec<Signal>, Vec<SignalParseError>), csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut signals = Vec::new();
    let mut rejected = Vec::new();

    for (index, record) in reader.records().enumerate() {
        // header is row 1
        let row = index + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) if e.is_io_error() => return Err(e),
            Err(e) => {
                rejected.push(SignalParseError {
                    row,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let cells: Vec<&str> = record.iter().collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }

        match parse_row(row, &cells, defaults) {
            Ok(signal) => signals.push(signal),
            Err(e) => rejected.push(e),
        }
    }

    Ok((signals, rejected))
}

pub fn parse_row(
    row: usize,
    cells: &[&str],
    defaults: &RowDefaults,
) -> Result<Signal, SignalParseError> {
    let fail = |reason: String| SignalParseError { row, reason };

    if cells.len() < EXPECTED_COLUMNS {
        return Err(fail(format!(
            "expected {} columns, found {}",
            EXPECTED_COLUMNS,
            cells.len()
        )));
    }

    let symbol = Symbol::parse(cells[0]).ok_or_else(|| fail(format!("bad symbol '{}'", cells[0])))?;
    let direction =
        Direction::parse(cells[1]).ok_or_else(|| fail(format!("unknown direction '{}'", cells[1])))?;

    let reference_price =
        parse_number(cells[2]).ok_or_else(|| fail(format!("bad entry price '{}'", cells[2])))?;
    if reference_price <= Decimal::ZERO {
        return Err(fail(format!("entry price must be positive, got {}", reference_price)));
    }

    let stop_loss_pct = parse_percent(cells[3], defaults.stop_loss_pct)
        .ok_or_else(|| fail(format!("bad stop-loss '{}'", cells[3])))?;
    let take_profit_pct = parse_percent(cells[4], defaults.take_profit_pct)
        .ok_or_else(|| fail(format!("bad take-profit '{}'", cells[4])))?;

    let created_at = parse_timestamp(cells[5], defaults.utc_offset)
        .ok_or_else(|| fail(format!("bad timestamp '{}'", cells[5])))?;

    let valid_for_minutes = cells[6]
        .trim()
        .parse::<u32>()
        .map_err(|_| fail(format!("bad validity window '{}'", cells[6])))?;

    Ok(Signal {
        symbol,
        direction,
        reference_price,
        stop_loss_pct,
        take_profit_pct,
        created_at,
        valid_for_minutes,
    })
}

/// Numbers as typed into a sheet: "60,000", "20 USDT", " 1.5 "
fn parse_number(cell: &str) -> Option<Decimal> {
    let cleaned: String = cell
        .trim()
        .trim_end_matches("USDT")
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '%'))
        .collect();
    Decimal::from_str(&cleaned).ok()
}

/// Percent cell to a fraction in (0, 1); "2%" and "2" both mean 0.02
fn parse_percent(cell: &str, default: Decimal) -> Option<Decimal> {
    if cell.trim().is_empty() {
        return Some(default);
    }
    let pct = parse_number(cell)? / Decimal::ONE_HUNDRED;
    (pct > Decimal::ZERO && pct < Decimal::ONE).then_some(pct)
}

fn parse_timestamp(cell: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let cell = cell.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(cell) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cell, fmt).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    const HEADER: &str = "Coin,Signal,Entry,SL,TP,Created,Valid (min)\n";

    #[test]
    fn test_parse_reference_row() {
        let body = format!(
            "{}BTC-USDT,LONG,60000,2%,5%,2024-01-01 00:00:00,60\n",
            HEADER
        );
        let (signals, rejected) = parse_signals(&body, &RowDefaults::default()).unwrap();

        assert!(rejected.is_empty());
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.symbol.as_str(), "BTCUSDT");
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.reference_price, dec("60000"));
        assert_eq!(s.stop_loss_pct, dec("0.02"));
        assert_eq!(s.take_profit_pct, dec("0.05"));
        assert_eq!(
            s.created_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(s.valid_for_minutes, 60);
    }

    #[test]
    fn test_bad_rows_are_skipped_not_fatal() {
        let body = format!(
            "{}\
             ETH-USDT,SHORT,3000,3%,6%,2024-01-01 00:00:00,30\n\
             BTC-USDT,LONG,60000\n\
             SOL-USDT,HOLD,100,2%,5%,2024-01-01 00:00:00,60\n\
             XRP-USDT,LONG,abc,2%,5%,2024-01-01 00:00:00,60\n\
             ,,,,,,\n\
             DOGE-USDT,long,0.1,1.5,4,01/01/2024 07:00:00,15\n",
            HEADER
        );
        let (signals, rejected) = parse_signals(&body, &RowDefaults::default()).unwrap();

        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].symbol.as_str(), "ETHUSDT");
        assert_eq!(signals[1].symbol.as_str(), "DOGEUSDT");
        assert_eq!(signals[1].stop_loss_pct, dec("0.015"));

        let rows: Vec<usize> = rejected.iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![3, 4, 5]);
        assert!(rejected[1].reason.contains("unknown direction"));
    }

    #[test]
    fn test_empty_percent_cells_use_defaults() {
        let defaults = RowDefaults::default();
        let signal = parse_row(
            2,
            &["BTCUSDT", "SHORT", "60000", "", "", "2024-01-01 00:00", "60"],
            &defaults,
        )
        .unwrap();

        assert_eq!(signal.stop_loss_pct, defaults.stop_loss_pct);
        assert_eq!(signal.take_profit_pct, defaults.take_profit_pct);
    }

    #[test]
    fn test_percent_out_of_range_rejected() {
        let err = parse_row(
            2,
            &["BTCUSDT", "LONG", "60000", "150%", "5%", "2024-01-01 00:00", "60"],
            &RowDefaults::default(),
        )
        .unwrap_err();
        assert!(err.reason.contains("stop-loss"));
    }

    #[test]
    fn test_naive_timestamp_uses_feed_offset() {
        let defaults = RowDefaults {
            utc_offset: FixedOffset::east_opt(7 * 3600).unwrap(),
            ..RowDefaults::default()
        };
        let signal = parse_row(
            2,
            &["BTCUSDT", "LONG", "60,000", "2%", "5%", "2024-01-01 07:00:00", "60"],
            &defaults,
        )
        .unwrap();

        assert_eq!(
            signal.created_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(signal.reference_price, dec("60000"));
    }

    #[test]
    fn test_rfc3339_timestamp() {
        let signal = parse_row(
            2,
            &["BTCUSDT", "LONG", "60000", "2", "5", "2024-01-01T00:00:00Z", "60"],
            &RowDefaults::default(),
        )
        .unwrap();
        assert_eq!(
            signal.created_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_negative_validity_rejected() {
        let err = parse_row(
            2,
            &["BTCUSDT", "LONG", "60000", "2", "5", "2024-01-01 00:00", "-5"],
            &RowDefaults::default(),
        )
        .unwrap_err();
        assert!(err.reason.contains("validity"));
    }
}

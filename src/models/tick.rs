//! Live tick model and wire normalization.
//!
//! The push connection delivers price updates in more than one JSON shape
//! depending on the subscription mode and server version. [`parse_tick`]
//! sniffs those shapes and produces a single [`TickMessage`], so nothing
//! past the adapter boundary ever sees raw payloads.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::InstrumentKey;
use crate::Result;
use crate::error::FeedError;

/// Timestamps below this are taken to be in seconds rather than milliseconds.
const SECONDS_TIMESTAMP_CEILING: i64 = 100_000_000_000;

const TOKEN_FIELDS: &[&str] = &["token", "instrument_token", "symbolToken"];
const SEGMENT_FIELDS: &[&str] = &["exchangeSegment", "exchange_segment", "exch_seg", "segment"];
const LTP_FIELDS: &[&str] = &["ltp", "last_traded_price", "lastPrice", "last_price"];
const CHANGE_FIELDS: &[&str] = &["changeAbs", "change", "net_change", "netChange"];
const CHANGE_PCT_FIELDS: &[&str] = &["changePct", "change_pct", "percent_change", "pChange"];
const VOLUME_FIELDS: &[&str] = &["volume", "volume_trade_for_the_day", "vol"];
const OI_FIELDS: &[&str] = &["openInterest", "open_interest", "oi"];
const TIMESTAMP_FIELDS: &[&str] = &[
    "timestampMillis",
    "exchange_timestamp",
    "exchangeTimestamp",
    "timestamp",
    "ts",
];

/// Session open/high/low/close carried by quote- and full-mode ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOhlc {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// One normalized real-time price update for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickMessage {
    pub instrument: InstrumentKey,
    /// Last traded price.
    pub ltp: Decimal,
    /// Absolute change against previous close, when the feed sends it.
    pub change_abs: Option<Decimal>,
    /// Percentage change against previous close, when the feed sends it.
    pub change_pct: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub open_interest: Option<Decimal>,
    pub ohlc: Option<SessionOhlc>,
    /// Exchange timestamp in Unix milliseconds.
    pub timestamp_millis: i64,
}

impl TickMessage {
    /// Creates a price-only tick. Optional fields start empty.
    pub fn new(instrument: InstrumentKey, ltp: Decimal, timestamp_millis: i64) -> Self {
        Self {
            instrument,
            ltp,
            change_abs: None,
            change_pct: None,
            volume: None,
            open_interest: None,
            ohlc: None,
            timestamp_millis,
        }
    }

    pub fn with_change(mut self, change_abs: Decimal, change_pct: Decimal) -> Self {
        self.change_abs = Some(change_abs);
        self.change_pct = Some(change_pct);
        self
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_open_interest(mut self, open_interest: Decimal) -> Self {
        self.open_interest = Some(open_interest);
        self
    }

    pub fn with_ohlc(mut self, ohlc: SessionOhlc) -> Self {
        self.ohlc = Some(ohlc);
        self
    }
}

/// Normalizes one raw tick object into a [`TickMessage`].
///
/// Accepts either a flat object or one with session prices nested under
/// `"ohlc"`. Numbers may arrive as JSON numbers or numeric strings, the
/// exchange segment as a name or a numeric code, and the timestamp in
/// seconds or milliseconds.
///
/// # Errors
///
/// Returns [`FeedError::MalformedTick`] if the token, segment, price or
/// timestamp is missing or unparseable, if the price is not positive, or
/// if the timestamp falls outside the representable date range.
pub fn parse_tick(value: &Value) -> Result<TickMessage> {
    let object = value
        .as_object()
        .ok_or_else(|| FeedError::MalformedTick("tick payload is not an object".to_string()))?;

    let token = first_field(value, TOKEN_FIELDS)
        .and_then(text_of)
        .ok_or_else(|| FeedError::MalformedTick("missing token".to_string()))?;
    let segment = first_field(value, SEGMENT_FIELDS)
        .and_then(text_of)
        .ok_or_else(|| FeedError::MalformedTick(format!("missing exchange segment for {token}")))?;
    let instrument = InstrumentKey::new(token, segment);

    let ltp = required_decimal(value, LTP_FIELDS, "ltp", &instrument)?;
    if ltp <= Decimal::ZERO {
        return Err(FeedError::MalformedTick(format!(
            "non-positive ltp {ltp} for {instrument}"
        )));
    }

    let timestamp = first_field(value, TIMESTAMP_FIELDS)
        .and_then(integer_of)
        .ok_or_else(|| FeedError::MalformedTick(format!("missing timestamp for {instrument}")))?;
    if timestamp <= 0 {
        return Err(FeedError::MalformedTick(format!(
            "non-positive timestamp {timestamp} for {instrument}"
        )));
    }
    let timestamp_millis = to_millis(timestamp);
    if DateTime::<Utc>::from_timestamp_millis(timestamp_millis).is_none() {
        return Err(FeedError::MalformedTick(format!(
            "out-of-range timestamp {timestamp} for {instrument}"
        )));
    }

    let ohlc_source = object.get("ohlc").filter(|v| v.is_object()).unwrap_or(value);
    let ohlc = match (
        optional_decimal(ohlc_source, &["open", "open_price_of_the_day"]),
        optional_decimal(ohlc_source, &["high", "high_price_of_the_day"]),
        optional_decimal(ohlc_source, &["low", "low_price_of_the_day"]),
        optional_decimal(ohlc_source, &["close", "closed_price", "prevClose"]),
    ) {
        (Some(open), Some(high), Some(low), Some(close)) => Some(SessionOhlc {
            open,
            high,
            low,
            close,
        }),
        _ => None,
    };

    Ok(TickMessage {
        instrument,
        ltp,
        change_abs: optional_decimal(value, CHANGE_FIELDS),
        change_pct: optional_decimal(value, CHANGE_PCT_FIELDS),
        volume: optional_decimal(value, VOLUME_FIELDS),
        open_interest: optional_decimal(value, OI_FIELDS),
        ohlc,
        timestamp_millis,
    })
}

/// Scales a seconds timestamp up to milliseconds; millisecond values pass through.
pub(crate) fn to_millis(timestamp: i64) -> i64 {
    if timestamp < SECONDS_TIMESTAMP_CEILING {
        timestamp * 1_000
    } else {
        timestamp
    }
}

fn first_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| value.get(*name))
        .find(|v| !v.is_null())
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn optional_decimal(value: &Value, names: &[&str]) -> Option<Decimal> {
    first_field(value, names).and_then(decimal_of)
}

fn required_decimal(
    value: &Value,
    names: &[&str],
    label: &str,
    instrument: &InstrumentKey,
) -> Result<Decimal> {
    let raw = first_field(value, names)
        .ok_or_else(|| FeedError::MalformedTick(format!("missing {label} for {instrument}")))?;
    decimal_of(raw)
        .ok_or_else(|| FeedError::MalformedTick(format!("unparseable {label} {raw} for {instrument}")))
}

//! OHLCV bar models and bucket arithmetic.

use std::fmt;
use std::str::FromStr;

use chrono::FixedOffset;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

const MINUTE_MS: i64 = 60_000;

/// Fixed chart resolutions supported by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Resolution {
    /// Every supported resolution, finest first.
    pub const ALL: [Resolution; 6] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::FifteenMinutes,
        Resolution::ThirtyMinutes,
        Resolution::OneHour,
        Resolution::OneDay,
    ];

    /// Width of one bucket in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Resolution::OneMinute => MINUTE_MS,
            Resolution::FiveMinutes => 5 * MINUTE_MS,
            Resolution::FifteenMinutes => 15 * MINUTE_MS,
            Resolution::ThirtyMinutes => 30 * MINUTE_MS,
            Resolution::OneHour => 60 * MINUTE_MS,
            Resolution::OneDay => 24 * 60 * MINUTE_MS,
        }
    }

    /// Returns the short name used on the wire and in config (`"5m"`, `"1d"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::OneMinute => "1m",
            Resolution::FiveMinutes => "5m",
            Resolution::FifteenMinutes => "15m",
            Resolution::ThirtyMinutes => "30m",
            Resolution::OneHour => "1h",
            Resolution::OneDay => "1d",
        }
    }

    /// Start of the bucket containing `timestamp_ms`.
    ///
    /// Buckets are aligned in exchange-local time: intraday resolutions to
    /// the top of the local hour, daily bars to local midnight. Seconds and
    /// milliseconds are always zeroed. Returns `None` if the timestamp is
    /// too close to the edge of the `i64` range to shift into local time.
    pub fn bucket_start(&self, timestamp_ms: i64, utc_offset: FixedOffset) -> Option<i64> {
        let offset_ms = i64::from(utc_offset.local_minus_utc()) * 1_000;
        let local_ms = timestamp_ms.checked_add(offset_ms)?;
        local_ms
            .checked_sub(local_ms.rem_euclid(self.duration_ms()))?
            .checked_sub(offset_ms)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|resolution| resolution.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FeedError::Config(format!("unsupported resolution {s:?}")))
    }
}

/// One fixed-width OHLCV bucket of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    /// Bucket start in Unix milliseconds.
    pub start_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// Opens a bar where every price equals `price`.
    pub fn from_price(start_time: i64, price: Decimal, volume: Option<Decimal>) -> Self {
        Self {
            start_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: volume.unwrap_or(Decimal::ZERO),
        }
    }

    /// Extends the bar in place with a later price in the same bucket.
    pub fn apply_price(&mut self, price: Decimal, volume: Option<Decimal>) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        if let Some(volume) = volume {
            self.volume += volume;
        }
    }
}

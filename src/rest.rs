//! REST collaborator for quote snapshots and historical bars.
//!
//! The pipeline only needs two calls from the broker's REST API: a one-time
//! quote snapshot (static metadata plus previous close) when an instrument
//! is first subscribed, and a history backfill when a chart opens. Both
//! sit behind the [`SnapshotSource`] trait so the service can be driven by
//! a fake in tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::Result;
use crate::error::FeedError;
use crate::models::InstrumentKey;
use crate::models::bar::{Bar, Resolution};
use crate::models::quote::QuoteSnapshot;
use crate::models::tick::{decimal_of, integer_of, to_millis};

/// Per-request timeout for REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of the one-time REST data the pipeline is seeded from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetches static metadata and previous close for each instrument.
    ///
    /// Instruments the source does not know may simply be left out.
    async fn fetch_quote_snapshot(&self, instruments: &[InstrumentKey])
    -> Result<Vec<QuoteSnapshot>>;

    /// Fetches bars for one instrument between two Unix-millisecond times.
    async fn fetch_historical_bars(
        &self,
        instrument: &InstrumentKey,
        resolution: Resolution,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Bar>>;
}

/// [`SnapshotSource`] backed by the broker's JSON REST API.
#[derive(Debug, Clone)]
pub struct RestSnapshotClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestSnapshotClient {
    /// Creates a client for the API rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotClient {
    async fn fetch_quote_snapshot(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<Vec<QuoteSnapshot>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/quotes", self.base_url))
            .json(&json!({ "instruments": instruments }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;

        let snapshots = parse_quote_response(&body)?;
        info!(
            requested = instruments.len(),
            received = snapshots.len(),
            "Fetched quote snapshot"
        );
        Ok(snapshots)
    }

    async fn fetch_historical_bars(
        &self,
        instrument: &InstrumentKey,
        resolution: Resolution,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Bar>> {
        let response = self
            .client
            .get(format!("{}/history", self.base_url))
            .query(&[
                ("token", instrument.token.clone()),
                ("exchangeSegment", instrument.exchange_segment.clone()),
                ("interval", resolution.as_str().to_string()),
                ("from", from_ms.to_string()),
                ("to", to_ms.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;

        let bars = parse_history_response(&body)?;
        debug!(%instrument, %resolution, bars = bars.len(), "Fetched bar history");
        Ok(bars)
    }
}

/// Checks the common `{"status": ..., "message": ...}` envelope and returns
/// the `data` member.
fn payload(body: &Value) -> Result<&Value> {
    if let Some(status) = body["status"].as_str()
        && !status.eq_ignore_ascii_case("success")
    {
        let message = body["message"].as_str().unwrap_or("no message");
        return Err(FeedError::Snapshot(format!("API error ({status}): {message}")));
    }
    body.get("data")
        .filter(|data| !data.is_null())
        .ok_or_else(|| FeedError::Snapshot("missing data in response".to_string()))
}

/// Decodes a quote snapshot response body.
///
/// # Errors
///
/// Returns [`FeedError::Snapshot`] for an error envelope or a missing
/// `data` array, and [`FeedError::Json`] if an entry does not decode.
pub fn parse_quote_response(body: &Value) -> Result<Vec<QuoteSnapshot>> {
    let data = payload(body)?;
    let entries = data
        .as_array()
        .ok_or_else(|| FeedError::Snapshot("quote data is not an array".to_string()))?;
    entries
        .iter()
        .map(|entry| serde_json::from_value(entry.clone()).map_err(FeedError::from))
        .collect()
}

/// Decodes a history response body of `[time, open, high, low, close, volume]`
/// rows under `data.candles`.
///
/// Times may be Unix seconds, Unix milliseconds or RFC 3339 strings.
/// Volume may be absent.
///
/// # Errors
///
/// Returns [`FeedError::Snapshot`] for an error envelope or any row that
/// cannot be decoded.
pub fn parse_history_response(body: &Value) -> Result<Vec<Bar>> {
    let data = payload(body)?;
    let rows = data
        .get("candles")
        .unwrap_or(data)
        .as_array()
        .ok_or_else(|| FeedError::Snapshot("candle data is not an array".to_string()))?;
    rows.iter().map(parse_candle_row).collect()
}

fn parse_candle_row(row: &Value) -> Result<Bar> {
    let fields = row
        .as_array()
        .filter(|fields| fields.len() >= 5)
        .ok_or_else(|| FeedError::Snapshot(format!("bad candle row {row}")))?;

    let start_time = candle_time(&fields[0])
        .ok_or_else(|| FeedError::Snapshot(format!("bad candle time {}", fields[0])))?;
    let price = |index: usize| {
        decimal_of(&fields[index])
            .ok_or_else(|| FeedError::Snapshot(format!("bad candle price in {row}")))
    };

    Ok(Bar {
        start_time,
        open: price(1)?,
        high: price(2)?,
        low: price(3)?,
        close: price(4)?,
        volume: fields.get(5).and_then(decimal_of).unwrap_or_default(),
    })
}

fn candle_time(value: &Value) -> Option<i64> {
    if let Some(text) = value.as_str()
        && let Ok(parsed) = DateTime::parse_from_rfc3339(text)
    {
        return Some(parsed.timestamp_millis());
    }
    integer_of(value).map(to_millis)
}

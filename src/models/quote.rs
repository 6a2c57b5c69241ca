//! Canonical quote record models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::InstrumentKey;
use super::tick::SessionOhlc;

/// Reference data for an instrument. Never touched by tick merges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticMetadata {
    pub symbol: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub lot_size: Option<u32>,
    #[serde(default)]
    pub exchange: Option<String>,
}

impl StaticMetadata {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    pub fn with_lot_size(mut self, lot_size: u32) -> Self {
        self.lot_size = Some(lot_size);
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Overwrites the fields `update` sets; unset fields keep their
    /// current value.
    pub fn overlay(&mut self, update: &StaticMetadata) {
        if !update.symbol.is_empty() {
            self.symbol.clone_from(&update.symbol);
        }
        if update.display_name.is_some() {
            self.display_name.clone_from(&update.display_name);
        }
        if update.lot_size.is_some() {
            self.lot_size = update.lot_size;
        }
        if update.exchange.is_some() {
            self.exchange.clone_from(&update.exchange);
        }
    }

    /// Fills fields the caller left empty from another source.
    ///
    /// Caller-supplied values always win.
    pub fn fill_missing_from(&mut self, other: &StaticMetadata) {
        if self.symbol.is_empty() {
            self.symbol.clone_from(&other.symbol);
        }
        if self.display_name.is_none() {
            self.display_name.clone_from(&other.display_name);
        }
        if self.lot_size.is_none() {
            self.lot_size = other.lot_size;
        }
        if self.exchange.is_none() {
            self.exchange.clone_from(&other.exchange);
        }
    }
}

/// Where a record's change figures came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// Sent by the feed on the tick itself.
    Tick,
    /// Computed from the last price and the previous close.
    Derived,
    /// Neither sent nor computable yet (no previous close).
    Unavailable,
}

/// Live fields of a quote, replaced wholesale on every merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuote {
    pub ltp: Decimal,
    pub change_abs: Option<Decimal>,
    pub change_pct: Option<Decimal>,
    pub change_source: ChangeSource,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub open_interest: Option<Decimal>,
    /// Exchange timestamp of the tick these fields came from.
    pub exchange_timestamp_millis: i64,
}

/// Progress of the one-time REST enrichment for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SnapshotState {
    Pending,
    Loaded,
    /// The fetch failed; only an explicit retry fetches again.
    Failed(String),
}

/// Canonical last-known state of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRecord {
    pub instrument: InstrumentKey,
    pub metadata: StaticMetadata,
    /// Previous session close from the REST snapshot. Ticks never change it.
    pub previous_close: Option<Decimal>,
    pub live: Option<LiveQuote>,
    /// Local time the live fields were last written. `None` until the first tick.
    pub last_updated: Option<DateTime<Utc>>,
    pub snapshot: SnapshotState,
}

impl QuoteRecord {
    /// Creates a static-only record awaiting its snapshot.
    pub fn seeded(instrument: InstrumentKey, metadata: StaticMetadata) -> Self {
        Self {
            instrument,
            metadata,
            previous_close: None,
            live: None,
            last_updated: None,
            snapshot: SnapshotState::Pending,
        }
    }

    /// Last traded price, if any live data has arrived.
    pub fn ltp(&self) -> Option<Decimal> {
        self.live.as_ref().map(|live| live.ltp)
    }

    /// Whether the presentation layer should show a "no data" state.
    pub fn has_no_data(&self) -> bool {
        self.live.is_none() && matches!(self.snapshot, SnapshotState::Failed(_))
    }
}

/// Per-instrument answer of the REST quote snapshot collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSnapshot {
    pub instrument: InstrumentKey,
    #[serde(default)]
    pub metadata: StaticMetadata,
    /// Previous session close; the base for derived change figures.
    pub previous_close: Option<Decimal>,
    #[serde(default)]
    pub ltp: Option<Decimal>,
    #[serde(default)]
    pub ohlc: Option<SessionOhlc>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub timestamp_millis: Option<i64>,
}

impl QuoteSnapshot {
    pub fn new(instrument: InstrumentKey, previous_close: Option<Decimal>) -> Self {
        Self {
            instrument,
            metadata: StaticMetadata::default(),
            previous_close,
            ltp: None,
            ohlc: None,
            volume: None,
            timestamp_millis: None,
        }
    }
}

//! Shared test utilities: a recording transport, a scripted REST source,
//! and tick/time builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use tickflow::error::{FeedError, TransportError};
use tickflow::models::bar::{Bar, Resolution};
use tickflow::models::quote::QuoteSnapshot;
use tickflow::models::tick::TickMessage;
use tickflow::models::{InstrumentKey, SubscriptionMode};
use tickflow::rest::SnapshotSource;
use tickflow::transport::TransportAdapter;

/// One call made on a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(Vec<InstrumentKey>),
    Unsubscribe(Vec<InstrumentKey>),
}

/// Transport fake that records every call and can refuse chosen keys.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub calls: Vec<Call>,
    pub refuse: HashSet<InstrumentKey>,
}

impl RecordingTransport {
    pub fn refusing(keys: &[InstrumentKey]) -> Self {
        Self {
            calls: Vec::new(),
            refuse: keys.iter().cloned().collect(),
        }
    }

    pub fn subscribes(&self) -> Vec<Vec<InstrumentKey>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Subscribe(keys) => Some(keys.clone()),
                Call::Unsubscribe(_) => None,
            })
            .collect()
    }

    pub fn unsubscribes(&self) -> Vec<Vec<InstrumentKey>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Unsubscribe(keys) => Some(keys.clone()),
                Call::Subscribe(_) => None,
            })
            .collect()
    }
}

impl TransportAdapter for RecordingTransport {
    fn subscribe(
        &mut self,
        instruments: &[InstrumentKey],
        _mode: SubscriptionMode,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::Subscribe(instruments.to_vec()));
        let refused: Vec<_> = instruments
            .iter()
            .filter(|key| self.refuse.contains(*key))
            .cloned()
            .collect();
        if refused.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                instruments: refused,
                reason: "unknown instrument".to_string(),
            })
        }
    }

    fn unsubscribe(
        &mut self,
        instruments: &[InstrumentKey],
        _mode: SubscriptionMode,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::Unsubscribe(instruments.to_vec()));
        Ok(())
    }
}

/// Scripted [`SnapshotSource`] that records requests.
#[derive(Default)]
pub struct FakeSource {
    pub snapshots: Mutex<HashMap<InstrumentKey, QuoteSnapshot>>,
    pub history: Mutex<HashMap<(InstrumentKey, Resolution), Vec<Bar>>>,
    pub fail_snapshots: AtomicBool,
    pub fail_history: AtomicBool,
    pub history_delay: Mutex<Option<Duration>>,
    pub snapshot_calls: Mutex<Vec<Vec<InstrumentKey>>>,
    pub history_calls: Mutex<Vec<(InstrumentKey, Resolution)>>,
}

impl FakeSource {
    pub fn with_snapshot(self, snapshot: QuoteSnapshot) -> Self {
        self.snapshots
            .lock()
            .insert(snapshot.instrument.clone(), snapshot);
        self
    }

    pub fn with_history(self, instrument: InstrumentKey, resolution: Resolution, bars: Vec<Bar>) -> Self {
        self.history.lock().insert((instrument, resolution), bars);
        self
    }

    pub fn set_fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch_quote_snapshot(
        &self,
        instruments: &[InstrumentKey],
    ) -> tickflow::Result<Vec<QuoteSnapshot>> {
        self.snapshot_calls.lock().push(instruments.to_vec());
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(FeedError::Snapshot("snapshot service unavailable".to_string()));
        }
        let snapshots = self.snapshots.lock();
        Ok(instruments
            .iter()
            .filter_map(|key| snapshots.get(key).cloned())
            .collect())
    }

    async fn fetch_historical_bars(
        &self,
        instrument: &InstrumentKey,
        resolution: Resolution,
        _from_ms: i64,
        _to_ms: i64,
    ) -> tickflow::Result<Vec<Bar>> {
        self.history_calls
            .lock()
            .push((instrument.clone(), resolution));
        let delay = *self.history_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(FeedError::Snapshot("history service unavailable".to_string()));
        }
        Ok(self
            .history
            .lock()
            .get(&(instrument.clone(), resolution))
            .cloned()
            .unwrap_or_default())
    }
}

pub fn key(token: &str) -> InstrumentKey {
    InstrumentKey::new(token, "NSE_EQ")
}

pub fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
}

/// Unix milliseconds for 2024-01-15 at the given UTC time.
pub fn at(h: u32, m: u32, s: u32) -> i64 {
    Utc.with_ymd_and_hms(2024, 1, 15, h, m, s)
        .unwrap()
        .timestamp_millis()
}

pub fn tick(token: &str, ltp: Decimal, timestamp_millis: i64) -> TickMessage {
    TickMessage::new(key(token), ltp, timestamp_millis)
}

pub fn bar(start_time: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
    Bar {
        start_time,
        open,
        high,
        low,
        close,
        volume: Decimal::ZERO,
    }
}

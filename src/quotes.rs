//! Canonical last-known quote per instrument.
//!
//! Static metadata comes from the caller when an instrument enters the
//! desired set and is topped up by the one-time REST snapshot. Live fields
//! are overwritten wholesale by each coalesced tick. Reads never touch the
//! network.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::coalescer::CoalescedBatch;
use crate::models::InstrumentKey;
use crate::models::quote::{
    ChangeSource, LiveQuote, QuoteRecord, QuoteSnapshot, SnapshotState, StaticMetadata,
};
use crate::models::tick::TickMessage;

/// Decimal places kept on derived percentage changes.
const CHANGE_PCT_SCALE: u32 = 2;

#[derive(Debug, Default)]
pub struct QuoteStore {
    records: HashMap<InstrumentKey, QuoteRecord>,
}

impl QuoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes the record for an instrument entering the
    /// desired set. Returns `true` if the record is new.
    ///
    /// On re-entry only the static fields the caller sets replace the
    /// stored ones, so values filled in by an earlier snapshot survive a key
    /// passed without metadata. Live fields, previous close and snapshot
    /// state are kept.
    pub fn seed(&mut self, instrument: InstrumentKey, metadata: StaticMetadata) -> bool {
        match self.records.get_mut(&instrument) {
            Some(record) => {
                record.metadata.overlay(&metadata);
                false
            }
            None => {
                self.records
                    .insert(instrument.clone(), QuoteRecord::seeded(instrument, metadata));
                true
            }
        }
    }

    /// Merges every tick of a batch and returns the updated records,
    /// sorted by instrument.
    pub fn apply_batch(&mut self, batch: &CoalescedBatch, now: DateTime<Utc>) -> Vec<QuoteRecord> {
        let mut updated = Vec::with_capacity(batch.len());
        for instrument in batch.instruments() {
            let Some(tick) = batch.get(&instrument) else {
                continue;
            };
            let record = self.records.entry(instrument.clone()).or_insert_with(|| {
                debug!(%instrument, "Creating quote record from tick");
                QuoteRecord::seeded(instrument.clone(), StaticMetadata::default())
            });
            merge_tick(record, tick, now);
            updated.push(record.clone());
        }
        updated
    }

    /// Applies a REST snapshot to an existing record.
    ///
    /// Returns `None` if the instrument was removed while the fetch was in
    /// flight. Snapshot prices only fill the live fields if no tick has
    /// arrived yet; otherwise derived change figures are recomputed against
    /// the newly known previous close.
    pub fn apply_snapshot(&mut self, snapshot: QuoteSnapshot) -> Option<QuoteRecord> {
        let record = self.records.get_mut(&snapshot.instrument)?;

        record.metadata.fill_missing_from(&snapshot.metadata);
        if snapshot.previous_close.is_some() {
            record.previous_close = snapshot.previous_close;
        }
        record.snapshot = SnapshotState::Loaded;

        match record.live.as_mut() {
            Some(live) if live.change_source != ChangeSource::Tick => {
                let (abs, pct, source) =
                    derive_change(live.ltp, None, None, record.previous_close);
                live.change_abs = abs;
                live.change_pct = pct;
                live.change_source = source;
            }
            Some(_) => {}
            None => {
                if let Some(ltp) = snapshot.ltp {
                    let (change_abs, change_pct, change_source) =
                        derive_change(ltp, None, None, record.previous_close);
                    record.live = Some(LiveQuote {
                        ltp,
                        change_abs,
                        change_pct,
                        change_source,
                        open: snapshot.ohlc.map(|o| o.open),
                        high: snapshot.ohlc.map(|o| o.high),
                        low: snapshot.ohlc.map(|o| o.low),
                        close: snapshot.ohlc.map(|o| o.close),
                        volume: snapshot.volume,
                        open_interest: None,
                        exchange_timestamp_millis: snapshot.timestamp_millis.unwrap_or_default(),
                    });
                }
            }
        }

        Some(record.clone())
    }

    /// Marks a record's snapshot as failed so the presentation layer can
    /// show a "no data" state. A record that already loaded is left alone.
    pub fn mark_snapshot_failed(
        &mut self,
        instrument: &InstrumentKey,
        reason: &str,
    ) -> Option<QuoteRecord> {
        let record = self.records.get_mut(instrument)?;
        if record.snapshot == SnapshotState::Loaded {
            return None;
        }
        warn!(%instrument, %reason, "Quote snapshot failed");
        record.snapshot = SnapshotState::Failed(reason.to_string());
        Some(record.clone())
    }

    /// Moves failed snapshots back to pending and returns their instruments.
    pub fn reset_failed_snapshots(&mut self) -> Vec<InstrumentKey> {
        let mut retried: Vec<_> = self
            .records
            .values_mut()
            .filter(|record| matches!(record.snapshot, SnapshotState::Failed(_)))
            .map(|record| {
                record.snapshot = SnapshotState::Pending;
                record.instrument.clone()
            })
            .collect();
        retried.sort();
        retried
    }

    pub fn get(&self, instrument: &InstrumentKey) -> Option<&QuoteRecord> {
        self.records.get(instrument)
    }

    pub fn contains(&self, instrument: &InstrumentKey) -> bool {
        self.records.contains_key(instrument)
    }

    pub fn remove(&mut self, instrument: &InstrumentKey) -> Option<QuoteRecord> {
        self.records.remove(instrument)
    }

    pub fn records(&self) -> impl Iterator<Item = &QuoteRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn merge_tick(record: &mut QuoteRecord, tick: &TickMessage, now: DateTime<Utc>) {
    let (change_abs, change_pct, change_source) = derive_change(
        tick.ltp,
        tick.change_abs,
        tick.change_pct,
        record.previous_close,
    );

    record.live = Some(LiveQuote {
        ltp: tick.ltp,
        change_abs,
        change_pct,
        change_source,
        open: tick.ohlc.map(|o| o.open),
        high: tick.ohlc.map(|o| o.high),
        low: tick.ohlc.map(|o| o.low),
        close: tick.ohlc.map(|o| o.close),
        volume: tick.volume,
        open_interest: tick.open_interest,
        exchange_timestamp_millis: tick.timestamp_millis,
    });
    record.last_updated = Some(now);
}

/// Fills in whichever change figure the feed left out, using the previous
/// close when it is known and non-zero.
fn derive_change(
    ltp: Decimal,
    change_abs: Option<Decimal>,
    change_pct: Option<Decimal>,
    previous_close: Option<Decimal>,
) -> (Option<Decimal>, Option<Decimal>, ChangeSource) {
    if change_abs.is_some() && change_pct.is_some() {
        return (change_abs, change_pct, ChangeSource::Tick);
    }

    let base = previous_close.filter(|close| !close.is_zero());
    match base {
        Some(close) => {
            let diff = ltp - close;
            let pct = diff
                .checked_div(close)
                .map(|ratio| (ratio * Decimal::ONE_HUNDRED).round_dp(CHANGE_PCT_SCALE));
            (
                change_abs.or(Some(diff)),
                change_pct.or(pct),
                ChangeSource::Derived,
            )
        }
        None if change_abs.is_some() || change_pct.is_some() => {
            (change_abs, change_pct, ChangeSource::Tick)
        }
        None => (None, None, ChangeSource::Unavailable),
    }
}

//! The synchronous pipeline engine.
//!
//! [`MarketFeed`] wires the four stages together: transport events go
//! through the reconciler or into the coalescer, and each flush fans the
//! batch out to the quote store and the bar aggregator. It never blocks
//! and never touches the network; [`crate::service`] supplies the timer,
//! the REST fetches and the locking.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::Result;
use crate::bars::{BarAggregator, BarSeriesSnapshot, BarUpdate, SeriesTicket};
use crate::coalescer::TickCoalescer;
use crate::models::InstrumentKey;
use crate::models::SubscriptionMode;
use crate::models::bar::{Bar, Resolution};
use crate::models::quote::{QuoteRecord, QuoteSnapshot, StaticMetadata};
use crate::models::tick::TickMessage;
use crate::quotes::QuoteStore;
use crate::reconciler::{ReconcileOutcome, SubscriptionReconciler};
use crate::transport::{ConnectionState, TransportAdapter, TransportEvent};

/// The instruments the application wants live data for, each with the
/// static metadata the caller knows about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSet {
    entries: BTreeMap<InstrumentKey, StaticMetadata>,
}

impl DesiredSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instrument, replacing any metadata given for it earlier.
    pub fn with(mut self, instrument: InstrumentKey, metadata: StaticMetadata) -> Self {
        self.insert(instrument, metadata);
        self
    }

    pub fn insert(&mut self, instrument: InstrumentKey, metadata: StaticMetadata) {
        self.entries.insert(instrument, metadata);
    }

    pub fn contains(&self, instrument: &InstrumentKey) -> bool {
        self.entries.contains_key(instrument)
    }

    pub fn metadata(&self, instrument: &InstrumentKey) -> Option<&StaticMetadata> {
        self.entries.get(instrument)
    }

    pub fn keys(&self) -> impl Iterator<Item = &InstrumentKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(InstrumentKey, StaticMetadata)> for DesiredSet {
    fn from_iter<I: IntoIterator<Item = (InstrumentKey, StaticMetadata)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Keys without caller metadata get an empty record; the snapshot fills it.
impl FromIterator<InstrumentKey> for DesiredSet {
    fn from_iter<I: IntoIterator<Item = InstrumentKey>>(iter: I) -> Self {
        iter.into_iter()
            .map(|key| (key, StaticMetadata::default()))
            .collect()
    }
}

/// What replacing the desired set changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSetChange {
    /// Newly seeded instruments. Each needs a quote snapshot.
    pub added: Vec<InstrumentKey>,
    /// Instruments whose records, series and buffered ticks were dropped.
    pub removed: Vec<InstrumentKey>,
    /// Instruments kept, with static fields refreshed from the caller.
    pub reseeded: Vec<InstrumentKey>,
    pub reconcile: ReconcileOutcome,
}

/// Bar changes for one series within an applied batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BarSeriesUpdate {
    pub instrument: InstrumentKey,
    pub resolution: Resolution,
    /// Set when the batch closed a bar.
    pub closed_bar: Option<Bar>,
    pub current_bar: Option<Bar>,
}

/// Everything one flush changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedBatch {
    pub sequence: u64,
    pub quotes: Vec<QuoteRecord>,
    pub bars: Vec<BarSeriesUpdate>,
}

/// Notifications published to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    /// Exactly one per non-empty flush.
    BatchApplied(AppliedBatch),
    /// Snapshot results, successful or failed, for a set of records.
    SnapshotApplied(Vec<QuoteRecord>),
    /// A series finished (or failed) loading its history.
    HistoryLoaded(BarSeriesSnapshot),
    ConnectionChanged(ConnectionState),
}

/// Running counters for the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    pub ticks_received: u64,
    /// Ticks for instruments outside the desired set.
    pub ticks_ignored: u64,
    /// Ticks replaced by a later one in the same window.
    pub ticks_superseded: u64,
    pub malformed_ticks: u64,
    /// Series updates skipped because the tick predated the current bar.
    pub late_ticks_discarded: u64,
    pub batches_flushed: u64,
    pub instruments_rejected: u64,
}

/// The reconcile, coalesce, merge and aggregate pipeline.
pub struct MarketFeed<T> {
    reconciler: SubscriptionReconciler<T>,
    coalescer: TickCoalescer,
    quotes: QuoteStore,
    bars: BarAggregator,
    desired: DesiredSet,
    stats: FeedStats,
}

impl<T: TransportAdapter> MarketFeed<T> {
    pub fn new(transport: T, mode: SubscriptionMode, utc_offset: FixedOffset) -> Self {
        Self {
            reconciler: SubscriptionReconciler::new(transport, mode),
            coalescer: TickCoalescer::new(),
            quotes: QuoteStore::new(),
            bars: BarAggregator::new(utc_offset),
            desired: DesiredSet::new(),
            stats: FeedStats::default(),
        }
    }

    /// Replaces the desired set wholesale.
    ///
    /// Instruments that left are dropped immediately from every store;
    /// instruments that joined are seeded with the caller's metadata; the
    /// transport is then reconciled against the new set.
    pub fn set_desired_set(&mut self, desired: DesiredSet) -> DesiredSetChange {
        let mut change = DesiredSetChange::default();

        for key in self.desired.keys() {
            if desired.contains(key) {
                continue;
            }
            self.quotes.remove(key);
            self.bars.remove_instrument(key);
            self.coalescer.discard(key);
            change.removed.push(key.clone());
        }

        for (key, metadata) in &desired.entries {
            if self.quotes.seed(key.clone(), metadata.clone()) {
                change.added.push(key.clone());
            } else {
                change.reseeded.push(key.clone());
            }
        }

        let keys: HashSet<InstrumentKey> = desired.keys().cloned().collect();
        self.desired = desired;
        change.reconcile = self.reconciler.reconcile(keys);
        self.stats.instruments_rejected += change.reconcile.rejected.len() as u64;

        info!(
            added = change.added.len(),
            removed = change.removed.len(),
            desired = self.desired.len(),
            "Desired set updated"
        );
        change
    }

    pub fn desired_set(&self) -> &DesiredSet {
        &self.desired
    }

    /// Buffers a tick for the next flush. Returns `false` if the tick was
    /// ignored because its instrument is not desired.
    pub fn ingest_tick(&mut self, tick: TickMessage) -> bool {
        self.stats.ticks_received += 1;
        if !self.desired.contains(&tick.instrument) {
            self.stats.ticks_ignored += 1;
            debug!(instrument = %tick.instrument, "Ignoring tick for undesired instrument");
            return false;
        }
        if self.coalescer.push(tick) {
            self.stats.ticks_superseded += 1;
        }
        true
    }

    /// Routes one transport event. Connection changes are returned so the
    /// caller can publish them.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Option<FeedUpdate> {
        match event {
            TransportEvent::Tick(tick) => {
                self.ingest_tick(tick);
                None
            }
            TransportEvent::ConnectionState(state) => {
                let outcome = self.reconciler.on_connection_state_change(state);
                self.stats.instruments_rejected += outcome.rejected.len() as u64;
                Some(FeedUpdate::ConnectionChanged(state))
            }
            TransportEvent::SubscribeRejected {
                instruments,
                reason,
            } => {
                let dropped = self.reconciler.on_subscribe_rejected(&instruments, &reason);
                self.stats.instruments_rejected += dropped.len() as u64;
                None
            }
            TransportEvent::MalformedTick(reason) => {
                self.stats.malformed_ticks += 1;
                warn!(%reason, "Dropped malformed tick");
                None
            }
        }
    }

    /// Drains the coalescer into both sinks.
    ///
    /// Returns `None` when no tick arrived since the previous flush.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Option<AppliedBatch> {
        let batch = self.coalescer.flush()?;
        self.stats.batches_flushed += 1;

        let quotes = self.quotes.apply_batch(&batch, now);

        let mut bars = Vec::new();
        for update in self.bars.on_batch(&batch) {
            let closed_bar = match update.update {
                BarUpdate::Discarded => {
                    self.stats.late_ticks_discarded += 1;
                    continue;
                }
                BarUpdate::Rolled { closed } => Some(closed),
                BarUpdate::Extended | BarUpdate::Opened => None,
            };
            let current_bar = self.bars.current_bar(&update.instrument, update.resolution);
            bars.push(BarSeriesUpdate {
                instrument: update.instrument,
                resolution: update.resolution,
                closed_bar,
                current_bar,
            });
        }

        debug!(
            sequence = batch.sequence(),
            quotes = quotes.len(),
            bars = bars.len(),
            "Applied batch"
        );
        Some(AppliedBatch {
            sequence: batch.sequence(),
            quotes,
            bars,
        })
    }

    /// Applies the answer to a snapshot request for `requested`.
    ///
    /// Instruments the response left out, or all of them if the request
    /// failed, are marked failed. Instruments removed in the meantime are
    /// skipped. Returns the records that changed.
    pub fn apply_snapshots(
        &mut self,
        requested: &[InstrumentKey],
        result: Result<Vec<QuoteSnapshot>>,
    ) -> Vec<QuoteRecord> {
        let snapshots = match result {
            Ok(snapshots) => snapshots,
            Err(e) => {
                let reason = e.to_string();
                return requested
                    .iter()
                    .filter_map(|key| self.quotes.mark_snapshot_failed(key, &reason))
                    .collect();
            }
        };

        let mut answered = HashSet::with_capacity(snapshots.len());
        let mut updated = Vec::with_capacity(requested.len());
        for snapshot in snapshots {
            answered.insert(snapshot.instrument.clone());
            if let Some(record) = self.quotes.apply_snapshot(snapshot) {
                updated.push(record);
            }
        }
        for key in requested.iter().filter(|key| !answered.contains(*key)) {
            if let Some(record) = self
                .quotes
                .mark_snapshot_failed(key, "instrument missing from snapshot response")
            {
                updated.push(record);
            }
        }
        updated
    }

    /// Opens a bar series for a chart. Returns a ticket to fetch history
    /// with, or `None` if the series is already open.
    pub fn open_chart(
        &mut self,
        instrument: InstrumentKey,
        resolution: Resolution,
    ) -> Option<SeriesTicket> {
        if !self.desired.contains(&instrument) {
            debug!(%instrument, "Opening chart for an instrument with no live subscription");
        }
        self.bars.open_series(instrument, resolution)
    }

    pub fn close_chart(&mut self, instrument: &InstrumentKey, resolution: Resolution) -> bool {
        self.bars.close_series(instrument, resolution)
    }

    /// Discards the series at `from` and opens one at `to`.
    pub fn change_chart_resolution(
        &mut self,
        instrument: InstrumentKey,
        from: Resolution,
        to: Resolution,
    ) -> Option<SeriesTicket> {
        if from != to {
            self.bars.close_series(&instrument, from);
        }
        self.bars.open_series(instrument, to)
    }

    /// Applies the answer to a history request. Returns `None` if the
    /// series was closed or reopened since the ticket was issued.
    pub fn apply_history(
        &mut self,
        ticket: &SeriesTicket,
        result: Result<Vec<Bar>>,
        now: DateTime<Utc>,
    ) -> Option<BarSeriesSnapshot> {
        match result {
            Ok(bars) => self.bars.load_history(ticket, bars, now.timestamp_millis()),
            Err(e) => self.bars.mark_history_failed(ticket, &e.to_string()),
        }
    }

    /// Time range `[from, to]` in Unix milliseconds covering the last
    /// `bars` buckets of a series up to `now`.
    pub fn history_range(&self, resolution: Resolution, bars: usize, now: DateTime<Utc>) -> (i64, i64) {
        let to = now.timestamp_millis();
        let current = resolution
            .bucket_start(to, self.bars.utc_offset())
            .unwrap_or(to);
        let span = resolution.duration_ms().saturating_mul(bars as i64);
        (current.saturating_sub(span), to)
    }

    /// Instruments whose snapshot failed, reset to pending for a new fetch.
    pub fn retry_snapshots(&mut self) -> Vec<InstrumentKey> {
        self.quotes.reset_failed_snapshots()
    }

    /// Series whose history failed, reset to loading under new tickets.
    pub fn retry_history(&mut self) -> Vec<SeriesTicket> {
        self.bars.reset_failed()
    }

    pub fn quote(&self, instrument: &InstrumentKey) -> Option<QuoteRecord> {
        self.quotes.get(instrument).cloned()
    }

    /// All records, sorted by instrument.
    pub fn quotes(&self) -> Vec<QuoteRecord> {
        let mut records: Vec<_> = self.quotes.records().cloned().collect();
        records.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        records
    }

    pub fn bar_series(
        &self,
        instrument: &InstrumentKey,
        resolution: Resolution,
    ) -> Option<BarSeriesSnapshot> {
        self.bars.get(instrument, resolution)
    }

    pub fn open_charts(&self) -> Vec<(InstrumentKey, Resolution)> {
        self.bars.open_series_ids()
    }

    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.reconciler.state()
    }

    pub fn active_set(&self) -> &HashSet<InstrumentKey> {
        self.reconciler.active()
    }

    pub fn pending_ticks(&self) -> usize {
        self.coalescer.pending_len()
    }

    pub fn transport(&self) -> &T {
        self.reconciler.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.reconciler.transport_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::error::{FeedError, TransportError};

    #[derive(Default)]
    struct NullTransport {
        calls: usize,
    }

    impl TransportAdapter for NullTransport {
        fn subscribe(
            &mut self,
            _instruments: &[InstrumentKey],
            _mode: SubscriptionMode,
        ) -> std::result::Result<(), TransportError> {
            self.calls += 1;
            Ok(())
        }

        fn unsubscribe(
            &mut self,
            _instruments: &[InstrumentKey],
            _mode: SubscriptionMode,
        ) -> std::result::Result<(), TransportError> {
            self.calls += 1;
            Ok(())
        }
    }

    fn key(token: &str) -> InstrumentKey {
        InstrumentKey::new(token, "NSE_EQ")
    }

    fn feed() -> MarketFeed<NullTransport> {
        let mut feed = MarketFeed::new(
            NullTransport::default(),
            SubscriptionMode::Quote,
            FixedOffset::east_opt(0).unwrap(),
        );
        feed.on_transport_event(TransportEvent::ConnectionState(ConnectionState::Connected));
        feed
    }

    #[test]
    fn undesired_ticks_are_ignored() {
        let mut feed = feed();
        feed.set_desired_set([key("A")].into_iter().collect());

        assert!(!feed.ingest_tick(TickMessage::new(key("B"), dec!(1), 1)));
        assert!(feed.flush(Utc::now()).is_none());
        assert_eq!(feed.stats().ticks_ignored, 1);
    }

    #[test]
    fn removal_drops_record_series_and_buffered_tick() {
        let mut feed = feed();
        feed.set_desired_set([key("A")].into_iter().collect());
        feed.open_chart(key("A"), Resolution::OneMinute);
        feed.ingest_tick(TickMessage::new(key("A"), dec!(10), 1_000));

        let change = feed.set_desired_set(DesiredSet::new());

        assert_eq!(change.removed, vec![key("A")]);
        assert!(feed.quote(&key("A")).is_none());
        assert!(feed.bar_series(&key("A"), Resolution::OneMinute).is_none());
        assert_eq!(feed.pending_ticks(), 0);
        assert!(feed.flush(Utc::now()).is_none());
    }

    #[test]
    fn snapshot_failure_marks_every_requested_record() {
        let mut feed = feed();
        feed.set_desired_set([key("A"), key("B")].into_iter().collect());

        let updated = feed.apply_snapshots(
            &[key("A"), key("B")],
            Err(FeedError::Snapshot("gateway timeout".to_string())),
        );
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(QuoteRecord::has_no_data));
        assert_eq!(feed.retry_snapshots(), vec![key("A"), key("B")]);
    }

    #[test]
    fn partial_snapshot_marks_missing_instruments() {
        let mut feed = feed();
        feed.set_desired_set([key("A"), key("B")].into_iter().collect());

        let updated = feed.apply_snapshots(
            &[key("A"), key("B")],
            Ok(vec![QuoteSnapshot::new(key("A"), Some(dec!(100)))]),
        );
        assert_eq!(updated.len(), 2);
        assert!(!feed.quote(&key("A")).unwrap().has_no_data());
        assert!(feed.quote(&key("B")).unwrap().has_no_data());
    }

    #[test]
    fn history_range_covers_requested_bars() {
        let feed = feed();
        let now = DateTime::from_timestamp_millis(10 * 60_000 + 30_000).unwrap();
        let (from, to) = feed.history_range(Resolution::OneMinute, 5, now);
        assert_eq!(from, 5 * 60_000);
        assert_eq!(to, now.timestamp_millis());
    }

    #[test]
    fn changing_resolution_replaces_the_series() {
        let mut feed = feed();
        feed.set_desired_set([key("A")].into_iter().collect());
        feed.open_chart(key("A"), Resolution::OneMinute);

        let ticket = feed
            .change_chart_resolution(key("A"), Resolution::OneMinute, Resolution::FiveMinutes)
            .unwrap();
        assert_eq!(ticket.resolution, Resolution::FiveMinutes);
        assert_eq!(feed.open_charts(), vec![(key("A"), Resolution::FiveMinutes)]);
    }
}

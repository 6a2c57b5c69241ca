//! Async runtime around [`MarketFeed`].
//!
//! [`FeedHandle`] serializes all mutation through one lock, runs the flush
//! timer, pumps transport events, and performs the REST fetches as spawned
//! tasks whose results are applied when they land. Reads take the lock
//! only long enough to clone, so they never wait on the network.
//!
//! Methods that start fetches spawn onto the current tokio runtime and
//! must be called from within one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bars::{BarSeriesSnapshot, SeriesTicket};
use crate::feed::{AppliedBatch, DesiredSet, DesiredSetChange, FeedStats, FeedUpdate, MarketFeed};
use crate::models::InstrumentKey;
use crate::models::bar::Resolution;
use crate::models::quote::QuoteRecord;
use crate::notify::{ListenerId, Listeners};
use crate::rest::SnapshotSource;
use crate::transport::{ConnectionState, TransportAdapter, TransportEvent};

/// Default number of bars requested when a chart opens.
pub const DEFAULT_HISTORY_BARS: usize = 500;

/// Shared handle to a running feed. Cheap to clone.
pub struct FeedHandle<T> {
    feed: Arc<Mutex<MarketFeed<T>>>,
    source: Arc<dyn SnapshotSource>,
    listeners: Listeners,
    history_bars: usize,
    cancel: CancellationToken,
}

impl<T> Clone for FeedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            feed: Arc::clone(&self.feed),
            source: Arc::clone(&self.source),
            listeners: self.listeners.clone(),
            history_bars: self.history_bars,
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: TransportAdapter + 'static> FeedHandle<T> {
    pub fn new(feed: MarketFeed<T>, source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            feed: Arc::new(Mutex::new(feed)),
            source,
            listeners: Listeners::new(),
            history_bars: DEFAULT_HISTORY_BARS,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets how many bars of history are requested per chart.
    pub fn with_history_bars(mut self, bars: usize) -> Self {
        self.history_bars = bars;
        self
    }

    /// Registers a callback for every [`FeedUpdate`].
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&FeedUpdate) + Send + Sync + 'static,
    {
        self.listeners.register(callback)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Starts the flush timer. Missed periods are skipped, never bunched.
    pub fn spawn_flush_loop(&self, period: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_ms = period.as_millis() as u64, "Flush loop started");
            loop {
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        handle.flush_now();
                    }
                }
            }
            info!("Flush loop stopped");
        })
    }

    /// Forwards transport events into the feed until the channel closes or
    /// the handle is shut down.
    pub fn spawn_event_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => handle.handle_event(event),
                        None => {
                            debug!("Transport event channel closed");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Applies one transport event and publishes any resulting update.
    pub fn handle_event(&self, event: TransportEvent) {
        let update = self.feed.lock().on_transport_event(event);
        if let Some(update) = update {
            self.listeners.notify(&update);
        }
    }

    /// Runs one flush immediately and notifies listeners if anything was
    /// applied.
    pub fn flush_now(&self) -> Option<AppliedBatch> {
        let applied = self.feed.lock().flush(Utc::now());
        if let Some(applied) = &applied {
            self.listeners
                .notify(&FeedUpdate::BatchApplied(applied.clone()));
        }
        applied
    }

    /// Replaces the desired set and fetches snapshots for new instruments.
    pub fn set_desired_set(&self, desired: DesiredSet) -> DesiredSetChange {
        let change = self.feed.lock().set_desired_set(desired);
        if !change.added.is_empty() {
            self.spawn_snapshot_fetch(change.added.clone());
        }
        change
    }

    pub fn desired_set(&self) -> DesiredSet {
        self.feed.lock().desired_set().clone()
    }

    /// Opens a chart and starts its history fetch. Returns `false` if the
    /// series was already open.
    pub fn open_chart(&self, instrument: InstrumentKey, resolution: Resolution) -> bool {
        let ticket = self.feed.lock().open_chart(instrument, resolution);
        match ticket {
            Some(ticket) => {
                self.spawn_history_fetch(ticket);
                true
            }
            None => false,
        }
    }

    pub fn close_chart(&self, instrument: &InstrumentKey, resolution: Resolution) -> bool {
        self.feed.lock().close_chart(instrument, resolution)
    }

    /// Switches a chart to another resolution, discarding the old series.
    pub fn change_chart_resolution(
        &self,
        instrument: InstrumentKey,
        from: Resolution,
        to: Resolution,
    ) -> bool {
        let ticket = self
            .feed
            .lock()
            .change_chart_resolution(instrument, from, to);
        match ticket {
            Some(ticket) => {
                self.spawn_history_fetch(ticket);
                true
            }
            None => false,
        }
    }

    /// Re-fetches failed quote snapshots. Returns the instruments retried.
    pub fn retry_snapshots(&self) -> Vec<InstrumentKey> {
        let retried = self.feed.lock().retry_snapshots();
        if !retried.is_empty() {
            self.spawn_snapshot_fetch(retried.clone());
        }
        retried
    }

    /// Re-fetches failed histories. Returns how many series were retried.
    pub fn retry_history(&self) -> usize {
        let tickets = self.feed.lock().retry_history();
        let count = tickets.len();
        for ticket in tickets {
            self.spawn_history_fetch(ticket);
        }
        count
    }

    pub fn quote(&self, instrument: &InstrumentKey) -> Option<QuoteRecord> {
        self.feed.lock().quote(instrument)
    }

    pub fn quotes(&self) -> Vec<QuoteRecord> {
        self.feed.lock().quotes()
    }

    pub fn bar_series(
        &self,
        instrument: &InstrumentKey,
        resolution: Resolution,
    ) -> Option<BarSeriesSnapshot> {
        self.feed.lock().bar_series(instrument, resolution)
    }

    pub fn stats(&self) -> FeedStats {
        self.feed.lock().stats()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.feed.lock().connection_state()
    }

    /// Runs `f` with the engine locked. Keep it short.
    pub fn with_feed<R>(&self, f: impl FnOnce(&mut MarketFeed<T>) -> R) -> R {
        f(&mut self.feed.lock())
    }

    /// Stops the flush loop and event pump.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn spawn_snapshot_fetch(&self, instruments: Vec<InstrumentKey>) {
        let handle = self.clone();
        tokio::spawn(async move {
            let result = handle.source.fetch_quote_snapshot(&instruments).await;
            let records = handle.feed.lock().apply_snapshots(&instruments, result);
            if !records.is_empty() {
                handle
                    .listeners
                    .notify(&FeedUpdate::SnapshotApplied(records));
            }
        });
    }

    fn spawn_history_fetch(&self, ticket: SeriesTicket) {
        let handle = self.clone();
        let (from_ms, to_ms) =
            self.feed
                .lock()
                .history_range(ticket.resolution, self.history_bars, Utc::now());
        tokio::spawn(async move {
            let result = handle
                .source
                .fetch_historical_bars(&ticket.instrument, ticket.resolution, from_ms, to_ms)
                .await;
            let series = handle.feed.lock().apply_history(&ticket, result, Utc::now());
            if let Some(series) = series {
                handle.listeners.notify(&FeedUpdate::HistoryLoaded(series));
            }
        });
    }
}

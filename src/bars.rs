//! OHLCV bar aggregation per (instrument, resolution).
//!
//! Every open series keeps an append-only run of closed bars plus at most
//! one mutable current bar. Series never share state, even for the same
//! instrument at two resolutions, and each carries a generation number so
//! a history response for a series that was closed and reopened in the
//! meantime can be recognised and dropped.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::FixedOffset;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coalescer::CoalescedBatch;
use crate::models::InstrumentKey;
use crate::models::bar::{Bar, Resolution};

/// Load state of a series' REST history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SeriesStatus {
    Loading,
    Ready,
    /// History could not be fetched. Live ticks still build bars.
    Failed(String),
}

/// Identifies one opening of a series. Stale tickets no longer match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesTicket {
    pub instrument: InstrumentKey,
    pub resolution: Resolution,
    pub generation: u64,
}

/// Effect of one tick on a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarUpdate {
    /// The current bar absorbed the price.
    Extended,
    /// The current bar closed and a new one opened.
    Rolled { closed: Bar },
    /// The first bar of an empty series opened.
    Opened,
    /// The tick fell before the current bar and was ignored.
    Discarded,
}

/// Read-only copy of a series handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarSeriesSnapshot {
    pub instrument: InstrumentKey,
    pub resolution: Resolution,
    pub closed_bars: Vec<Bar>,
    pub current_bar: Option<Bar>,
    pub status: SeriesStatus,
}

/// A single (instrument, resolution) bar series.
#[derive(Debug, Clone)]
pub struct BarSeries {
    resolution: Resolution,
    closed: Vec<Bar>,
    current: Option<Bar>,
    status: SeriesStatus,
    generation: u64,
}

impl BarSeries {
    pub fn new(resolution: Resolution, generation: u64) -> Self {
        Self {
            resolution,
            closed: Vec::new(),
            current: None,
            status: SeriesStatus::Loading,
            generation,
        }
    }

    /// Folds one price into the series.
    ///
    /// Bars never move backwards in time: a price whose bucket starts
    /// before the current bar, or at or before the last closed bar when no
    /// bar is open, is discarded.
    pub fn apply_tick(
        &mut self,
        price: Decimal,
        volume: Option<Decimal>,
        timestamp_ms: i64,
        utc_offset: FixedOffset,
    ) -> BarUpdate {
        let Some(bucket) = self.resolution.bucket_start(timestamp_ms, utc_offset) else {
            debug!(timestamp_ms, "Discarding tick with unbucketable timestamp");
            return BarUpdate::Discarded;
        };

        if let Some(current) = self.current.as_mut() {
            if bucket < current.start_time {
                return BarUpdate::Discarded;
            }
            if bucket == current.start_time {
                current.apply_price(price, volume);
                return BarUpdate::Extended;
            }
            let closed = std::mem::replace(current, Bar::from_price(bucket, price, volume));
            self.closed.push(closed);
            return BarUpdate::Rolled { closed };
        }

        if self.closed.last().is_some_and(|last| bucket <= last.start_time) {
            return BarUpdate::Discarded;
        }
        self.current = Some(Bar::from_price(bucket, price, volume));
        BarUpdate::Opened
    }

    /// Installs REST history as the closed series.
    ///
    /// Bars are deduplicated by start time (first occurrence wins) and
    /// sorted. Bars built from live ticks before the history arrived are
    /// merged in rather than lost. Without a live current bar, the last
    /// history bar is promoted to current if it covers `now_ms`.
    ///
    /// Returns the number of closed bars afterwards.
    pub fn seed_history(&mut self, bars: Vec<Bar>, now_ms: i64, utc_offset: FixedOffset) -> usize {
        let mut seen = HashSet::with_capacity(bars.len());
        let mut merged: BTreeMap<i64, Bar> = BTreeMap::new();
        for bar in bars {
            if seen.insert(bar.start_time) {
                merged.insert(bar.start_time, bar);
            }
        }

        for live in std::mem::take(&mut self.closed) {
            merged
                .entry(live.start_time)
                .and_modify(|rest| *rest = merge_live(*rest, live))
                .or_insert(live);
        }

        self.current = match self.current.take() {
            Some(live) => {
                let later = merged.split_off(&live.start_time);
                let mut current = live;
                for (start, rest) in later {
                    if start == live.start_time {
                        current = merge_live(rest, live);
                    } else {
                        debug!(start, "Dropping history bar newer than the live bar");
                    }
                }
                Some(current)
            }
            None => {
                let current_bucket = self.resolution.bucket_start(now_ms, utc_offset);
                let last_start = merged.last_key_value().map(|(&start, _)| start);
                match last_start {
                    Some(start) if Some(start) == current_bucket => merged.remove(&start),
                    _ => None,
                }
            }
        };

        self.closed = merged.into_values().collect();
        self.status = SeriesStatus::Ready;
        self.closed.len()
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.status = SeriesStatus::Failed(reason.to_string());
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn closed_bars(&self) -> &[Bar] {
        &self.closed
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    pub fn status(&self) -> &SeriesStatus {
        &self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Combines a history bar with a live bar for the same bucket: history
/// open, widest range, live close, larger volume.
fn merge_live(rest: Bar, live: Bar) -> Bar {
    Bar {
        start_time: rest.start_time,
        open: rest.open,
        high: rest.high.max(live.high),
        low: rest.low.min(live.low),
        close: live.close,
        volume: rest.volume.max(live.volume),
    }
}

/// Result of feeding one batch into one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesUpdate {
    pub instrument: InstrumentKey,
    pub resolution: Resolution,
    pub update: BarUpdate,
}

/// Owns every open bar series.
#[derive(Debug)]
pub struct BarAggregator {
    series: HashMap<(InstrumentKey, Resolution), BarSeries>,
    utc_offset: FixedOffset,
    next_generation: u64,
}

impl BarAggregator {
    /// Creates an aggregator aligning buckets to `utc_offset` local time.
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            series: HashMap::new(),
            utc_offset,
            next_generation: 0,
        }
    }

    /// Opens an empty series awaiting history.
    ///
    /// Returns `None` if the series is already open.
    pub fn open_series(
        &mut self,
        instrument: InstrumentKey,
        resolution: Resolution,
    ) -> Option<SeriesTicket> {
        let id = (instrument.clone(), resolution);
        if self.series.contains_key(&id) {
            return None;
        }
        let generation = self.bump_generation();
        self.series.insert(id, BarSeries::new(resolution, generation));
        info!(%instrument, %resolution, generation, "Opened bar series");
        Some(SeriesTicket {
            instrument,
            resolution,
            generation,
        })
    }

    /// Discards a series and everything it holds.
    pub fn close_series(&mut self, instrument: &InstrumentKey, resolution: Resolution) -> bool {
        let removed = self
            .series
            .remove(&(instrument.clone(), resolution))
            .is_some();
        if removed {
            info!(%instrument, %resolution, "Closed bar series");
        }
        removed
    }

    /// Discards every series of an instrument. Returns how many were open.
    pub fn remove_instrument(&mut self, instrument: &InstrumentKey) -> usize {
        let before = self.series.len();
        self.series.retain(|(key, _), _| key != instrument);
        before - self.series.len()
    }

    /// Feeds a batch into every open series whose instrument it carries.
    ///
    /// Updates are sorted by instrument then resolution.
    pub fn on_batch(&mut self, batch: &CoalescedBatch) -> Vec<SeriesUpdate> {
        let mut updates = Vec::new();
        for ((instrument, resolution), series) in &mut self.series {
            let Some(tick) = batch.get(instrument) else {
                continue;
            };
            let update = series.apply_tick(tick.ltp, tick.volume, tick.timestamp_millis, self.utc_offset);
            if update == BarUpdate::Discarded {
                debug!(
                    %instrument,
                    %resolution,
                    timestamp = tick.timestamp_millis,
                    "Discarded late tick"
                );
            }
            updates.push(SeriesUpdate {
                instrument: instrument.clone(),
                resolution: *resolution,
                update,
            });
        }
        updates.sort_by(|a, b| {
            (&a.instrument, a.resolution).cmp(&(&b.instrument, b.resolution))
        });
        updates
    }

    /// Installs fetched history. Returns `None` if the ticket is stale.
    pub fn load_history(
        &mut self,
        ticket: &SeriesTicket,
        bars: Vec<Bar>,
        now_ms: i64,
    ) -> Option<BarSeriesSnapshot> {
        let utc_offset = self.utc_offset;
        let series = self.live_series(ticket)?;
        let received = bars.len();
        let closed = series.seed_history(bars, now_ms, utc_offset);
        info!(
            instrument = %ticket.instrument,
            resolution = %ticket.resolution,
            received,
            closed,
            "Loaded bar history"
        );
        self.get(&ticket.instrument, ticket.resolution)
    }

    /// Records a failed history fetch. Returns `None` if the ticket is stale.
    pub fn mark_history_failed(
        &mut self,
        ticket: &SeriesTicket,
        reason: &str,
    ) -> Option<BarSeriesSnapshot> {
        let series = self.live_series(ticket)?;
        warn!(
            instrument = %ticket.instrument,
            resolution = %ticket.resolution,
            %reason,
            "Bar history fetch failed"
        );
        series.mark_failed(reason);
        self.get(&ticket.instrument, ticket.resolution)
    }

    /// Moves failed series back to loading under a fresh generation and
    /// returns tickets to fetch them with.
    pub fn reset_failed(&mut self) -> Vec<SeriesTicket> {
        let failed: Vec<(InstrumentKey, Resolution)> = self
            .series
            .iter()
            .filter(|(_, series)| matches!(series.status, SeriesStatus::Failed(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let mut tickets = Vec::with_capacity(failed.len());
        for (instrument, resolution) in failed {
            let generation = self.bump_generation();
            if let Some(series) = self.series.get_mut(&(instrument.clone(), resolution)) {
                series.status = SeriesStatus::Loading;
                series.generation = generation;
                tickets.push(SeriesTicket {
                    instrument,
                    resolution,
                    generation,
                });
            }
        }
        tickets.sort_by(|a, b| (&a.instrument, a.resolution).cmp(&(&b.instrument, b.resolution)));
        tickets
    }

    pub fn get(
        &self,
        instrument: &InstrumentKey,
        resolution: Resolution,
    ) -> Option<BarSeriesSnapshot> {
        self.series
            .get(&(instrument.clone(), resolution))
            .map(|series| BarSeriesSnapshot {
                instrument: instrument.clone(),
                resolution,
                closed_bars: series.closed.clone(),
                current_bar: series.current,
                status: series.status.clone(),
            })
    }

    pub fn current_bar(&self, instrument: &InstrumentKey, resolution: Resolution) -> Option<Bar> {
        self.series
            .get(&(instrument.clone(), resolution))
            .and_then(|series| series.current)
    }

    pub fn is_open(&self, instrument: &InstrumentKey, resolution: Resolution) -> bool {
        self.series.contains_key(&(instrument.clone(), resolution))
    }

    /// Every open (instrument, resolution) pair, sorted.
    pub fn open_series_ids(&self) -> Vec<(InstrumentKey, Resolution)> {
        let mut ids: Vec<_> = self.series.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    fn live_series(&mut self, ticket: &SeriesTicket) -> Option<&mut BarSeries> {
        let series = self
            .series
            .get_mut(&(ticket.instrument.clone(), ticket.resolution))?;
        if series.generation != ticket.generation {
            debug!(
                instrument = %ticket.instrument,
                resolution = %ticket.resolution,
                "Dropping history for a reopened series"
            );
            return None;
        }
        Some(series)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::models::tick::TickMessage;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s)
            .unwrap()
            .timestamp_millis()
    }

    fn bar(start: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar {
            start_time: start,
            open,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    fn key() -> InstrumentKey {
        InstrumentKey::new("2885", "NSE_EQ")
    }

    #[test]
    fn one_minute_bucketing_rolls_bars() {
        let mut series = BarSeries::new(Resolution::OneMinute, 1);
        assert_eq!(series.apply_tick(dec!(100), None, at(9, 15, 10), utc()), BarUpdate::Opened);
        assert_eq!(series.apply_tick(dec!(105), None, at(9, 15, 40), utc()), BarUpdate::Extended);
        let rolled = series.apply_tick(dec!(102), None, at(9, 16, 5), utc());

        let expected_closed = bar(at(9, 15, 0), dec!(100), dec!(105), dec!(100), dec!(105));
        assert_eq!(rolled, BarUpdate::Rolled { closed: expected_closed });
        assert_eq!(series.closed_bars(), &[expected_closed]);
        assert_eq!(
            series.current_bar(),
            Some(&bar(at(9, 16, 0), dec!(102), dec!(102), dec!(102), dec!(102)))
        );
    }

    #[test]
    fn late_tick_changes_nothing() {
        let mut series = BarSeries::new(Resolution::OneMinute, 1);
        series.apply_tick(dec!(100), None, at(9, 15, 10), utc());
        series.apply_tick(dec!(102), None, at(9, 16, 5), utc());
        let closed_before = series.closed_bars().to_vec();
        let current_before = series.current_bar().copied();

        assert_eq!(
            series.apply_tick(dec!(1), None, at(9, 15, 50), utc()),
            BarUpdate::Discarded
        );
        assert_eq!(series.closed_bars(), closed_before.as_slice());
        assert_eq!(series.current_bar().copied(), current_before);
    }

    #[test]
    fn unbucketable_tick_is_discarded() {
        let ist = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let mut series = BarSeries::new(Resolution::OneMinute, 1);
        series.apply_tick(dec!(100), None, at(9, 15, 10), ist);

        assert_eq!(
            series.apply_tick(dec!(1), None, i64::MAX, ist),
            BarUpdate::Discarded
        );
        assert_eq!(series.current_bar().map(|b| b.close), Some(dec!(100)));
    }

    #[test]
    fn volume_accumulates_within_bucket() {
        let mut series = BarSeries::new(Resolution::FiveMinutes, 1);
        series.apply_tick(dec!(10), Some(dec!(3)), at(9, 15, 0), utc());
        series.apply_tick(dec!(11), Some(dec!(4)), at(9, 19, 59), utc());

        assert_eq!(series.current_bar().unwrap().volume, dec!(7));
    }

    #[test]
    fn history_dedups_and_promotes_current_bucket() {
        let mut series = BarSeries::new(Resolution::OneMinute, 1);
        let history = vec![
            bar(at(9, 11, 0), dec!(5), dec!(6), dec!(4), dec!(5)),
            bar(at(9, 10, 0), dec!(1), dec!(2), dec!(1), dec!(2)),
            bar(at(9, 11, 0), dec!(99), dec!(99), dec!(99), dec!(99)),
        ];

        let closed = series.seed_history(history, at(9, 11, 30), utc());
        assert_eq!(closed, 1);
        assert_eq!(series.closed_bars()[0].start_time, at(9, 10, 0));
        assert_eq!(series.current_bar().unwrap().open, dec!(5));

        assert_eq!(series.apply_tick(dec!(7), None, at(9, 11, 45), utc()), BarUpdate::Extended);
        let current = series.current_bar().unwrap();
        assert_eq!(current.start_time, at(9, 11, 0));
        assert_eq!(current.high, dec!(7));
        assert_eq!(series.closed_bars().len(), 1);
        assert_eq!(series.status(), &SeriesStatus::Ready);
    }

    #[test]
    fn history_without_current_bucket_leaves_no_current_bar() {
        let mut series = BarSeries::new(Resolution::OneMinute, 1);
        series.seed_history(
            vec![bar(at(9, 10, 0), dec!(1), dec!(2), dec!(1), dec!(2))],
            at(9, 30, 0),
            utc(),
        );
        assert!(series.current_bar().is_none());
        assert_eq!(series.apply_tick(dec!(3), None, at(9, 30, 1), utc()), BarUpdate::Opened);
    }

    #[test]
    fn history_arriving_after_live_ticks_merges() {
        let mut series = BarSeries::new(Resolution::OneMinute, 1);
        series.apply_tick(dec!(50), Some(dec!(1)), at(9, 11, 5), utc());
        series.apply_tick(dec!(51), Some(dec!(1)), at(9, 12, 5), utc());

        series.seed_history(
            vec![
                bar(at(9, 10, 0), dec!(40), dec!(45), dec!(39), dec!(44)),
                bar(at(9, 11, 0), dec!(44), dec!(49), dec!(43), dec!(48)),
            ],
            at(9, 12, 10),
            utc(),
        );

        let closed = series.closed_bars();
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[1].open, dec!(44));
        assert_eq!(closed[1].high, dec!(50));
        assert_eq!(closed[1].close, dec!(50));
        assert_eq!(series.current_bar().unwrap().start_time, at(9, 12, 0));
    }

    #[test]
    fn aggregator_drops_stale_history_ticket() {
        let mut aggregator = BarAggregator::new(utc());
        let first = aggregator.open_series(key(), Resolution::OneMinute).unwrap();
        aggregator.close_series(&key(), Resolution::OneMinute);
        let second = aggregator.open_series(key(), Resolution::OneMinute).unwrap();

        assert!(aggregator.load_history(&first, vec![], at(9, 0, 0)).is_none());
        let loaded = aggregator.load_history(&second, vec![], at(9, 0, 0)).unwrap();
        assert_eq!(loaded.status, SeriesStatus::Ready);
    }

    #[test]
    fn resolutions_are_independent() {
        let mut aggregator = BarAggregator::new(utc());
        aggregator.open_series(key(), Resolution::OneMinute);
        aggregator.open_series(key(), Resolution::FiveMinutes);
        assert!(aggregator.open_series(key(), Resolution::OneMinute).is_none());

        let batch = CoalescedBatch::from_ticks(1, vec![TickMessage::new(key(), dec!(10), at(9, 16, 0))]);
        let updates = aggregator.on_batch(&batch);
        assert_eq!(updates.len(), 2);

        aggregator.close_series(&key(), Resolution::OneMinute);
        let five = aggregator.get(&key(), Resolution::FiveMinutes).unwrap();
        assert_eq!(five.current_bar.unwrap().start_time, at(9, 15, 0));
        assert!(aggregator.get(&key(), Resolution::OneMinute).is_none());
    }

    #[test]
    fn failed_history_is_retried_under_new_generation() {
        let mut aggregator = BarAggregator::new(utc());
        let ticket = aggregator.open_series(key(), Resolution::OneHour).unwrap();
        let failed = aggregator.mark_history_failed(&ticket, "502").unwrap();
        assert_eq!(failed.status, SeriesStatus::Failed("502".to_string()));

        let retries = aggregator.reset_failed();
        assert_eq!(retries.len(), 1);
        assert!(retries[0].generation > ticket.generation);
        assert!(aggregator.load_history(&ticket, vec![], 0).is_none());
    }
}

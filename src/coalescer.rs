//! Per-window tick deduplication.
//!
//! Ticks are buffered by instrument with last-write-wins semantics. A
//! flush swaps the buffer for an empty one and hands back the old
//! contents as a [`CoalescedBatch`]. The buffer can never hold more
//! entries than there are distinct instruments, regardless of tick rate.

use std::collections::HashMap;
use std::mem;

use crate::models::InstrumentKey;
use crate::models::tick::TickMessage;

/// The latest tick per instrument seen during one flush window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalescedBatch {
    ticks: HashMap<InstrumentKey, TickMessage>,
    /// Monotonic flush number, starting at 1.
    sequence: u64,
}

impl CoalescedBatch {
    /// Builds a batch directly from ticks. Later ticks for the same
    /// instrument replace earlier ones.
    pub fn from_ticks(sequence: u64, ticks: impl IntoIterator<Item = TickMessage>) -> Self {
        let ticks = ticks
            .into_iter()
            .map(|tick| (tick.instrument.clone(), tick))
            .collect();
        Self { ticks, sequence }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn get(&self, key: &InstrumentKey) -> Option<&TickMessage> {
        self.ticks.get(key)
    }

    pub fn ticks(&self) -> impl Iterator<Item = &TickMessage> {
        self.ticks.values()
    }

    /// Instruments in the batch, sorted for stable downstream ordering.
    pub fn instruments(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<_> = self.ticks.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Buffers ticks between flushes.
#[derive(Debug, Default)]
pub struct TickCoalescer {
    buffer: HashMap<InstrumentKey, TickMessage>,
    flushed: u64,
}

impl TickCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a tick, replacing any earlier tick for the same instrument.
    ///
    /// Returns `true` if an earlier tick was superseded.
    pub fn push(&mut self, tick: TickMessage) -> bool {
        self.buffer.insert(tick.instrument.clone(), tick).is_some()
    }

    /// Takes the buffered ticks as one batch, leaving an empty buffer.
    ///
    /// Returns `None` when nothing arrived since the last flush, so empty
    /// windows produce no notifications.
    pub fn flush(&mut self) -> Option<CoalescedBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        self.flushed += 1;
        Some(CoalescedBatch {
            ticks: mem::take(&mut self.buffer),
            sequence: self.flushed,
        })
    }

    /// Drops a buffered tick for an instrument that is no longer wanted.
    pub fn discard(&mut self, key: &InstrumentKey) -> bool {
        self.buffer.remove(key).is_some()
    }

    /// Keeps only buffered ticks whose instrument passes `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&InstrumentKey) -> bool) {
        self.buffer.retain(|key, _| keep(key));
    }

    /// Number of instruments with a buffered tick.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of non-empty batches flushed so far.
    pub fn flushed(&self) -> u64 {
        self.flushed
    }
}

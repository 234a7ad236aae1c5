//! Journal write batcher: accumulates envelopes and decides when a
//! `WriteMessages` round-trip may be dispatched.
//!
//! At most one write is in flight per entity. Envelopes queued while a
//! write is outstanding accumulate and go out in one batch when the
//! batch-level acknowledgement arrives.

use std::collections::VecDeque;

use crate::envelope::Envelope;

/// Accumulating write batch plus the in-flight flag.
pub(crate) struct JournalBatcher<E, R> {
    batch: VecDeque<Envelope<E, R>>,
    write_in_progress: bool,
    max_batch_size: usize,
}

impl<E, R> JournalBatcher<E, R> {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Self {
            batch: VecDeque::new(),
            write_in_progress: false,
            max_batch_size,
        }
    }

    /// Queue an envelope for the next write.
    pub(crate) fn push(&mut self, envelope: Envelope<E, R>) {
        self.batch.push_back(envelope);
    }

    /// Whether the accumulated batch has hit the size bound.
    pub(crate) fn is_full(&self) -> bool {
        self.batch.len() >= self.max_batch_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub(crate) fn write_in_progress(&self) -> bool {
        self.write_in_progress
    }

    /// Take the accumulated batch for dispatch, marking a write as in
    /// flight. Returns `None` when there is nothing to send or a write
    /// is already outstanding.
    pub(crate) fn flush(&mut self) -> Option<Vec<Envelope<E, R>>> {
        if self.write_in_progress || self.batch.is_empty() {
            return None;
        }
        self.write_in_progress = true;
        Some(self.batch.drain(..).collect())
    }

    /// The in-flight write finished (successfully or not). Returns the
    /// next batch to dispatch if envelopes accumulated meanwhile;
    /// otherwise the in-flight flag is simply cleared.
    pub(crate) fn write_complete(&mut self) -> Option<Vec<Envelope<E, R>>> {
        self.write_in_progress = false;
        self.flush()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.batch.len()
    }
}

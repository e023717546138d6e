use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::common::{ChunkNumber, SequenceData, SequenceNumber, Timestamp};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PendingSequence {
    max_watermark: Timestamp,
    seen_chunks: BTreeSet<ChunkNumber>,
    last_chunk: Option<ChunkNumber>,
}

impl PendingSequence {
    fn is_complete(&self) -> bool {
        self.last_chunk
            .map_or(false, |last| self.seen_chunks.len() as u64 == last)
    }
}

/// Outcome of feeding one buffer's sequence data into a [`SequenceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerUpdate {
    /// Already applied, or a chunk seen twice.
    Stale,
    /// Recorded, but a lower sequence number or a sibling chunk is still missing.
    Buffered,
    /// The contiguous prefix grew by `applied` sequence numbers.
    Advanced {
        applied: u64,
        watermark: Timestamp,
        /// First `(previous, received)` pair where a sequence carried a lower watermark.
        regression: Option<(Timestamp, Timestamp)>,
    },
}

/// Per-origin watermark that only moves along the contiguous prefix of complete
/// sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTracker {
    last_applied: SequenceNumber,
    watermark: Timestamp,
    pending: BTreeMap<SequenceNumber, PendingSequence>,
}

impl SequenceTracker {
    /// Tracker expecting `first_sequence` next, with watermark 0.
    pub fn starting_at(first_sequence: SequenceNumber) -> Self {
        Self {
            last_applied: first_sequence.saturating_sub(1),
            watermark: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn watermark(&self) -> Timestamp {
        self.watermark
    }

    pub fn last_applied(&self) -> SequenceNumber {
        self.last_applied
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn observe(&mut self, sequence: SequenceData, watermark: Timestamp) -> TrackerUpdate {
        if sequence.sequence_number <= self.last_applied {
            return TrackerUpdate::Stale;
        }

        let entry = self.pending.entry(sequence.sequence_number).or_default();
        if !entry.seen_chunks.insert(sequence.chunk_number) {
            return TrackerUpdate::Stale;
        }
        entry.max_watermark = entry.max_watermark.max(watermark);
        if sequence.last_chunk {
            entry.last_chunk = Some(sequence.chunk_number);
        }

        let mut applied = 0;
        let mut regression = None;
        while let Some(next) = self.pending.first_entry() {
            if *next.key() != self.last_applied + 1 || !next.get().is_complete() {
                break;
            }
            let (seq, done) = next.remove_entry();
            self.last_applied = seq;
            if done.max_watermark < self.watermark {
                regression.get_or_insert((self.watermark, done.max_watermark));
            } else {
                self.watermark = done.max_watermark;
            }
            applied += 1;
        }

        if applied == 0 {
            TrackerUpdate::Buffered
        } else {
            TrackerUpdate::Advanced {
                applied,
                watermark: self.watermark,
                regression,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_sequence_waits_for_gap() {
        let mut t = SequenceTracker::starting_at(1);
        assert!(matches!(t.observe(SequenceData::single(1), 10), TrackerUpdate::Advanced { watermark: 10, .. }));
        assert_eq!(t.observe(SequenceData::single(3), 30), TrackerUpdate::Buffered);
        assert_eq!(t.watermark(), 10);
        assert_eq!(
            t.observe(SequenceData::single(2), 20),
            TrackerUpdate::Advanced {
                applied: 2,
                watermark: 30,
                regression: None
            }
        );
        assert_eq!(t.last_applied(), 3);
        assert_eq!(t.num_pending(), 0);
    }

    #[test]
    fn chunks_complete_a_sequence_in_any_order() {
        let mut t = SequenceTracker::starting_at(1);
        assert_eq!(t.observe(SequenceData::new(1, 3, true), 7), TrackerUpdate::Buffered);
        assert_eq!(t.observe(SequenceData::new(1, 1, false), 9), TrackerUpdate::Buffered);
        assert_eq!(t.watermark(), 0);
        assert!(matches!(
            t.observe(SequenceData::new(1, 2, false), 5),
            TrackerUpdate::Advanced { applied: 1, watermark: 9, .. }
        ));
    }

    #[test]
    fn duplicates_and_old_sequences_are_stale() {
        let mut t = SequenceTracker::starting_at(1);
        t.observe(SequenceData::single(1), 10);
        assert_eq!(t.observe(SequenceData::single(1), 50), TrackerUpdate::Stale);
        assert_eq!(t.observe(SequenceData::new(2, 1, false), 20), TrackerUpdate::Buffered);
        assert_eq!(t.observe(SequenceData::new(2, 1, false), 20), TrackerUpdate::Stale);
        assert_eq!(t.watermark(), 10);
    }

    #[test]
    fn lower_watermark_is_reported_and_not_applied() {
        let mut t = SequenceTracker::starting_at(5);
        t.observe(SequenceData::single(5), 100);
        assert_eq!(
            t.observe(SequenceData::single(6), 40),
            TrackerUpdate::Advanced {
                applied: 1,
                watermark: 100,
                regression: Some((100, 40))
            }
        );
        assert_eq!(t.last_applied(), 6);
    }
}

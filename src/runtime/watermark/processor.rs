use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{OriginId, SequenceData, Timestamp, INITIAL_SEQUENCE_NUMBER};
use crate::runtime::operators::window::error::{WindowError, WindowResult};

use super::config::{OriginPolicy, RegressionPolicy, WatermarkConfig};
use super::sequence::{SequenceTracker, TrackerUpdate};

/// Captured per-origin state of a [`MultiOriginWatermarkProcessor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkSnapshot {
    pub origins: Vec<(OriginId, SequenceTracker)>,
    pub current: Timestamp,
}

/// Merges watermarks of several origins into one global watermark.
///
/// Each origin only contributes the watermark of its contiguous prefix of sequence numbers;
/// the global watermark is the minimum over origins and never decreases. The origin map is
/// guarded by one mutex, the current value is mirrored in an atomic for lock-free reads.
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    config: WatermarkConfig,
    origins: Mutex<BTreeMap<OriginId, SequenceTracker>>,
    current: AtomicU64,
}

impl MultiOriginWatermarkProcessor {
    pub fn new(config: WatermarkConfig) -> Self {
        let origins = config
            .input_origins
            .iter()
            .map(|origin| (*origin, SequenceTracker::starting_at(INITIAL_SEQUENCE_NUMBER)))
            .collect();
        Self {
            config,
            origins: Mutex::new(origins),
            current: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WatermarkConfig {
        &self.config
    }

    pub fn current_watermark(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }

    pub fn origin_watermark(&self, origin_id: OriginId) -> Option<Timestamp> {
        self.lock_origins().get(&origin_id).map(SequenceTracker::watermark)
    }

    pub fn num_origins(&self) -> usize {
        self.lock_origins().len()
    }

    /// Records `watermark` for `sequence` of `origin_id` and returns the new global watermark.
    pub fn update_watermark(
        &self,
        origin_id: OriginId,
        watermark: Timestamp,
        sequence: SequenceData,
    ) -> WindowResult<Timestamp> {
        let mut origins = self.lock_origins();

        if !origins.contains_key(&origin_id) {
            if self.config.origin_policy == OriginPolicy::Closed {
                return Err(WindowError::UnknownOriginAfterClose(origin_id));
            }
            info!(
                "Registering origin {} at sequence {}",
                origin_id, sequence.sequence_number
            );
            origins.insert(origin_id, SequenceTracker::starting_at(sequence.sequence_number));
        }

        let Some(tracker) = origins.get_mut(&origin_id) else {
            return Ok(self.current_watermark());
        };

        match tracker.observe(sequence, watermark) {
            TrackerUpdate::Stale => {
                debug!(
                    "Ignoring stale sequence {:?} from origin {} (applied up to {})",
                    sequence,
                    origin_id,
                    tracker.last_applied()
                );
                return Ok(self.current_watermark());
            }
            TrackerUpdate::Buffered => {
                debug!(
                    "Buffered sequence {:?} from origin {}, waiting for {}",
                    sequence,
                    origin_id,
                    tracker.last_applied() + 1
                );
                return Ok(self.current_watermark());
            }
            TrackerUpdate::Advanced {
                regression: Some((previous, received)),
                ..
            } => match self.config.regression_policy {
                RegressionPolicy::Strict => {
                    return Err(WindowError::WatermarkRegression {
                        origin_id,
                        previous,
                        received,
                    });
                }
                RegressionPolicy::Tolerant => {
                    warn!(
                        "Watermark regression from origin {}: received {}, keeping {}",
                        origin_id, received, previous
                    );
                }
            },
            TrackerUpdate::Advanced { .. } => {}
        }

        let min_watermark = origins.values().map(SequenceTracker::watermark).min().unwrap_or(0);
        let global = self.current.load(Ordering::SeqCst).max(min_watermark);
        self.current.store(global, Ordering::SeqCst);
        Ok(global)
    }

    pub fn snapshot(&self) -> WatermarkSnapshot {
        let origins = self.lock_origins();
        WatermarkSnapshot {
            origins: origins.iter().map(|(id, t)| (*id, t.clone())).collect(),
            current: self.current_watermark(),
        }
    }

    pub fn restore(&self, snapshot: WatermarkSnapshot) {
        let mut origins = self.lock_origins();
        *origins = snapshot.origins.into_iter().collect();
        self.current.store(snapshot.current, Ordering::SeqCst);
    }

    fn lock_origins(&self) -> std::sync::MutexGuard<'_, BTreeMap<OriginId, SequenceTracker>> {
        self.origins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn single(seq: u64) -> SequenceData {
        SequenceData::single(seq)
    }

    #[test]
    fn global_watermark_waits_for_slowest_origin() {
        let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::new(vec![1, 2]));
        assert_eq!(p.update_watermark(1, 5, single(1)).unwrap(), 0);
        assert_eq!(p.update_watermark(1, 8, single(2)).unwrap(), 0);
        assert_eq!(p.update_watermark(2, 4, single(1)).unwrap(), 4);
        assert_eq!(p.update_watermark(2, 6, single(2)).unwrap(), 6);
        assert_eq!(p.current_watermark(), 6);
        assert_eq!(p.origin_watermark(1), Some(8));
    }

    #[test]
    fn sequence_gap_holds_origin_watermark() {
        let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::new(vec![1]));
        assert_eq!(p.update_watermark(1, 10, single(1)).unwrap(), 10);
        assert_eq!(p.update_watermark(1, 30, single(3)).unwrap(), 10);
        assert_eq!(p.update_watermark(1, 20, single(2)).unwrap(), 30);
    }

    #[test]
    fn open_policy_registers_new_origins_at_first_sequence() {
        let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::default());
        assert_eq!(p.update_watermark(7, 12, single(40)).unwrap(), 12);
        assert_eq!(p.num_origins(), 1);
        assert_eq!(p.update_watermark(8, 15, single(1)).unwrap(), 12);
        assert_eq!(p.update_watermark(7, 20, single(41)).unwrap(), 15);
    }

    #[test]
    fn closed_policy_rejects_unknown_origin() {
        let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::closed(vec![1]));
        let err = p.update_watermark(2, 10, single(1)).unwrap_err();
        assert!(matches!(err, WindowError::UnknownOriginAfterClose(2)));
        assert!(err.is_fatal());
    }

    #[test]
    fn regression_policy_decides_between_warning_and_failure() {
        let tolerant = MultiOriginWatermarkProcessor::new(WatermarkConfig::new(vec![1]));
        tolerant.update_watermark(1, 50, single(1)).unwrap();
        assert_eq!(tolerant.update_watermark(1, 20, single(2)).unwrap(), 50);

        let strict = MultiOriginWatermarkProcessor::new(
            WatermarkConfig::new(vec![1]).with_regression_policy(RegressionPolicy::Strict),
        );
        strict.update_watermark(1, 50, single(1)).unwrap();
        let err = strict.update_watermark(1, 20, single(2)).unwrap_err();
        assert!(matches!(
            err,
            WindowError::WatermarkRegression {
                origin_id: 1,
                previous: 50,
                received: 20
            }
        ));
    }

    #[test]
    fn snapshot_restores_pending_sequences() {
        let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::new(vec![1]));
        p.update_watermark(1, 10, single(1)).unwrap();
        p.update_watermark(1, 30, single(3)).unwrap();
        let snapshot = p.snapshot();

        let restored = MultiOriginWatermarkProcessor::new(WatermarkConfig::new(vec![1]));
        restored.restore(snapshot);
        assert_eq!(restored.current_watermark(), 10);
        assert_eq!(restored.update_watermark(1, 20, single(2)).unwrap(), 30);
    }

    fn shuffled_updates() -> impl Strategy<Value = Vec<(OriginId, u64, u64)>> {
        // per origin: sequence i carries watermark 10 * i; delivery order is shuffled
        prop::collection::vec(1u64..40, 1..4)
            .prop_flat_map(|lens| {
                let updates: Vec<(OriginId, u64, u64)> = lens
                    .iter()
                    .enumerate()
                    .flat_map(|(origin, len)| (1..=*len).map(move |seq| (origin as u64, seq, seq * 10)))
                    .collect();
                Just(updates).prop_shuffle()
            })
    }

    proptest! {
        #[test]
        fn global_watermark_never_decreases(updates in shuffled_updates()) {
            let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::default());
            let mut last = 0;
            for (origin, seq, wm) in updates {
                let global = p.update_watermark(origin, wm, SequenceData::single(seq)).unwrap();
                prop_assert!(global >= last);
                last = global;
            }
        }

        #[test]
        fn declared_origins_end_at_minimum_of_final_watermarks(updates in shuffled_updates()) {
            let mut origins: Vec<OriginId> = updates.iter().map(|u| u.0).collect();
            origins.sort_unstable();
            origins.dedup();
            let p = MultiOriginWatermarkProcessor::new(WatermarkConfig::new(origins.clone()));
            for (origin, seq, wm) in &updates {
                p.update_watermark(*origin, *wm, SequenceData::single(*seq)).unwrap();
            }
            let expected = origins
                .iter()
                .map(|o| updates.iter().filter(|u| u.0 == *o).map(|u| u.2).max().unwrap_or(0))
                .min()
                .unwrap_or(0);
            prop_assert_eq!(p.current_watermark(), expected);
        }
    }
}

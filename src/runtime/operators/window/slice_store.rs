use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::common::{SliceIndex, Timestamp};

use super::aggregates::AccumulatorLayout;
use super::error::{WindowError, WindowResult};
use super::slice::{Slice, SliceState};
use super::slice_assigner::SliceAssigner;

/// A window whose end passed the trigger watermark, with the slices that make it up.
#[derive(Debug, Clone)]
pub struct PlannedWindow {
    pub start: Timestamp,
    pub end: Timestamp,
    pub start_slice_index: SliceIndex,
    pub end_slice_index: SliceIndex,
    pub slices: Vec<Arc<Slice>>,
}

#[derive(Debug, Clone)]
pub struct SliceStoreOptions {
    pub keyed: bool,
    pub num_partials: usize,
    pub max_live_slices: Option<usize>,
    pub pool_capacity: usize,
}

#[derive(Debug, Default)]
struct Inner {
    slices: BTreeMap<SliceIndex, Arc<Slice>>,
    first_index: SliceIndex,
    last_index: Option<SliceIndex>,
    // every window ending at or before this was planned
    frontier: Timestamp,
    pool: Vec<Slice>,
}

/// Ordered slices of one operator, shared by all worker threads.
///
/// Creation is test-and-set under the write lock: concurrent creators of one index get
/// the same slice. Slices below `first_index` were collected and are never recreated.
#[derive(Debug)]
pub struct SliceStore {
    assigner: SliceAssigner,
    layout: Arc<AccumulatorLayout>,
    options: SliceStoreOptions,
    inner: RwLock<Inner>,
    slices_created: AtomicU64,
    slices_collected: AtomicU64,
}

impl SliceStore {
    pub fn new(assigner: SliceAssigner, layout: Arc<AccumulatorLayout>, options: SliceStoreOptions) -> Self {
        Self {
            assigner,
            layout,
            options,
            inner: RwLock::new(Inner::default()),
            slices_created: AtomicU64::new(0),
            slices_collected: AtomicU64::new(0),
        }
    }

    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    pub fn layout(&self) -> &Arc<AccumulatorLayout> {
        &self.layout
    }

    pub fn is_keyed(&self) -> bool {
        self.options.keyed
    }

    pub fn first_index(&self) -> SliceIndex {
        self.read().first_index
    }

    pub fn last_index(&self) -> Option<SliceIndex> {
        self.read().last_index
    }

    pub fn trigger_frontier(&self) -> Timestamp {
        self.read().frontier
    }

    pub fn num_slices(&self) -> usize {
        self.read().slices.len()
    }

    pub fn pool_size(&self) -> usize {
        self.read().pool.len()
    }

    pub fn slices_created(&self) -> u64 {
        self.slices_created.load(Ordering::Relaxed)
    }

    pub fn slices_collected(&self) -> u64 {
        self.slices_collected.load(Ordering::Relaxed)
    }

    pub fn get_or_create_slice(&self, timestamp: Timestamp) -> WindowResult<Arc<Slice>> {
        self.get_or_create_slice_at(self.assigner.slice_index(timestamp), timestamp)
    }

    /// Slice `index`, created on first request. `timestamp` is only reported on late data.
    pub fn get_or_create_slice_at(&self, index: SliceIndex, timestamp: Timestamp) -> WindowResult<Arc<Slice>> {
        {
            let inner = self.read();
            if index < inner.first_index {
                return Err(late(timestamp, index, inner.first_index));
            }
            if let Some(slice) = inner.slices.get(&index) {
                return Ok(Arc::clone(slice));
            }
        }

        let mut inner = self.write();
        if index < inner.first_index {
            return Err(late(timestamp, index, inner.first_index));
        }
        if let Some(slice) = inner.slices.get(&index) {
            return Ok(Arc::clone(slice));
        }
        if self.assigner.last_window_end(index) <= inner.frontier {
            return Err(late(timestamp, index, inner.first_index));
        }
        if let Some(limit) = self.options.max_live_slices {
            if inner.slices.len() >= limit {
                return Err(WindowError::SliceAllocationFailed {
                    index,
                    live: inner.slices.len(),
                    limit,
                });
            }
        }

        let start = self.assigner.slice_start(index);
        let end = self.assigner.slice_end(index);
        let slice = match inner.pool.pop() {
            Some(mut pooled) => {
                pooled.reset(index, start, end, &self.layout);
                pooled
            }
            None => Slice::new(
                index,
                start,
                end,
                self.options.num_partials,
                self.options.keyed,
                &self.layout,
            ),
        };
        let slice = Arc::new(slice);
        inner.slices.insert(index, Arc::clone(&slice));
        inner.last_index = Some(inner.last_index.map_or(index, |last| last.max(index)));
        self.slices_created.fetch_add(1, Ordering::Relaxed);
        debug!("Created slice {} [{}, {})", index, start, end);
        Ok(slice)
    }

    /// Slices with `end <= watermark` that are not finalized yet, in index order.
    pub fn triggerable_slices(&self, watermark: Timestamp) -> impl Iterator<Item = Arc<Slice>> {
        let inner = self.read();
        let slices: Vec<_> = inner
            .slices
            .values()
            .take_while(|slice| slice.end() <= watermark)
            .filter(|slice| !slice.is_finalized())
            .cloned()
            .collect();
        slices.into_iter()
    }

    /// Every slice not finalized yet, in index order.
    pub fn all_non_triggered_slices(&self) -> Vec<Arc<Slice>> {
        self.read()
            .slices
            .values()
            .filter(|slice| !slice.is_finalized())
            .cloned()
            .collect()
    }

    /// Existing slices with index in `[first, last)`.
    pub fn slices_in_range(&self, first: SliceIndex, last: SliceIndex) -> Vec<Arc<Slice>> {
        if first >= last {
            return Vec::new();
        }
        self.read().slices.range(first..last).map(|(_, s)| Arc::clone(s)).collect()
    }

    /// Plans every window ending in `(frontier, trigger_watermark]` that has at least one
    /// slice, in window order. Advances the frontier and finalizes slices whose last window
    /// is now planned. Each window is returned by exactly one call.
    pub fn take_triggerable_windows(&self, trigger_watermark: Timestamp) -> Vec<PlannedWindow> {
        let mut inner = self.write();
        if trigger_watermark <= inner.frontier {
            return Vec::new();
        }
        let frontier = inner.frontier;

        let mut windows = BTreeSet::new();
        for slice in inner.slices.values() {
            if slice.start() >= trigger_watermark {
                break;
            }
            windows.extend(
                self.assigner
                    .windows_containing(slice.index())
                    .filter(|(_, end)| *end > frontier && *end <= trigger_watermark),
            );
        }

        let planned: Vec<PlannedWindow> = windows
            .into_iter()
            .map(|(start, end)| {
                let (first, last) = self.assigner.slice_range(start, end);
                PlannedWindow {
                    start,
                    end,
                    start_slice_index: first,
                    end_slice_index: last,
                    slices: inner.slices.range(first..last).map(|(_, s)| Arc::clone(s)).collect(),
                }
            })
            .collect();

        inner.frontier = trigger_watermark;
        for slice in inner.slices.values() {
            if slice.start() >= trigger_watermark {
                break;
            }
            if self.assigner.last_window_end(slice.index()) <= trigger_watermark {
                slice.finalize();
            }
        }

        planned
    }

    /// Drops every slice that no window ending after `probe_watermark` needs. Returns the
    /// number of slices dropped.
    pub fn garbage_collect(&self, probe_watermark: Timestamp) -> usize {
        let mut inner = self.write();
        let first_live = self.assigner.first_live_index(probe_watermark);
        if first_live <= inner.first_index {
            return 0;
        }
        inner.first_index = first_live;

        let retained = inner.slices.split_off(&first_live);
        let collected = std::mem::replace(&mut inner.slices, retained);
        let count = collected.len();
        for (_, slice) in collected {
            if inner.pool.len() >= self.options.pool_capacity {
                continue;
            }
            // still referenced by an in-flight merge; dropped when that finishes
            if let Ok(slice) = Arc::try_unwrap(slice) {
                inner.pool.push(slice);
            }
        }
        if count > 0 {
            self.slices_collected.fetch_add(count as u64, Ordering::Relaxed);
            debug!(
                "Collected {} slices below index {} (probe watermark {})",
                count, first_live, probe_watermark
            );
        }
        count
    }

    /// Non-finalized slices with all partials combined, for snapshots.
    pub fn capture_slices(&self) -> Vec<(SliceIndex, SliceState, u64)> {
        self.all_non_triggered_slices()
            .into_iter()
            .map(|slice| {
                (
                    slice.index(),
                    slice.combined_state(self.options.keyed, &self.layout),
                    slice.num_records(),
                )
            })
            .collect()
    }

    /// Replaces the store content with captured slices and bounds.
    pub fn restore(
        &self,
        slices: Vec<(SliceIndex, SliceState, u64)>,
        first_index: SliceIndex,
        frontier: Timestamp,
    ) {
        let mut inner = self.write();
        inner.slices.clear();
        inner.first_index = first_index;
        inner.frontier = frontier;
        inner.last_index = None;
        for (index, state, records) in slices {
            let slice = Slice::new(
                index,
                self.assigner.slice_start(index),
                self.assigner.slice_end(index),
                self.options.num_partials,
                self.options.keyed,
                &self.layout,
            );
            slice.restore_state(state, records, &self.layout);
            inner.slices.insert(index, Arc::new(slice));
            inner.last_index = Some(inner.last_index.map_or(index, |last| last.max(index)));
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn late(timestamp: Timestamp, index: SliceIndex, first_index: SliceIndex) -> WindowError {
    WindowError::LateDataDropped {
        timestamp,
        index,
        first_index,
    }
}

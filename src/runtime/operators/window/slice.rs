use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::common::{Key, SliceIndex, Timestamp, WorkerThreadId};

use super::aggregates::AccumulatorLayout;
use super::error::{WindowError, WindowResult};

/// Partial aggregation state of one slice: a single accumulator entry for non-keyed
/// windows, one entry per key otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SliceState {
    NonKeyed { entry: Vec<u8>, touched: bool },
    Keyed(HashMap<Key, Vec<u8>>),
}

impl SliceState {
    pub fn new(keyed: bool, layout: &AccumulatorLayout) -> Self {
        if keyed {
            SliceState::Keyed(HashMap::new())
        } else {
            SliceState::NonKeyed {
                entry: layout.new_entry(),
                touched: false,
            }
        }
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, SliceState::Keyed(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SliceState::NonKeyed { touched, .. } => !touched,
            SliceState::Keyed(entries) => entries.is_empty(),
        }
    }

    /// Number of accumulator entries (keys) that would be lowered.
    pub fn num_entries(&self) -> usize {
        match self {
            SliceState::NonKeyed { touched, .. } => usize::from(*touched),
            SliceState::Keyed(entries) => entries.len(),
        }
    }

    /// Accumulator of a non-keyed state; `None` on a keyed one.
    pub fn accumulator(&mut self) -> Option<&mut [u8]> {
        match self {
            SliceState::NonKeyed { entry, touched } => {
                *touched = true;
                Some(entry.as_mut_slice())
            }
            SliceState::Keyed(_) => None,
        }
    }

    /// Accumulator for `key`, inserted reset on first access; `None` on a non-keyed state.
    pub fn accumulator_for(&mut self, key: Key, layout: &AccumulatorLayout) -> Option<&mut [u8]> {
        match self {
            SliceState::Keyed(entries) => Some(
                entries
                    .entry(key)
                    .or_insert_with(|| layout.new_entry())
                    .as_mut_slice(),
            ),
            SliceState::NonKeyed { .. } => None,
        }
    }

    /// Combines `other` into `self`, consuming it.
    pub fn absorb(&mut self, other: SliceState, layout: &AccumulatorLayout) {
        match (self, other) {
            (
                SliceState::NonKeyed { entry, touched },
                SliceState::NonKeyed {
                    entry: other_entry,
                    touched: other_touched,
                },
            ) => {
                if other_touched {
                    layout.combine_entry(entry, &other_entry);
                    *touched = true;
                }
            }
            (SliceState::Keyed(entries), SliceState::Keyed(other_entries)) => {
                if entries.is_empty() {
                    *entries = other_entries;
                    return;
                }
                for (key, other_entry) in other_entries {
                    match entries.get_mut(&key) {
                        Some(entry) => layout.combine_entry(entry, &other_entry),
                        None => {
                            entries.insert(key, other_entry);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Combines a copy of `other` into `self`.
    pub fn combine_from(&mut self, other: &SliceState, layout: &AccumulatorLayout) {
        match (self, other) {
            (
                SliceState::NonKeyed { entry, touched },
                SliceState::NonKeyed {
                    entry: other_entry,
                    touched: other_touched,
                },
            ) => {
                if *other_touched {
                    layout.combine_entry(entry, other_entry);
                    *touched = true;
                }
            }
            (SliceState::Keyed(entries), SliceState::Keyed(other_entries)) => {
                for (key, other_entry) in other_entries {
                    match entries.get_mut(key) {
                        Some(entry) => layout.combine_entry(entry, other_entry),
                        None => {
                            entries.insert(key.clone(), other_entry.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Clears the state, keeping allocated capacity.
    pub fn reset(&mut self, layout: &AccumulatorLayout) {
        match self {
            SliceState::NonKeyed { entry, touched } => {
                layout.reset_entry(entry);
                *touched = false;
            }
            SliceState::Keyed(entries) => entries.clear(),
        }
    }
}

/// Time range `[start, end)` of the stream holding one partial state per worker thread.
///
/// Worker `w` only writes to partial `w % partials`. Once finalized the slice rejects
/// writes; the trigger path reads the partials under their locks.
#[derive(Debug)]
pub struct Slice {
    index: SliceIndex,
    start: Timestamp,
    end: Timestamp,
    partials: Vec<Mutex<SliceState>>,
    finalized: AtomicBool,
    records: AtomicU64,
}

impl Slice {
    pub fn new(
        index: SliceIndex,
        start: Timestamp,
        end: Timestamp,
        num_partials: usize,
        keyed: bool,
        layout: &AccumulatorLayout,
    ) -> Self {
        let partials = (0..num_partials.max(1))
            .map(|_| Mutex::new(SliceState::new(keyed, layout)))
            .collect();
        Self {
            index,
            start,
            end,
            partials,
            finalized: AtomicBool::new(false),
            records: AtomicU64::new(0),
        }
    }

    /// Reuses a pooled slice for a new time range.
    pub fn reset(&mut self, index: SliceIndex, start: Timestamp, end: Timestamp, layout: &AccumulatorLayout) {
        self.index = index;
        self.start = start;
        self.end = end;
        for partial in &mut self.partials {
            partial
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .reset(layout);
        }
        *self.finalized.get_mut() = false;
        *self.records.get_mut() = 0;
    }

    pub fn index(&self) -> SliceIndex {
        self.index
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn num_partials(&self) -> usize {
        self.partials.len()
    }

    pub fn num_records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Marks the slice read-only. Returns false if it already was.
    pub fn finalize(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }

    /// Runs `update` on the accumulator of `key` (or the single accumulator) in the
    /// worker's partial.
    pub fn update_accumulator<F>(
        &self,
        worker: WorkerThreadId,
        key: Option<Key>,
        layout: &AccumulatorLayout,
        update: F,
    ) -> WindowResult<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut partial = self.lock_partial(worker);
        if self.is_finalized() {
            return Err(WindowError::SliceFinalized(self.index));
        }
        let entry = match key {
            Some(key) => partial.accumulator_for(key, layout),
            None => partial.accumulator(),
        };
        let Some(entry) = entry else {
            return Err(WindowError::InvalidConfig(format!(
                "key access does not match the state of slice {}",
                self.index
            )));
        };
        update(entry);
        self.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Combines buffer-local pre-aggregated state into the worker's partial.
    pub fn flush(
        &self,
        worker: WorkerThreadId,
        local: SliceState,
        records: u64,
        layout: &AccumulatorLayout,
    ) -> WindowResult<()> {
        let mut partial = self.lock_partial(worker);
        if self.is_finalized() {
            return Err(WindowError::SliceFinalized(self.index));
        }
        partial.absorb(local, layout);
        self.records.fetch_add(records, Ordering::Relaxed);
        Ok(())
    }

    /// Combines every partial of the slice into `target`.
    pub fn combine_into(&self, target: &mut SliceState, layout: &AccumulatorLayout) {
        for partial in &self.partials {
            let partial = partial.lock().unwrap_or_else(PoisonError::into_inner);
            target.combine_from(&partial, layout);
        }
    }

    /// All partials combined into a fresh state.
    pub fn combined_state(&self, keyed: bool, layout: &AccumulatorLayout) -> SliceState {
        let mut state = SliceState::new(keyed, layout);
        self.combine_into(&mut state, layout);
        state
    }

    /// Replaces the first partial with `state` and clears the others.
    pub fn restore_state(&self, state: SliceState, records: u64, layout: &AccumulatorLayout) {
        for (i, partial) in self.partials.iter().enumerate() {
            let mut partial = partial.lock().unwrap_or_else(PoisonError::into_inner);
            if i == 0 {
                *partial = state.clone();
            } else {
                partial.reset(layout);
            }
        }
        self.records.store(records, Ordering::Relaxed);
    }

    fn lock_partial(&self, worker: WorkerThreadId) -> MutexGuard<'_, SliceState> {
        self.partials[worker % self.partials.len()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

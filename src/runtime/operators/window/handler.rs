use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use arrow::datatypes::SchemaRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{
    BufferMetadata, KeyExtractor, OriginId, RecordBuffer, SequenceData, SequenceNumber, Timestamp,
    WorkerThreadId, INITIAL_SEQUENCE_NUMBER, MAX_WATERMARK_VALUE,
};
use crate::runtime::metrics::{WindowOperatorMetrics, WindowOperatorStats};
use crate::runtime::runtime_context::{EmitFn, PipelineContext};
use crate::runtime::watermark::{MultiOriginWatermarkProcessor, WatermarkConfig};

use super::aggregates::AccumulatorLayout;
use super::build::{key_extractor_for, BuildOutcome, SliceBuilder};
use super::error::{WindowError, WindowResult};
use super::slice_assigner::SliceAssigner;
use super::slice_store::{SliceStore, SliceStoreOptions};
use super::snapshot::{HandlerSnapshot, SliceSnapshot};
use super::trigger::{result_schema, SliceMergeTask, WindowMerger};
use super::window_config::WindowOperatorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandlerStatus {
    Created = 0,
    Started = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl From<u8> for HandlerStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => HandlerStatus::Created,
            1 => HandlerStatus::Started,
            2 => HandlerStatus::Running,
            3 => HandlerStatus::Stopping,
            _ => HandlerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationType {
    /// End of stream: every window was flushed by `trigger_all_windows`.
    Graceful,
    /// Stop requested without flushing; remaining state is discarded.
    HardStop,
    /// The query failed; remaining state is discarded.
    Failure,
}

/// State that exists between `start` and `stop`.
struct HandlerRuntime {
    store: SliceStore,
    builder: SliceBuilder,
    merger: WindowMerger,
    build_watermarks: MultiOriginWatermarkProcessor,
    probe_watermarks: MultiOriginWatermarkProcessor,
    emitter: EmitFn,
    stats: Arc<WindowOperatorStats>,
}

#[derive(Debug)]
struct TriggerState {
    next_sequence_number: SequenceNumber,
}

/// Windowed aggregation of one pipeline.
///
/// Worker threads call [`Self::process_buffer`] concurrently. Records are lifted into
/// per-worker slice partials; each buffer's metadata then advances the build-side
/// watermark, and every window whose end passed it is merged, lowered and emitted exactly
/// once. Emitted windows feed the probe-side watermark, which drives slice collection.
pub struct WindowOperatorHandler {
    config: WindowOperatorConfig,
    input_schema: SchemaRef,
    output_origin: OriginId,
    layout: Arc<AccumulatorLayout>,
    assigner: SliceAssigner,
    key_extractor: Option<Arc<KeyExtractor>>,
    result_schema: SchemaRef,
    status: AtomicU8,
    runtime: RwLock<Option<Arc<HandlerRuntime>>>,
    trigger_state: Mutex<TriggerState>,
    final_metrics: Mutex<WindowOperatorMetrics>,
}

impl WindowOperatorHandler {
    pub fn new(
        config: WindowOperatorConfig,
        input_schema: SchemaRef,
        output_origin: OriginId,
    ) -> WindowResult<Self> {
        config.validate(&input_schema)?;
        let assigner = SliceAssigner::new(config.window)?;
        let layout = Arc::new(AccumulatorLayout::new(&config.aggregations));
        let key_extractor = key_extractor_for(&config, &input_schema)?;
        let result_schema = result_schema(&config, key_extractor.as_deref());

        Ok(Self {
            config,
            input_schema,
            output_origin,
            layout,
            assigner,
            key_extractor,
            result_schema,
            status: AtomicU8::new(HandlerStatus::Created as u8),
            runtime: RwLock::new(None),
            trigger_state: Mutex::new(TriggerState {
                next_sequence_number: INITIAL_SEQUENCE_NUMBER,
            }),
            final_metrics: Mutex::new(WindowOperatorMetrics::default()),
        })
    }

    pub fn config(&self) -> &WindowOperatorConfig {
        &self.config
    }

    pub fn input_schema(&self) -> &SchemaRef {
        &self.input_schema
    }

    pub fn result_schema(&self) -> &SchemaRef {
        &self.result_schema
    }

    pub fn output_origin(&self) -> OriginId {
        self.output_origin
    }

    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Bytes of one accumulator entry holding every configured aggregation.
    pub fn accumulator_entry_size(&self) -> usize {
        self.layout.entry_size()
    }

    pub fn status(&self) -> HandlerStatus {
        HandlerStatus::from(self.status.load(Ordering::SeqCst))
    }

    pub fn setup(&self, ctx: &PipelineContext, entry_size: usize) -> anyhow::Result<()> {
        self.expect_status("setup", &[HandlerStatus::Created])?;
        if entry_size != self.layout.entry_size() {
            return Err(WindowError::InvalidConfig(format!(
                "accumulator entry size {} does not match the configured aggregations ({} bytes)",
                entry_size,
                self.layout.entry_size()
            ))
            .into());
        }
        debug!(
            "Set up window operator {} with {} aggregations, {} bytes per entry",
            ctx.operator_label(),
            self.layout.num_aggregations(),
            entry_size
        );
        Ok(())
    }

    pub fn start(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
        self.expect_status("start", &[HandlerStatus::Created])?;

        let num_worker_threads = ctx.num_worker_threads();
        let store = SliceStore::new(
            self.assigner,
            Arc::clone(&self.layout),
            SliceStoreOptions {
                keyed: self.config.is_keyed(),
                num_partials: num_worker_threads,
                max_live_slices: self.config.max_live_slices,
                pool_capacity: self.config.slice_pool_capacity,
            },
        );
        let runtime = HandlerRuntime {
            store,
            builder: SliceBuilder::new(&self.config, Arc::clone(&self.layout), self.key_extractor.clone()),
            merger: WindowMerger::new(
                &self.config,
                Arc::clone(&self.layout),
                self.key_extractor.clone(),
                self.output_origin,
            ),
            build_watermarks: MultiOriginWatermarkProcessor::new(self.config.watermark.clone()),
            probe_watermarks: MultiOriginWatermarkProcessor::new(WatermarkConfig::new(vec![self.output_origin])),
            emitter: ctx.emitter(),
            stats: Arc::new(WindowOperatorStats::new(ctx.operator_label())),
        };

        {
            let mut slot = self.runtime.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(self.lifecycle_error("start").into());
            }
            *slot = Some(Arc::new(runtime));
        }
        self.status.store(HandlerStatus::Started as u8, Ordering::SeqCst);

        info!(
            "Started window operator {} ({:?}, {} worker threads, output origin {})",
            ctx.operator_label(),
            self.config.window,
            num_worker_threads,
            self.output_origin
        );
        Ok(())
    }

    /// Builds the buffer's records into slices, then triggers on its metadata.
    /// Returns the number of windows emitted.
    pub fn process_buffer(&self, worker: WorkerThreadId, buffer: &RecordBuffer) -> WindowResult<usize> {
        self.build(worker, buffer)?;
        self.check_and_trigger_windows(&buffer.metadata)
    }

    /// Lifts the buffer's records into the worker's slice partials. Late records and rows
    /// without an event time are dropped and counted.
    pub fn build(&self, worker: WorkerThreadId, buffer: &RecordBuffer) -> WindowResult<BuildOutcome> {
        let runtime = self.active_runtime("build")?;
        self.mark_running();
        let outcome = runtime.builder.build(&runtime.store, worker, &buffer.record_batch)?;
        runtime.stats.record_processed(outcome.records);
        runtime
            .stats
            .record_late_dropped(outcome.late_records, runtime.store.first_index());
        runtime.stats.record_untimed_dropped(outcome.untimed_records);
        Ok(outcome)
    }

    /// Feeds the buffer metadata into the build-side watermark and emits every window that
    /// became complete. Returns the number of windows emitted.
    pub fn check_and_trigger_windows(&self, metadata: &BufferMetadata) -> WindowResult<usize> {
        let runtime = self.active_runtime("check_and_trigger_windows")?;
        self.mark_running();
        let global = runtime.build_watermarks.update_watermark(
            metadata.origin_id,
            metadata.watermark,
            metadata.sequence,
        )?;
        let trigger_watermark = global.saturating_sub(self.config.allowed_lateness_ms);
        self.trigger_windows(&runtime, trigger_watermark)
    }

    /// Emits every remaining window regardless of watermarks, in window order.
    pub fn trigger_all_windows(&self) -> WindowResult<usize> {
        let runtime = self.runtime_in(
            "trigger_all_windows",
            &[HandlerStatus::Started, HandlerStatus::Running, HandlerStatus::Stopping],
        )?;
        let emitted = self.trigger_windows(&runtime, MAX_WATERMARK_VALUE)?;
        self.status.store(HandlerStatus::Stopping as u8, Ordering::SeqCst);
        info!(
            "Flushed {} windows, {} slices left",
            emitted,
            runtime.store.num_slices()
        );
        Ok(emitted)
    }

    /// Drops slices no window ending after `probe_watermark` needs.
    pub fn garbage_collect_slices_and_windows(&self, probe_watermark: Timestamp) -> WindowResult<usize> {
        let runtime = self.runtime_in(
            "garbage_collect_slices_and_windows",
            &[HandlerStatus::Started, HandlerStatus::Running, HandlerStatus::Stopping],
        )?;
        let collected = runtime.store.garbage_collect(probe_watermark);
        self.publish_store_stats(&runtime);
        Ok(collected)
    }

    pub fn stop(&self, termination: TerminationType, ctx: &PipelineContext) -> anyhow::Result<()> {
        match termination {
            TerminationType::Graceful => self.expect_status("stop", &[HandlerStatus::Stopping])?,
            TerminationType::HardStop | TerminationType::Failure => {
                if self.status() == HandlerStatus::Stopped {
                    return Err(self.lifecycle_error("stop").into());
                }
            }
        }

        let runtime = self
            .runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            self.publish_store_stats(&runtime);
            let remaining = runtime.store.num_slices();
            if termination != TerminationType::Graceful && remaining > 0 {
                warn!(
                    "Discarding {} slices of window operator {} on {:?}",
                    remaining,
                    ctx.operator_label(),
                    termination
                );
            }
            *self.final_metrics.lock().unwrap_or_else(PoisonError::into_inner) = runtime.stats.snapshot();
        }
        self.status.store(HandlerStatus::Stopped as u8, Ordering::SeqCst);
        info!("Stopped window operator {} ({:?})", ctx.operator_label(), termination);
        Ok(())
    }

    pub fn build_watermark(&self) -> Timestamp {
        self.current_runtime()
            .map_or(0, |runtime| runtime.build_watermarks.current_watermark())
    }

    pub fn probe_watermark(&self) -> Timestamp {
        self.current_runtime()
            .map_or(0, |runtime| runtime.probe_watermarks.current_watermark())
    }

    pub fn num_live_slices(&self) -> usize {
        self.current_runtime()
            .map_or(0, |runtime| runtime.store.num_slices())
    }

    pub fn first_slice_index(&self) -> u64 {
        self.current_runtime()
            .map_or(0, |runtime| runtime.store.first_index())
    }

    pub fn metrics(&self) -> WindowOperatorMetrics {
        match self.current_runtime() {
            Some(runtime) => {
                self.publish_store_stats(&runtime);
                runtime.stats.snapshot()
            }
            None => *self.final_metrics.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Captures the state needed to resume: open slices, watermarks, trigger frontier
    /// and the next output sequence number. Call between buffers.
    pub fn capture_snapshot(&self) -> WindowResult<HandlerSnapshot> {
        let runtime = self.active_runtime("capture_snapshot")?;
        let trigger = self.lock_trigger();
        let slices = runtime
            .store
            .capture_slices()
            .into_iter()
            .map(|(index, state, records)| SliceSnapshot { index, records, state })
            .collect();
        Ok(HandlerSnapshot {
            slices,
            first_index: runtime.store.first_index(),
            trigger_frontier: runtime.store.trigger_frontier(),
            next_sequence_number: trigger.next_sequence_number,
            build_watermarks: runtime.build_watermarks.snapshot(),
            probe_watermarks: runtime.probe_watermarks.snapshot(),
        })
    }

    /// Replaces the running state with a captured one. Call before the first buffer.
    pub fn restore_snapshot(&self, snapshot: HandlerSnapshot) -> WindowResult<()> {
        let runtime = self.runtime_in("restore_snapshot", &[HandlerStatus::Started])?;
        let mut trigger = self.lock_trigger();
        let num_slices = snapshot.slices.len();
        runtime.store.restore(
            snapshot
                .slices
                .into_iter()
                .map(|s| (s.index, s.state, s.records))
                .collect(),
            snapshot.first_index,
            snapshot.trigger_frontier,
        );
        runtime.build_watermarks.restore(snapshot.build_watermarks);
        runtime.probe_watermarks.restore(snapshot.probe_watermarks);
        trigger.next_sequence_number = snapshot.next_sequence_number;
        info!(
            "Restored {} slices, build watermark {}, next sequence {}",
            num_slices,
            runtime.build_watermarks.current_watermark(),
            trigger.next_sequence_number
        );
        Ok(())
    }

    fn trigger_windows(&self, runtime: &HandlerRuntime, trigger_watermark: Timestamp) -> WindowResult<usize> {
        let tasks: Vec<SliceMergeTask> = {
            let mut trigger = self.lock_trigger();
            runtime
                .store
                .take_triggerable_windows(trigger_watermark)
                .into_iter()
                .map(|window| {
                    let sequence_number = trigger.next_sequence_number;
                    trigger.next_sequence_number += 1;
                    SliceMergeTask::new(window, sequence_number)
                })
                .collect()
        };
        if tasks.is_empty() {
            return Ok(0);
        }

        let emitted = tasks.len();
        for task in tasks {
            let result = runtime.merger.execute(&task)?;
            debug!(
                "Emitting window [{}, {}) with {} rows as sequence {}",
                task.window_start,
                task.window_end,
                result.num_records(),
                task.sequence_number
            );
            runtime.stats.record_window_emitted(result.num_records());
            (runtime.emitter)(result);
            runtime.probe_watermarks.update_watermark(
                self.output_origin,
                task.window_end,
                SequenceData::single(task.sequence_number),
            )?;
        }

        let probe_watermark = runtime.probe_watermarks.current_watermark();
        runtime.store.garbage_collect(probe_watermark);
        self.publish_store_stats(runtime);
        runtime
            .stats
            .record_watermarks(runtime.build_watermarks.current_watermark(), probe_watermark);
        Ok(emitted)
    }

    fn publish_store_stats(&self, runtime: &HandlerRuntime) {
        runtime.stats.record_slices(
            runtime.store.slices_created(),
            runtime.store.slices_collected(),
            runtime.store.num_slices(),
        );
    }

    fn mark_running(&self) {
        let _ = self.status.compare_exchange(
            HandlerStatus::Started as u8,
            HandlerStatus::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn active_runtime(&self, operation: &'static str) -> WindowResult<Arc<HandlerRuntime>> {
        self.runtime_in(operation, &[HandlerStatus::Started, HandlerStatus::Running])
    }

    fn runtime_in(&self, operation: &'static str, allowed: &[HandlerStatus]) -> WindowResult<Arc<HandlerRuntime>> {
        self.expect_status(operation, allowed)?;
        self.current_runtime()
            .ok_or_else(|| self.lifecycle_error(operation))
    }

    fn current_runtime(&self) -> Option<Arc<HandlerRuntime>> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone)
    }

    fn expect_status(&self, operation: &'static str, allowed: &[HandlerStatus]) -> WindowResult<()> {
        if allowed.contains(&self.status()) {
            Ok(())
        } else {
            Err(self.lifecycle_error(operation))
        }
    }

    fn lifecycle_error(&self, operation: &'static str) -> WindowError {
        WindowError::InvalidLifecycle {
            operation,
            status: self.status(),
        }
    }

    fn lock_trigger(&self) -> MutexGuard<'_, TriggerState> {
        self.trigger_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for WindowOperatorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowOperatorHandler")
            .field("window", &self.config.window)
            .field("keyed", &self.config.is_keyed())
            .field("output_origin", &self.output_origin)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use itertools::Itertools;

use crate::common::{
    BufferMetadata, KeyExtractor, OriginId, SequenceData, SequenceNumber, SliceIndex, Timestamp,
    WindowResultBuffer,
};

use super::aggregates::{AccumulatorLayout, AggregationFunction, LoweredValue};
use super::error::{WindowError, WindowResult};
use super::slice::{Slice, SliceState};
use super::slice_store::PlannedWindow;
use super::window_config::{WindowOperatorConfig, WINDOW_END_FIELD, WINDOW_START_FIELD};

/// A planned window with its output sequence number, ready to be merged and emitted.
#[derive(Debug, Clone)]
pub struct SliceMergeTask {
    pub start_slice_index: SliceIndex,
    pub end_slice_index: SliceIndex,
    pub sequence_number: SequenceNumber,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub slices: Vec<Arc<Slice>>,
}

impl SliceMergeTask {
    pub fn new(window: PlannedWindow, sequence_number: SequenceNumber) -> Self {
        Self {
            start_slice_index: window.start_slice_index,
            end_slice_index: window.end_slice_index,
            sequence_number,
            window_start: window.start,
            window_end: window.end,
            slices: window.slices,
        }
    }
}

/// Output schema: window bounds, key columns, one column per aggregation.
pub fn result_schema(config: &WindowOperatorConfig, key_extractor: Option<&KeyExtractor>) -> SchemaRef {
    let mut fields = vec![
        Field::new(WINDOW_START_FIELD, DataType::UInt64, false),
        Field::new(WINDOW_END_FIELD, DataType::UInt64, false),
    ];
    if let Some(extractor) = key_extractor {
        fields.extend(extractor.key_fields().iter().cloned());
    }
    for agg in &config.aggregations {
        let nullable = !matches!(agg.function, AggregationFunction::Count);
        fields.push(Field::new(&agg.output_field, agg.function.output_type(), nullable));
    }
    Arc::new(Schema::new(fields))
}

/// Merges the slices of a window and lowers the merged state into a result buffer.
#[derive(Debug)]
pub struct WindowMerger {
    layout: Arc<AccumulatorLayout>,
    key_extractor: Option<Arc<KeyExtractor>>,
    schema: SchemaRef,
    output_origin: OriginId,
}

impl WindowMerger {
    pub fn new(
        config: &WindowOperatorConfig,
        layout: Arc<AccumulatorLayout>,
        key_extractor: Option<Arc<KeyExtractor>>,
        output_origin: OriginId,
    ) -> Self {
        let schema = result_schema(config, key_extractor.as_deref());
        Self {
            layout,
            key_extractor,
            schema,
            output_origin,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn merge(&self, task: &SliceMergeTask) -> SliceState {
        let mut state = SliceState::new(self.key_extractor.is_some(), &self.layout);
        for slice in &task.slices {
            slice.combine_into(&mut state, &self.layout);
        }
        state
    }

    /// Merged result of the task. A window whose slices hold no records still yields a
    /// zero-row buffer so the output sequence stays contiguous.
    pub fn execute(&self, task: &SliceMergeTask) -> WindowResult<WindowResultBuffer> {
        let state = self.merge(task);
        let batch = if state.is_empty() {
            RecordBatch::new_empty(Arc::clone(&self.schema))
        } else {
            self.lower(task, &state)?
        };
        let metadata = BufferMetadata::new(
            self.output_origin,
            SequenceData::single(task.sequence_number),
            task.window_end,
        );
        Ok(WindowResultBuffer::new(
            metadata,
            task.window_start,
            task.window_end,
            batch,
        ))
    }

    fn lower(&self, task: &SliceMergeTask, state: &SliceState) -> WindowResult<RecordBatch> {
        let (keys, entries): (Vec<_>, Vec<&[u8]>) = match state {
            SliceState::NonKeyed { entry, .. } => (Vec::new(), vec![entry.as_slice()]),
            SliceState::Keyed(map) => map
                .iter()
                .sorted_by(|a, b| a.0.cmp(b.0))
                .map(|(key, entry)| (key, entry.as_slice()))
                .unzip(),
        };
        let num_rows = entries.len();

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(vec![task.window_start; num_rows])),
            Arc::new(UInt64Array::from(vec![task.window_end; num_rows])),
        ];
        if let Some(extractor) = &self.key_extractor {
            let decoded = extractor
                .decode_keys(keys)
                .map_err(|e| WindowError::SchemaMismatch(e.to_string()))?;
            columns.extend(decoded);
        }
        for (i, function) in self.layout.functions().iter().enumerate() {
            let lowered = entries.iter().map(|entry| self.layout.lower(entry, i));
            let column: ArrayRef = match function {
                AggregationFunction::Count => Arc::new(
                    lowered
                        .map(|v| match v {
                            LoweredValue::UInt(n) => n,
                            LoweredValue::Float(f) => f.unwrap_or(0.0) as u64,
                        })
                        .collect::<UInt64Array>(),
                ),
                _ => Arc::new(lowered.map(|v| v.as_f64()).collect::<Float64Array>()),
            };
            columns.push(column);
        }

        Ok(RecordBatch::try_new(Arc::clone(&self.schema), columns)?)
    }
}

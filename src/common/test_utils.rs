use std::sync::Arc;

use arrow::array::{Array, AsArray, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef, UInt64Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;

use crate::common::{
    BufferMetadata, OriginId, RecordBuffer, SequenceData, SequenceNumber, Timestamp,
    WindowResultBuffer,
};
use crate::runtime::collector::ResultCollector;
use crate::runtime::runtime_context::PipelineContext;

pub const TEST_TIME_FIELD: &str = "ts";
pub const TEST_KEY_FIELD: &str = "key";
pub const TEST_VALUE_FIELD: &str = "value";

/// `ts: UInt64, key: Utf8, value: Float64`
pub fn test_input_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(TEST_TIME_FIELD, DataType::UInt64, false),
        Field::new(TEST_KEY_FIELD, DataType::Utf8, false),
        Field::new(TEST_VALUE_FIELD, DataType::Float64, true),
    ]))
}

pub fn test_batch(rows: &[(Timestamp, &str, f64)]) -> Result<RecordBatch, ArrowError> {
    let ts: UInt64Array = rows.iter().map(|(ts, _, _)| Some(*ts)).collect();
    let keys: StringArray = rows.iter().map(|(_, key, _)| Some(*key)).collect();
    let values: Float64Array = rows.iter().map(|(_, _, value)| Some(*value)).collect();
    RecordBatch::try_new(
        test_input_schema(),
        vec![Arc::new(ts), Arc::new(keys), Arc::new(values)],
    )
}

/// Single-chunk buffer of `rows` from `origin_id`.
pub fn test_buffer(
    origin_id: OriginId,
    sequence_number: SequenceNumber,
    watermark: Timestamp,
    rows: &[(Timestamp, &str, f64)],
) -> Result<RecordBuffer, ArrowError> {
    let metadata = BufferMetadata::new(origin_id, SequenceData::single(sequence_number), watermark);
    Ok(RecordBuffer::new(metadata, test_batch(rows)?))
}

pub fn test_context(num_worker_threads: usize, collector: &ResultCollector) -> PipelineContext {
    PipelineContext::new(
        1,
        1,
        "window".to_string(),
        num_worker_threads,
        collector.emitter(),
        None,
    )
}

/// One output row, flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRow {
    pub sequence_number: SequenceNumber,
    pub start: Timestamp,
    pub end: Timestamp,
    pub key: Option<String>,
    pub value: Option<f64>,
}

/// Flattens results into rows, reading `value_field` as the value column and the test key
/// column when present. Count columns are read as floats.
pub fn window_rows(results: &[WindowResultBuffer], value_field: &str) -> Vec<WindowRow> {
    let mut rows = Vec::new();
    for result in results {
        let batch = &result.record_batch;
        let keys = batch
            .column_by_name(TEST_KEY_FIELD)
            .and_then(|c| c.as_string_opt::<i32>());
        let values = batch.column_by_name(value_field);
        for row in 0..batch.num_rows() {
            let value = values.and_then(|column| {
                if column.is_null(row) {
                    None
                } else if let Some(floats) = column.as_primitive_opt::<Float64Type>() {
                    Some(floats.value(row))
                } else {
                    column
                        .as_primitive_opt::<UInt64Type>()
                        .map(|counts| counts.value(row) as f64)
                }
            });
            rows.push(WindowRow {
                sequence_number: result.sequence_number(),
                start: result.window_start,
                end: result.window_end,
                key: keys.map(|k| k.value(row).to_string()),
                value,
            });
        }
    }
    rows
}

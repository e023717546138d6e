use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type, Schema, TimeUnit, TimestampMillisecondType, UInt64Type};
use arrow::record_batch::RecordBatch;

use crate::common::{Key, KeyExtractor, SliceIndex, Timestamp, WorkerThreadId};

use super::aggregates::AccumulatorLayout;
use super::error::{WindowError, WindowResult};
use super::slice::SliceState;
use super::slice_store::SliceStore;
use super::window_config::WindowOperatorConfig;

/// Records of one buffer that fell into one slice.
#[derive(Debug)]
pub struct LocalSlice {
    pub state: SliceState,
    pub records: u64,
    pub min_timestamp: Timestamp,
}

/// Result of building one buffer into the slice store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    pub records: u64,
    pub late_records: u64,
    /// Rows with a null event time; dropped.
    pub untimed_records: u64,
    pub slices_touched: usize,
}

/// Lifts input records into slices: first into buffer-local states without locks, then
/// one flush per touched slice into the worker's partial.
#[derive(Debug)]
pub struct SliceBuilder {
    layout: Arc<AccumulatorLayout>,
    time_field: String,
    input_fields: Vec<Option<String>>,
    key_extractor: Option<Arc<KeyExtractor>>,
}

impl SliceBuilder {
    pub fn new(
        config: &WindowOperatorConfig,
        layout: Arc<AccumulatorLayout>,
        key_extractor: Option<Arc<KeyExtractor>>,
    ) -> Self {
        Self {
            layout,
            time_field: config.time_field.clone(),
            input_fields: config.aggregations.iter().map(|a| a.input_field.clone()).collect(),
            key_extractor,
        }
    }

    pub fn build(
        &self,
        store: &SliceStore,
        worker: WorkerThreadId,
        batch: &RecordBatch,
    ) -> WindowResult<BuildOutcome> {
        let local = self.pre_aggregate(store, batch)?;
        let mut outcome = BuildOutcome {
            untimed_records: column(batch, &self.time_field)?.null_count() as u64,
            slices_touched: local.len(),
            ..Default::default()
        };

        for (index, slice_local) in local {
            let records = slice_local.records;
            let flushed = store
                .get_or_create_slice_at(index, slice_local.min_timestamp)
                .and_then(|slice| slice.flush(worker, slice_local.state, records, &self.layout));
            match flushed {
                Ok(()) => outcome.records += records,
                Err(e) if !e.is_fatal() => outcome.late_records += records,
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Groups the batch by slice index and lifts every record into a buffer-local state.
    pub fn pre_aggregate(
        &self,
        store: &SliceStore,
        batch: &RecordBatch,
    ) -> WindowResult<BTreeMap<SliceIndex, LocalSlice>> {
        let timestamps = self.timestamps(batch)?;
        let values = self.value_columns(batch)?;
        let values: Vec<_> = values
            .iter()
            .map(|column| column.as_ref().map(|c| c.as_primitive::<Float64Type>()))
            .collect();
        let mut keys = match &self.key_extractor {
            Some(extractor) => Some(
                extractor
                    .extract_keys(batch)
                    .map_err(|e| WindowError::SchemaMismatch(e.to_string()))?
                    .into_iter(),
            ),
            None => None,
        };

        let keyed = store.is_keyed();
        let assigner = store.assigner();
        let mut local: BTreeMap<SliceIndex, LocalSlice> = BTreeMap::new();

        for (row, ts) in timestamps.into_iter().enumerate() {
            let key: Option<Key> = keys.as_mut().and_then(Iterator::next);
            let Some(ts) = ts else {
                continue;
            };

            let slice = local
                .entry(assigner.slice_index(ts))
                .or_insert_with(|| LocalSlice {
                    state: SliceState::new(keyed, &self.layout),
                    records: 0,
                    min_timestamp: ts,
                });
            slice.records += 1;
            slice.min_timestamp = slice.min_timestamp.min(ts);

            let entry = match key {
                Some(key) => slice.state.accumulator_for(key, &self.layout),
                None => slice.state.accumulator(),
            };
            let Some(entry) = entry else {
                return Err(WindowError::InvalidConfig(
                    "key extraction does not match the slice state".to_string(),
                ));
            };

            for (i, column) in values.iter().enumerate() {
                match column {
                    None => self.layout.lift(entry, i, 0.0),
                    Some(column) if column.is_valid(row) => {
                        self.layout.lift(entry, i, column.value(row))
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(local)
    }

    /// Event time per row; `None` for null timestamps.
    fn timestamps(&self, batch: &RecordBatch) -> WindowResult<Vec<Option<Timestamp>>> {
        let column = column(batch, &self.time_field)?;
        match column.data_type() {
            DataType::UInt64 => Ok(column.as_primitive::<UInt64Type>().iter().collect()),
            DataType::Int64 => non_negative(column.as_primitive::<Int64Type>().iter(), &self.time_field),
            DataType::Timestamp(TimeUnit::Millisecond, _) => non_negative(
                column.as_primitive::<TimestampMillisecondType>().iter(),
                &self.time_field,
            ),
            other => Err(WindowError::SchemaMismatch(format!(
                "time field '{}' has unsupported type {:?}",
                self.time_field, other
            ))),
        }
    }

    /// Input columns cast to Float64, `None` for row-counting aggregations.
    fn value_columns(&self, batch: &RecordBatch) -> WindowResult<Vec<Option<ArrayRef>>> {
        self.input_fields
            .iter()
            .map(|field| match field {
                None => Ok(None),
                Some(name) => {
                    let column = column(batch, name)?;
                    Ok(Some(cast(column, &DataType::Float64)?))
                }
            })
            .collect()
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> WindowResult<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| WindowError::SchemaMismatch(format!("column '{}' missing from record batch", name)))
}

fn non_negative(
    values: impl Iterator<Item = Option<i64>>,
    field: &str,
) -> WindowResult<Vec<Option<Timestamp>>> {
    values
        .map(|v| match v {
            Some(v) if v < 0 => Err(WindowError::SchemaMismatch(format!(
                "negative timestamp {} in '{}'",
                v, field
            ))),
            Some(v) => Ok(Some(v as Timestamp)),
            None => Ok(None),
        })
        .collect()
}

/// Builds the key extractor for a keyed plan.
pub fn key_extractor_for(
    config: &WindowOperatorConfig,
    input_schema: &Schema,
) -> WindowResult<Option<Arc<KeyExtractor>>> {
    if !config.is_keyed() {
        return Ok(None);
    }
    KeyExtractor::try_new(input_schema, &config.key_fields)
        .map(|extractor| Some(Arc::new(extractor)))
        .map_err(|e| WindowError::InvalidConfig(e.to_string()))
}

use std::collections::HashSet;

use arrow::datatypes::{DataType, Schema, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::common::Timestamp;
use crate::runtime::watermark::WatermarkConfig;

use super::aggregates::{AggregationFunction, AggregationSpec};
use super::error::{WindowError, WindowResult};
use super::slice_assigner::SliceAssigner;

pub const WINDOW_START_FIELD: &str = "window_start";
pub const WINDOW_END_FIELD: &str = "window_end";

pub const DEFAULT_SLICE_POOL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowType {
    Tumbling { size_ms: Timestamp },
    Sliding { size_ms: Timestamp, slide_ms: Timestamp },
}

impl WindowType {
    pub fn size_and_slide(&self) -> (Timestamp, Timestamp) {
        match *self {
            WindowType::Tumbling { size_ms } => (size_ms, size_ms),
            WindowType::Sliding { size_ms, slide_ms } => (size_ms, slide_ms),
        }
    }
}

fn default_slice_pool_capacity() -> usize {
    DEFAULT_SLICE_POOL_CAPACITY
}

/// Physical plan of one windowed aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowOperatorConfig {
    pub window: WindowType,
    /// Event-time column: `UInt64`, non-negative `Int64` or `Timestamp(Millisecond)`.
    pub time_field: String,
    /// Grouping columns. Empty means a non-keyed window.
    #[serde(default)]
    pub key_fields: Vec<String>,
    pub aggregations: Vec<AggregationSpec>,
    #[serde(default)]
    pub allowed_lateness_ms: Timestamp,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub max_live_slices: Option<usize>,
    #[serde(default = "default_slice_pool_capacity")]
    pub slice_pool_capacity: usize,
}

impl WindowOperatorConfig {
    pub fn new(window: WindowType, time_field: &str, aggregations: Vec<AggregationSpec>) -> Self {
        Self {
            window,
            time_field: time_field.to_string(),
            key_fields: Vec::new(),
            aggregations,
            allowed_lateness_ms: 0,
            watermark: WatermarkConfig::default(),
            max_live_slices: None,
            slice_pool_capacity: DEFAULT_SLICE_POOL_CAPACITY,
        }
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn with_key_fields(mut self, key_fields: &[&str]) -> Self {
        self.key_fields = key_fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_allowed_lateness(mut self, allowed_lateness_ms: Timestamp) -> Self {
        self.allowed_lateness_ms = allowed_lateness_ms;
        self
    }

    pub fn with_watermark(mut self, watermark: WatermarkConfig) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_max_live_slices(mut self, max_live_slices: usize) -> Self {
        self.max_live_slices = Some(max_live_slices);
        self
    }

    pub fn is_keyed(&self) -> bool {
        !self.key_fields.is_empty()
    }

    /// Checks the plan against the input schema.
    pub fn validate(&self, input_schema: &Schema) -> WindowResult<()> {
        SliceAssigner::new(self.window)?;

        let time_field = input_schema
            .field_with_name(&self.time_field)
            .map_err(|_| invalid(format!("time field '{}' not found in input schema", self.time_field)))?;
        match time_field.data_type() {
            DataType::UInt64 | DataType::Int64 | DataType::Timestamp(TimeUnit::Millisecond, _) => {}
            other => {
                return Err(invalid(format!(
                    "time field '{}' has unsupported type {:?}",
                    self.time_field, other
                )))
            }
        }

        for key in &self.key_fields {
            if input_schema.field_with_name(key).is_err() {
                return Err(invalid(format!("key field '{}' not found in input schema", key)));
            }
        }

        if self.aggregations.is_empty() {
            return Err(invalid("at least one aggregation is required".to_string()));
        }

        let mut output_names: HashSet<&str> = [WINDOW_START_FIELD, WINDOW_END_FIELD]
            .into_iter()
            .chain(self.key_fields.iter().map(String::as_str))
            .collect();
        for agg in &self.aggregations {
            match (&agg.function, &agg.input_field) {
                (AggregationFunction::Count, None) => {}
                (_, None) => {
                    return Err(invalid(format!(
                        "aggregation '{}' ({}) needs an input field",
                        agg.output_field,
                        agg.function.name()
                    )))
                }
                (_, Some(input)) => {
                    let field = input_schema
                        .field_with_name(input)
                        .map_err(|_| invalid(format!("input field '{}' not found in input schema", input)))?;
                    if !field.data_type().is_numeric() {
                        return Err(invalid(format!(
                            "input field '{}' of type {:?} is not numeric",
                            input,
                            field.data_type()
                        )));
                    }
                }
            }
            if !output_names.insert(agg.output_field.as_str()) {
                return Err(invalid(format!("duplicate output field '{}'", agg.output_field)));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> WindowError {
    WindowError::InvalidConfig(message)
}

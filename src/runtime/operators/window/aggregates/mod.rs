use std::fmt;
use std::sync::Arc;

use arrow::datatypes::DataType;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};


/// Lift/combine/lower/reset over an externally owned accumulator region of
/// `state_size()` bytes. Implementations must keep `combine` associative and commutative.
pub trait UserDefinedAggregation: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn state_size(&self) -> usize;
    fn reset(&self, acc: &mut [u8]);
    fn lift(&self, acc: &mut [u8], value: f64);
    fn combine(&self, acc: &mut [u8], other: &[u8]);
    fn lower(&self, acc: &[u8]) -> Option<f64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFunction {
    Sum,
    Min,
    Max,
    Avg,
    Count,
    #[serde(skip)]
    Custom(Arc<dyn UserDefinedAggregation>),
}

/// Final value of one accumulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoweredValue {
    Float(Option<f64>),
    UInt(u64),
}

impl LoweredValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            LoweredValue::Float(v) => *v,
            LoweredValue::UInt(v) => Some(*v as f64),
        }
    }
}

// Region layouts, little endian:
// Sum   [sum: f64]
// Min   [value: f64][count: u64]
// Max   [value: f64][count: u64]
// Avg   [sum: f64][count: u64]
// Count [count: u64]
impl AggregationFunction {
    pub fn state_size(&self) -> usize {
        match self {
            AggregationFunction::Sum | AggregationFunction::Count => 8,
            AggregationFunction::Min | AggregationFunction::Max | AggregationFunction::Avg => 16,
            AggregationFunction::Custom(udf) => udf.state_size(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AggregationFunction::Sum => "sum",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
            AggregationFunction::Avg => "avg",
            AggregationFunction::Count => "count",
            AggregationFunction::Custom(udf) => udf.name(),
        }
    }

    pub fn output_type(&self) -> DataType {
        match self {
            AggregationFunction::Count => DataType::UInt64,
            _ => DataType::Float64,
        }
    }

    pub fn reset(&self, acc: &mut [u8]) {
        match self {
            AggregationFunction::Custom(udf) => udf.reset(acc),
            _ => acc.fill(0),
        }
    }

    pub fn lift(&self, acc: &mut [u8], value: f64) {
        match self {
            AggregationFunction::Sum => write_f64(acc, 0, read_f64(acc, 0) + value),
            AggregationFunction::Min => lift_extremum(acc, value, std::cmp::min),
            AggregationFunction::Max => lift_extremum(acc, value, std::cmp::max),
            AggregationFunction::Avg => {
                write_f64(acc, 0, read_f64(acc, 0) + value);
                write_u64(acc, 8, read_u64(acc, 8) + 1);
            }
            AggregationFunction::Count => write_u64(acc, 0, read_u64(acc, 0) + 1),
            AggregationFunction::Custom(udf) => udf.lift(acc, value),
        }
    }

    pub fn combine(&self, acc: &mut [u8], other: &[u8]) {
        match self {
            AggregationFunction::Sum => write_f64(acc, 0, read_f64(acc, 0) + read_f64(other, 0)),
            AggregationFunction::Min => combine_extremum(acc, other, std::cmp::min),
            AggregationFunction::Max => combine_extremum(acc, other, std::cmp::max),
            AggregationFunction::Avg => {
                write_f64(acc, 0, read_f64(acc, 0) + read_f64(other, 0));
                write_u64(acc, 8, read_u64(acc, 8) + read_u64(other, 8));
            }
            AggregationFunction::Count => write_u64(acc, 0, read_u64(acc, 0) + read_u64(other, 0)),
            AggregationFunction::Custom(udf) => udf.combine(acc, other),
        }
    }

    pub fn lower(&self, acc: &[u8]) -> LoweredValue {
        match self {
            AggregationFunction::Sum => LoweredValue::Float(Some(read_f64(acc, 0))),
            AggregationFunction::Min | AggregationFunction::Max => {
                if read_u64(acc, 8) == 0 {
                    LoweredValue::Float(None)
                } else {
                    LoweredValue::Float(Some(read_f64(acc, 0)))
                }
            }
            AggregationFunction::Avg => {
                let count = read_u64(acc, 8);
                if count == 0 {
                    LoweredValue::Float(None)
                } else {
                    LoweredValue::Float(Some(read_f64(acc, 0) / count as f64))
                }
            }
            AggregationFunction::Count => LoweredValue::UInt(read_u64(acc, 0)),
            AggregationFunction::Custom(udf) => LoweredValue::Float(udf.lower(acc)),
        }
    }
}

type Extremum = fn(OrderedFloat<f64>, OrderedFloat<f64>) -> OrderedFloat<f64>;

fn lift_extremum(acc: &mut [u8], value: f64, pick: Extremum) {
    let count = read_u64(acc, 8);
    let next = if count == 0 {
        value
    } else {
        pick(OrderedFloat(read_f64(acc, 0)), OrderedFloat(value)).0
    };
    write_f64(acc, 0, next);
    write_u64(acc, 8, count + 1);
}

fn combine_extremum(acc: &mut [u8], other: &[u8], pick: Extremum) {
    let other_count = read_u64(other, 8);
    if other_count == 0 {
        return;
    }
    let count = read_u64(acc, 8);
    let next = if count == 0 {
        read_f64(other, 0)
    } else {
        pick(OrderedFloat(read_f64(acc, 0)), OrderedFloat(read_f64(other, 0))).0
    };
    write_f64(acc, 0, next);
    write_u64(acc, 8, count + other_count);
}

pub fn read_f64(region: &[u8], offset: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&region[offset..offset + 8]);
    f64::from_le_bytes(buf)
}

pub fn write_f64(region: &mut [u8], offset: usize, value: f64) {
    region[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn read_u64(region: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&region[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub fn write_u64(region: &mut [u8], offset: usize, value: u64) {
    region[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// One configured aggregation: function, input column and result column.
/// `input_field` may only be omitted for `count`, which then counts rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub function: AggregationFunction,
    #[serde(default)]
    pub input_field: Option<String>,
    pub output_field: String,
}

impl AggregationSpec {
    pub fn new(function: AggregationFunction, input_field: Option<&str>, output_field: &str) -> Self {
        Self {
            function,
            input_field: input_field.map(str::to_string),
            output_field: output_field.to_string(),
        }
    }

    pub fn sum(input_field: &str, output_field: &str) -> Self {
        Self::new(AggregationFunction::Sum, Some(input_field), output_field)
    }

    pub fn min(input_field: &str, output_field: &str) -> Self {
        Self::new(AggregationFunction::Min, Some(input_field), output_field)
    }

    pub fn max(input_field: &str, output_field: &str) -> Self {
        Self::new(AggregationFunction::Max, Some(input_field), output_field)
    }

    pub fn avg(input_field: &str, output_field: &str) -> Self {
        Self::new(AggregationFunction::Avg, Some(input_field), output_field)
    }

    pub fn count(output_field: &str) -> Self {
        Self::new(AggregationFunction::Count, None, output_field)
    }
}

/// Packs the accumulator regions of all aggregations of an operator into one fixed-size entry.
#[derive(Debug, Clone)]
pub struct AccumulatorLayout {
    functions: Vec<AggregationFunction>,
    offsets: Vec<usize>,
    entry_size: usize,
}

impl AccumulatorLayout {
    pub fn new(specs: &[AggregationSpec]) -> Self {
        let mut offsets = Vec::with_capacity(specs.len());
        let mut entry_size = 0;
        for spec in specs {
            offsets.push(entry_size);
            entry_size += spec.function.state_size();
        }
        Self {
            functions: specs.iter().map(|s| s.function.clone()).collect(),
            offsets,
            entry_size,
        }
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn num_aggregations(&self) -> usize {
        self.functions.len()
    }

    pub fn functions(&self) -> &[AggregationFunction] {
        &self.functions
    }

    /// Fresh entry with every region reset.
    pub fn new_entry(&self) -> Vec<u8> {
        let mut entry = vec![0u8; self.entry_size];
        self.reset_entry(&mut entry);
        entry
    }

    pub fn reset_entry(&self, entry: &mut [u8]) {
        for (i, function) in self.functions.iter().enumerate() {
            function.reset(self.region_mut(entry, i));
        }
    }

    pub fn lift(&self, entry: &mut [u8], aggregation: usize, value: f64) {
        self.functions[aggregation].lift(self.region_mut(entry, aggregation), value);
    }

    pub fn combine_entry(&self, entry: &mut [u8], other: &[u8]) {
        for (i, function) in self.functions.iter().enumerate() {
            function.combine(self.region_mut(entry, i), self.region(other, i));
        }
    }

    pub fn lower(&self, entry: &[u8], aggregation: usize) -> LoweredValue {
        self.functions[aggregation].lower(self.region(entry, aggregation))
    }

    fn region<'a>(&self, entry: &'a [u8], aggregation: usize) -> &'a [u8] {
        let start = self.offsets[aggregation];
        &entry[start..start + self.functions[aggregation].state_size()]
    }

    fn region_mut<'a>(&self, entry: &'a mut [u8], aggregation: usize) -> &'a mut [u8] {
        let start = self.offsets[aggregation];
        &mut entry[start..start + self.functions[aggregation].state_size()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifted(function: &AggregationFunction, values: &[f64]) -> Vec<u8> {
        let mut acc = vec![0u8; function.state_size()];
        function.reset(&mut acc);
        for v in values {
            function.lift(&mut acc, *v);
        }
        acc
    }

    #[test]
    fn builtin_functions_lower_expected_values() {
        let values = [4.0, -2.0, 10.0, 3.0];
        assert_eq!(
            AggregationFunction::Sum.lower(&lifted(&AggregationFunction::Sum, &values)),
            LoweredValue::Float(Some(15.0))
        );
        assert_eq!(
            AggregationFunction::Min.lower(&lifted(&AggregationFunction::Min, &values)),
            LoweredValue::Float(Some(-2.0))
        );
        assert_eq!(
            AggregationFunction::Max.lower(&lifted(&AggregationFunction::Max, &values)),
            LoweredValue::Float(Some(10.0))
        );
        assert_eq!(
            AggregationFunction::Avg.lower(&lifted(&AggregationFunction::Avg, &values)),
            LoweredValue::Float(Some(3.75))
        );
        assert_eq!(
            AggregationFunction::Count.lower(&lifted(&AggregationFunction::Count, &values)),
            LoweredValue::UInt(4)
        );
    }

    #[test]
    fn empty_accumulators_lower_to_null_or_zero() {
        assert_eq!(
            AggregationFunction::Avg.lower(&lifted(&AggregationFunction::Avg, &[])),
            LoweredValue::Float(None)
        );
        assert_eq!(
            AggregationFunction::Min.lower(&lifted(&AggregationFunction::Min, &[])),
            LoweredValue::Float(None)
        );
        assert_eq!(
            AggregationFunction::Sum.lower(&lifted(&AggregationFunction::Sum, &[])),
            LoweredValue::Float(Some(0.0))
        );
        assert_eq!(
            AggregationFunction::Count.lower(&lifted(&AggregationFunction::Count, &[])),
            LoweredValue::UInt(0)
        );
    }

    #[test]
    fn combine_with_empty_keeps_extremum() {
        let mut acc = lifted(&AggregationFunction::Max, &[7.0]);
        let empty = lifted(&AggregationFunction::Max, &[]);
        AggregationFunction::Max.combine(&mut acc, &empty);
        assert_eq!(AggregationFunction::Max.lower(&acc), LoweredValue::Float(Some(7.0)));

        let mut empty_first = lifted(&AggregationFunction::Min, &[]);
        AggregationFunction::Min.combine(&mut empty_first, &lifted(&AggregationFunction::Min, &[-1.0]));
        assert_eq!(AggregationFunction::Min.lower(&empty_first), LoweredValue::Float(Some(-1.0)));
    }

    #[test]
    fn layout_packs_regions_back_to_back() {
        let specs = vec![
            AggregationSpec::sum("v", "s"),
            AggregationSpec::avg("v", "a"),
            AggregationSpec::count("c"),
        ];
        let layout = AccumulatorLayout::new(&specs);
        assert_eq!(layout.entry_size(), 8 + 16 + 8);

        let mut entry = layout.new_entry();
        for v in [1.0, 2.0, 3.0] {
            for i in 0..layout.num_aggregations() {
                layout.lift(&mut entry, i, v);
            }
        }
        let mut other = layout.new_entry();
        layout.lift(&mut other, 0, 10.0);
        layout.lift(&mut other, 1, 10.0);
        layout.lift(&mut other, 2, 10.0);
        layout.combine_entry(&mut entry, &other);

        assert_eq!(layout.lower(&entry, 0), LoweredValue::Float(Some(16.0)));
        assert_eq!(layout.lower(&entry, 1), LoweredValue::Float(Some(4.0)));
        assert_eq!(layout.lower(&entry, 2), LoweredValue::UInt(4));
    }

    #[test]
    fn aggregation_spec_parses_from_yaml() {
        let spec: AggregationSpec =
            serde_yaml::from_str("function: avg\ninput_field: price\noutput_field: avg_price\n").unwrap();
        assert!(matches!(spec.function, AggregationFunction::Avg));
        assert_eq!(spec.input_field.as_deref(), Some("price"));

        let count: AggregationSpec = serde_yaml::from_str("function: count\noutput_field: n\n").unwrap();
        assert!(count.input_field.is_none());
    }
}

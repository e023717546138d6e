use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use arrow::array::ArrayRef;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow_row::{RowConverter, SortField};
use serde::{Deserialize, Serialize};

/// Grouping key of a keyed window: the key columns of one record in Arrow row format.
///
/// The row format is order preserving, so comparing the raw bytes compares the key values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    bytes: Vec<u8>,
    hash: u64,
}

impl Key {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = Self::compute_hash(&bytes);
        Self { bytes, hash }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    fn compute_hash(bytes: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

/// Encodes key columns of input batches into [`Key`]s and decodes keys back into
/// Arrow columns for window results.
#[derive(Debug)]
pub struct KeyExtractor {
    key_fields: Vec<Field>,
    converter: RowConverter,
}

impl KeyExtractor {
    pub fn try_new(input_schema: &Schema, key_field_names: &[String]) -> Result<Self> {
        let mut key_fields = Vec::with_capacity(key_field_names.len());
        for name in key_field_names {
            let field = input_schema
                .field_with_name(name)
                .map_err(|_| anyhow::anyhow!("Key field '{}' not found in input schema", name))?;
            key_fields.push(field.clone());
        }

        let converter = RowConverter::new(
            key_fields
                .iter()
                .map(|f| SortField::new(f.data_type().clone()))
                .collect(),
        )?;

        Ok(Self {
            key_fields,
            converter,
        })
    }

    pub fn key_fields(&self) -> &[Field] {
        &self.key_fields
    }

    /// One key per row of `batch`.
    pub fn extract_keys(&self, batch: &RecordBatch) -> Result<Vec<Key>> {
        let schema = batch.schema();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.key_fields.len());
        for field in &self.key_fields {
            let idx = schema.index_of(field.name()).map_err(|_| {
                anyhow::anyhow!("Key field '{}' missing from record batch", field.name())
            })?;
            columns.push(Arc::clone(batch.column(idx)));
        }

        let rows = self.converter.convert_columns(&columns)?;
        Ok(rows.iter().map(|row| Key::new(row.as_ref().to_vec())).collect())
    }

    /// Decodes keys into one array per key field, in the given order.
    pub fn decode_keys<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> Result<Vec<ArrayRef>> {
        let parser = self.converter.parser();
        let rows: Vec<_> = keys.into_iter().map(|key| parser.parse(key.bytes())).collect();
        Ok(self.converter.convert_rows(rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("region", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["b", "a", "b"])),
                Arc::new(Int64Array::from(vec![2, 1, 2])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn equal_rows_produce_equal_keys() {
        let b = batch();
        let extractor =
            KeyExtractor::try_new(&b.schema(), &["name".to_string(), "region".to_string()]).unwrap();
        let keys = extractor.extract_keys(&b).unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], keys[2]);
        assert_ne!(keys[0], keys[1]);
        assert!(keys[1] < keys[0]);
    }

    #[test]
    fn decode_restores_key_columns() {
        let b = batch();
        let extractor = KeyExtractor::try_new(&b.schema(), &["name".to_string()]).unwrap();
        let keys = extractor.extract_keys(&b).unwrap();
        let cols = extractor.decode_keys(&keys).unwrap();
        let names = cols[0].as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(names.value(0), "b");
        assert_eq!(names.value(1), "a");
    }

    #[test]
    fn missing_key_field_is_rejected() {
        let b = batch();
        assert!(KeyExtractor::try_new(&b.schema(), &["nope".to_string()]).is_err());
    }
}

//! TrainingRecord - the unit written to the experience store
//!
//! A record is a mapping of named, fixed-shape `f32` blocks. Field names are kept in a
//! `BTreeMap` so two records with the same fields always serialize identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;

/// Flat `f32` buffer with a row-major shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that the shape covers the data exactly
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, AggregatorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(AggregatorError::ShapeMismatch {
                field: "tensor",
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional tensor
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Stack equally sized rows into a `[rows, width]` tensor
    pub fn stack(rows: &[&[f32]]) -> Result<Self, AggregatorError> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(AggregatorError::ShapeMismatch {
                    field: "row",
                    expected: width,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            shape: vec![rows.len(), width],
            data,
        })
    }

    /// Number of scalar elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the payload in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Named training fields produced by the sample aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    fields: BTreeMap<String, Tensor>,
    /// Integer label per row (the step index of each window row); scratch data that is
    /// cleared before the record leaves the node
    #[serde(default)]
    row_ids: Vec<u64>,
}

impl TrainingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing any previous value with the same name
    pub fn with_field(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn with_row_ids(mut self, ids: Vec<u64>) -> Self {
        self.row_ids = ids;
        self
    }

    pub fn row_ids(&self) -> &[u64] {
        &self.row_ids
    }

    /// Remove and return the row labels
    pub fn take_row_ids(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.row_ids)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.fields.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Remove a field, e.g. scratch data that must not reach the store
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total payload size across all fields
    pub fn nbytes(&self) -> usize {
        self.fields.values().map(Tensor::nbytes).sum()
    }

    /// Field name → shape, the record's signature
    pub fn signature(&self) -> BTreeMap<&str, &[usize]> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.shape.as_slice()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_check() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_stack_rows() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let t = Tensor::stack(&[&a, &b]).unwrap();
        assert_eq!(t.shape, vec![2, 2]);
        assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);

        let short = [5.0];
        assert!(Tensor::stack(&[&a, &short]).is_err());
    }

    #[test]
    fn test_record_remove_scratch_field() {
        let mut record = TrainingRecord::new()
            .with_field("advantage", Tensor::vector(vec![1.0, 2.0]))
            .with_field("step", Tensor::vector(vec![0.0, 1.0]));

        assert_eq!(record.nbytes(), 16);
        assert!(record.remove("step").is_some());
        assert!(!record.contains("step"));
        assert_eq!(record.field_names().collect::<Vec<_>>(), vec!["advantage"]);
    }

    #[test]
    fn test_row_ids_exact_beyond_f32_precision() {
        let big = (1u64 << 24) + 1;
        let mut record = TrainingRecord::new()
            .with_field("mask", Tensor::vector(vec![1.0, 1.0]))
            .with_row_ids(vec![big, big + 1]);

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: TrainingRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.row_ids(), &[big, big + 1]);

        assert_eq!(record.take_row_ids(), vec![big, big + 1]);
        assert!(record.row_ids().is_empty());
        // labels are not payload
        assert_eq!(record.nbytes(), 8);
    }

    #[test]
    fn test_signature_is_ordered() {
        let record = TrainingRecord::new()
            .with_field("value", Tensor::vector(vec![0.0; 3]))
            .with_field("action", Tensor::vector(vec![0.0; 2]));
        let names: Vec<_> = record.signature().keys().copied().collect();
        assert_eq!(names, vec!["action", "value"]);
    }
}

//! Fixed-capacity exact cosine index.
//!
//! Labels map to slots in one contiguous vector buffer. Deletion only marks
//! the slot; re-adding a deleted label revives it in place. Scoring is an
//! exhaustive parallel dot product, so results are exact for unit vectors.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnnError {
    #[error("index is full ({capacity} elements)")]
    CapacityExceeded { capacity: usize },

    #[error("only {available} live elements, {requested} requested")]
    InsufficientResults { requested: usize, available: usize },

    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cannot shrink index below its {len} elements")]
    ShrinkBelowLen { len: usize },

    #[error("corrupt index file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    dimension: usize,
    capacity: usize,
    vectors: Vec<f32>,
    labels: Vec<i64>,
    deleted: Vec<bool>,
    slots: HashMap<i64, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            capacity,
            vectors: Vec::new(),
            labels: Vec::new(),
            deleted: Vec::new(),
            slots: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements stored, deleted ones included.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.deleted.iter().filter(|d| !**d).count()
    }

    /// True when `label` is stored and not deleted.
    pub fn contains(&self, label: i64) -> bool {
        self.slots
            .get(&label)
            .map(|&slot| !self.deleted[slot])
            .unwrap_or(false)
    }

    /// Insert `label`, or overwrite its vector and revive it if present.
    pub fn add(&mut self, label: i64, vector: &[f32]) -> Result<(), AnnError> {
        if vector.len() != self.dimension {
            return Err(AnnError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        if let Some(&slot) = self.slots.get(&label) {
            let start = slot * self.dimension;
            self.vectors[start..start + self.dimension].copy_from_slice(vector);
            self.deleted[slot] = false;
            return Ok(());
        }

        if self.labels.len() >= self.capacity {
            return Err(AnnError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let slot = self.labels.len();
        self.vectors.extend_from_slice(vector);
        self.labels.push(label);
        self.deleted.push(false);
        self.slots.insert(label, slot);
        Ok(())
    }

    /// Mark `label` deleted. Returns false when it was absent or already deleted.
    pub fn mark_deleted(&mut self, label: i64) -> bool {
        match self.slots.get(&label) {
            Some(&slot) if !self.deleted[slot] => {
                self.deleted[slot] = true;
                true
            }
            _ => false,
        }
    }

    pub fn resize(&mut self, capacity: usize) -> Result<(), AnnError> {
        if capacity < self.labels.len() {
            return Err(AnnError::ShrinkBelowLen {
                len: self.labels.len(),
            });
        }
        self.capacity = capacity;
        Ok(())
    }

    /// The `k` live labels most similar to `query`, best first.
    ///
    /// Fails with [`AnnError::InsufficientResults`] when fewer than `k` live
    /// elements exist.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, AnnError> {
        if query.len() != self.dimension {
            return Err(AnnError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(i64, f32)> = self
            .vectors
            .par_chunks(self.dimension)
            .enumerate()
            .filter(|(slot, _)| !self.deleted[*slot])
            .map(|(slot, v)| {
                let dot: f32 = v.iter().zip(query).map(|(a, b)| a * b).sum();
                (self.labels[slot], dot)
            })
            .collect();

        if scored.len() < k {
            return Err(AnnError::InsufficientResults {
                requested: k,
                available: scored.len(),
            });
        }

        scored.par_sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn save(&self, path: &Path) -> Result<(), AnnError> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AnnError> {
        let reader = BufReader::new(File::open(path)?);
        let index: FlatIndex = bincode::deserialize_from(reader)?;
        index.validate()?;
        Ok(index)
    }

    fn validate(&self) -> Result<(), AnnError> {
        let n = self.labels.len();
        if self.dimension == 0 {
            return Err(AnnError::Corrupt("zero dimension".to_string()));
        }
        if self.vectors.len() != n * self.dimension || self.deleted.len() != n {
            return Err(AnnError::Corrupt("buffer lengths disagree".to_string()));
        }
        if self.slots.len() != n || n > self.capacity {
            return Err(AnnError::Corrupt("label map disagrees with slots".to_string()));
        }
        if self
            .slots
            .iter()
            .any(|(label, &slot)| slot >= n || self.labels[slot] != *label)
        {
            return Err(AnnError::Corrupt("label map points at wrong slot".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut index = FlatIndex::new(3, 10);
        index.add(1, &unit(3, 0)).unwrap();
        index.add(2, &[0.6, 0.8, 0.0]).unwrap();
        index.add(3, &unit(3, 2)).unwrap();

        let hits = index.search(&unit(3, 0), 3).unwrap();
        let labels: Vec<i64> = hits.iter().map(|h| h.0).collect();
        assert_eq!(labels, vec![1, 2, 3]);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!((hits[1].1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut index = FlatIndex::new(2, 1);
        index.add(1, &unit(2, 0)).unwrap();

        // Updating an existing label does not need room.
        index.add(1, &unit(2, 1)).unwrap();
        assert!(matches!(
            index.add(2, &unit(2, 0)),
            Err(AnnError::CapacityExceeded { capacity: 1 })
        ));

        index.resize(2).unwrap();
        index.add(2, &unit(2, 0)).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_deleted_labels_are_hidden_and_revivable() {
        let mut index = FlatIndex::new(2, 4);
        index.add(1, &unit(2, 0)).unwrap();
        index.add(2, &unit(2, 1)).unwrap();

        assert!(index.mark_deleted(1));
        assert!(!index.mark_deleted(1));
        assert!(!index.contains(1));
        assert_eq!(index.len(), 2);
        assert_eq!(index.live_count(), 1);

        assert!(matches!(
            index.search(&unit(2, 0), 2),
            Err(AnnError::InsufficientResults { requested: 2, available: 1 })
        ));
        let hits = index.search(&unit(2, 0), 1).unwrap();
        assert_eq!(hits[0].0, 2);

        index.add(1, &unit(2, 0)).unwrap();
        assert!(index.contains(1));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.bin");

        let mut index = FlatIndex::new(2, 8);
        index.add(7, &unit(2, 1)).unwrap();
        index.mark_deleted(7);
        index.add(9, &unit(2, 0)).unwrap();
        index.save(&path).unwrap();

        let loaded = FlatIndex::load(&path).unwrap();
        assert_eq!(loaded.capacity(), 8);
        assert!(!loaded.contains(7));
        assert!(loaded.contains(9));
    }

    #[test]
    fn test_load_garbage_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        std::fs::write(&path, b"garbage").unwrap();

        assert!(FlatIndex::load(&path).is_err());
    }
}

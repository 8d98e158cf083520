//! Persistent vector index for one embedding model.
//!
//! The index is a derived cache of the catalog: anything that looks wrong on
//! disk is thrown away and rebuilt empty, and photos get re-embedded by the
//! catch-up loop.

mod flat;

pub use flat::{AnnError, FlatIndex};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::config::VectorIndexConfig;

const BLOB_FILE: &str = "vectors.bin";
const DESCRIPTOR_FILE: &str = "vectors.json";

#[derive(Debug, Error)]
pub enum IndexError {
    /// The index cannot be used at all (storage unreachable, lock poisoned).
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    /// The persisted blob decoded to garbage or failed validation.
    #[error("vector index corrupt: {0}")]
    Corrupt(String),

    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Ann(#[from] AnnError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Sidecar written next to the blob so a load can tell whether the blob
/// belongs to the active model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Descriptor {
    dimension: usize,
    model_id: String,
    capacity: usize,
}

/// Mutex-guarded owner of the [`FlatIndex`], loaded on first use.
pub struct VectorIndex {
    dir: PathBuf,
    dimension: usize,
    model_id: String,
    default_capacity: usize,
    inner: Mutex<Option<FlatIndex>>,
}

impl VectorIndex {
    pub fn new(config: &VectorIndexConfig, dimension: usize, model_id: impl Into<String>) -> Self {
        Self {
            dir: config.path.clone(),
            dimension,
            model_id: model_id.into(),
            default_capacity: config.default_capacity.max(1),
            inner: Mutex::new(None),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn blob_path(&self) -> PathBuf {
        self.dir.join(BLOB_FILE)
    }

    fn descriptor_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTOR_FILE)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<FlatIndex>>, IndexError> {
        self.inner
            .lock()
            .map_err(|e| IndexError::Unavailable(format!("index lock poisoned: {}", e)))
    }

    /// Run `f` against the loaded index, holding the lock throughout.
    fn with_index<R>(
        &self,
        f: impl FnOnce(&mut FlatIndex) -> Result<R, IndexError>,
    ) -> Result<R, IndexError> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            *guard = Some(self.load_or_create()?);
        }
        match guard.as_mut() {
            Some(index) => f(index),
            None => Err(IndexError::Unavailable("index failed to load".to_string())),
        }
    }

    fn load_or_create(&self) -> Result<FlatIndex, IndexError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            IndexError::Unavailable(format!("cannot create {}: {}", self.dir.display(), e))
        })?;

        let blob = self.blob_path();
        let index = match self.read_descriptor() {
            Some(desc) if blob.exists() => {
                if desc.dimension != self.dimension || desc.model_id != self.model_id {
                    tracing::warn!(
                        stored_model = %desc.model_id,
                        stored_dimension = desc.dimension,
                        model = %self.model_id,
                        "Vector index belongs to another model, rebuilding"
                    );
                    None
                } else {
                    match self.load_blob(&blob) {
                        Ok(index) => Some(index),
                        Err(IndexError::Corrupt(reason)) => {
                            tracing::warn!(reason = %reason, "Vector index corrupt, rebuilding");
                            None
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Vector index unreadable, rebuilding");
                            None
                        }
                    }
                }
            }
            None if blob.exists() => {
                tracing::warn!("Vector index has no descriptor, rebuilding");
                None
            }
            _ => None,
        };

        let mut index = match index {
            Some(index) => index,
            None => {
                remove_if_exists(&blob)?;
                FlatIndex::new(self.dimension, self.default_capacity)
            }
        };

        if index.capacity() < self.default_capacity {
            index.resize(self.default_capacity)?;
        }

        tracing::info!(
            model = %self.model_id,
            elements = index.len(),
            capacity = index.capacity(),
            "Vector index ready"
        );

        self.write_descriptor(&index)?;
        Ok(index)
    }

    /// Decode the blob, reporting anything undecodable or inconsistent with
    /// the active dimension as [`IndexError::Corrupt`].
    fn load_blob(&self, blob: &Path) -> Result<FlatIndex, IndexError> {
        let index = match FlatIndex::load(blob) {
            Ok(index) => index,
            Err(AnnError::Corrupt(reason)) => return Err(IndexError::Corrupt(reason)),
            Err(AnnError::Encode(e)) => return Err(IndexError::Corrupt(e.to_string())),
            Err(e) => return Err(e.into()),
        };
        if index.dimension() != self.dimension {
            return Err(IndexError::Corrupt(format!(
                "blob has {} dimensions, descriptor says {}",
                index.dimension(),
                self.dimension
            )));
        }
        Ok(index)
    }

    fn read_descriptor(&self) -> Option<Descriptor> {
        let content = std::fs::read_to_string(self.descriptor_path()).ok()?;
        match serde_json::from_str(&content) {
            Ok(desc) => Some(desc),
            Err(e) => {
                tracing::warn!(error = %e, "Vector index descriptor unreadable");
                None
            }
        }
    }

    fn write_descriptor(&self, index: &FlatIndex) -> Result<(), IndexError> {
        let desc = Descriptor {
            dimension: self.dimension,
            model_id: self.model_id.clone(),
            capacity: index.capacity(),
        };
        std::fs::write(self.descriptor_path(), serde_json::to_string_pretty(&desc)?)?;
        Ok(())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Capacity after growing to hold `min_elements`: never below the
    /// configured default, doubled until large enough.
    fn grown_capacity(&self, current: usize, min_elements: usize) -> usize {
        let mut capacity = self.default_capacity.max(current).max(1);
        while capacity < min_elements {
            capacity *= 2;
        }
        capacity
    }

    pub fn add_or_update(&self, label: i64, vector: &[f32]) -> Result<(), IndexError> {
        self.check_dimension(vector)?;
        self.with_index(|index| match index.add(label, vector) {
            Err(AnnError::CapacityExceeded { capacity }) => {
                let grown = self.grown_capacity(capacity, index.len() + 1);
                tracing::info!(from = capacity, to = grown, "Growing vector index");
                index.resize(grown)?;
                index.add(label, vector)?;
                Ok(())
            }
            other => Ok(other?),
        })
    }

    pub fn delete(&self, label: i64) -> Result<bool, IndexError> {
        self.with_index(|index| Ok(index.mark_deleted(label)))
    }

    /// Delete several labels under one lock hold, returning how many were live.
    pub fn delete_many(&self, labels: &[i64]) -> Result<usize, IndexError> {
        self.with_index(|index| Ok(labels.iter().filter(|&&l| index.mark_deleted(l)).count()))
    }

    pub fn has_label(&self, label: i64) -> Result<bool, IndexError> {
        self.with_index(|index| Ok(index.contains(label)))
    }

    /// Up to `k` `(label, similarity)` pairs, most similar first.
    ///
    /// `k` is clamped to the live element count. Should the backing index
    /// still refuse, the breadth is halved until a search fits.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, IndexError> {
        self.check_dimension(query)?;
        self.with_index(|index| {
            let live = index.live_count();
            if live == 0 || k == 0 {
                return Ok(Vec::new());
            }

            let mut breadth = k.min(live);
            loop {
                match index.search(query, breadth) {
                    Ok(hits) => return Ok(hits),
                    Err(AnnError::InsufficientResults { .. }) if breadth > 1 => {
                        breadth = (breadth / 2).max(1);
                    }
                    Err(AnnError::InsufficientResults { .. }) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                }
            }
        })
    }

    /// Write the blob and descriptor. The blob goes through a temp file so a
    /// crash mid-write leaves the previous copy intact.
    /// Does nothing when the index was never loaded.
    pub fn persist(&self) -> Result<(), IndexError> {
        let guard = self.lock()?;
        let Some(index) = guard.as_ref() else {
            return Ok(());
        };

        let blob = self.blob_path();
        let tmp = blob.with_extension("bin.tmp");
        index.save(&tmp)?;
        std::fs::rename(&tmp, &blob)?;
        self.write_descriptor(index)?;
        tracing::debug!(elements = index.len(), "Vector index persisted");
        Ok(())
    }

    /// Stored elements, deleted ones included.
    pub fn len(&self) -> Result<usize, IndexError> {
        self.with_index(|index| Ok(index.len()))
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        self.with_index(|index| Ok(index.is_empty()))
    }

    pub fn capacity(&self) -> Result<usize, IndexError> {
        self.with_index(|index| Ok(index.capacity()))
    }
}

fn remove_if_exists(path: &Path) -> Result<(), IndexError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

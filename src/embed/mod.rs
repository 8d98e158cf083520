//! Embedding capability.
//!
//! The indexer and search paths only see the [`Embedder`] trait; the CLIP
//! ONNX implementation lives in [`clip`].

mod clip;

pub use clip::ClipEmbedder;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// The model or its runtime cannot be loaded. Callers degrade instead of failing.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Failed(String),
}

/// Maps text and images into one unit-length vector space.
pub trait Embedder: Send + Sync {
    /// Identifies the model; stored with each photo and the vector index.
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError>;

    /// False once the image model is known not to load. Background work
    /// that only exists to compute embeddings checks this first.
    fn is_available(&self) -> bool {
        true
    }
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

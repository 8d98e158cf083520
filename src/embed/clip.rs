//! CLIP ViT-B/32 embedder on ONNX Runtime.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tokenizers::Tokenizer;

use crate::config::EmbeddingConfig;

use super::{normalize, EmbedError, Embedder};

const MODEL_ID: &str = "clip:ViT-B-32:openai";

const INPUT_SIZE: u32 = 224;
const CONTEXT_LENGTH: usize = 77;

// ImageNet statistics used by CLIP preprocessing
const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

struct ModelFile {
    filename: &'static str,
    url: &'static str,
}

const VISION_MODEL: ModelFile = ModelFile {
    filename: "clip-vit-b32-vision.onnx",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
};

const TEXT_MODEL: ModelFile = ModelFile {
    filename: "clip-vit-b32-text.onnx",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx",
};

const TOKENIZER: ModelFile = ModelFile {
    filename: "clip-vit-b32-tokenizer.json",
    url: "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/tokenizer.json",
};

/// Loads its sessions on first use. A load failure is remembered and every
/// later call reports [`EmbedError::Unavailable`].
pub struct ClipEmbedder {
    model_dir: PathBuf,
    auto_download: bool,
    dimension: usize,
    vision: OnceLock<Result<Mutex<Session>, String>>,
    text: OnceLock<Result<Mutex<Session>, String>>,
    tokenizer: OnceLock<Result<Tokenizer, String>>,
}

impl ClipEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model_dir: config.model_dir.clone(),
            auto_download: config.auto_download,
            dimension: config.dimension,
            vision: OnceLock::new(),
            text: OnceLock::new(),
            tokenizer: OnceLock::new(),
        }
    }

    fn ensure_file(&self, file: &ModelFile) -> Result<PathBuf> {
        let path = self.model_dir.join(file.filename);
        if path.exists() {
            return Ok(path);
        }
        if !self.auto_download {
            return Err(anyhow!("{} not found and downloads are disabled", path.display()));
        }

        std::fs::create_dir_all(&self.model_dir)?;
        tracing::info!(model = %file.filename, "Downloading CLIP model file...");
        let response = ureq::get(file.url)
            .call()
            .map_err(|e| anyhow!("Failed to download {}: {}", file.filename, e))?;

        let tmp = path.with_extension("part");
        let mut out = std::fs::File::create(&tmp)?;
        std::io::copy(&mut response.into_reader(), &mut out)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(model = %file.filename, path = ?path, "CLIP model file downloaded");

        Ok(path)
    }

    fn load_session(&self, file: &ModelFile) -> Result<Session> {
        let model_path = self.ensure_file(file)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;
        Ok(session)
    }

    fn session<'a>(
        &self,
        cell: &'a OnceLock<Result<Mutex<Session>, String>>,
        file: &ModelFile,
    ) -> Result<&'a Mutex<Session>, EmbedError> {
        let loaded = cell.get_or_init(|| {
            self.load_session(file).map(Mutex::new).map_err(|e| {
                tracing::warn!(model = %file.filename, error = %e, "CLIP model unavailable");
                e.to_string()
            })
        });
        loaded
            .as_ref()
            .map_err(|e| EmbedError::Unavailable(e.clone()))
    }

    fn tokenizer(&self) -> Result<&Tokenizer, EmbedError> {
        let loaded = self.tokenizer.get_or_init(|| {
            self.ensure_file(&TOKENIZER)
                .and_then(|path| Tokenizer::from_file(&path).map_err(|e| anyhow!("{}", e)))
                .map_err(|e| e.to_string())
        });
        loaded
            .as_ref()
            .map_err(|e| EmbedError::Unavailable(e.clone()))
    }

    fn finish(&self, mut embedding: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
        if embedding.len() != self.dimension {
            return Err(EmbedError::Failed(format!(
                "model produced {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        normalize(&mut embedding);
        Ok(embedding)
    }
}

impl Embedder for ClipEmbedder {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let tokenizer = self.tokenizer()?;
        let session = self.session(&self.text, &TEXT_MODEL)?;

        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::Failed(format!("tokenization failed: {}", e)))?;
        let (input_ids, attention_mask) = pad_tokens(encoding.get_ids());

        let raw = run_text_encoder(session, input_ids, attention_mask)
            .map_err(|e| EmbedError::Failed(e.to_string()))?;
        self.finish(raw)
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbedError> {
        let session = self.session(&self.vision, &VISION_MODEL)?;

        let img = image::open(path)
            .map_err(|e| EmbedError::Failed(format!("failed to load {}: {}", path.display(), e)))?;
        let raw = run_visual_encoder(session, &img).map_err(|e| EmbedError::Failed(e.to_string()))?;
        self.finish(raw)
    }

    fn is_available(&self) -> bool {
        self.session(&self.vision, &VISION_MODEL).is_ok()
    }
}

/// Truncate or zero-pad token ids to the CLIP context length.
fn pad_tokens(ids: &[u32]) -> (Vec<i64>, Vec<i64>) {
    let mut input_ids: Vec<i64> = ids.iter().take(CONTEXT_LENGTH).map(|&id| i64::from(id)).collect();
    let mut attention_mask = vec![1i64; input_ids.len()];
    input_ids.resize(CONTEXT_LENGTH, 0);
    attention_mask.resize(CONTEXT_LENGTH, 0);
    (input_ids, attention_mask)
}

/// Resize to 224x224 and lay out as normalized NCHW floats.
fn preprocess(img: &DynamicImage) -> Vec<f32> {
    let side = INPUT_SIZE as usize;
    let plane = side * side;
    let rgb = img
        .resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * side + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    data
}

fn run_visual_encoder(session: &Mutex<Session>, img: &DynamicImage) -> Result<Vec<f32>> {
    let input = preprocess(img);
    let side = INPUT_SIZE as usize;
    let tensor = Tensor::from_array(([1usize, 3, side, side], input.into_boxed_slice()))?;

    let mut model = session
        .lock()
        .map_err(|e| anyhow!("Failed to lock vision model: {}", e))?;
    let outputs = model.run(ort::inputs!["pixel_values" => tensor])?;

    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("Vision model returned no outputs"))?;
    let (_shape, data) = output.try_extract_tensor::<f32>()?;
    Ok(data.to_vec())
}

fn run_text_encoder(session: &Mutex<Session>, input_ids: Vec<i64>, attention_mask: Vec<i64>) -> Result<Vec<f32>> {
    let ids = Tensor::from_array(([1usize, CONTEXT_LENGTH], input_ids.into_boxed_slice()))?;
    let mask = Tensor::from_array(([1usize, CONTEXT_LENGTH], attention_mask.into_boxed_slice()))?;

    let mut model = session
        .lock()
        .map_err(|e| anyhow!("Failed to lock text model: {}", e))?;
    let outputs = model.run(ort::inputs!["input_ids" => ids, "attention_mask" => mask])?;

    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("Text model returned no outputs"))?;
    let (_shape, data) = output.try_extract_tensor::<f32>()?;
    Ok(data.to_vec())
}

//! Sentence embeddings for taxonomy matching.
//!
//! `LocalEmbedder` runs a BERT-family sentence-transformers model through
//! candle, mean-pooled and L2-normalized. Vectors are never persisted; each
//! run re-embeds what it needs.

use crate::error::{PipelineError, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, HiddenAct, DTYPE};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::info;

pub const DEFAULT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
const REVISION: &str = "main";

/// Batch text → fixed-dimension vectors, one per input, in order
pub trait Embedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

impl<E: Embedder + ?Sized> Embedder for &E {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_batch(texts)
    }
}

fn embed_err(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Embedding(format!("{}: {}", context, e))
}

/// Local embedding model wrapper
pub struct LocalEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl LocalEmbedder {
    /// Load model from Hugging Face Hub (downloads on first use)
    pub fn load(model_id: &str) -> Result<Self> {
        // Try CUDA if feature enabled, otherwise CPU only
        #[cfg(feature = "cuda")]
        let device = if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    info!("Embeddings using CUDA device (GPU)");
                    dev
                }
                Err(e) => {
                    info!("CUDA device creation failed: {}, falling back to CPU", e);
                    Device::Cpu
                }
            }
        } else {
            info!("CUDA not available, embeddings using CPU");
            Device::Cpu
        };

        #[cfg(not(feature = "cuda"))]
        let device = Device::Cpu;

        let api = Api::new().map_err(|e| embed_err("Failed to create HF API", e))?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            REVISION.to_string(),
        ));

        let config_path = repo.get("config.json").map_err(|e| embed_err("Failed to download config", e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| embed_err("Failed to download tokenizer", e))?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| embed_err("Failed to download weights", e))?;

        let config_str = std::fs::read_to_string(&config_path)?;
        let mut config: Config = serde_json::from_str(&config_str)?;
        // sentence-transformers checkpoints use exact gelu
        config.hidden_act = HiddenAct::Gelu;

        let mut tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| embed_err("Failed to load tokenizer", e))?;
        let padding = PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        };
        let truncation = TruncationParams {
            max_length: 512,
            ..Default::default()
        };
        tokenizer.with_padding(Some(padding));
        tokenizer
            .with_truncation(Some(truncation))
            .map_err(|e| embed_err("Failed to set truncation", e))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)
                .map_err(|e| embed_err("Failed to load weights", e))?
        };
        let model = BertModel::load(vb, &config).map_err(|e| embed_err("Failed to build model", e))?;

        info!("Embedding model loaded: {}", model_id);

        Ok(Self { model, tokenizer, device, model_id: model_id.to_string() })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn forward(&self, texts: &[&str]) -> candle_core::Result<Tensor> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(candle_core::Error::msg)?;

        let batch_size = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut all_ids = Vec::with_capacity(batch_size * seq_len);
        let mut all_mask = Vec::with_capacity(batch_size * seq_len);
        let mut all_type_ids = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            all_ids.extend(encoding.get_ids().iter().map(|&x| x as i64));
            all_mask.extend(encoding.get_attention_mask().iter().map(|&x| x as i64));
            all_type_ids.extend(encoding.get_type_ids().iter().map(|&x| x as i64));
        }

        let input_ids = Tensor::from_vec(all_ids, (batch_size, seq_len), &self.device)?;
        let attention_mask = Tensor::from_vec(all_mask, (batch_size, seq_len), &self.device)?;
        let token_type_ids = Tensor::from_vec(all_type_ids, (batch_size, seq_len), &self.device)?;

        let hidden_states = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean pooling with attention mask
        let mask_expanded = attention_mask
            .unsqueeze(2)?
            .to_dtype(DTYPE)?
            .broadcast_as(hidden_states.shape())?;
        let summed = hidden_states.mul(&mask_expanded)?.sum(1)?;
        let mask_sum = mask_expanded.sum(1)?.clamp(1e-9, f64::MAX)?;
        let pooled = summed.div(&mask_sum)?;

        // L2 normalize
        let norm = pooled.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12, f64::MAX)?;
        pooled.broadcast_div(&norm)
    }
}

impl Embedder for LocalEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.forward(texts)
            .and_then(|t| t.to_vec2::<f32>())
            .map_err(|e| embed_err("Embedding forward pass failed", e))
    }
}

/// Embed `texts` in chunks of `chunk_size`, preserving order
pub fn embed_chunked<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[&str],
    chunk_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(chunk_size.max(1)) {
        let vectors = embedder.embed_batch(chunk)?;
        if vectors.len() != chunk.len() {
            return Err(PipelineError::Embedding(format!(
                "expected {} vectors, got {}",
                chunk.len(),
                vectors.len()
            )));
        }
        out.extend(vectors);
    }
    Ok(out)
}

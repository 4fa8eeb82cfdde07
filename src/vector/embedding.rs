//! Embedding generation for posts.
//!
//! The index engine only needs "text in, fixed-length vector out". The
//! [`Embedder`] trait is that seam; [`FastEmbedder`] implements it with a
//! local fastembed model (all-MiniLM-L6-v2 by default).

use std::path::PathBuf;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{IndexError, IndexResult};
use crate::vector::VectorDimension;

/// Trait for generating embeddings from text.
///
/// Implementations must be thread-safe; the engine shares one embedder across
/// all query threads.
pub trait Embedder: Send + Sync {
    /// Generate embeddings for multiple texts, one per input, in order.
    fn embed_batch(&self, texts: &[&str]) -> IndexResult<Vec<Vec<f32>>>;

    /// Dimension of every vector this embedder produces.
    fn dimension(&self) -> VectorDimension;

    /// Generate the embedding of a single text.
    fn embed(&self, text: &str) -> IndexResult<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("model returned no embedding".to_string()))
    }
}

/// Embedder backed by a fastembed ONNX model.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimension: VectorDimension,
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model", &self.model_name)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedder {
    /// Loads (downloading on first use) the named model.
    ///
    /// The output dimension is probed with a test embedding rather than
    /// assumed, so any supported model works with the index.
    ///
    /// # Errors
    /// Returns `IndexError::InvalidInput` for an unknown model name and
    /// `IndexError::Embedding` if the model fails to initialize.
    pub fn new(
        model_name: &str,
        cache_dir: Option<PathBuf>,
        show_download_progress: bool,
    ) -> IndexResult<Self> {
        let model = parse_embedding_model(model_name)?;

        let mut options = InitOptions::new(model).with_show_download_progress(show_download_progress);
        if let Some(dir) = cache_dir {
            options = options.with_cache_dir(dir);
        }

        let mut text_model = TextEmbedding::try_new(options).map_err(|e| {
            IndexError::Embedding(format!(
                "Failed to initialize embedding model {model_name}: {e}. Ensure you have internet connection for first-time model download"
            ))
        })?;

        let sample = text_model
            .embed(vec!["test".to_string()], None)
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        let dim = sample.first().map(Vec::len).unwrap_or_default();
        let dimension = VectorDimension::new(dim)?;

        info!(model = model_name, dimension = dim, "embedding model ready");

        Ok(Self {
            model: Mutex::new(text_model),
            model_name: model_name.to_string(),
            dimension,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl Embedder for FastEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> IndexResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let owned: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        let embeddings = self
            .model
            .lock()
            .embed(owned, None)
            .map_err(|e| IndexError::Embedding(format!("Failed to generate embeddings: {e}")))?;

        if embeddings.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "model returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        for embedding in &embeddings {
            self.dimension.validate_vector(embedding)?;
        }

        debug!(count = texts.len(), "generated embeddings");
        Ok(embeddings)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }
}

/// Maps a configured model name to a fastembed model.
pub fn parse_embedding_model(name: &str) -> IndexResult<EmbeddingModel> {
    let model = match name {
        "AllMiniLML6V2" => EmbeddingModel::AllMiniLML6V2,
        "AllMiniLML6V2Q" => EmbeddingModel::AllMiniLML6V2Q,
        "AllMiniLML12V2" => EmbeddingModel::AllMiniLML12V2,
        "BGESmallENV15" => EmbeddingModel::BGESmallENV15,
        "BGEBaseENV15" => EmbeddingModel::BGEBaseENV15,
        "MultilingualE5Small" => EmbeddingModel::MultilingualE5Small,
        "ParaphraseMLMiniLML12V2" => EmbeddingModel::ParaphraseMLMiniLML12V2,
        other => {
            return Err(IndexError::InvalidInput {
                reason: format!(
                    "unknown embedding model '{other}'. Supported: AllMiniLML6V2, AllMiniLML6V2Q, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15, MultilingualE5Small, ParaphraseMLMiniLML12V2"
                ),
            });
        }
    };
    Ok(model)
}

/// Text embedded for a post, identical at build and query time.
#[must_use]
pub fn post_text(title: &str, body: &str) -> String {
    format!("{title} {body}")
}

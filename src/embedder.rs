//! Embedding provider: turns text into fixed-length dense vectors.
//!
//! The model load is expensive, so [`FastEmbedder`] defers it to first use
//! and performs it at most once per process. A failed load is retried on
//! the next call; until one succeeds every embedding request fails with
//! [`Error::ModelUnavailable`]. There is deliberately no fallback model:
//! an index must never mix vectors from two different models.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_NAME: &str = "all-minilm-l6-v2";
pub const MODEL_ENV_VAR: &str = "MEMODEX_MODEL";

/// A source of fixed-dimension text embeddings.
///
/// The dimension is stable after the first successful call; all vectors an
/// implementation produces have exactly that length.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text. Empty or whitespace-only text is embedded
    /// as-is and yields a full-length vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimensionality. May trigger model initialization.
    fn dimension(&self) -> Result<usize>;

    /// The model name this provider was configured with.
    fn model_name(&self) -> &str;
}

/// Map a model name string to a fastembed `EmbeddingModel` variant.
fn resolve_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" | "AllMiniLML6V2" => {
            Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
        }
        "bge-small-en-v1.5" | "BGESmallENV15" => {
            Ok(fastembed::EmbeddingModel::BGESmallENV15)
        }
        "bge-base-en-v1.5" | "BGEBaseENV15" => {
            Ok(fastembed::EmbeddingModel::BGEBaseENV15)
        }
        "bge-large-en-v1.5" | "BGELargeENV15" => {
            Ok(fastembed::EmbeddingModel::BGELargeENV15)
        }
        other => Err(Error::Config(format!(
            "unknown embedding model '{other}'; supported: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5"
        ))),
    }
}

struct LoadedModel {
    // fastembed's TextEmbedding is not Sync, so inference is serialized
    // behind the model's own mutex. Per-user index locks are never held
    // across an inference call.
    model: Mutex<fastembed::TextEmbedding>,
    dimension: usize,
}

/// Lazily-initialized embedding provider backed by the `fastembed` crate.
///
/// One instance is meant to be shared by every caller in the process.
/// Readers after a successful initialization go through the lock-free
/// `OnceLock` fast path; only the one-time construction takes the init
/// mutex.
pub struct FastEmbedder {
    model_name: String,
    cache_dir: Option<PathBuf>,
    loaded: OnceLock<Arc<LoadedModel>>,
    init_lock: Mutex<()>,
}

impl FastEmbedder {
    /// Create a provider resolving the model name from, in order:
    /// 1. The `MEMODEX_MODEL` environment variable, if set
    /// 2. Otherwise, the default model (`all-minilm-l6-v2`, 384 dimensions)
    ///
    /// The model is not loaded until the first embedding call.
    pub fn new() -> Self {
        let model_name = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_NAME.to_string());
        Self::with_model_name(model_name, None)
    }

    /// Create a provider with an explicit model name and optional model
    /// file cache directory, bypassing environment variable resolution.
    pub fn with_model_name(
        model_name: String,
        cache_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            model_name,
            cache_dir,
            loaded: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Returns `true` if the model has been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Ensure the model is loaded, downloading model files if needed.
    ///
    /// Construction happens at most once; concurrent first callers block
    /// on the init mutex and reuse the winner's instance. A failed load
    /// leaves the guard unset so a later call retries.
    fn ensure_loaded(&self) -> Result<Arc<LoadedModel>> {
        if let Some(loaded) = self.loaded.get() {
            return Ok(loaded.clone());
        }

        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| Error::ModelUnavailable("init lock poisoned".into()))?;

        // Another caller may have finished loading while we waited.
        if let Some(loaded) = self.loaded.get() {
            return Ok(loaded.clone());
        }

        let model_enum = resolve_model(&self.model_name)?;
        let mut init = fastembed::InitOptions::new(model_enum);
        if let Some(dir) = &self.cache_dir {
            init = init.with_cache_dir(dir.clone());
        }

        let mut model = fastembed::TextEmbedding::try_new(init).map_err(|e| {
            Error::ModelUnavailable(format!(
                "failed to load model '{}': {e}",
                self.model_name
            ))
        })?;

        // Probe the output dimension once; it is stable afterwards.
        let probe = model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| {
                Error::ModelUnavailable(format!("dimension probe failed: {e}"))
            })?;
        let dimension = probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| {
                Error::ModelUnavailable("empty probe embedding".into())
            })?;

        info!(model = %self.model_name, dimension, "embedding model loaded");

        let loaded = Arc::new(LoadedModel {
            model: Mutex::new(model),
            dimension,
        });
        let _ = self.loaded.set(loaded.clone());
        Ok(loaded)
    }
}

impl Default for FastEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingProvider for FastEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let loaded = self.ensure_loaded()?;
        let mut model = loaded
            .model
            .lock()
            .map_err(|_| Error::ModelUnavailable("model lock poisoned".into()))?;

        let results = model.embed(vec![text], None).map_err(|e| {
            Error::ModelUnavailable(format!("embedding failed: {e}"))
        })?;
        results.into_iter().next().ok_or_else(|| {
            Error::ModelUnavailable("no embedding returned".into())
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let loaded = self.ensure_loaded()?;
        let mut model = loaded
            .model
            .lock()
            .map_err(|_| Error::ModelUnavailable("model lock poisoned".into()))?;

        model.embed(texts.to_vec(), None).map_err(|e| {
            Error::ModelUnavailable(format!("batch embedding failed: {e}"))
        })
    }

    fn dimension(&self) -> Result<usize> {
        Ok(self.ensure_loaded()?.dimension)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl std::fmt::Debug for FastEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedder")
            .field("model_name", &self.model_name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_known_names() {
        assert!(resolve_model("all-minilm-l6-v2").is_ok());
        assert!(resolve_model("bge-small-en-v1.5").is_ok());
        assert!(resolve_model("bge-base-en-v1.5").is_ok());
        assert!(resolve_model("bge-large-en-v1.5").is_ok());
    }

    #[test]
    fn resolve_model_aliases() {
        assert!(resolve_model("AllMiniLML6V2").is_ok());
        assert!(resolve_model("BGESmallENV15").is_ok());
    }

    #[test]
    fn resolve_model_unknown() {
        let err = resolve_model("nonexistent-model").unwrap_err();
        assert!(err.to_string().contains("unknown embedding model"));
    }

    #[test]
    fn not_loaded_until_first_use() {
        let embedder =
            FastEmbedder::with_model_name("all-minilm-l6-v2".into(), None);
        assert!(!embedder.is_loaded());
        assert_eq!(embedder.model_name(), "all-minilm-l6-v2");
    }

    #[test]
    fn unknown_model_fails_without_sticking() {
        let embedder =
            FastEmbedder::with_model_name("no-such-model".into(), None);
        assert!(embedder.embed("hello").is_err());
        // A failed initialization must not mark the model as loaded.
        assert!(!embedder.is_loaded());
        assert!(embedder.embed("hello").is_err());
    }

    #[test]
    #[ignore = "requires model download (~80MB)"]
    fn embed_returns_fixed_dimension() {
        let embedder = FastEmbedder::new();
        let vector = embedder.embed("Hello world").unwrap();
        assert_eq!(vector.len(), embedder.dimension().unwrap());
        assert_eq!(vector.len(), 384);
    }

    #[test]
    #[ignore = "requires model download (~80MB)"]
    fn embed_empty_text_returns_full_vector() {
        let embedder = FastEmbedder::new();
        let vector = embedder.embed("").unwrap();
        assert_eq!(vector.len(), embedder.dimension().unwrap());
    }

    #[test]
    #[ignore = "requires model download (~80MB)"]
    fn embed_batch_preserves_order_and_dimension() {
        let embedder = FastEmbedder::new();
        let texts: Vec<String> =
            ["first", "second", "third"].iter().map(|s| s.to_string()).collect();
        let vectors = embedder.embed_batch(&texts).unwrap();
        assert_eq!(vectors.len(), 3);
        let single = embedder.embed("first").unwrap();
        assert_eq!(vectors[0], single);
    }
}

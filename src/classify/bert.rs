use std::path::Path;

use category_clustering_local_embedder::{BertEmbedder as LocalBertEmbedder, EmbedderConfig};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;

use crate::AppResult;
use crate::classify::traits::Embedder;

/// BERT encoder producing mean-pooled document embeddings.
#[derive(Clone)]
pub struct BertEmbedder {
    inner: LocalBertEmbedder,
}

impl Embedder for BertEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
        async move { Ok(self.inner.embed_texts(texts).await?) }.boxed()
    }
}

impl BertEmbedder {
    /// Load from a local model directory when `model` names one, otherwise
    /// treat it as a Hugging Face model id and download it into the cache.
    #[tracing::instrument(name = "Loading encoder", level = "info", skip(config))]
    pub async fn load(model: &str, config: EmbedderConfig) -> AppResult<Self> {
        let inner = if Path::new(model).is_dir() {
            info!("Using local model directory {}", model);
            LocalBertEmbedder::new_from_dir(model, config)?
        } else {
            LocalBertEmbedder::new_from_pretrained(model, config).await?
        };
        Ok(Self { inner })
    }
}

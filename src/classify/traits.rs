use futures::future::BoxFuture;
use ndarray::{Array1, Array2};

use crate::AppResult;

/// Trait for converting text into vector embeddings.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts.
    /// Returns one vector per text, in input order, all of the same length.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>>;
}

/// Trait for partitioning vector embeddings.
pub trait Clusterer: Send + Sync {
    /// Assign each row of `embeddings` to a cluster id in `[0, n_clusters)`.
    fn cluster(&self, embeddings: &Array2<f64>, n_clusters: usize) -> AppResult<Array1<usize>>;
}

use thiserror::Error;

/// Unified application error type for everything outside the two skip outcomes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Errored while handling a file. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error reading the dataset. {0}")]
    Csv(#[from] csv::Error),
    #[error("Column `{column}` not found in {path}. Available columns: {available}")]
    MissingColumn {
        column: String,
        path: String,
        available: String,
    },
    #[error("Error while running the embedding model. {0}")]
    Embedder(#[from] category_clustering_local_embedder::EmbedderError),
    #[error("Error shaping the embedding matrix. {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Invalid embeddings. {0}")]
    InvalidEmbeddings(String),
    #[error("n_samples={n_samples} should be >= n_clusters={n_clusters}.")]
    TooFewSamples { n_samples: usize, n_clusters: usize },
    #[error("Silhouette score needs at least 2 distinct clusters, found {0}.")]
    SilhouetteUndefined(usize),
    #[error("Invalid configuration. {0}")]
    InvalidConfig(String),
    #[error("Error serializing json. {0}")]
    SerdeJsonSer(#[from] serde_json::Error),
}

/// Convenience alias for results that bubble `AppError`.
pub type AppResult<T> = Result<T, AppError>;

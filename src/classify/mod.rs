pub(crate) mod bert;
pub(crate) mod convert;
pub(crate) mod kmeans;
pub(crate) mod linalg;
pub(crate) mod silhouette;
pub mod traits;

use std::collections::HashSet;

use ndarray::prelude::*;
use tracing::{debug, info, warn};

use crate::classify::kmeans::KMeans;
use crate::classify::traits::{Clusterer, Embedder};
use crate::dataset::Dataset;
use crate::report::Outcome;
use crate::{AppError, AppResult};

impl Clusterer for KMeans {
    fn cluster(&self, embeddings: &Array2<f64>, n_clusters: usize) -> AppResult<Array1<usize>> {
        let mut kmeans = self.clone();
        kmeans.set_k(n_clusters);
        let fit = kmeans.fit(embeddings)?;
        debug!(
            "k-means converged after {} iterations, inertia {:.4}, centres {:?}",
            fit.n_iter,
            fit.inertia,
            fit.centers.dim()
        );
        Ok(fit.labels)
    }
}

/// Everything one evaluation run needs, built once and passed in explicitly.
pub struct ClusterEvaluation<E, C> {
    embedder: E,
    clusterer: C,
}

impl<E: Embedder, C: Clusterer> ClusterEvaluation<E, C> {
    pub fn new(embedder: E, clusterer: C) -> Self {
        Self {
            embedder,
            clusterer,
        }
    }

    /// Cluster the documents into as many groups as they have labels and
    /// score the partition.
    ///
    /// Fewer than two label values, or a clustering that collapses into a
    /// single group, end the run with a skip outcome rather than an error.
    #[tracing::instrument(
        name = "Evaluating category clustering",
        level = "info",
        skip_all,
        fields(documents = dataset.len())
    )]
    pub async fn run(&self, dataset: &Dataset) -> AppResult<Outcome> {
        let num_clusters = dataset.distinct_labels();
        if num_clusters <= 1 {
            warn!("Found {} distinct labels, nothing to compare", num_clusters);
            return Ok(Outcome::InsufficientLabels {
                distinct_labels: num_clusters,
            });
        }

        info!("Generating embeddings for category clustering...");
        let embeddings = self.embedder.embed(&dataset.texts()).await?;
        if embeddings.len() != dataset.len() {
            return Err(AppError::InvalidEmbeddings(format!(
                "got {} embeddings for {} documents",
                embeddings.len(),
                dataset.len()
            )));
        }
        let matrix = convert::embeddings_to_ndarray(&embeddings)?;

        let labels = self.clusterer.cluster(&matrix, num_clusters)?;
        let unique_clusters = labels.iter().collect::<HashSet<_>>().len();
        if unique_clusters <= 1 {
            warn!(
                "Asked for {} clusters but every document landed in one",
                num_clusters
            );
            return Ok(Outcome::SingleCluster {
                n_clusters: num_clusters,
            });
        }

        let silhouette = silhouette::silhouette_score(&matrix, &labels)?;
        Ok(Outcome::Scored {
            silhouette,
            n_clusters: unique_clusters,
            n_documents: dataset.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::*;
    use crate::dataset::Document;

    /// Embeds each text with a fixed function and counts how often it is asked to.
    struct FnEmbedder {
        calls: AtomicUsize,
        vector: fn(&str) -> Vec<f32>,
    }

    impl FnEmbedder {
        fn new(vector: fn(&str) -> Vec<f32>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                vector,
            }
        }
    }

    impl Embedder for FnEmbedder {
        fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let out = texts.iter().map(|t| (self.vector)(t)).collect();
            async move { Ok(out) }.boxed()
        }
    }

    /// Puts every document in cluster 0 regardless of the request.
    struct CollapsingClusterer;

    impl Clusterer for CollapsingClusterer {
        fn cluster(&self, embeddings: &Array2<f64>, _: usize) -> AppResult<Array1<usize>> {
            Ok(Array1::zeros(embeddings.nrows()))
        }
    }

    /// Texts look like `"<topic>-<n>"`; topics sit far apart with a little per-document jitter.
    fn topic_vector(text: &str) -> Vec<f32> {
        let (topic, n) = text.split_once('-').unwrap();
        let jitter = n.parse::<f32>().unwrap() * 0.05;
        match topic {
            "nlp" => vec![jitter, 1.0 - jitter, 0.0],
            "vision" => vec![8.0 + jitter, 8.0, 1.0 - jitter],
            _ => vec![0.0, 0.0, 0.0],
        }
    }

    fn papers(labels: &[&str]) -> Dataset {
        let documents = labels
            .iter()
            .enumerate()
            .map(|(i, label)| Document {
                text: format!("{label}-{i}"),
                label: Some(label.to_string()),
            })
            .collect();
        Dataset { documents }
    }

    fn ten_papers() -> Dataset {
        papers(&[
            "nlp", "vision", "nlp", "vision", "nlp", "vision", "nlp", "vision", "nlp", "vision",
        ])
    }

    #[tokio::test]
    async fn separable_topics_score_high() {
        let dataset = ten_papers();
        let evaluation = ClusterEvaluation::new(FnEmbedder::new(topic_vector), KMeans::default());

        let outcome = evaluation.run(&dataset).await.unwrap();

        let embeddings: Vec<Vec<f32>> = dataset.texts().iter().map(|t| topic_vector(t)).collect();
        let matrix = convert::embeddings_to_ndarray(&embeddings).unwrap();
        let by_label: Array1<usize> = (0..10).map(|i| i % 2).collect();
        let reference = silhouette::silhouette_score(&matrix, &by_label).unwrap();

        match outcome {
            Outcome::Scored {
                silhouette,
                n_clusters,
                n_documents,
            } => {
                assert_eq!(n_clusters, 2);
                assert_eq!(n_documents, 10);
                assert!(silhouette > 0.9, "silhouette={silhouette}");
                assert!((silhouette - reference).abs() < 1e-12);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_runs_agree() {
        let dataset = ten_papers();
        let evaluation = ClusterEvaluation::new(FnEmbedder::new(topic_vector), KMeans::default());

        let first = evaluation.run(&dataset).await.unwrap();
        let second = evaluation.run(&dataset).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn one_label_skips_before_embedding() {
        let dataset = papers(&["nlp", "nlp", "nlp"]);
        let evaluation = ClusterEvaluation::new(FnEmbedder::new(topic_vector), KMeans::default());

        let outcome = evaluation.run(&dataset).await.unwrap();

        assert_eq!(outcome, Outcome::InsufficientLabels { distinct_labels: 1 });
        assert_eq!(evaluation.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_dataset_skips() {
        let evaluation = ClusterEvaluation::new(FnEmbedder::new(topic_vector), KMeans::default());
        let outcome = evaluation.run(&Dataset::default()).await.unwrap();
        assert_eq!(outcome, Outcome::InsufficientLabels { distinct_labels: 0 });
    }

    #[tokio::test]
    async fn collapsed_clustering_is_reported() {
        let evaluation =
            ClusterEvaluation::new(FnEmbedder::new(topic_vector), CollapsingClusterer);
        let outcome = evaluation.run(&ten_papers()).await.unwrap();
        assert_eq!(outcome, Outcome::SingleCluster { n_clusters: 2 });
    }

    #[tokio::test]
    async fn identical_embeddings_collapse_under_kmeans() {
        let evaluation =
            ClusterEvaluation::new(FnEmbedder::new(|_| vec![0.5, 0.5]), KMeans::default());
        let outcome = evaluation.run(&ten_papers()).await.unwrap();
        assert_eq!(outcome, Outcome::SingleCluster { n_clusters: 2 });
    }

    /// Drops the last vector, as a misbehaving encoder might.
    struct ShortEmbedder;

    impl Embedder for ShortEmbedder {
        fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
            let mut out: Vec<Vec<f32>> = texts.iter().map(|t| topic_vector(t)).collect();
            out.pop();
            async move { Ok(out) }.boxed()
        }
    }

    #[tokio::test]
    async fn embedding_count_mismatch_fails_fast() {
        let evaluation = ClusterEvaluation::new(ShortEmbedder, KMeans::default());
        let err = evaluation.run(&ten_papers()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidEmbeddings(_)));
    }
}

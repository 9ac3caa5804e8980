use std::collections::HashSet;

use ndarray::prelude::*;

use crate::classify::kmeans::utils::euclidean_distances;
use crate::classify::linalg::row_norms;
use crate::{AppError, AppResult};

const CHUNK_SIZE: usize = 256;

/// Per-sample silhouette coefficients under Euclidean distance.
///
/// For sample `i` with mean intra-cluster distance `a` and smallest mean
/// distance to another cluster `b`, `s(i) = (b - a) / max(a, b)`. Members of
/// singleton clusters score 0. Distances are produced one block of rows at a
/// time, so memory stays at `CHUNK_SIZE * n_samples`.
pub fn silhouette_samples(
    x: &Array2<f64>,        // x = (n_samples, n_features)
    labels: &Array1<usize>, // labels = (n_samples,)
) -> AppResult<Array1<f64>> {
    let n_samples = x.nrows();
    if labels.len() != n_samples {
        return Err(AppError::InvalidEmbeddings(format!(
            "{} labels for {} samples",
            labels.len(),
            n_samples
        )));
    }
    let n_labels = labels.iter().collect::<HashSet<_>>().len();
    if n_labels < 2 {
        return Err(AppError::SilhouetteUndefined(n_labels));
    }

    let n_clusters = labels.iter().max().map_or(0, |m| m + 1);
    let mut cluster_sizes = vec![0usize; n_clusters];
    for &label in labels {
        cluster_sizes[label] += 1;
    }

    let x_squared_norms = row_norms(x, true); // (n_samples,)
    let mut scores = Array1::<f64>::zeros(n_samples);

    for start in (0..n_samples).step_by(CHUNK_SIZE) {
        let end = (start + CHUNK_SIZE).min(n_samples);
        let chunk_norms = x_squared_norms.slice(s![start..end]).to_owned();
        // distances = (end - start, n_samples)
        let distances = euclidean_distances(
            &x.slice(s![start..end, ..]).to_owned(),
            x,
            Some(&chunk_norms),
            Some(&x_squared_norms),
            false,
        );

        for (offset, row) in distances.rows().into_iter().enumerate() {
            let i = start + offset;
            let own = labels[i];
            if cluster_sizes[own] <= 1 {
                continue;
            }

            let mut sums = vec![0.0; n_clusters];
            for (j, (&d, &label)) in row.iter().zip(labels.iter()).enumerate() {
                if j != i {
                    sums[label] += d;
                }
            }

            let a = sums[own] / (cluster_sizes[own] - 1) as f64;
            let b = (0..n_clusters)
                .filter(|&c| c != own && cluster_sizes[c] > 0)
                .map(|c| sums[c] / cluster_sizes[c] as f64)
                .fold(f64::INFINITY, f64::min);
            let denom = a.max(b);
            if denom > 0.0 && denom.is_finite() {
                scores[i] = (b - a) / denom;
            }
        }
    }
    Ok(scores)
}

/// Mean silhouette coefficient over all samples, in `[-1, 1]`.
#[tracing::instrument(name = "Scoring clusters", level = "info", skip(x, labels))]
pub fn silhouette_score(x: &Array2<f64>, labels: &Array1<usize>) -> AppResult<f64> {
    let samples = silhouette_samples(x, labels)?;
    Ok(samples.mean().unwrap_or(0.0))
}

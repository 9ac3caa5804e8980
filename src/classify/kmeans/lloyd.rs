use ndarray::prelude::*;

use super::KMeansFit;
use super::utils::euclidean_distances;
use crate::classify::linalg::row_norms;

const CHUNK_SIZE: usize = 256;

/// Outcome of one assignment (and optional update) pass.
struct LloydStep {
    centers: Array2<f64>,      // (n_clusters, n_features)
    labels: Array1<usize>,     // (n_samples,)
    center_shift: Array1<f64>, // (n_clusters,)
}

/// Sum of weighted squared distances of samples to their assigned centre.
fn inertia_dense(
    x: &Array2<f64>,             // x = (n_samples, n_features)
    sample_weight: &Array1<f64>, // sample_weight = (n_samples,)
    centers: &Array2<f64>,       // centers = (n_clusters, n_features)
    labels: &Array1<usize>,      // labels = (n_samples,)
) -> f64 {
    labels
        .iter()
        .enumerate()
        .map(|(i, &label)| {
            let diff = &x.row(i) - &centers.row(label);
            diff.mapv(|v| v * v).sum() * sample_weight[i]
        })
        .sum()
}

fn argmin(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best_i, best_v), (i, &v)| {
            if v < best_v { (i, v) } else { (best_i, best_v) }
        })
        .0
}

/// Assign every sample to its closest centre, walking the samples in chunks to
/// bound the size of the distance block. With `update_centers`, centres move
/// to the weighted mean of their members; an empty cluster keeps its centre.
fn lloyd_step(
    x: &Array2<f64>,             // x = (n_samples, n_features)
    sample_weight: &Array1<f64>, // sample_weight = (n_samples,)
    centers_old: &Array2<f64>,   // centers_old = (n_clusters, n_features)
    update_centers: bool,
) -> LloydStep {
    let (n_samples, n_features) = x.dim();
    let n_clusters = centers_old.nrows();

    let centers_squared_norms = row_norms(centers_old, true);
    let mut labels = Array1::<usize>::zeros(n_samples);
    let mut weighted_sums = Array2::<f64>::zeros((n_clusters, n_features));
    let mut weight_in_clusters = Array1::<f64>::zeros(n_clusters);

    for start in (0..n_samples).step_by(CHUNK_SIZE) {
        let end = (start + CHUNK_SIZE).min(n_samples);
        let x_chunk = x.slice(s![start..end, ..]).to_owned();
        // distances = (end - start, n_clusters)
        let distances = euclidean_distances(
            &x_chunk,
            centers_old,
            None,
            Some(&centers_squared_norms),
            true,
        );

        for (offset, row) in distances.rows().into_iter().enumerate() {
            let i = start + offset;
            let label = argmin(row);
            labels[i] = label;
            if update_centers {
                weight_in_clusters[label] += sample_weight[i];
                weighted_sums
                    .row_mut(label)
                    .scaled_add(sample_weight[i], &x.row(i));
            }
        }
    }

    if !update_centers {
        return LloydStep {
            centers: centers_old.clone(),
            labels,
            center_shift: Array1::<f64>::zeros(n_clusters),
        };
    }

    let mut centers = weighted_sums;
    for ((mut center, old), &weight) in centers
        .rows_mut()
        .into_iter()
        .zip(centers_old.rows())
        .zip(weight_in_clusters.iter())
    {
        if weight > 0.0 {
            center /= weight;
        } else {
            center.assign(&old);
        }
    }
    let center_shift = row_norms(&(centers_old - &centers), false);

    LloydStep {
        centers,
        labels,
        center_shift,
    }
}

/// Run a single k-means from `centers_init` using Lloyd's algorithm.
///
/// Stops when the labels repeat or the squared total centre shift drops to
/// `tol`, whichever comes first, or after `max_iter` passes.
pub fn kmeans_single_lloyd(
    x: &Array2<f64>,             // x = (n_samples, n_features)
    sample_weight: &Array1<f64>, // sample_weight = (n_samples,)
    centers_init: &Array2<f64>,  // centers_init = (n_clusters, n_features)
    max_iter: usize,
    tol: f64,
) -> KMeansFit {
    let mut centers = centers_init.clone();
    let mut labels = Array1::<usize>::zeros(x.nrows());
    let mut labels_old: Option<Array1<usize>> = None;
    let mut strict_convergence = false;
    let mut n_iter = 0;

    for i in 0..max_iter {
        let step = lloyd_step(x, sample_weight, &centers, true);
        n_iter = i + 1;

        if labels_old.as_ref() == Some(&step.labels) {
            centers = step.centers;
            labels = step.labels;
            strict_convergence = true;
            break;
        }

        let center_shift_tot: f64 = step.center_shift.mapv(|v| v * v).sum();
        centers = step.centers;
        labels = step.labels;
        labels_old = Some(labels.clone());

        if center_shift_tot <= tol {
            break;
        }
    }

    if !strict_convergence {
        // Labels must reflect the final centres.
        labels = lloyd_step(x, sample_weight, &centers, false).labels;
    }

    let inertia = inertia_dense(x, sample_weight, &centers, &labels);

    KMeansFit {
        labels,
        centers,
        inertia,
        n_iter,
    }
}

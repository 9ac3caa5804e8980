use ndarray::prelude::*;

use crate::classify::linalg::row_norms;

/// Pairwise distances between the rows of `a` and `b`, `(n_a, n_b)`.
///
/// Uses the `|a|^2 - 2ab + |b|^2` expansion; precomputed squared norms can be
/// passed to skip recomputing them. Negative rounding residue is clamped to 0.
pub fn euclidean_distances(
    a: &Array2<f64>,                      // a = (n_a, n_features)
    b: &Array2<f64>,                      // b = (n_b, n_features)
    a_norm_squared: Option<&Array1<f64>>, // a_norm_squared = (n_a,)
    b_norm_squared: Option<&Array1<f64>>, // b_norm_squared = (n_b,)
    squared: bool,
) -> Array2<f64> {
    let aa: Array1<f64> = match a_norm_squared {
        Some(norms) => norms.to_owned(),
        None => row_norms(a, true),
    };
    let bb: Array1<f64> = match b_norm_squared {
        Some(norms) => norms.to_owned(),
        None => row_norms(b, true),
    };
    let mut distances: Array2<f64> = -2.0 * a.dot(&b.t());
    distances += &aa.insert_axis(Axis(1)); // (n_a, 1) broadcast over columns
    distances += &bb.insert_axis(Axis(0)); // (1, n_b) broadcast over rows
    distances.mapv_inplace(|d| if d > 0.0 { d } else { 0.0 });
    if !squared {
        distances.mapv_inplace(f64::sqrt);
    }
    distances
}

/// Left-side insertion points of `values` into `cumsum(weights * dist)`.
///
/// Sampling an index with probability proportional to `weights * dist` is a
/// search for a uniform draw scaled by the total.
pub fn searchsorted_cumsum(
    weights: &Array1<f64>, // (n_samples,)
    dist: &Array1<f64>,    // (n_samples,)
    values: &Array1<f64>,  // (n_trials,)
) -> Vec<usize> {
    let mut acc = 0.0;
    let cumsum: Vec<f64> = weights
        .iter()
        .zip(dist.iter())
        .map(|(w, d)| {
            acc += w * d;
            acc
        })
        .collect();
    values
        .iter()
        .map(|v| cumsum.partition_point(|c| c < v))
        .collect()
}

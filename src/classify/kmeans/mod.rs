mod lloyd;
pub(crate) mod utils;

use std::cmp::Ordering;
use std::collections::HashSet;

use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::{Distribution, Uniform};
use tracing::{debug, trace, warn};

use crate::classify::linalg::{mean_feature_variance, row_norms};
use crate::{AppError, AppResult};

static DEFAULT_K: usize = 8;
static DEFAULT_N_INIT: usize = 0;
static DEFAULT_MAX_ITER: usize = 300;
static DEFAULT_TOLERANCE: f64 = 1e-4;
static DEFAULT_SEED: u64 = 42;

/// Centroid seeding strategy. The payload is the number of seedings to try;
/// 0 picks the strategy's own default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KMeansInit {
    Random(usize),
    KMeansPlusPlus(usize),
}

impl KMeansInit {
    fn value(&self) -> usize {
        match self {
            KMeansInit::Random(n) => *n,
            KMeansInit::KMeansPlusPlus(n) => *n,
        }
    }

    pub fn set_n_init(&mut self, n_init: usize) {
        match self {
            KMeansInit::Random(n) => *n = n_init,
            KMeansInit::KMeansPlusPlus(n) => *n = n_init,
        }
    }

    pub fn n_init(&self) -> usize {
        if self.value() > 0 {
            self.value()
        } else {
            match self {
                KMeansInit::Random(_) => 10,
                KMeansInit::KMeansPlusPlus(_) => 1,
            }
        }
    }

    fn init_centroids<R: Rng + ?Sized>(
        &self,
        x: &Array2<f64>,               // x = (n_samples, n_features)
        x_squared_norms: &Array1<f64>, // x_squared_norms = (n_samples,)
        rng: &mut R,
        sample_weight: &Array1<f64>, // sample_weight = (n_samples,)
        n_clusters: usize,
    ) -> AppResult<Array2<f64>> {
        match self {
            KMeansInit::Random(_) => {
                let seeds =
                    ndarray_rand::rand::seq::index::sample(rng, x.nrows(), n_clusters).into_vec();
                Ok(x.select(Axis(0), &seeds))
            }
            KMeansInit::KMeansPlusPlus(_) => Ok(kmeans_plus_plus(
                x,
                n_clusters,
                sample_weight,
                x_squared_norms,
                rng,
                None,
            )?
            .0),
        }
    }
}

impl Default for KMeansInit {
    fn default() -> Self {
        KMeansInit::KMeansPlusPlus(DEFAULT_N_INIT)
    }
}

/// Greedy k-means++ seeding.
///
/// Each new centre is the best of `n_local_trials` candidates drawn with
/// probability proportional to their squared distance from the centres chosen
/// so far. Returns the centres and the sample indices they were taken from.
fn kmeans_plus_plus<R: Rng + ?Sized>(
    x: &Array2<f64>, // x = (n_samples, n_features)
    n_clusters: usize,
    sample_weight: &Array1<f64>,   // sample_weight = (n_samples,)
    x_squared_norms: &Array1<f64>, // x_squared_norms = (n_samples,)
    rng: &mut R,
    n_local_trials: Option<usize>,
) -> AppResult<(Array2<f64>, Vec<usize>)> {
    let (n_samples, n_features) = x.dim();
    let last = n_samples - 1;
    let n_local_trials = n_local_trials.unwrap_or(2 + (n_clusters as f64).ln() as usize);
    let unit = Uniform::new(0.0, 1.0).map_err(|e| AppError::InvalidConfig(e.to_string()))?;

    let mut centers = Array2::<f64>::zeros((n_clusters, n_features));
    let mut indices = Vec::with_capacity(n_clusters);

    // First centre: drawn proportionally to sample weight.
    let draw = arr1(&[unit.sample(rng) * sample_weight.sum()]);
    let first = utils::searchsorted_cumsum(sample_weight, &Array1::ones(n_samples), &draw)[0]
        .min(last);
    centers.row_mut(0).assign(&x.row(first));
    indices.push(first);

    // closest_dist_sq = (n_samples,)
    let mut closest_dist_sq: Array1<f64> = utils::euclidean_distances(
        &x.slice(s![first..first + 1, ..]).to_owned(),
        x,
        None,
        Some(x_squared_norms),
        true,
    )
    .row(0)
    .to_owned();
    let mut current_pot = closest_dist_sq.dot(sample_weight);

    for c in 1..n_clusters {
        let rand_vals = Array1::<f64>::random_using(n_local_trials, unit, rng) * current_pot;
        let candidate_ids: Vec<usize> =
            utils::searchsorted_cumsum(sample_weight, &closest_dist_sq, &rand_vals)
                .into_iter()
                .map(|id| id.min(last))
                .collect();

        // distance_to_candidates = (n_local_trials, n_samples)
        let mut distance_to_candidates = utils::euclidean_distances(
            &x.select(Axis(0), &candidate_ids),
            x,
            None,
            Some(x_squared_norms),
            true,
        );
        for mut row in distance_to_candidates.rows_mut() {
            row.zip_mut_with(&closest_dist_sq, |dist, &closest| {
                if closest < *dist {
                    *dist = closest;
                }
            });
        }
        let candidates_pot = distance_to_candidates.dot(sample_weight); // (n_local_trials,)

        let best = candidates_pot
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        current_pot = candidates_pot[best];
        closest_dist_sq = distance_to_candidates.row(best).to_owned();

        let best_candidate = candidate_ids[best];
        centers.row_mut(c).assign(&x.row(best_candidate));
        indices.push(best_candidate);
    }
    Ok((centers, indices))
}

/// A fitted partition.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub labels: Array1<usize>, // (n_samples,)
    pub centers: Array2<f64>,  // (k, n_features)
    pub inertia: f64,
    pub n_iter: usize,
}

impl KMeansFit {
    pub fn distinct_clusters(&self) -> usize {
        self.labels.iter().collect::<HashSet<_>>().len()
    }
}

/// Seeded k-means. Two fits with the same settings on the same data agree.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub k: usize,
    pub init: KMeansInit,
    pub max_iterations: usize,
    /// Relative tolerance, scaled by the mean feature variance of the data.
    pub tolerance: f64,
    pub seed: u64,
}

impl Default for KMeans {
    fn default() -> Self {
        KMeans {
            k: DEFAULT_K,
            init: KMeansInit::default(),
            max_iterations: DEFAULT_MAX_ITER,
            tolerance: DEFAULT_TOLERANCE,
            seed: DEFAULT_SEED,
        }
    }
}

impl KMeans {
    #[cfg(test)]
    pub fn new(k: usize) -> Self {
        KMeans {
            k,
            ..Default::default()
        }
    }

    pub fn set_k(&mut self, k: usize) -> &mut Self {
        self.k = k;
        self
    }

    pub fn set_init(&mut self, init: KMeansInit) -> &mut Self {
        self.init = init;
        self
    }

    pub fn set_n_init(&mut self, n_init: usize) -> &mut Self {
        self.init.set_n_init(n_init);
        self
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> &mut Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn set_tolerance(&mut self, tolerance: f64) -> &mut Self {
        self.tolerance = tolerance;
        self
    }

    pub fn set_seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    #[tracing::instrument(name = "Clustering embeddings", level = "info", skip(self, x), fields(k = self.k))]
    pub fn fit(&self, x: &Array2<f64>) -> AppResult<KMeansFit> {
        let (n_samples, n_features) = x.dim(); // x = (n_samples, n_features)
        if self.k == 0 {
            return Err(AppError::InvalidConfig(
                "k-means needs at least one cluster".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(AppError::InvalidConfig(
                "max_iter must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(AppError::InvalidConfig(format!(
                "tol must be finite and non-negative, got {}",
                self.tolerance
            )));
        }
        if n_samples < self.k {
            return Err(AppError::TooFewSamples {
                n_samples,
                n_clusters: self.k,
            });
        }

        let sample_weight = Array1::<f64>::ones(n_samples); // sample_weight = (n_samples,)
        let x_mean: Array1<f64> = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::<f64>::zeros(n_features)); // x_mean = (n_features,)
        let centered = x - &x_mean;
        let x_squared_norms = row_norms(&centered, true); // x_squared_norms = (n_samples,)
        let tol = mean_feature_variance(&centered) * self.tolerance;
        debug!("Absolute tolerance {tol:e} over {n_samples} samples");

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<KMeansFit> = None;
        for run in 0..self.init.n_init() {
            let centers_init = self.init.init_centroids(
                &centered,
                &x_squared_norms,
                &mut rng,
                &sample_weight,
                self.k,
            )?; // centers_init = (k, n_features)
            let fit = lloyd::kmeans_single_lloyd(
                &centered,
                &sample_weight,
                &centers_init,
                self.max_iterations,
                tol,
            );
            trace!(
                "Run {} finished after {} iterations with inertia {}",
                run, fit.n_iter, fit.inertia
            );
            if best.as_ref().is_none_or(|b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }
        let mut best = best.ok_or_else(|| {
            AppError::InvalidConfig("k-means ran zero initializations".to_string())
        })?;
        best.centers += &x_mean;

        let distinct_clusters = best.distinct_clusters();
        if distinct_clusters < self.k {
            warn!(
                "Number of distinct clusters ({}) found smaller than n_clusters ({}). Possibly due to duplicate points in X.",
                distinct_clusters, self.k
            );
        }
        Ok(best)
    }
}

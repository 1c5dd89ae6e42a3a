//! K-means clustering used to partition the index into coarse buckets.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Number of centroids. Clamped to the number of training points.
    pub k: usize,
    pub max_iterations: usize,
    /// Stop once no centroid moves more than this (squared distance).
    pub convergence_threshold: f32,
    pub seed: u64,
}

/// Trained centroids.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub centroids: Vec<Vec<f32>>,
    pub iterations: usize,
    /// Sum of squared distances from each training point to its centroid.
    pub inertia: f32,
}

impl KMeans {
    /// Train on `data`. All points must have the same, non-zero length and
    /// `data` must not be empty; the index builder validates both.
    pub fn train(data: &[&[f32]], config: &KMeansConfig) -> Self {
        let k = config.k.clamp(1, data.len());
        let dimension = data[0].len();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut centroids = Self::plus_plus_init(data, k, &mut rng);

        let mut iterations = 0;
        let mut inertia = f32::MAX;

        for _ in 0..config.max_iterations {
            iterations += 1;

            let assignments = assign(data, &centroids);
            inertia = assignments.iter().map(|&(_, d)| d).sum();

            let updated = Self::update_centroids(data, &assignments, &centroids, dimension);
            let movement = centroids
                .iter()
                .zip(&updated)
                .map(|(old, new)| squared_euclidean(old, new))
                .fold(0.0f32, f32::max);
            centroids = updated;

            if movement < config.convergence_threshold {
                break;
            }
        }

        Self {
            centroids,
            iterations,
            inertia,
        }
    }

    /// K-means++ seeding: each new centroid is drawn with probability
    /// proportional to its squared distance from the nearest chosen one.
    fn plus_plus_init(data: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
        centroids.push(data[rng.random_range(0..data.len())].to_vec());

        let mut nearest: Vec<f32> = data
            .par_iter()
            .map(|point| squared_euclidean(point, &centroids[0]))
            .collect();

        while centroids.len() < k {
            let total: f32 = nearest.iter().sum();
            let chosen = if total <= f32::EPSILON {
                rng.random_range(0..data.len())
            } else {
                let threshold = rng.random::<f32>() * total;
                let mut cumulative = 0.0f32;
                nearest
                    .iter()
                    .position(|&d| {
                        cumulative += d;
                        cumulative >= threshold
                    })
                    .unwrap_or(data.len() - 1)
            };

            let centroid = data[chosen].to_vec();
            nearest
                .par_iter_mut()
                .zip(data.par_iter())
                .for_each(|(best, point)| {
                    let d = squared_euclidean(point, &centroid);
                    if d < *best {
                        *best = d;
                    }
                });
            centroids.push(centroid);
        }

        centroids
    }

    fn update_centroids(
        data: &[&[f32]],
        assignments: &[(usize, f32)],
        previous: &[Vec<f32>],
        dimension: usize,
    ) -> Vec<Vec<f32>> {
        let mut sums = vec![vec![0.0f64; dimension]; previous.len()];
        let mut counts = vec![0usize; previous.len()];

        for (point, &(cluster, _)) in data.iter().zip(assignments) {
            counts[cluster] += 1;
            for (sum, &x) in sums[cluster].iter_mut().zip(point.iter()) {
                *sum += x as f64;
            }
        }

        sums.into_iter()
            .zip(counts)
            .zip(previous)
            .map(|((sum, count), old)| {
                // empty clusters keep their position
                if count == 0 {
                    old.clone()
                } else {
                    sum.into_iter().map(|s| (s / count as f64) as f32).collect()
                }
            })
            .collect()
    }
}

/// Nearest centroid (and squared distance to it) for every point.
/// Ties go to the lower centroid index.
pub fn assign(data: &[&[f32]], centroids: &[Vec<f32>]) -> Vec<(usize, f32)> {
    data.par_iter()
        .map(|point| nearest_centroid(point, centroids))
        .collect()
}

pub fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best = (0, f32::MAX);
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_euclidean(point, centroid);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

//! Approximate nearest-neighbor index over a store snapshot.
//!
//! The index is an inverted file: vectors are partitioned into coarse
//! buckets by k-means over a random sample, and a query visits only the
//! buckets whose centroids are closest to it. When the probe count covers
//! most buckets anyway the query scans everything instead.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::galaxy::kmeans::{self, KMeans, KMeansConfig};
use crate::galaxy::store::{Fingerprint, StoreSnapshot};

/// Distance used for both bucketing and ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cos(a, b)`, in `[0, 2]`.
    #[default]
    Cosine,
    Euclidean,
}

/// Build-time parameters.
#[derive(Debug, Clone)]
pub struct IndexParams {
    pub metric: Metric,
    /// Number of buckets; 0 picks roughly `sqrt(N)`.
    pub buckets: usize,
    /// Buckets visited per query.
    pub probe: usize,
    /// Maximum number of vectors used to train the bucket centroids.
    pub sample_size: usize,
    pub kmeans_iterations: usize,
    /// Scan exhaustively once `probe / buckets` reaches this fraction.
    pub exhaustive_fraction: f32,
    pub seed: u64,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            buckets: 0,
            probe: 8,
            sample_size: 4096,
            kmeans_iterations: 12,
            exhaustive_fraction: 0.5,
            seed: 42,
        }
    }
}

/// One query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    pub item_id: String,
    pub distance: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Cannot build from an empty snapshot")]
    EmptyIndex,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index is not ready")]
    NotReady,

    #[error("Query component {0} is not a finite number")]
    InvalidQuery(usize),
}

/// Heap entry ordered by distance, then by insertion position, so the
/// max-heap evicts the farthest (and, on ties, the latest inserted) item.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    position: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.position.cmp(&other.position))
    }
}

/// Immutable IVF index built from one snapshot.
pub struct AnnIndex {
    metric: Metric,
    dimensions: usize,
    /// Item ids by insertion position.
    ids: Vec<Arc<str>>,
    /// Row-major vectors; unit-normalized for the cosine metric.
    data: Vec<f32>,
    centroids: Vec<Vec<f32>>,
    /// Member positions per bucket, ascending.
    buckets: Vec<Vec<u32>>,
    probe: usize,
    exhaustive: bool,
    fingerprint: Fingerprint,
}

impl AnnIndex {
    /// Build an index over every entry of `snapshot`.
    pub fn build(snapshot: &StoreSnapshot, params: &IndexParams) -> Result<Self, IndexError> {
        if snapshot.is_empty() {
            return Err(IndexError::EmptyIndex);
        }

        let dimensions = snapshot.dimensions();
        for entry in snapshot.entries() {
            if entry.vector.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    got: entry.vector.len(),
                });
            }
        }

        let started = Instant::now();
        let n = snapshot.len();

        let mut data = Vec::with_capacity(n * dimensions);
        for entry in snapshot.entries() {
            data.extend_from_slice(&entry.vector);
        }
        if params.metric == Metric::Cosine && dimensions > 0 {
            data.par_chunks_mut(dimensions).for_each(normalize);
        }

        let ids: Vec<Arc<str>> = snapshot
            .entries()
            .iter()
            .map(|entry| entry.item_id.clone())
            .collect();

        let bucket_count = if params.buckets == 0 {
            ((n as f64).sqrt().round() as usize).max(1)
        } else {
            params.buckets
        }
        .min(n);

        let rows: Vec<&[f32]> = if dimensions == 0 {
            vec![&[][..]; n]
        } else {
            data.chunks(dimensions).collect()
        };

        let centroids = if bucket_count == 1 || dimensions == 0 {
            vec![vec![0.0; dimensions]]
        } else {
            let mut rng = StdRng::seed_from_u64(params.seed);
            let sample: Vec<&[f32]> = if n <= params.sample_size.max(bucket_count) {
                rows.clone()
            } else {
                let mut picked =
                    rand::seq::index::sample(&mut rng, n, params.sample_size.max(bucket_count))
                        .into_vec();
                picked.sort_unstable();
                picked.into_iter().map(|i| rows[i]).collect()
            };

            let kmeans = KMeans::train(
                &sample,
                &KMeansConfig {
                    k: bucket_count,
                    max_iterations: params.kmeans_iterations.max(1),
                    convergence_threshold: 1e-6,
                    seed: params.seed,
                },
            );
            log::debug!(
                "trained {} buckets on {} vectors in {} iterations (inertia {:.4})",
                kmeans.centroids.len(),
                sample.len(),
                kmeans.iterations,
                kmeans.inertia
            );
            kmeans.centroids
        };

        let mut buckets = vec![Vec::new(); centroids.len()];
        for (position, (bucket, _)) in kmeans::assign(&rows, &centroids).into_iter().enumerate() {
            buckets[bucket].push(position as u32);
        }

        let probe = params.probe.clamp(1, buckets.len());
        let exhaustive = probe as f32 / buckets.len() as f32 >= params.exhaustive_fraction;

        log::info!(
            "built index over {} vectors ({} dims, {} buckets, probe {}{}) in {}ms",
            n,
            dimensions,
            buckets.len(),
            probe,
            if exhaustive { ", exhaustive" } else { "" },
            started.elapsed().as_millis()
        );

        Ok(Self {
            metric: params.metric,
            dimensions,
            ids,
            data,
            centroids,
            buckets,
            probe,
            exhaustive,
            fingerprint: snapshot.fingerprint().clone(),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Fingerprint of the snapshot this index was built from.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The `k` nearest items to `query`, closest first.
    ///
    /// Returns `min(k, N)` results. Ties are broken by insertion order. An
    /// item whose vector equals the query is returned like any other item.
    pub fn query_with_distances(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if let Some(position) = query.iter().position(|x| !x.is_finite()) {
            return Err(IndexError::InvalidQuery(position));
        }

        let wanted = k.min(self.ids.len());
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        if self.metric == Metric::Cosine {
            normalize(&mut query);
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(wanted + 1);

        if self.exhaustive {
            for position in 0..self.ids.len() {
                self.offer(&mut heap, &query, position as u32, wanted);
            }
        } else {
            let mut order: Vec<(f32, usize)> = self
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (kmeans::squared_euclidean(&query, c), i))
                .collect();
            order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            let mut visited_members = 0;
            for (visited, &(_, bucket)) in order.iter().enumerate() {
                // keep going past the probe count until enough members were seen
                if visited >= self.probe && visited_members >= wanted {
                    break;
                }
                for &position in &self.buckets[bucket] {
                    self.offer(&mut heap, &query, position, wanted);
                }
                visited_members += self.buckets[bucket].len();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                item_id: self.ids[c.position as usize].to_string(),
                distance: c.distance,
            })
            .collect())
    }

    fn offer(&self, heap: &mut BinaryHeap<Candidate>, query: &[f32], position: u32, k: usize) {
        let candidate = Candidate {
            distance: self.distance(query, self.row(position as usize)),
            position,
        };
        if heap.len() < k {
            heap.push(candidate);
        } else if let Some(worst) = heap.peek() {
            if candidate < *worst {
                heap.pop();
                heap.push(candidate);
            }
        }
    }

    fn row(&self, position: usize) -> &[f32] {
        &self.data[position * self.dimensions..(position + 1) * self.dimensions]
    }

    fn distance(&self, query: &[f32], row: &[f32]) -> f32 {
        let squared = kmeans::squared_euclidean(query, row);
        match self.metric {
            // for unit vectors |a - b|^2 = 2 - 2cos, so this is exactly 0 for
            // identical vectors
            Metric::Cosine => squared * 0.5,
            Metric::Euclidean => squared.sqrt(),
        }
    }
}

/// Scale to unit length in place. Zero vectors are left as they are.
fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Holder for the current index generation.
///
/// Readers pin an `Arc<AnnIndex>` and keep querying that instance even if a
/// rebuild installs a newer one meanwhile.
#[derive(Default)]
pub struct IndexSlot {
    current: RwLock<Option<Arc<AnnIndex>>>,
}

impl IndexSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current generation.
    pub fn install(&self, index: Arc<AnnIndex>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(index);
    }

    /// The current generation, if one was ever built.
    pub fn current(&self) -> Option<Arc<AnnIndex>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Like [`IndexSlot::current`], failing with `NotReady` when empty.
    pub fn pin(&self) -> Result<Arc<AnnIndex>, IndexError> {
        self.current().ok_or(IndexError::NotReady)
    }
}

//! Projection of the whole catalog onto its top three principal directions.
//!
//! The directions are found by orthogonal (block power) iteration over the
//! implicit covariance matrix: each pass multiplies three candidate vectors
//! by `Xc^T Xc` in one sweep over the rows, then re-orthonormalizes them.
//! Row sweeps are split into fixed-size chunks whose partial sums are
//! combined in chunk order, so results do not depend on thread scheduling.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::galaxy::index::IndexError;
use crate::galaxy::store::StoreSnapshot;

const AXES: usize = 3;

/// Rows per parallel work unit.
const CHUNK_ROWS: usize = 256;

/// Norms below this are treated as a collapsed direction.
const DEGENERATE_NORM: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct LayoutParams {
    pub power_iterations: usize,
    /// Half the side of the cube the layout is fitted into.
    pub extent: f64,
    pub seed: u64,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            power_iterations: 24,
            extent: 100.0,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutPoint {
    pub item_id: Arc<str>,
    pub position: [f64; 3],
}

/// 3-D positions for every item of a snapshot, in snapshot order.
#[derive(Debug, Clone)]
pub struct Layout {
    points: Vec<LayoutPoint>,
    /// Variance captured along each axis before rescaling.
    variance: [f64; 3],
}

impl Layout {
    pub fn points(&self) -> &[LayoutPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn variance(&self) -> [f64; 3] {
        self.variance
    }
}

/// Reduce every vector of `snapshot` to a point inside the cube
/// `[-extent, extent]^3`.
///
/// The same snapshot and seed always produce the same layout.
pub fn reduce(snapshot: &StoreSnapshot, params: &LayoutParams) -> Result<Layout, IndexError> {
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
    let rows: Vec<&[f32]> = snapshot.entries().iter().map(|e| &*e.vector).collect();

    let mean = mean(&rows, dimensions);
    let (basis, variance) = principal_directions(&rows, &mean, params);
    let (projected, min, max) = project(&rows, &mean, &basis);

    let center: Vec<f64> = (0..AXES).map(|a| (min[a] + max[a]) / 2.0).collect();
    let half_span = (0..AXES)
        .map(|a| (max[a] - min[a]) / 2.0)
        .fold(0.0f64, f64::max);
    let scale = if half_span > DEGENERATE_NORM {
        params.extent / half_span
    } else {
        0.0
    };

    let points: Vec<LayoutPoint> = snapshot
        .entries()
        .iter()
        .zip(projected)
        .map(|(entry, p)| LayoutPoint {
            item_id: entry.item_id.clone(),
            position: [
                (p[0] - center[0]) * scale,
                (p[1] - center[1]) * scale,
                (p[2] - center[2]) * scale,
            ],
        })
        .collect();

    log::info!(
        "reduced {} vectors ({} dims) to 3D in {}ms, variance [{:.4}, {:.4}, {:.4}]",
        points.len(),
        dimensions,
        started.elapsed().as_millis(),
        variance[0],
        variance[1],
        variance[2]
    );

    Ok(Layout { points, variance })
}

fn mean(rows: &[&[f32]], dimensions: usize) -> Vec<f64> {
    let partials: Vec<Vec<f64>> = rows
        .par_chunks(CHUNK_ROWS)
        .map(|chunk| {
            let mut acc = vec![0.0f64; dimensions];
            for row in chunk {
                for (a, &x) in acc.iter_mut().zip(row.iter()) {
                    *a += x as f64;
                }
            }
            acc
        })
        .collect();

    let mut total = vec![0.0f64; dimensions];
    for partial in partials {
        add_into(&mut total, &partial);
    }
    let n = rows.len() as f64;
    total.iter_mut().for_each(|x| *x /= n);
    total
}

/// Top principal directions (unit vectors, strongest first) and the variance
/// along each. Directions that collapse are returned as zero vectors.
fn principal_directions(
    rows: &[&[f32]],
    mean: &[f64],
    params: &LayoutParams,
) -> (Vec<Vec<f64>>, [f64; 3]) {
    let dimensions = mean.len();
    let rank = AXES.min(dimensions);
    let n = rows.len() as f64;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut basis: Vec<Vec<f64>> = (0..rank)
        .map(|_| {
            (0..dimensions)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect()
        })
        .collect();
    orthonormalize(&mut basis);

    let mut norms = vec![0.0f64; rank];
    for _ in 0..params.power_iterations.max(1) {
        let mut next = covariance_times(rows, mean, &basis);
        norms = orthonormalize(&mut next);
        basis = next;
    }

    for direction in basis.iter_mut() {
        orient(direction);
    }
    while basis.len() < AXES {
        basis.push(vec![0.0; dimensions]);
    }

    let mut variance = [0.0f64; 3];
    for (v, norm) in variance.iter_mut().zip(norms) {
        *v = norm / n;
    }

    (basis, variance)
}

/// `Xc^T Xc v` for every `v` in `basis`, with `Xc` the centered rows.
fn covariance_times(rows: &[&[f32]], mean: &[f64], basis: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let dimensions = mean.len();
    let partials: Vec<Vec<Vec<f64>>> = rows
        .par_chunks(CHUNK_ROWS)
        .map(|chunk| {
            let mut acc = vec![vec![0.0f64; dimensions]; basis.len()];
            let mut centered = vec![0.0f64; dimensions];
            for row in chunk {
                for ((c, &x), m) in centered.iter_mut().zip(row.iter()).zip(mean) {
                    *c = x as f64 - m;
                }
                for (out, v) in acc.iter_mut().zip(basis) {
                    let s = dot(&centered, v);
                    if s != 0.0 {
                        for (o, &c) in out.iter_mut().zip(&centered) {
                            *o += s * c;
                        }
                    }
                }
            }
            acc
        })
        .collect();

    let mut total = vec![vec![0.0f64; dimensions]; basis.len()];
    for partial in partials {
        for (t, p) in total.iter_mut().zip(&partial) {
            add_into(t, p);
        }
    }
    total
}

/// Gram-Schmidt in place. Returns each vector's norm after removing the
/// components along earlier vectors; collapsed vectors become zero.
fn orthonormalize(vectors: &mut [Vec<f64>]) -> Vec<f64> {
    let mut norms = Vec::with_capacity(vectors.len());
    for i in 0..vectors.len() {
        let (done, rest) = vectors.split_at_mut(i);
        let current = &mut rest[0];
        for previous in done.iter() {
            let projection = dot(current, previous);
            for (c, p) in current.iter_mut().zip(previous) {
                *c -= projection * p;
            }
        }

        let norm = current.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm > DEGENERATE_NORM {
            current.iter_mut().for_each(|c| *c /= norm);
            norms.push(norm);
        } else {
            current.iter_mut().for_each(|c| *c = 0.0);
            norms.push(0.0);
        }
    }
    norms
}

/// Flip `direction` so its largest-magnitude coefficient is positive.
fn orient(direction: &mut [f64]) {
    let pivot = direction
        .iter()
        .copied()
        .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
    if pivot < 0.0 {
        direction.iter_mut().for_each(|x| *x = -*x);
    }
}

type Projection = (Vec<[f64; 3]>, [f64; 3], [f64; 3]);

/// Project every row onto `basis`, tracking per-axis bounds in the same pass.
fn project(rows: &[&[f32]], mean: &[f64], basis: &[Vec<f64>]) -> Projection {
    let chunks: Vec<Projection> = rows
        .par_chunks(CHUNK_ROWS)
        .map(|chunk| {
            let mut points = Vec::with_capacity(chunk.len());
            let mut min = [f64::INFINITY; 3];
            let mut max = [f64::NEG_INFINITY; 3];
            let mut centered = vec![0.0f64; mean.len()];
            for row in chunk {
                for ((c, &x), m) in centered.iter_mut().zip(row.iter()).zip(mean) {
                    *c = x as f64 - m;
                }
                let mut point = [0.0f64; 3];
                for axis in 0..AXES {
                    point[axis] = dot(&centered, &basis[axis]);
                    min[axis] = min[axis].min(point[axis]);
                    max[axis] = max[axis].max(point[axis]);
                }
                points.push(point);
            }
            (points, min, max)
        })
        .collect();

    let mut points = Vec::with_capacity(rows.len());
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for (chunk_points, chunk_min, chunk_max) in chunks {
        points.extend(chunk_points);
        for axis in 0..AXES {
            min[axis] = min[axis].min(chunk_min[axis]);
            max[axis] = max[axis].max(chunk_max[axis]);
        }
    }
    (points, min, max)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn add_into(total: &mut [f64], part: &[f64]) {
    for (t, p) in total.iter_mut().zip(part) {
        *t += p;
    }
}

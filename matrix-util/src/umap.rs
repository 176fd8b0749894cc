//! UMAP (Uniform Manifold Approximation and Projection)
//!
//! The high-dimensional fuzzy graph is the union kNN graph with
//! adaptive-bandwidth weights (`KnnGraph::fuzzy_kernel_weights`); the
//! layout is optimized by SGD with edge sampling proportional to the
//! membership strength and negative sampling for the repulsive term.

use crate::dmatrix_rsvd::RSVD;
use crate::knn_graph::{KnnGraph, KnnGraphArgs};
use crate::traits::{MatOps, SampleOps};

use log::{info, warn};
use nalgebra::DMatrix;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// gradient clipping as in the reference implementation
const GRAD_CLIP: f32 = 4.0;

/// initial coordinates are scaled into [-INIT_SCALE, INIT_SCALE]
const INIT_SCALE: f32 = 10.0;

#[derive(Debug, Clone)]
pub struct UmapArgs {
    /// output dimension
    pub n_components: usize,
    /// size of the local neighbourhood, counting the point itself
    pub n_neighbors: usize,
    /// minimum distance between embedded points
    pub min_dist: f32,
    /// effective scale of the embedded points
    pub spread: f32,
    /// number of SGD epochs
    pub n_epochs: usize,
    /// initial SGD learning rate
    pub learning_rate: f32,
    /// negative samples per positive edge sample
    pub negative_sample_rate: usize,
    /// random state
    pub seed: u64,
}

impl Default for UmapArgs {
    fn default() -> Self {
        Self {
            n_components: 2,
            n_neighbors: 15,
            min_dist: 0.1,
            spread: 1.0,
            n_epochs: 200,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed: 42,
        }
    }
}

/// Embed the rows of `data` (n x d) into `n x n_components`
///
/// * `data` - one point per row
/// * `args` - UMAP parameters
///
pub fn umap_rows(data: &DMatrix<f32>, args: &UmapArgs) -> anyhow::Result<DMatrix<f32>> {
    let nn = data.nrows();

    if nn < 2 {
        anyhow::bail!("UMAP needs at least 2 points, got {}", nn);
    }
    if args.n_components == 0 {
        anyhow::bail!("n_components must be > 0");
    }
    if args.n_neighbors < 2 {
        anyhow::bail!("n_neighbors must be >= 2, got {}", args.n_neighbors);
    }
    if !(args.min_dist >= 0.0 && args.min_dist.is_finite()) {
        anyhow::bail!("min_dist must be a finite non-negative number");
    }
    if !(args.spread > 0.0 && args.min_dist <= args.spread) {
        anyhow::bail!(
            "need 0 <= min_dist ({}) <= spread ({})",
            args.min_dist,
            args.spread
        );
    }

    info!(
        "UMAP: {} points x {} features -> {} components, n_neighbors={}, min_dist={}",
        nn,
        data.ncols(),
        args.n_components,
        args.n_neighbors,
        args.min_dist
    );

    let graph = KnnGraph::from_rows(
        data,
        KnnGraphArgs {
            knn: args.n_neighbors - 1,
            block_size: 1000,
            reciprocal: false,
            seed: args.seed,
        },
    )?;

    let weights = graph.fuzzy_kernel_weights();

    let edges: Vec<(usize, usize, f32)> = {
        let max_w = weights.iter().cloned().fold(0.0f32, f32::max);
        let cutoff = max_w / args.n_epochs.max(1) as f32;
        graph
            .edges
            .iter()
            .zip(weights.iter())
            .filter(|(_, &w)| w >= cutoff && w > 0.0)
            .map(|(&(i, j), &w)| (i, j, w))
            .collect()
    };

    info!("UMAP fuzzy graph: {} edges", edges.len());

    let (a, b) = fit_ab_params(args.min_dist, args.spread);

    let mut embedding = initialize_embedding(data, args.n_components, args.seed);

    optimize_layout(&mut embedding, &edges, a, b, args);

    Ok(embedding)
}

/// Fit `(a, b)` of the low-dimensional membership curve
/// `1 / (1 + a d^(2b))` against the target
/// `1 if d <= min_dist, exp(-(d - min_dist) / spread) otherwise`
/// by damped Gauss-Newton least squares over `d in (0, 3 * spread]`.
pub fn fit_ab_params(min_dist: f32, spread: f32) -> (f32, f32) {
    let min_dist = min_dist as f64;
    let spread = spread as f64;

    let n_points = 300;
    let max_d = 3.0 * spread;

    let grid: Vec<(f64, f64)> = (0..n_points)
        .map(|k| {
            let d = (k as f64 + 1.0) * max_d / n_points as f64;
            let target = if d <= min_dist {
                1.0
            } else {
                (-(d - min_dist) / spread).exp()
            };
            (d, target)
        })
        .collect();

    let sse = |a: f64, b: f64| -> f64 {
        grid.iter()
            .map(|&(d, t)| {
                let r = 1.0 / (1.0 + a * d.powf(2.0 * b)) - t;
                r * r
            })
            .sum()
    };

    let mut a = 1.0f64;
    let mut b = 1.0f64;
    let mut current = sse(a, b);

    for _ in 0..100 {
        let (mut jj00, mut jj01, mut jj11, mut jr0, mut jr1) = (0.0, 0.0, 0.0, 0.0, 0.0);

        for &(d, target) in grid.iter() {
            let d2b = d.powf(2.0 * b);
            let denom = 1.0 + a * d2b;
            let residual = 1.0 / denom - target;

            let df_da = -d2b / (denom * denom);
            let df_db = -a * d2b * 2.0 * d.ln() / (denom * denom);

            jj00 += df_da * df_da;
            jj01 += df_da * df_db;
            jj11 += df_db * df_db;
            jr0 += df_da * residual;
            jr1 += df_db * residual;
        }

        let det = jj00 * jj11 - jj01 * jj01;
        if det.abs() < 1e-20 {
            break;
        }
        let da = -(jj11 * jr0 - jj01 * jr1) / det;
        let db = -(jj00 * jr1 - jj01 * jr0) / det;

        // halve the step until the fit improves
        let mut step = 1.0;
        let mut accepted = false;
        for _ in 0..20 {
            let a_new = (a + step * da).max(1e-3);
            let b_new = (b + step * db).max(1e-3);
            let next = sse(a_new, b_new);
            if next <= current {
                a = a_new;
                b = b_new;
                current = next;
                accepted = true;
                break;
            }
            step *= 0.5;
        }

        if !accepted || ((step * da).abs() < 1e-8 && (step * db).abs() < 1e-8) {
            break;
        }
    }

    (a as f32, b as f32)
}

/// PCA initialization by randomized SVD of the centred data, scaled
/// into `[-INIT_SCALE, INIT_SCALE]` with a little jitter so that
/// identical rows do not start on top of each other. Falls back to a
/// uniform random layout if the SVD cannot be computed.
fn initialize_embedding(data: &DMatrix<f32>, n_components: usize, seed: u64) -> DMatrix<f32> {
    let nn = data.nrows();

    let jitter = DMatrix::<f32>::rnorm_seeded(nn, n_components, seed.wrapping_add(1)) * 1e-4;

    let pca = data
        .centre_columns()
        .rsvd(n_components, seed)
        .map(|(u, d, _)| &u * DMatrix::from_diagonal(&d));

    let mut embedding = match pca {
        Ok(pc) => {
            let mut ret = DMatrix::<f32>::zeros(nn, n_components);
            let kk = pc.ncols().min(n_components);
            ret.columns_mut(0, kk).copy_from(&pc.columns(0, kk));
            ret
        }
        Err(e) => {
            warn!("PCA initialization failed ({}); using a random layout", e);
            DMatrix::<f32>::runif_seeded(nn, n_components, seed).map(|x| 2.0 * x - 1.0)
        }
    };

    let max_abs = embedding.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    if max_abs > 0.0 {
        embedding *= INIT_SCALE / max_abs;
    }

    embedding + jitter
}

fn optimize_layout(
    embedding: &mut DMatrix<f32>,
    edges: &[(usize, usize, f32)],
    a: f32,
    b: f32,
    args: &UmapArgs,
) {
    let n_epochs = args.n_epochs;
    if edges.is_empty() || n_epochs == 0 {
        return;
    }

    let nn = embedding.nrows();
    let dim = embedding.ncols();

    let max_w = edges.iter().map(|e| e.2).fold(0.0f32, f32::max);

    // sample each edge every `epochs_per_sample` epochs
    let epochs_per_sample: Vec<f32> = edges.iter().map(|e| max_w / e.2).collect();
    let mut epoch_of_next_sample = epochs_per_sample.clone();

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let mut grad = vec![0.0f32; dim];

    for epoch in 0..n_epochs {
        let alpha = args.learning_rate * (1.0 - epoch as f32 / n_epochs as f32);

        for (e, &(i, j, _)) in edges.iter().enumerate() {
            if epoch_of_next_sample[e] > (epoch + 1) as f32 {
                continue;
            }

            // attraction along the edge, both ends move
            let dist_sq = squared_distance(embedding, i, j);
            let coeff = if dist_sq > 0.0 {
                -2.0 * a * b * dist_sq.powf(b - 1.0) / (1.0 + a * dist_sq.powf(b))
            } else {
                0.0
            };
            for (d, g) in grad.iter_mut().enumerate() {
                *g = (coeff * (embedding[(i, d)] - embedding[(j, d)])).clamp(-GRAD_CLIP, GRAD_CLIP);
            }
            for (d, &g) in grad.iter().enumerate() {
                embedding[(i, d)] += alpha * g;
                embedding[(j, d)] -= alpha * g;
            }

            // repulsion from random points, for both ends
            for &head in &[i, j] {
                for _ in 0..args.negative_sample_rate {
                    let neg = rng.random_range(0..nn);
                    if neg == head {
                        continue;
                    }
                    let dist_sq = squared_distance(embedding, head, neg);
                    for d in 0..dim {
                        let g = if dist_sq > 0.0 {
                            let coeff =
                                2.0 * b / ((0.001 + dist_sq) * (1.0 + a * dist_sq.powf(b)));
                            (coeff * (embedding[(head, d)] - embedding[(neg, d)]))
                                .clamp(-GRAD_CLIP, GRAD_CLIP)
                        } else {
                            GRAD_CLIP
                        };
                        embedding[(head, d)] += alpha * g;
                    }
                }
            }

            epoch_of_next_sample[e] += epochs_per_sample[e];
        }
    }
}

fn squared_distance(embedding: &DMatrix<f32>, i: usize, j: usize) -> f32 {
    embedding
        .row(i)
        .iter()
        .zip(embedding.row(j).iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    const N_PER_GROUP: usize = 30;

    /// two groups of points in 20 dimensions, far apart
    fn two_group_data() -> DMatrix<f32> {
        let mut rng = SmallRng::seed_from_u64(7);
        let noise = Normal::new(0.0f32, 0.1).unwrap();
        let dim = 20;
        let mut data = DMatrix::zeros(2 * N_PER_GROUP, dim);
        for i in 0..(2 * N_PER_GROUP) {
            let centre = if i < N_PER_GROUP { 1.0 } else { 5.0 };
            for d in 0..dim {
                data[(i, d)] = centre + noise.sample(&mut rng);
            }
        }
        data
    }

    fn centroid(emb: &DMatrix<f32>, range: std::ops::Range<usize>) -> Vec<f32> {
        let n = range.len() as f32;
        (0..emb.ncols())
            .map(|d| range.clone().map(|i| emb[(i, d)]).sum::<f32>() / n)
            .collect()
    }

    #[test]
    fn test_umap_separates_groups() {
        let data = two_group_data();
        let args = UmapArgs {
            n_neighbors: 5,
            ..Default::default()
        };
        let emb = umap_rows(&data, &args).unwrap();

        assert_eq!(emb.shape(), (2 * N_PER_GROUP, 2));
        assert!(emb.iter().all(|x| x.is_finite()));

        let c0 = centroid(&emb, 0..N_PER_GROUP);
        let c1 = centroid(&emb, N_PER_GROUP..(2 * N_PER_GROUP));
        let between = crate::knn_match::euclidean(&c0, &c1);

        let spread0 = (0..N_PER_GROUP)
            .map(|i| {
                let p: Vec<f32> = emb.row(i).iter().cloned().collect();
                crate::knn_match::euclidean(&p, &c0)
            })
            .fold(0.0f32, f32::max);

        assert!(
            between > spread0,
            "groups should be apart: between {} vs within {}",
            between,
            spread0
        );
    }

    #[test]
    fn test_umap_is_deterministic_for_seed() {
        let data = two_group_data();
        let args = UmapArgs {
            n_neighbors: 5,
            n_epochs: 50,
            ..Default::default()
        };
        let a = umap_rows(&data, &args).unwrap();
        let b = umap_rows(&data, &args).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_umap_rejects_bad_input() {
        let one = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        assert!(umap_rows(&one, &UmapArgs::default()).is_err());

        let data = two_group_data();
        let bad = UmapArgs {
            n_neighbors: 1,
            ..Default::default()
        };
        assert!(umap_rows(&data, &bad).is_err());

        let bad = UmapArgs {
            min_dist: -0.5,
            ..Default::default()
        };
        assert!(umap_rows(&data, &bad).is_err());
    }

    #[test]
    fn test_fit_ab_default_curve() {
        // reference values for min_dist = 0.1, spread = 1.0
        let (a, b) = fit_ab_params(0.1, 1.0);
        assert!(a > 1.0 && a < 2.2, "a = {}", a);
        assert!(b > 0.7 && b < 1.1, "b = {}", b);
    }
}

use crate::knn_match::{exact_knn, ColumnDict};

use dashmap::DashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;

const DEFAULT_BLOCK_SIZE: usize = 1000;

/// Up to this many points, neighbours are found by brute force
pub const EXACT_KNN_LIMIT: usize = 2000;

pub struct KnnGraph {
    /// Symmetric CSC adjacency matrix (n_nodes x n_nodes)
    pub adjacency: CscMatrix<f32>,
    /// Sorted edge list (i < j), deduplicated
    pub edges: Vec<(usize, usize)>,
    /// Edge distances, parallel to `edges`
    pub distances: Vec<f32>,
    /// Directed kNN lists `(neighbour, distance)` of each node,
    /// sorted by neighbour
    pub directed: Vec<Vec<(usize, f32)>>,
    /// Number of nodes
    pub n_nodes: usize,
}

pub struct KnnGraphArgs {
    pub knn: usize,
    pub block_size: usize,
    /// If true, keep only reciprocal edges (i→j AND j→i).
    /// If false, keep union edges (i→j OR j→i), using min distance.
    pub reciprocal: bool,
    /// seed for the approximate (HNSW) index
    pub seed: u64,
}

impl KnnGraph {
    /// Build a KNN graph from row vectors (cells × features).
    ///
    /// * `data` - matrix (n x d), where each row is a point
    /// * `args` - KNN graph construction parameters
    pub fn from_rows(data: &DMatrix<f32>, args: KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let nn = data.nrows();
        if nn < 2 {
            return Err(anyhow::anyhow!("need at least 2 points, got {}", nn));
        }

        let triplets: DashMap<(usize, usize), f32> = DashMap::new();

        /////////////////////////////////////////////////////////////////
        // step 1: searching nearest neighbours                        //
        /////////////////////////////////////////////////////////////////

        if nn <= EXACT_KNN_LIMIT {
            let points: Vec<Vec<f32>> = data
                .row_iter()
                .map(|r| r.iter().cloned().collect())
                .collect();

            for (i, (indices, distances)) in exact_knn(&points, args.knn).into_iter().enumerate() {
                for (j, d_ij) in indices.into_iter().zip(distances) {
                    triplets.insert((i, j), d_ij);
                }
            }
        } else {
            let transposed = data.transpose();
            let views = transposed.column_iter().collect::<Vec<_>>();
            let names = (0..nn).collect::<Vec<_>>();
            let dict = ColumnDict::from_dvector_views(views, names, args.seed);

            // the query itself comes back first and is dropped
            let nquery = (args.knn + 1).min(nn).max(2);

            let jobs = create_jobs(nn, args.block_size);
            let njobs = jobs.len() as u64;

            jobs.into_par_iter().progress_count(njobs).try_for_each(
                |(lb, ub)| -> anyhow::Result<()> {
                    for i in lb..ub {
                        let (_indices, _distances) = dict.search_others(&i, nquery)?;
                        for (j, d_ij) in _indices.into_iter().zip(_distances) {
                            triplets.insert((i, j), d_ij);
                        }
                    }
                    Ok(())
                },
            )?;
        }

        info!("{} triplets by kNN matching", triplets.len());

        if triplets.is_empty() {
            return Err(anyhow::anyhow!("empty triplets"));
        }

        let mut directed: Vec<Vec<(usize, f32)>> = vec![vec![]; nn];
        for entry in triplets.iter() {
            let &(i, j) = entry.key();
            directed[i].push((j, *entry.value()));
        }
        directed
            .par_iter_mut()
            .for_each(|nbrs| nbrs.sort_by_key(|&(j, _)| j));

        ///////////////////////////////////////////////////
        // step 2: edge filtering (reciprocal or union) //
        ///////////////////////////////////////////////////

        let mut edges: Vec<((usize, usize), f32)> = if args.reciprocal {
            triplets
                .par_iter()
                .filter_map(|entry| {
                    let &(i, j) = entry.key();
                    if i < j && triplets.contains_key(&(j, i)) {
                        Some(((i, j), *entry.value()))
                    } else {
                        None
                    }
                })
                .collect()
        } else {
            triplets
                .par_iter()
                .filter_map(|entry| {
                    let &(i, j) = entry.key();
                    if i < j {
                        let d_ij = *entry.value();
                        let d_ji = triplets.get(&(j, i)).map(|e| *e).unwrap_or(d_ij);
                        Some(((i, j), d_ij.min(d_ji)))
                    } else if i > j && !triplets.contains_key(&(j, i)) {
                        // only (i→j) exists with i > j; emit as canonical (j, i)
                        Some(((j, i), *entry.value()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        edges.par_sort_by_key(|&(ij, _)| ij);
        edges.dedup_by_key(|&mut (ij, _)| ij);

        info!(
            "{} edges after {} matching",
            edges.len(),
            if args.reciprocal {
                "reciprocal"
            } else {
                "union"
            }
        );

        ///////////////////////////////////////////////
        // step 3: construct sparse network backbone //
        ///////////////////////////////////////////////

        let mut coo = CooMatrix::new(nn, nn);
        for &((i, j), v) in edges.iter() {
            coo.push(i, j, v);
            coo.push(j, i, v);
        }

        let adjacency = CscMatrix::from(&coo);

        let (edge_pairs, distances): (Vec<_>, Vec<_>) = edges.into_iter().unzip();

        Ok(KnnGraph {
            adjacency,
            edges: edge_pairs,
            distances,
            directed,
            n_nodes: nn,
        })
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Per-node `(rho, sigma)` of the smooth kNN kernel, computed on
    /// the directed kNN list of each node
    ///
    /// * `rho_i` - distance to the nearest neighbour
    /// * `sigma_i` - sum_j exp(-(d_ij - rho_i)/sigma_i) = log2(k_i)
    pub fn kernel_bandwidths(&self) -> (Vec<f32>, Vec<f32>) {
        self.directed
            .par_iter()
            .map(|nbrs| {
                if nbrs.is_empty() {
                    return (0.0, 1.0);
                }
                let dists: Vec<f32> = nbrs.iter().map(|&(_, d)| d).collect();
                let rho_i = dists.iter().cloned().fold(f32::INFINITY, f32::min);
                let target = (dists.len() as f32).log2();
                (rho_i, smooth_knn_sigma(&dists, rho_i, target))
            })
            .unzip()
    }

    /// Adaptive-bandwidth kernel weights with local connectivity,
    /// i.e., the fuzzy simplicial set of UMAP (McInnes et al. 2018).
    ///
    /// 1. rho_i, sigma_i from the directed kNN list (`kernel_bandwidths`)
    /// 2. Directed weight: w(i→j) = exp(-(d_ij - rho_i) / sigma_i),
    ///    zero if j is not among the k nearest of i
    /// 3. Symmetrize: w_sym = w(i→j) + w(j→i) - w(i→j) * w(j→i)
    ///
    /// Returns weights parallel to `self.edges`, all in (0, 1].
    pub fn fuzzy_kernel_weights(&self) -> Vec<f32> {
        if self.edges.is_empty() {
            return Vec::new();
        }

        let (rho, sigma) = self.kernel_bandwidths();

        self.edges
            .par_iter()
            .map(|&(i, j)| {
                let w_ij = directed_distance(&self.directed[i], j)
                    .map_or(0.0, |d| directed_umap_weight(d, rho[i], sigma[i]));
                let w_ji = directed_distance(&self.directed[j], i)
                    .map_or(0.0, |d| directed_umap_weight(d, rho[j], sigma[j]));

                // fuzzy union: P(at least one edge) = P(A) + P(B) - P(A)*P(B)
                w_ij + w_ji - w_ij * w_ji
            })
            .collect()
    }
}

/// Distance to `to` in a directed kNN list sorted by neighbour
fn directed_distance(nbrs: &[(usize, f32)], to: usize) -> Option<f32> {
    nbrs.binary_search_by_key(&to, |&(j, _)| j)
        .ok()
        .map(|k| nbrs[k].1)
}

/// Binary search for per-point sigma (UMAP's smooth_knn_dist).
///
/// Finds sigma such that: sum_j exp(-max(0, d_j - rho) / sigma) = target
fn smooth_knn_sigma(dists: &[f32], rho: f32, target: f32) -> f32 {
    const TOLERANCE: f32 = 1e-5;
    const MAX_ITER: usize = 64;

    let mean_dist: f32 = dists.iter().sum::<f32>() / dists.len().max(1) as f32;
    let min_sigma = (1e-3 * mean_dist).max(f32::MIN_POSITIVE);

    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut mid = 1.0f32;

    for _ in 0..MAX_ITER {
        let psum: f32 = dists
            .iter()
            .map(|&d| {
                let gap = d - rho;
                if gap > 0.0 {
                    (-gap / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();

        if (psum - target).abs() < TOLERANCE {
            break;
        }

        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }

    mid.max(min_sigma)
}

/// Compute a single directed UMAP membership weight.
fn directed_umap_weight(d: f32, rho: f32, sigma: f32) -> f32 {
    if !d.is_finite() || sigma <= 0.0 {
        return 0.0;
    }
    let gap = d - rho;
    if gap <= 0.0 {
        1.0
    } else {
        (-gap / sigma).exp()
    }
}

fn create_jobs(ntot: usize, block_size: usize) -> Vec<(usize, usize)> {
    let block_size = if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    let nblock = ntot.div_ceil(block_size);
    (0..nblock)
        .map(|block| {
            let lb = block * block_size;
            let ub = ((block + 1) * block_size).min(ntot);
            (lb, ub)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight clusters of 5 points each in 2D, well separated
    fn two_cluster_matrix() -> DMatrix<f32> {
        DMatrix::from_row_slice(
            10,
            2,
            &[
                // Cluster A near origin
                0.0, 0.0, //
                0.1, 0.0, //
                0.0, 0.1, //
                0.1, 0.1, //
                0.05, 0.05, //
                // Cluster B far away
                10.0, 10.0, //
                10.1, 10.0, //
                10.0, 10.1, //
                10.1, 10.1, //
                10.05, 10.05, //
            ],
        )
    }

    fn args(knn: usize, reciprocal: bool) -> KnnGraphArgs {
        KnnGraphArgs {
            knn,
            block_size: 100,
            reciprocal,
            seed: 42,
        }
    }

    #[test]
    fn test_from_rows_basic() {
        let data = two_cluster_matrix();
        let graph = KnnGraph::from_rows(&data, args(4, true)).unwrap();

        assert_eq!(graph.num_nodes(), 10);
        assert!(graph.num_edges() > 0);
        assert_eq!(graph.edges.len(), graph.distances.len());

        for &(i, j) in &graph.edges {
            assert!(i < j, "Edge ({}, {}) not canonical", i, j);
        }
        for &d in &graph.distances {
            assert!(d >= 0.0);
        }
    }

    #[test]
    fn test_two_clusters_no_cross_edges() {
        let data = two_cluster_matrix();
        let graph = KnnGraph::from_rows(&data, args(4, false)).unwrap();

        // With k=4 and well-separated clusters, no edges should cross clusters
        for &(i, j) in &graph.edges {
            let same_cluster = (i < 5 && j < 5) || (i >= 5 && j >= 5);
            assert!(same_cluster, "Cross-cluster edge ({}, {})", i, j);
        }
    }

    #[test]
    fn test_adjacency_symmetric() {
        let data = two_cluster_matrix();
        let graph = KnnGraph::from_rows(&data, args(3, false)).unwrap();

        for node in 0..graph.num_nodes() {
            let col = graph.adjacency.col(node);
            for &neighbor in col.row_indices() {
                assert!(
                    graph.adjacency.col(neighbor).row_indices().contains(&node),
                    "Node {} has neighbor {} but not vice versa",
                    node,
                    neighbor
                );
            }
        }
    }

    /// A hub at the origin with 8 spokes at growing radii: every spoke
    /// lists the hub among its 3 nearest, so the hub has 8 union edges
    fn hub_matrix() -> DMatrix<f32> {
        let mut rows = vec![0.0, 0.0];
        for m in 0..8 {
            let r = 1.0 + 0.1 * m as f32;
            let theta = std::f32::consts::FRAC_PI_4 * m as f32;
            rows.extend_from_slice(&[r * theta.cos(), r * theta.sin()]);
        }
        DMatrix::from_row_slice(9, 2, &rows)
    }

    #[test]
    fn test_bandwidths_use_directed_knn() {
        let data = hub_matrix();
        let graph = KnnGraph::from_rows(&data, args(3, false)).unwrap();

        assert!(graph.directed.iter().all(|nbrs| nbrs.len() == 3));
        let hub_edges = graph
            .edges
            .iter()
            .filter(|&&(i, j)| i == 0 || j == 0)
            .count();
        assert_eq!(hub_edges, 8);

        let (rho, sigma) = graph.kernel_bandwidths();
        assert!((rho[0] - 1.0).abs() < 1e-5);

        // the hub kernel calibrates to its own 3 neighbours
        let psum: f32 = graph.directed[0]
            .iter()
            .map(|&(_, d)| (-(d - rho[0]).max(0.0) / sigma[0]).exp())
            .sum();
        assert!(
            (psum - 3f32.log2()).abs() < 0.05,
            "psum {} vs {}",
            psum,
            3f32.log2()
        );

        let weights = graph.fuzzy_kernel_weights();
        for (&(i, j), &w) in graph.edges.iter().zip(weights.iter()) {
            assert!(w > 0.0 && w <= 1.0, "edge ({}, {}) weight {}", i, j, w);
        }
    }

    #[test]
    fn test_single_point_rejected() {
        let data = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        assert!(KnnGraph::from_rows(&data, args(3, false)).is_err());
    }

    #[test]
    fn test_fuzzy_kernel_weights() {
        let data = two_cluster_matrix();
        let graph = KnnGraph::from_rows(&data, args(4, false)).unwrap();

        let weights = graph.fuzzy_kernel_weights();
        assert_eq!(weights.len(), graph.num_edges());

        for &w in &weights {
            assert!(w > 0.0, "Weight {} should be > 0", w);
            assert!(w <= 1.0, "Weight {} should be <= 1", w);
        }

        let min_w = weights.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!(min_w > 0.01, "Min fuzzy weight {} is too small", min_w);
    }

    #[test]
    fn test_smooth_knn_sigma() {
        let dists = [0.1, 0.2, 0.3, 0.5, 1.0];
        let rho = 0.1;
        let target = (5.0f32).log2();

        let sigma = super::smooth_knn_sigma(&dists, rho, target);
        assert!(sigma > 0.0, "sigma should be positive");

        let psum: f32 = dists
            .iter()
            .map(|&d| {
                let gap = d - rho;
                if gap > 0.0 {
                    (-gap / sigma).exp()
                } else {
                    1.0
                }
            })
            .sum();

        assert!((psum - target).abs() < 0.1, "psum {:.3} vs {:.3}", psum, target);
    }

    #[test]
    fn test_create_jobs_helper() {
        assert_eq!(create_jobs(10, 3), vec![(0, 3), (3, 6), (6, 9), (9, 10)]);
        assert_eq!(create_jobs(6, 3), vec![(0, 3), (3, 6)]);
        assert_eq!(create_jobs(5, 0), vec![(0, 5)]);
    }
}

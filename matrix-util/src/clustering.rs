//! Density-based clustering traits for matrices
//!
//! Provides HDBSCAN clustering of the rows or columns of matrices using
//! the `hdbscan` crate.

use hdbscan::{Hdbscan, HdbscanHyperParams};
use log::info;
use nalgebra::DMatrix;

/// Label of points that belong to no cluster
pub const NOISE_LABEL: i32 = -1;

/// Arguments for HDBSCAN clustering
#[derive(Debug, Clone)]
pub struct HdbscanArgs {
    /// Smallest group of points that counts as a cluster
    pub min_cluster_size: usize,
    /// Neighbourhood size for the core distance
    pub min_samples: usize,
}

impl Default for HdbscanArgs {
    fn default() -> Self {
        Self {
            min_cluster_size: 30,
            min_samples: 10,
        }
    }
}

impl HdbscanArgs {
    /// Clamp the parameters to what `n` points can support
    pub fn clamped(&self, n: usize) -> Self {
        let min_cluster_size = self.min_cluster_size.clamp(2, n.max(2));
        let min_samples = self.min_samples.clamp(1, n.saturating_sub(1).max(1));
        if min_cluster_size != self.min_cluster_size || min_samples != self.min_samples {
            info!(
                "HDBSCAN parameters clamped for {} points: min_cluster_size {} -> {}, min_samples {} -> {}",
                n, self.min_cluster_size, min_cluster_size, self.min_samples, min_samples
            );
        }
        Self {
            min_cluster_size,
            min_samples,
        }
    }
}

/// Trait for HDBSCAN clustering on matrices
pub trait DensityClustering {
    /// Cluster rows and return one label per row; noise is `NOISE_LABEL`
    fn hdbscan_rows(&self, args: &HdbscanArgs) -> anyhow::Result<Vec<i32>>;
}

impl DensityClustering for DMatrix<f32> {
    fn hdbscan_rows(&self, args: &HdbscanArgs) -> anyhow::Result<Vec<i32>> {
        let data: Vec<Vec<f32>> = self
            .row_iter()
            .map(|x| x.iter().cloned().collect())
            .collect();
        hdbscan_points(&data, args)
    }
}

fn hdbscan_points(data: &Vec<Vec<f32>>, args: &HdbscanArgs) -> anyhow::Result<Vec<i32>> {
    let n = data.len();
    if n < 2 {
        anyhow::bail!("HDBSCAN needs at least 2 points, got {}", n);
    }

    let args = args.clamped(n);

    let hyper_params = HdbscanHyperParams::builder()
        .min_cluster_size(args.min_cluster_size)
        .min_samples(args.min_samples)
        .build();

    let labels = Hdbscan::new(data, hyper_params)
        .cluster()
        .map_err(|e| anyhow::anyhow!("HDBSCAN failed: {:?}", e))?;

    let n_noise = labels.iter().filter(|&&l| l == NOISE_LABEL).count();
    let n_clusters = labels.iter().filter(|&&l| l >= 0).max().map_or(0, |&m| m + 1);
    info!(
        "HDBSCAN: {} points, {} clusters, {} noise",
        n, n_clusters, n_noise
    );

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdbscan_rows_two_groups_and_noise() {
        let mut rows = vec![];
        for i in 0..6 {
            rows.extend_from_slice(&[1.0 + 0.05 * i as f32, 1.0]);
        }
        for i in 0..6 {
            rows.extend_from_slice(&[8.0 + 0.05 * i as f32, 8.0]);
        }
        rows.extend_from_slice(&[50.0, -50.0]);
        let mat = DMatrix::from_row_slice(13, 2, &rows);

        let args = HdbscanArgs {
            min_cluster_size: 3,
            min_samples: 2,
        };
        let labels = mat.hdbscan_rows(&args).unwrap();

        assert_eq!(labels.len(), 13);
        assert!(labels[..6].iter().all(|&l| l == labels[0] && l >= 0));
        assert!(labels[6..12].iter().all(|&l| l == labels[6] && l >= 0));
        assert_ne!(labels[0], labels[6]);
        assert_eq!(labels[12], NOISE_LABEL);
    }

    #[test]
    fn test_clamped() {
        let args = HdbscanArgs::default().clamped(5);
        assert_eq!(args.min_cluster_size, 5);
        assert_eq!(args.min_samples, 4);

        let args = HdbscanArgs::default().clamped(1000);
        assert_eq!(args.min_cluster_size, 30);
        assert_eq!(args.min_samples, 10);
    }

    #[test]
    fn test_too_few_points() {
        let mat = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        assert!(mat.hdbscan_rows(&HdbscanArgs::default()).is_err());
    }
}

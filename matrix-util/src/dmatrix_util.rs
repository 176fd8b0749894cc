use crate::traits::{DistanceOps, MatOps, SampleOps};

use nalgebra::DMatrix;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

impl MatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    /// Y[,j] = X[,j] - mean
    fn centre_columns_inplace(&mut self) {
        if self.nrows() == 0 {
            return;
        }
        for mut xx_j in self.column_iter_mut() {
            let mu = xx_j.mean();
            xx_j.add_scalar_mut(-mu);
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.centre_columns_inplace();
        ret
    }
}

impl SampleOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn runif_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = SmallRng::seed_from_u64(seed);
        let rvec = (0..(dd * nn)).map(|_| rng.random::<f32>()).collect();
        DMatrix::<f32>::from_vec(dd, nn, rvec)
    }

    fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = SmallRng::seed_from_u64(seed);
        let rvec = (0..(dd * nn))
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        DMatrix::<f32>::from_vec(dd, nn, rvec)
    }
}

impl DistanceOps for DMatrix<f32> {
    type Scalar = f32;

    fn cityblock_row_distances(&self) -> Vec<Vec<f32>> {
        let nn = self.nrows();
        (0..nn)
            .into_par_iter()
            .map(|i| {
                (0..nn)
                    .map(|j| {
                        self.row(i)
                            .iter()
                            .zip(self.row(j).iter())
                            .map(|(a, b)| (a - b).abs())
                            .sum::<f32>()
                    })
                    .collect()
            })
            .collect()
    }
}

use crate::traits::SampleOps;
use log::debug;
use nalgebra::{DMatrix, DVector};

type Mat = DMatrix<f32>;
type Vec = DVector<f32>;

pub trait RSVD {
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, Vec, Mat)>;
}

impl RSVD for Mat {
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, Vec, Mat)> {
        let default_iter = 5;
        let mut rsvd = RandomizedSVD::new(rank, default_iter, seed);
        rsvd.compute(self)?;
        Ok((
            rsvd.matrix_u().clone(),
            rsvd.singular_values().clone(),
            rsvd.matrix_v().clone(),
        ))
    }
}

/// Randomized SVD
///
/// Implement Alg 4.4 of Halko et al. (2009): randomized subspace
/// iteration with QR re-orthonormalization at every half step.
///
pub struct RandomizedSVD {
    max_rank: usize,
    iter: usize,
    seed: u64,
    u_vectors: Mat,
    singular_values: Vec,
    v_vectors: Mat,
    qq: Mat,
}

impl RandomizedSVD {
    pub fn new(max_rank: usize, iter: usize, seed: u64) -> Self {
        Self {
            max_rank,
            iter,
            seed,
            u_vectors: Mat::zeros(0, 0),
            singular_values: Vec::zeros(0),
            v_vectors: Mat::zeros(0, 0),
            qq: Mat::zeros(0, 0),
        }
    }

    pub fn matrix_u(&self) -> &Mat {
        &self.u_vectors
    }

    pub fn matrix_v(&self) -> &Mat {
        &self.v_vectors
    }

    pub fn singular_values(&self) -> &Vec {
        &self.singular_values
    }

    pub fn compute(&mut self, xx: &Mat) -> anyhow::Result<()> {
        let nr = xx.nrows();
        let nc = xx.ncols();

        let mut rank = nr.min(nc);
        if rank == 0 {
            anyhow::bail!("RandomizedSVD on an empty [{} x {}] matrix", nr, nc);
        }

        let mut oversample = 0;

        if self.max_rank > 0 && rank > self.max_rank {
            rank = self.max_rank;
            oversample = 5.min(nr.min(nc) - rank);
        }

        self.rand_subspace_iteration(xx, rank + oversample);

        let rank = rank.min(self.qq.ncols());

        let bb = self.qq.transpose() * xx;

        debug!("Final svd on [{} x {}]", bb.nrows(), bb.ncols());

        let svd = bb.svd(true, true);

        if let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) {
            self.u_vectors = &self.qq * svd_u.columns(0, rank);
            self.v_vectors = svd_vt.transpose().columns(0, rank).into_owned();
            self.singular_values = svd.singular_values.rows(0, rank).into_owned();
        } else {
            anyhow::bail!("SVD failed");
        }

        Ok(())
    }

    // Find an orthonormal matrix qq whose range approximates the range of xx
    fn rand_subspace_iteration(&mut self, xx: &Mat, rank_and_oversample: usize) {
        let nc = xx.ncols();

        let omega = Mat::rnorm_seeded(nc, rank_and_oversample, self.seed);
        let mut qq = (xx * omega).qr().q();

        for i in 0..self.iter {
            let qq_t = (xx.transpose() * &qq).qr().q();
            qq = (xx * qq_t).qr().q();
            debug!("subspace iteration {:>3}", i + 1);
        }

        let kk = rank_and_oversample.min(qq.ncols());
        self.qq = qq.columns(0, kk).into_owned();
    }
}

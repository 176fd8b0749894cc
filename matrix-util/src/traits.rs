/// Column-wise centring
pub trait MatOps {
    type Mat;
    type Scalar;

    fn centre_columns_inplace(&mut self);
    fn centre_columns(&self) -> Self::Mat;
}

/// Operations to sample random matrices from a seeded generator
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat;
}

/// Pairwise distances between the rows of a matrix
pub trait DistanceOps {
    type Scalar;

    /// `n x n` cityblock (L1) distances between rows
    fn cityblock_row_distances(&self) -> Vec<Vec<Self::Scalar>>;
}

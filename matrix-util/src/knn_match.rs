use fnv::FnvHashMap as HashMap;
use instant_distance::{Builder, HnswMap, Search};
use rayon::prelude::*;
use std::fmt::{Debug, Display};

/// A dictionary (HnswMap wrapper) for fast column look-up
///
pub struct ColumnDict<T> {
    pub dict: HnswMap<VecPoint, T>,
    pub data_vec: Vec<VecPoint>,
    pub name2index: HashMap<T, usize>,
}

impl<T> ColumnDict<T>
where
    T: Clone + Eq + std::hash::Hash + Debug + Display + Send + Sync,
{
    pub fn len(&self) -> usize {
        self.data_vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_vec.is_empty()
    }

    /// Build a dictionary over column views of a `d x n` matrix
    ///
    /// * `data` - one view per point
    /// * `names` - one name per point
    /// * `seed` - random seed for the HNSW layer assignment
    ///
    pub fn from_dvector_views(
        data: Vec<nalgebra::DVectorView<f32>>,
        names: Vec<T>,
        seed: u64,
    ) -> Self {
        debug_assert!(
            data.len() == names.len(),
            "Data and names must have the same length"
        );

        let data_vec: Vec<VecPoint> = data.par_iter().map(|x| x.to_vp()).collect();

        let name2index: HashMap<T, usize> = names
            .iter()
            .enumerate()
            .map(|(j, x)| (x.clone(), j))
            .collect();

        let dict = Builder::default()
            .seed(seed)
            .build(data_vec.clone(), names);

        ColumnDict {
            dict,
            data_vec,
            name2index,
        }
    }

    /// k-nearest neighbours of a named point among the other points of
    /// this dictionary (the query itself is excluded)
    ///
    /// * `query_name` - the name of the query column
    /// * `knn` - the number of candidates to pull from the index
    ///
    /// Returns neighbour names and their Euclidean distances
    pub fn search_others(&self, query_name: &T, knn: usize) -> anyhow::Result<(Vec<T>, Vec<f32>)> {
        let self_idx = self
            .name2index
            .get(query_name)
            .ok_or(anyhow::anyhow!("name {} not found", query_name))?;

        let query = &self.data_vec[*self_idx];
        let nquery = knn.min(self.data_vec.len());

        let mut search = Search::default();
        let mut names = Vec::with_capacity(nquery);
        let mut distances = Vec::with_capacity(nquery);

        for item in self.dict.search(query, &mut search).take(nquery) {
            if item.value == query_name {
                continue;
            }
            names.push(item.value.clone());
            distances.push(item.distance);
        }

        Ok((names, distances))
    }
}

#[derive(Clone, Debug)]
/// a wrapper for Vec<f32>
pub struct VecPoint {
    pub data: Vec<f32>,
}

pub trait MakeVecPoint {
    fn to_vp(&self) -> VecPoint;
}

impl MakeVecPoint for Vec<f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint { data: self.clone() }
    }
}

impl MakeVecPoint for nalgebra::DVectorView<'_, f32> {
    fn to_vp(&self) -> VecPoint {
        VecPoint {
            data: self.iter().cloned().collect(),
        }
    }
}

impl instant_distance::Point for VecPoint {
    fn distance(&self, other: &Self) -> f32 {
        euclidean(&self.data, &other.data)
    }
}

/// Euclidean distance between two equally long slices
pub fn euclidean(x: &[f32], y: &[f32]) -> f32 {
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt()
}

/// Exact k-nearest neighbours of every row in `points` by brute force,
/// excluding the point itself. Ties are broken by index.
///
/// * `points` - one `Vec<f32>` per point
/// * `knn` - number of neighbours per point
///
pub fn exact_knn(points: &[Vec<f32>], knn: usize) -> Vec<(Vec<usize>, Vec<f32>)> {
    let nn = points.len();
    let kk = knn.min(nn.saturating_sub(1));

    points
        .par_iter()
        .enumerate()
        .map(|(i, x_i)| {
            let mut dist: Vec<(usize, f32)> = (0..nn)
                .filter(|&j| j != i)
                .map(|j| (j, euclidean(x_i, &points[j])))
                .collect();
            dist.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            dist.truncate(kk);
            dist.into_iter().unzip()
        })
        .collect()
}

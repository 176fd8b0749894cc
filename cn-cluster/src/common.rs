pub use log::{info, warn};

pub type Mat = nalgebra::DMatrix<f32>;

pub use fnv::FnvHashMap as HashMap;
pub use fnv::FnvHashSet as HashSet;

pub const CN_DATA_FILE: &str = "cn_data.csv";
pub const SCATTER_FILE: &str = "uh_scatter.png";
pub const HEATMAP_FILE: &str = "umap_heatmap.png";
pub const CLUSTERS_FILE: &str = "umap_clusters.csv";

pub const CLUSTER_COLUMN: &str = "umap_cluster_id";
pub const ORIGIN_COLUMN: &str = "origin_id";
pub const SAMPLE_COLUMN: &str = "sample_id";

/// figure units to pixels
pub const PX_PER_UNIT: u32 = 100;

//! Cell clustering over the CN matrix and the merge of cluster labels
//! back onto the long-format table

use crate::cn_matrix::CnMatrix;
use crate::cn_table::CnTable;
use crate::common::*;
use anyhow::Context;
use matrix_util::clustering::{DensityClustering, HdbscanArgs};
use matrix_util::common_io::{mkdir, open_buf_writer};
use matrix_util::umap::{umap_rows, UmapArgs};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct UmapHdbscanParams {
    pub n_components: usize,
    pub n_neighbors: usize,
    pub min_dist: f32,
    pub n_epochs: usize,
    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub seed: u64,
}

impl Default for UmapHdbscanParams {
    fn default() -> Self {
        Self {
            n_components: 2,
            n_neighbors: 5,
            min_dist: 0.1,
            n_epochs: 200,
            min_cluster_size: 30,
            min_samples: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellAssignment {
    pub cell_id: Box<str>,
    #[serde(rename = "umap_cluster_id")]
    pub cluster_id: i32,
    pub umap1: f32,
    pub umap2: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterAssignments {
    pub assignments: Vec<CellAssignment>,
}

impl ClusterAssignments {
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Sorted distinct cluster ids; noise (-1) comes first
    pub fn distinct_clusters(&self) -> Vec<i32> {
        let mut ret: Vec<i32> = self.assignments.iter().map(|a| a.cluster_id).collect();
        ret.sort_unstable();
        ret.dedup();
        ret
    }

    /// Write `cell_id,umap_cluster_id,umap1,umap2`
    pub fn to_csv(&self, path: &str) -> anyhow::Result<()> {
        mkdir(path)?;
        let mut wtr = csv::Writer::from_writer(open_buf_writer(path)?);
        for a in self.assignments.iter() {
            wtr.serialize(a)
                .with_context(|| format!("failed to write {}", path))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Anything that assigns each cell of a CN matrix to a cluster with 2D
/// coordinates
pub trait CellClusterer {
    fn cluster(
        &self,
        cn: &CnMatrix,
        params: &UmapHdbscanParams,
    ) -> anyhow::Result<ClusterAssignments>;
}

/// UMAP embedding of the cells followed by HDBSCAN on the embedding
pub struct UmapHdbscan;

impl CellClusterer for UmapHdbscan {
    fn cluster(
        &self,
        cn: &CnMatrix,
        params: &UmapHdbscanParams,
    ) -> anyhow::Result<ClusterAssignments> {
        let nn = cn.num_cells();
        anyhow::ensure!(nn >= 2, "need at least 2 cells to cluster, got {}", nn);

        let data = cn.cells_by_bins();

        let umap_args = UmapArgs {
            n_components: params.n_components,
            n_neighbors: params.n_neighbors,
            min_dist: params.min_dist,
            n_epochs: params.n_epochs,
            seed: params.seed,
            ..UmapArgs::default()
        };
        let embedding = umap_rows(&data, &umap_args).context("UMAP embedding")?;

        let hdbscan_args = HdbscanArgs {
            min_cluster_size: params.min_cluster_size,
            min_samples: params.min_samples,
        };
        let labels = embedding
            .hdbscan_rows(&hdbscan_args)
            .context("HDBSCAN clustering")?;

        let second = if embedding.ncols() > 1 { Some(1) } else { None };

        let assignments = cn
            .cells
            .iter()
            .zip(labels)
            .enumerate()
            .map(|(i, (cell, cluster_id))| CellAssignment {
                cell_id: cell.clone(),
                cluster_id,
                umap1: embedding[(i, 0)],
                umap2: second.map_or(0.0, |k| embedding[(i, k)]),
            })
            .collect();

        Ok(ClusterAssignments { assignments })
    }
}

/// CN table rows with their cell's cluster and embedding coordinates
#[derive(Debug, Clone)]
pub struct ClusteredCnTable {
    pub table: CnTable,
    /// one entry per table row
    pub cluster_ids: Vec<i32>,
    pub umap1: Vec<f32>,
    pub umap2: Vec<f32>,
}

impl ClusteredCnTable {
    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }

    /// Numeric values of a column, `None` where missing or not a number
    pub fn numeric_field(&self, name: &str) -> anyhow::Result<Vec<Option<f32>>> {
        let rows = &self.table.rows;
        Ok(match name {
            "copy" => rows.iter().map(|r| r.copy).collect(),
            "start" => rows.iter().map(|r| Some(r.start as f32)).collect(),
            "end" => rows.iter().map(|r| Some(r.end as f32)).collect(),
            CLUSTER_COLUMN => self.cluster_ids.iter().map(|&c| Some(c as f32)).collect(),
            "umap1" => self.umap1.iter().map(|&x| Some(x)).collect(),
            "umap2" => self.umap2.iter().map(|&x| Some(x)).collect(),
            _ => {
                let k = self.extra_index(name)?;
                rows.iter()
                    .map(|r| r.extra[k].trim().parse::<f32>().ok().filter(|x| x.is_finite()))
                    .collect()
            }
        })
    }

    /// Integer cluster labels from a column
    pub fn cluster_field(&self, name: &str) -> anyhow::Result<Vec<i32>> {
        if name == CLUSTER_COLUMN {
            return Ok(self.cluster_ids.clone());
        }
        let k = self.extra_index(name)?;
        self.table
            .rows
            .iter()
            .map(|r| {
                r.extra[k]
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| anyhow::anyhow!("{}: not a cluster id: {:?}", name, r.extra[k]))
            })
            .collect()
    }

    /// Values of any column as text
    pub fn text_field(&self, name: &str) -> anyhow::Result<Vec<Box<str>>> {
        let rows = &self.table.rows;
        Ok(match name {
            "chr" => rows.iter().map(|r| r.chr.clone()).collect(),
            "cell_id" => rows.iter().map(|r| r.cell_id.clone()).collect(),
            CLUSTER_COLUMN => self
                .cluster_ids
                .iter()
                .map(|c| c.to_string().into_boxed_str())
                .collect(),
            "copy" => rows
                .iter()
                .map(|r| r.copy.map(|x| x.to_string()).unwrap_or_default().into_boxed_str())
                .collect(),
            _ => {
                let k = self.extra_index(name)?;
                rows.iter().map(|r| r.extra[k].clone()).collect()
            }
        })
    }

    fn extra_index(&self, name: &str) -> anyhow::Result<usize> {
        self.table
            .extra_column(name)
            .ok_or(anyhow::anyhow!("no such column: {}", name))
    }
}

/// Attach each row's cell cluster and coordinates. The assignments must
/// cover every cell of the table exactly once and name no other cell.
pub fn merge_clusters(
    table: &CnTable,
    assignments: &ClusterAssignments,
) -> anyhow::Result<ClusteredCnTable> {
    let mut by_cell: HashMap<&str, &CellAssignment> = HashMap::default();
    for a in assignments.assignments.iter() {
        if by_cell.insert(&a.cell_id, a).is_some() {
            anyhow::bail!("cell {} is assigned more than once", a.cell_id);
        }
    }

    let cells: HashSet<&str> = table.rows.iter().map(|r| &*r.cell_id).collect();
    if let Some(a) = assignments
        .assignments
        .iter()
        .find(|a| !cells.contains(&*a.cell_id))
    {
        anyhow::bail!("assigned cell {} is not in the CN table", a.cell_id);
    }

    let nrows = table.num_rows();
    let mut cluster_ids = Vec::with_capacity(nrows);
    let mut umap1 = Vec::with_capacity(nrows);
    let mut umap2 = Vec::with_capacity(nrows);

    for r in table.rows.iter() {
        let a = by_cell
            .get(&*r.cell_id)
            .ok_or(anyhow::anyhow!("cell {} has no cluster assignment", r.cell_id))?;
        cluster_ids.push(a.cluster_id);
        umap1.push(a.umap1);
        umap2.push(a.umap2);
    }

    info!(
        "merged {} cluster assignments onto {} rows",
        assignments.len(),
        nrows
    );

    Ok(ClusteredCnTable {
        table: table.clone(),
        cluster_ids,
        umap1,
        umap2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(cell: &str, k: i32) -> CellAssignment {
        CellAssignment {
            cell_id: cell.into(),
            cluster_id: k,
            umap1: k as f32,
            umap2: -(k as f32),
        }
    }

    fn table() -> CnTable {
        let csv = "\
chr,start,end,cell_id,copy,state
1,1,100,A,2,2
1,101,200,A,3,3
1,1,100,B,1,1
1,101,200,B,1,x
";
        CnTable::from_reader(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_merge_keeps_rows() -> anyhow::Result<()> {
        let t = table();
        let asg = ClusterAssignments {
            assignments: vec![assign("B", 1), assign("A", 0)],
        };
        let merged = merge_clusters(&t, &asg)?;
        assert_eq!(merged.num_rows(), t.num_rows());
        assert_eq!(merged.cluster_ids, vec![0, 0, 1, 1]);
        assert_eq!(merged.umap2, vec![0.0, 0.0, -1.0, -1.0]);
        assert_eq!(asg.distinct_clusters(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn test_merge_rejects_bad_assignments() {
        let t = table();

        let missing = ClusterAssignments {
            assignments: vec![assign("A", 0)],
        };
        assert!(merge_clusters(&t, &missing).is_err());

        let duplicate = ClusterAssignments {
            assignments: vec![assign("A", 0), assign("B", 1), assign("A", 2)],
        };
        assert!(merge_clusters(&t, &duplicate).is_err());

        let unknown = ClusterAssignments {
            assignments: vec![assign("A", 0), assign("B", 1), assign("C", 1)],
        };
        let err = merge_clusters(&t, &unknown).err().unwrap();
        assert!(err.to_string().contains("C"));
    }

    #[test]
    fn test_fields() -> anyhow::Result<()> {
        let asg = ClusterAssignments {
            assignments: vec![assign("A", -1), assign("B", 3)],
        };
        let merged = merge_clusters(&table(), &asg)?;

        assert_eq!(merged.cluster_field(CLUSTER_COLUMN)?, vec![-1, -1, 3, 3]);
        assert_eq!(
            merged.numeric_field("state")?,
            vec![Some(2.0), Some(3.0), Some(1.0), None]
        );
        assert!(merged.cluster_field("state").is_err());
        assert_eq!(merged.text_field("cell_id")?[2].as_ref(), "B");
        assert!(merged.text_field("nope").is_err());
        Ok(())
    }

    #[test]
    fn test_assignments_csv() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("umap_clusters.csv");
        let path = path.to_str().unwrap();

        let asg = ClusterAssignments {
            assignments: vec![assign("A", -1), assign("B", 2)],
        };
        asg.to_csv(path)?;
        assert_eq!(asg.distinct_clusters(), vec![-1, 2]);

        let text = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "cell_id,umap_cluster_id,umap1,umap2");
        assert_eq!(lines[1], "A,-1,-1.0,1.0");
        assert_eq!(lines.len(), 3);
        Ok(())
    }

    #[test]
    fn test_umap_hdbscan_needs_two_cells() {
        let csv = "chr,start,end,cell_id,copy\n1,1,100,A,2\n";
        let table = CnTable::from_reader(csv.as_bytes()).unwrap();
        let cn = CnMatrix::from_table(&table).unwrap();
        assert!(UmapHdbscan
            .cluster(&cn, &UmapHdbscanParams::default())
            .is_err());
    }
}

use crate::bins::restrict_bins;
use crate::cluster::{
    merge_clusters, CellClusterer, ClusterAssignments, ClusteredCnTable, UmapHdbscanParams,
};
use crate::cn_matrix::CnMatrix;
use crate::cn_table::CnTable;
use crate::common::*;
use crate::plot::{HeatmapMatrix, HeatmapOptions, HeatmapRenderer, ScatterRenderer};
use crate::subsample::{subsample_cells, SpikeIn};

use matrix_util::common_io::ensure_dir;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

/// figure units
pub const SCATTER_SIZE: (u32, u32) = (8, 8);
pub const HEATMAP_SIZE: (u32, u32) = (10, 8);

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub cn_data: Box<str>,
    pub out_dir: Box<str>,
    pub seed: u64,
    pub n_cells: Option<usize>,
    pub n_bins: Option<usize>,
    pub spike_in: Option<SpikeIn>,
    pub cluster: UmapHdbscanParams,
    pub origin_field: Option<Box<str>>,
    pub raw: bool,
    pub flip: bool,
}

impl PipelineConfig {
    pub fn new(cn_data: &str, out_dir: &str) -> Self {
        Self {
            cn_data: cn_data.into(),
            out_dir: out_dir.into(),
            seed: 42,
            n_cells: None,
            n_bins: None,
            spike_in: None,
            cluster: UmapHdbscanParams::default(),
            origin_field: None,
            raw: true,
            flip: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.n_cells != Some(0), "n_cells must be positive");
        anyhow::ensure!(self.n_bins != Some(0), "n_bins must be positive");

        let c = &self.cluster;
        anyhow::ensure!(c.n_components > 0, "n_components must be positive");
        anyhow::ensure!(
            c.n_neighbors >= 2,
            "n_neighbors must be at least 2, got {}",
            c.n_neighbors
        );
        anyhow::ensure!(
            c.min_dist.is_finite() && c.min_dist >= 0.0,
            "min_dist must be a finite non-negative number, got {}",
            c.min_dist
        );
        anyhow::ensure!(c.n_epochs > 0, "n_epochs must be positive");
        anyhow::ensure!(c.min_cluster_size >= 2, "min_cluster_size must be at least 2");
        anyhow::ensure!(c.min_samples >= 1, "min_samples must be positive");

        if let Some(spike_in) = &self.spike_in {
            anyhow::ensure!(self.n_cells.is_some(), "spike-in needs the number of cells");
            spike_in.validate()?;
        }
        Ok(())
    }

    /// Whether the loaded table gets reduced before clustering
    pub fn subsampling(&self) -> bool {
        self.n_cells.is_some() || self.n_bins.is_some()
    }

    pub fn output_file(&self, name: &str) -> Box<str> {
        Path::new(&*self.out_dir)
            .join(name)
            .to_string_lossy()
            .into_owned()
            .into_boxed_str()
    }

    pub fn heatmap_options(&self) -> HeatmapOptions {
        HeatmapOptions {
            origin_field: self.origin_field.clone(),
            raw: self.raw,
            flip: self.flip,
            ..HeatmapOptions::default()
        }
    }
}

pub struct PipelineOutput {
    pub table: ClusteredCnTable,
    pub assignments: ClusterAssignments,
    pub heatmap: HeatmapMatrix,
    pub written: Vec<Box<str>>,
}

/// Subsample cells, then restrict bins, as configured
pub fn prepare_cn_data(config: &PipelineConfig, table: CnTable) -> anyhow::Result<CnTable> {
    let mut table = table;
    if let Some(n_cells) = config.n_cells {
        table = subsample_cells(table, n_cells, config.spike_in.as_ref(), config.seed)?;
    }
    if let Some(n_bins) = config.n_bins {
        table = restrict_bins(table, n_bins)?;
    }
    Ok(table)
}

/// Load, reduce, cluster, merge and draw
pub fn run_pipeline(
    config: &PipelineConfig,
    clusterer: &dyn CellClusterer,
    scatter: &dyn ScatterRenderer,
    heatmap: &dyn HeatmapRenderer,
) -> anyhow::Result<PipelineOutput> {
    config.validate()?;
    info!("configuration: {}", serde_json::to_string(config)?);

    ensure_dir(&config.out_dir)?;
    let mut written = vec![];

    info!("reading {}", config.cn_data);
    let table = CnTable::from_csv(&config.cn_data)?;
    info!(
        "CN table: {} rows x {} columns",
        table.num_rows(),
        table.num_columns()
    );

    let table = prepare_cn_data(config, table)?;

    if config.subsampling() {
        let file = config.output_file(CN_DATA_FILE);
        table.to_csv(&file)?;
        info!("wrote {}", file);
        written.push(file);
    }

    let cn = CnMatrix::from_table(&table)?;
    info!(
        "clustering {} cells over {} bins",
        cn.num_cells(),
        cn.num_bins()
    );

    let tic = Instant::now();
    let assignments = clusterer.cluster(&cn, &config.cluster)?;
    info!("clustering took {:.2}s", tic.elapsed().as_secs_f64());
    info!("cluster ids: {:?}", assignments.distinct_clusters());

    let clustered = merge_clusters(&table, &assignments)?;
    info!(
        "merged table: {} rows x {} columns",
        clustered.num_rows(),
        table.num_columns() + 3
    );

    let file = config.output_file(CLUSTERS_FILE);
    assignments.to_csv(&file)?;
    info!("wrote {}", file);
    written.push(file);

    let file = config.output_file(SCATTER_FILE);
    scatter.draw_scatter(&file, pixels(SCATTER_SIZE), &assignments)?;
    written.push(file);

    let file = config.output_file(HEATMAP_FILE);
    let matrix = heatmap.draw_heatmap(
        &file,
        pixels(HEATMAP_SIZE),
        &clustered,
        &config.heatmap_options(),
    )?;
    written.push(file);

    Ok(PipelineOutput {
        table: clustered,
        assignments,
        heatmap: matrix,
        written,
    })
}

pub fn pixels(units: (u32, u32)) -> (u32, u32) {
    (units.0 * PX_PER_UNIT, units.1 * PX_PER_UNIT)
}

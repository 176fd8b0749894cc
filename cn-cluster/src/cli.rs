use crate::cluster::{UmapHdbscan, UmapHdbscanParams};
use crate::cn_table::CnTable;
use crate::common::*;
use crate::pipeline::{prepare_cn_data, run_pipeline, PipelineConfig};
use crate::plot::{PlottersHeatmap, PlottersScatter};
use crate::subsample::SpikeIn;

use clap::{Args, Parser, Subcommand};
use matrix_util::common_io::ensure_dir;
use rayon::ThreadPoolBuilder;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Cluster single-cell copy number profiles",
    long_about = "Cluster single-cell copy number profiles by UMAP + HDBSCAN\n\
		  and draw a scatter plot of the embedding and a clustered heatmap.\n\
		  Input is a CSV (optionally gzipped) with at least\n\
		  `chr`, `start`, `end`, `cell_id` and `copy` columns.",
    term_width = 80
)]
pub struct Cli {
    #[command(subcommand)]
    pub commands: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Subsample, embed, cluster and draw",
        long_about = "Run the full pipeline:\n\
		      (1) optionally subsample cells and genomic bins\n\
		      (2) UMAP embedding of the cells over the bins\n\
		      (3) HDBSCAN clustering of the embedding\n\
		      (4) scatter plot and clustered heatmap.\n"
    )]
    Cluster(ClusterArgs),

    /// Subsample cells and bins and write `cn_data.csv`
    Subsample(DataArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    #[arg(long, required = true, help = "Copy number data (.csv or .csv.gz)")]
    pub cn_data: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory, created if missing.\n\
		     Generates the following files:\n\
		     cn_data.csv (if subsampled), umap_clusters.csv,\n\
		     uh_scatter.png and umap_heatmap.png"
    )]
    pub out_dir: Box<str>,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    pub seed: u64,

    #[arg(long, help = "Subsample this many cells")]
    pub n_cells: Option<usize>,

    #[arg(
        long,
        help = "Keep the first N bins",
        long_help = "Keep bins whose `end` is at most the N-th smallest\n\
		     distinct `end` coordinate across all chromosomes."
    )]
    pub n_bins: Option<usize>,

    #[arg(
        long,
        default_value_t = false,
        help = "Mix cells from samples of origin",
        long_help = "Draw `--n-cells` cells from the samples in `--sample-ids`\n\
		     in `--proportions` (equal shares by default).\n\
		     The sample of a cell is its `sample_id` column if present,\n\
		     otherwise the sample id prefixing its `cell_id`."
    )]
    pub spike_in: bool,

    #[arg(long, value_delimiter(','), help = "Spike-in sample ids (comma separated)")]
    pub sample_ids: Vec<Box<str>>,

    #[arg(long, value_delimiter(','), help = "Spike-in proportions (comma separated)")]
    pub proportions: Option<Vec<f64>>,

    #[arg(long, help = "Maximum number of threads (default: all cores)")]
    pub num_threads: Option<usize>,

    #[arg(short, long, help = "Verbosity")]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, default_value_t = 5, help = "UMAP number of neighbours")]
    pub umap_nn: usize,

    #[arg(long, default_value_t = 0.1, help = "UMAP minimum distance")]
    pub umap_min_dist: f32,

    #[arg(long, default_value_t = 200, help = "UMAP optimization epochs")]
    pub umap_epochs: usize,

    #[arg(long, default_value_t = 30, help = "HDBSCAN minimum cluster size")]
    pub min_cluster_size: usize,

    #[arg(long, default_value_t = 10, help = "HDBSCAN minimum samples")]
    pub min_samples: usize,

    #[arg(long, help = "Column drawn as an origin strip in the heatmap")]
    pub origin_field: Option<Box<str>>,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Continuous colour scale (false: copy number states)"
    )]
    pub raw: bool,

    #[arg(long, default_value_t = false, help = "Bins as rows, cells as columns")]
    pub flip: bool,
}

impl DataArgs {
    pub fn to_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(&self.cn_data, &self.out_dir);
        config.seed = self.seed;
        config.n_cells = self.n_cells;
        config.n_bins = self.n_bins;
        if self.spike_in {
            config.spike_in = Some(SpikeIn {
                sample_ids: self.sample_ids.clone(),
                proportions: self.proportions.clone(),
            });
        }
        config
    }
}

impl ClusterArgs {
    pub fn to_config(&self) -> PipelineConfig {
        let mut config = self.data.to_config();
        config.cluster = UmapHdbscanParams {
            n_components: 2,
            n_neighbors: self.umap_nn,
            min_dist: self.umap_min_dist,
            n_epochs: self.umap_epochs,
            min_cluster_size: self.min_cluster_size,
            min_samples: self.min_samples,
            seed: self.data.seed,
        };
        config.origin_field = self.origin_field.clone();
        config.raw = self.raw;
        config.flip = self.flip;
        config
    }
}

fn init_runtime(args: &DataArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let max_threads = args
        .num_threads
        .unwrap_or(usize::MAX)
        .clamp(1, num_cpus::get().max(1));

    ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build_global()?;

    info!("will use {} threads", rayon::current_num_threads());
    Ok(())
}

pub fn run_cluster(args: &ClusterArgs) -> anyhow::Result<()> {
    init_runtime(&args.data)?;

    let config = args.to_config();
    let out = run_pipeline(&config, &UmapHdbscan, &PlottersScatter, &PlottersHeatmap)?;

    info!(
        "{} cells in {} clusters",
        out.assignments.len(),
        out.assignments.distinct_clusters().len()
    );
    Ok(())
}

pub fn run_subsample(args: &DataArgs) -> anyhow::Result<()> {
    init_runtime(args)?;

    let config = args.to_config();
    config.validate()?;

    ensure_dir(&config.out_dir)?;
    let table = CnTable::from_csv(&config.cn_data)?;
    let table = prepare_cn_data(&config, table)?;

    let file = config.output_file(CN_DATA_FILE);
    table.to_csv(&file)?;
    info!(
        "wrote {} rows of {} cells to {}",
        table.num_rows(),
        table.cell_ids().len(),
        file
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_args() {
        let cli = Cli::try_parse_from([
            "cn-cluster",
            "cluster",
            "--cn-data",
            "cn.csv.gz",
            "--out-dir",
            "out",
            "--n-cells",
            "100",
            "--spike-in",
            "--sample-ids",
            "S1,S2",
            "--proportions",
            "0.8,0.2",
            "--raw",
            "false",
            "--flip",
        ])
        .unwrap();

        let Commands::Cluster(args) = cli.commands else {
            panic!("expected the cluster command");
        };
        let config = args.to_config();

        assert_eq!(config.cn_data.as_ref(), "cn.csv.gz");
        assert_eq!(config.n_cells, Some(100));
        assert_eq!(config.n_bins, None);
        assert!(!config.raw);
        assert!(config.flip);
        assert_eq!(config.cluster.n_neighbors, 5);
        assert_eq!(config.cluster.min_cluster_size, 30);
        assert_eq!(config.cluster.seed, 42);

        let spike_in = config.spike_in.as_ref().unwrap();
        assert_eq!(spike_in.sample_ids.len(), 2);
        assert_eq!(spike_in.proportions, Some(vec![0.8, 0.2]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from([
            "cn-cluster",
            "cluster",
            "--cn-data",
            "cn.csv",
            "-o",
            "out",
        ])
        .unwrap();
        let Commands::Cluster(args) = cli.commands else {
            panic!("expected the cluster command");
        };
        let config = args.to_config();
        assert!(config.raw);
        assert!(!config.flip);
        assert!(config.spike_in.is_none());
        assert!(!config.subsampling());
        assert_eq!(config.cluster.min_dist, 0.1);
        assert_eq!(config.cluster.n_epochs, 200);
        assert_eq!(config.cluster.min_samples, 10);
    }

    #[test]
    fn test_subsample_args() {
        let cli = Cli::try_parse_from([
            "cn-cluster",
            "subsample",
            "--cn-data",
            "cn.csv",
            "--out-dir",
            "out",
            "--n-bins",
            "20",
        ])
        .unwrap();
        let Commands::Subsample(args) = cli.commands else {
            panic!("expected the subsample command");
        };
        assert_eq!(args.to_config().n_bins, Some(20));
    }
}

use cn_cluster::cli::{run_cluster, run_subsample, Cli, Commands};

use clap::Parser;
use log::info;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Cluster(args) => {
            run_cluster(args)?;
        }
        Commands::Subsample(args) => {
            run_subsample(args)?;
        }
    }

    info!("Done");
    Ok(())
}

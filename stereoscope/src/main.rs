use clap::{Parser, Subcommand};
use log::info;

use stereoscope::fit_rna::*;
use stereoscope::fit_spatial::*;
use stereoscope::simulate::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "STEREOSCOPE",
    long_about = "Spatial mapping of cell types by negative binomial deconvolution\n\
		  (1) `rna` learns cell type profiles from labelled single cells\n\
		  (2) `spatial` explains each spot as a mixture of those profiles\n\
		  Count matrices are dense `.tsv`/`.csv` files, optionally gzipped."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Simulate single-cell and spatial counts",
        long_about = "Sample cell type expression profiles, single cells of each type\n\
		      and spatial spots mixing a few cells each.\n\
		      Writes the true cell type fractions of every spot.\n"
    )]
    Simulate(SimulateArgs),

    #[command(
        about = "Learn cell type profiles from single-cell data",
        long_about = "Fit a negative binomial model of single-cell counts given labels.\n\
		      Writes the profiles `W` (genes x labels), the gene-wise logits `px_o`\n\
		      and the label order, to be used by `stereoscope spatial`.\n"
    )]
    Rna(RnaArgs),

    #[command(
        about = "Deconvolve spatial spots into cell type proportions",
        long_about = "Fit per-spot cell type loadings with the profiles from `rna` fixed.\n\
		      An extra noise cell type absorbs gene-wise background.\n\
		      Writes proportions (spots x labels) in the order of `{rna}.labels.txt`.\n"
    )]
    Spatial(SpatialArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.commands {
        Commands::Simulate(_) => true,
        Commands::Rna(args) => args.train.verbose,
        Commands::Spatial(args) => args.train.verbose,
    };

    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
        Commands::Rna(args) => {
            fit_rna(args)?;
        }
        Commands::Spatial(args) => {
            fit_spatial(args)?;
        }
    }

    info!("Done");
    Ok(())
}

use crate::common::*;
use crate::fit_rna::write_history;
use crate::spatial_deconv::{PriorWeight, SpatialDeconv};
use crate::train_args::TrainArgs;

use candle_core::Tensor;
use candle_vi::candle_data_loader::{DataSplits, InMemoryData};
use candle_vi::candle_trainer::{Trainer, TrainingResult};
use clap::Args;
use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Args, Debug)]
pub struct SpatialArgs {
    /// spatial count matrix, spots x genes (`.tsv`, `.csv`, `.gz`)
    #[arg(required = true)]
    pub data_file: Box<str>,

    /// cell type profiles from `stereoscope rna` (`{out}.w.tsv.gz`)
    #[arg(short = 'w', long, required = true)]
    pub w_file: Box<str>,

    /// gene-wise logits from `stereoscope rna` (`{out}.px_o.tsv.gz`)
    #[arg(short = 'p', long, required = true)]
    pub px_o_file: Box<str>,

    /// output header
    #[arg(short, long, required = true)]
    pub out: Box<str>,

    /// how to weigh the minibatch likelihood against the prior
    #[arg(long, value_enum, default_value = "n-obs")]
    pub prior_weight: PriorWeight,

    /// also report the noise cell type as the last column
    #[arg(long)]
    pub keep_noise: bool,

    #[command(flatten)]
    pub train: TrainArgs,
}

pub fn fit_spatial(args: &SpatialArgs) -> anyhow::Result<()> {
    let x_sg = read_dense_matrix(&args.data_file)?;
    let w_gl = read_dense_matrix(&args.w_file)?;
    let px_o = read_dense_matrix(&args.px_o_file)?;

    if px_o.ncols() != 1 {
        return Err(anyhow::anyhow!(
            "expected a single column in {}, found {}",
            args.px_o_file,
            px_o.ncols()
        ));
    }

    info!(
        "read {} spots x {} genes, {} cell types",
        x_sg.nrows(),
        x_sg.ncols(),
        w_gl.ncols()
    );

    let px_o_g: Vec<f32> = px_o.iter().copied().collect();
    let (model, result) =
        train_spatial_model(&x_sg, &w_gl, &px_o_g, args.prior_weight, &args.train)?;

    mkdir_parent(&args.out)?;
    let out = args.out.as_ref();

    let prop_sl = model.get_proportions(args.keep_noise)?;
    write_tensor(&prop_sl, &format!("{}.proportions.tsv.gz", out))?;
    write_history(&result, &format!("{}.history.json", out))?;
    Ok(())
}

///
/// Fit per-spot cell type loadings with the single-cell profiles held
/// fixed. Every spot is used for training.
///
/// * `x_sg` - spatial counts (spots x genes)
/// * `w_gl` - softplus-transformed profiles (genes x labels)
/// * `px_o_g` - gene-wise NB logits
///
pub fn train_spatial_model(
    x_sg: &Array2<f32>,
    w_gl: &Array2<f32>,
    px_o_g: &[f32],
    prior_weight: PriorWeight,
    train: &TrainArgs,
) -> anyhow::Result<(SpatialDeconv, TrainingResult)> {
    let n_genes = x_sg.ncols();
    if w_gl.nrows() != n_genes || px_o_g.len() != n_genes {
        return Err(anyhow::anyhow!(
            "{} genes in the spatial data, {} in W, {} in px_o",
            n_genes,
            w_gl.nrows(),
            px_o_g.len()
        ));
    }

    let mut splits = DataSplits::train_only(InMemoryData::new(x_sg)?);

    let config = train.to_train_config(false)?;
    let w = array_to_tensor(w_gl, &config.device)?;
    let px_o = Tensor::from_slice(px_o_g, n_genes, &config.device)?;

    let mut rng = StdRng::seed_from_u64(train.seed);
    let model = SpatialDeconv::new(
        x_sg.nrows(),
        &px_o,
        &w,
        prior_weight,
        &config.device,
        &mut rng,
    )?;

    let result = {
        let mut trainer = Trainer::new(&model, config)?;
        trainer.train(&mut splits)?
    };

    info!(
        "trained spatial model for {} epochs ({} iterations)",
        result.epochs, result.iterations
    );
    Ok((model, result))
}

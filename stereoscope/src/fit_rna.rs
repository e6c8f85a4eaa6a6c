use crate::common::*;
use crate::rna_deconv::RnaDeconv;
use crate::train_args::TrainArgs;

use candle_vi::candle_data_loader::{InMemoryData, LabelSubsampling};
use candle_vi::candle_model_traits::GenerativeModuleT;
use candle_vi::candle_trainer::{Trainer, TrainingResult};
use clap::Args;
use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;

#[derive(Args, Debug)]
pub struct RnaArgs {
    /// single-cell count matrix, cells x genes (`.tsv`, `.csv`, `.gz`)
    #[arg(required = true)]
    pub data_file: Box<str>,

    /// cell type label per row of the data matrix
    #[arg(short = 'l', long, required = true)]
    pub label_file: Box<str>,

    /// output header
    #[arg(short, long, required = true)]
    pub out: Box<str>,

    #[command(flatten)]
    pub train: TrainArgs,
}

pub fn fit_rna(args: &RnaArgs) -> anyhow::Result<()> {
    let x_ng = read_dense_matrix(&args.data_file)?;
    let labels = read_labels(&args.label_file)?;
    info!(
        "read {} cells x {} genes, {} cell types",
        x_ng.nrows(),
        x_ng.ncols(),
        labels.num_labels()
    );

    let (model, result) = train_rna_model(&x_ng, &labels, &args.train)?;

    mkdir_parent(&args.out)?;
    let out = args.out.as_ref();

    let (px_o, w) = model.get_params()?;
    write_tensor(&w, &format!("{}.w.tsv.gz", out))?;
    write_tensor(&px_o, &format!("{}.px_o.tsv.gz", out))?;
    write_lines(&labels.names, &format!("{}.labels.txt", out))?;
    write_history(&result, &format!("{}.history.json", out))?;

    // the best state has already been loaded back into the model
    if result.best_epoch.is_some() {
        let file = format!("{}.best_state.safetensors", out);
        model.parameters_snapshot()?.save(&file)?;
        info!("saved the best state: {}", file);
    }
    Ok(())
}

///
/// Fit cell type profiles `W` and gene-wise logits `px_o` on labelled
/// single-cell counts
///
/// * `x_ng` - counts (cells x genes)
/// * `labels` - one label per cell
/// * `train` - optimization flags
///
pub fn train_rna_model(
    x_ng: &Array2<f32>,
    labels: &LabelIndex,
    train: &TrainArgs,
) -> anyhow::Result<(RnaDeconv, TrainingResult)> {
    if labels.index.len() != x_ng.nrows() {
        return Err(anyhow::anyhow!(
            "{} labels for {} cells",
            labels.index.len(),
            x_ng.nrows()
        ));
    }

    let mut data = InMemoryData::new(x_ng)?.with_labels(labels.index.clone())?;
    if let Some(n) = train.labels_per_class {
        data = data.with_label_subsampling(LabelSubsampling {
            n_samples_per_label: n,
            unlabeled: None,
        })?;
    }

    let mut rng = StdRng::seed_from_u64(train.seed);
    let mut splits = data.split(train.train_size, &mut rng)?;

    let config = train.to_train_config(splits.validation.is_some())?;
    let model = RnaDeconv::new(x_ng.ncols(), labels.num_labels(), &config.device, &mut rng)?;

    let result = {
        let mut trainer = Trainer::new(&model, config)?;
        trainer.train(&mut splits)?
    };

    info!(
        "trained RNA model for {} epochs ({} iterations)",
        result.epochs, result.iterations
    );
    Ok((model, result))
}

/// Dump the whole training result, history included, as JSON
pub fn write_history(result: &TrainingResult, output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    serde_json::to_writer_pretty(&mut buf, result)?;
    buf.flush()?;
    Ok(())
}

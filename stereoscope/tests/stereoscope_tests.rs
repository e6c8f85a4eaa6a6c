use approx::assert_abs_diff_eq;
use clap::Parser;
use stereoscope::common::*;
use stereoscope::fit_rna::*;
use stereoscope::fit_spatial::*;
use stereoscope::simulate::*;
use stereoscope::spatial_deconv::PriorWeight;
use stereoscope::train_args::TrainArgs;

#[derive(Parser)]
#[command(args_override_self = true)]
struct TrainWrapper {
    #[command(flatten)]
    train: TrainArgs,
}

#[derive(Parser)]
struct SimWrapper {
    #[command(flatten)]
    sim: SimulateArgs,
}

#[derive(Parser)]
struct RnaWrapper {
    #[command(flatten)]
    rna: RnaArgs,
}

#[derive(Parser)]
struct SpatialWrapper {
    #[command(flatten)]
    spatial: SpatialArgs,
}

fn train_args(extra: &[&str]) -> anyhow::Result<TrainArgs> {
    let mut argv = vec!["test", "--epochs", "30", "--batch-size", "32", "--learning-rate", "0.05"];
    argv.extend_from_slice(extra);
    Ok(TrainWrapper::try_parse_from(argv)?.train)
}

fn simulated(out: &str) -> anyhow::Result<SimulateArgs> {
    Ok(SimWrapper::try_parse_from([
        "sim", "-g", "40", "-t", "3", "-c", "90", "-s", "20", "-d", "500", "--out", out,
    ])?
    .sim)
}

fn labels_of(sim: &SimOut) -> LabelIndex {
    let names: Vec<Box<str>> = sim
        .sc_labels
        .iter()
        .map(|t| format!("type_{}", t).into_boxed_str())
        .collect();
    LabelIndex::from_names(&names)
}

#[test]
fn rna_then_spatial_in_memory() -> anyhow::Result<()> {
    let sim = generate(&simulated("unused")?)?;
    let labels = labels_of(&sim);

    let (rna, result) = train_rna_model(&sim.sc_counts, &labels, &train_args(&[])?)?;
    assert_eq!(result.epochs, 30);
    assert_eq!(result.history.len(), 30);

    let trace = result.history.metric_trace("elbo_train");
    let first = trace.first().map(|x| x.1).unwrap();
    let last = trace.last().map(|x| x.1).unwrap();
    assert!(last < first, "elbo_train {} -> {}", first, last);

    let (px_o, w) = rna.get_params()?;
    assert_eq!(w.dims(), &[40, 3]);
    assert_eq!(px_o.dims(), &[40]);

    let w_gl = ndarray::Array2::from_shape_vec((40, 3), w.flatten_all()?.to_vec1::<f32>()?)?;
    let px_o_g = px_o.to_vec1::<f32>()?;

    for prior_weight in [PriorWeight::NObs, PriorWeight::Minibatch] {
        let (spatial, result) = train_spatial_model(
            &sim.st_counts,
            &w_gl,
            &px_o_g,
            prior_weight,
            &train_args(&[])?,
        )?;
        assert_eq!(result.epochs, 30);
        assert!(result.history.metric_trace("elbo_validation").is_empty());

        let prop = spatial.get_proportions(false)?;
        assert_eq!(prop.dims(), &[20, 3]);
        for s in prop.sum(1)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-4);
        }
        assert_eq!(spatial.get_proportions(true)?.dims(), &[20, 4]);
    }
    Ok(())
}

#[test]
fn best_state_with_validation_and_resampling() -> anyhow::Result<()> {
    let sim = generate(&simulated("unused")?)?;
    let labels = labels_of(&sim);

    let args = train_args(&[
        "--train-size",
        "0.8",
        "--save-best",
        "--labels-per-class",
        "10",
        "--epochs",
        "10",
    ])?;
    let (_, result) = train_rna_model(&sim.sc_counts, &labels, &args)?;

    assert_eq!(result.history.metric_trace("elbo_validation").len(), 10);
    assert!(result.best_epoch.is_some());
    Ok(())
}

#[test]
fn same_seed_gives_the_same_fit() -> anyhow::Result<()> {
    let sim = generate(&simulated("unused")?)?;
    let labels = labels_of(&sim);

    let fit = |seed: &str| -> anyhow::Result<Vec<f32>> {
        let args = train_args(&["--epochs", "3", "--seed", seed, "--train-size", "0.8"])?;
        let (rna, _) = train_rna_model(&sim.sc_counts, &labels, &args)?;
        Ok(rna.get_params()?.1.flatten_all()?.to_vec1::<f32>()?)
    };

    let first = fit("7")?;
    assert_eq!(first, fit("7")?, "same --seed gave different fits");
    assert_ne!(first, fit("8")?);
    Ok(())
}

fn pearson(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&x| x as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&x| x as f64).sum::<f64>() / n;
    let (mut ab, mut aa, mut bb) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x as f64 - mean_a, y as f64 - mean_b);
        ab += dx * dy;
        aa += dx * dx;
        bb += dy * dy;
    }
    ab / (aa * bb).sqrt().max(f64::MIN_POSITIVE)
}

#[test]
fn spatial_fit_recovers_true_proportions() -> anyhow::Result<()> {
    let sim = generate(
        &SimWrapper::try_parse_from([
            "sim", "-g", "40", "-t", "3", "-c", "90", "-s", "20", "-d", "100", "--out", "unused",
        ])?
        .sim,
    )?;
    let labels = labels_of(&sim);

    let rna_args = train_args(&["--epochs", "150"])?;
    let (rna, _) = train_rna_model(&sim.sc_counts, &labels, &rna_args)?;
    let (px_o, w) = rna.get_params()?;
    let w_gl = ndarray::Array2::from_shape_vec((40, 3), w.flatten_all()?.to_vec1::<f32>()?)?;
    let px_o_g = px_o.to_vec1::<f32>()?;

    let st_args = train_args(&["--epochs", "500", "--learning-rate", "0.1"])?;
    let (spatial, _) =
        train_spatial_model(&sim.st_counts, &w_gl, &px_o_g, PriorWeight::NObs, &st_args)?;

    let estimated = spatial.get_proportions(false)?.flatten_all()?.to_vec1::<f32>()?;
    let truth: Vec<f32> = sim.proportions.iter().copied().collect();
    assert_eq!(estimated.len(), truth.len());

    let corr = pearson(&estimated, &truth);
    assert!(corr > 0.6, "correlation with the true proportions: {}", corr);

    // closer than guessing uniform fractions
    let n_types = 3.0_f32;
    let mae = |est: &dyn Fn(usize) -> f32| -> f32 {
        truth.iter().enumerate().map(|(i, &t)| (est(i) - t).abs()).sum::<f32>()
            / truth.len() as f32
    };
    let fitted_mae = mae(&|i| estimated[i]);
    let uniform_mae = mae(&|_| 1.0 / n_types);
    assert!(
        fitted_mae < uniform_mae,
        "fitted MAE {} vs. uniform {}",
        fitted_mae,
        uniform_mae
    );
    Ok(())
}

#[test]
fn label_count_must_match_cells() -> anyhow::Result<()> {
    let sim = generate(&simulated("unused")?)?;
    let names: Vec<Box<str>> = vec!["a".into(); 5];
    let labels = LabelIndex::from_names(&names);
    assert!(train_rna_model(&sim.sc_counts, &labels, &train_args(&[])?).is_err());
    Ok(())
}

#[test]
fn command_line_pipeline_writes_outputs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = |name: &str| dir.path().join(name).to_string_lossy().to_string();

    let sim_out = path("sim/data");
    run_simulate(&simulated(&sim_out)?)?;

    let rna_out = path("rna/fit");
    let sc_counts = format!("{}.sc_counts.tsv.gz", sim_out);
    let sc_labels = format!("{}.sc_labels.txt", sim_out);
    let rna = RnaWrapper::try_parse_from([
        "rna",
        sc_counts.as_str(),
        "--label-file",
        sc_labels.as_str(),
        "--out",
        rna_out.as_str(),
        "--epochs",
        "5",
        "--save-best",
    ])?
    .rna;
    fit_rna(&rna)?;

    let w = read_dense_matrix(&format!("{}.w.tsv.gz", rna_out))?;
    assert_eq!(w.dim(), (40, 3));
    let names = read_lines(&format!("{}.labels.txt", rna_out))?;
    assert_eq!(names.len(), 3);
    assert!(std::path::Path::new(&format!("{}.best_state.safetensors", rna_out)).exists());

    let history: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(format!("{}.history.json", rna_out))?)?;
    assert_eq!(history["epochs"], 5);

    let st_out = path("st/fit");
    let st_counts = format!("{}.st_counts.tsv.gz", sim_out);
    let w_file = format!("{}.w.tsv.gz", rna_out);
    let px_o_file = format!("{}.px_o.tsv.gz", rna_out);
    let spatial = SpatialWrapper::try_parse_from([
        "spatial",
        st_counts.as_str(),
        "--w-file",
        w_file.as_str(),
        "--px-o-file",
        px_o_file.as_str(),
        "--out",
        st_out.as_str(),
        "--epochs",
        "5",
        "--prior-weight",
        "minibatch",
    ])?
    .spatial;
    fit_spatial(&spatial)?;

    let prop = read_dense_matrix(&format!("{}.proportions.tsv.gz", st_out))?;
    assert_eq!(prop.dim(), (20, 3));
    for row in prop.rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-4);
    }
    Ok(())
}

use candle_vi::candle_callbacks::*;
use candle_vi::candle_data_loader::*;
use candle_vi::candle_inference::*;
use candle_vi::candle_metric_monitor::EpochMetrics;
use candle_vi::candle_model_traits::*;
use candle_vi::candle_train_error::TrainError;
use candle_vi::candle_trainer::Trainer;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use ndarray::Array2;
use rand::rngs::StdRng;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Gaussian mean fit: recon_n = 0.5 * |x_n - theta|^2, kl = |theta|^2.
/// Evaluation can replay a scripted sequence of reconstruction values,
/// and training can be made to return NaN after a number of steps.
struct ToyModule {
    varmap: VarMap,
    theta: Tensor,
    eval_script: Vec<f32>,
    eval_calls: Cell<usize>,
    nan_after: Option<usize>,
    train_calls: Cell<usize>,
}

impl ToyModule {
    fn new(dim: usize) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let theta = vb.get_with_hints(dim, "theta", Init::Const(0.))?;
        Ok(Self {
            varmap,
            theta,
            eval_script: vec![],
            eval_calls: Cell::new(0),
            nan_after: None,
            train_calls: Cell::new(0),
        })
    }

    fn with_eval_script(mut self, script: &[f32]) -> Self {
        self.eval_script = script.to_vec();
        self
    }

    fn with_nan_after(mut self, steps: usize) -> Self {
        self.nan_after = Some(steps);
        self
    }

    fn theta(&self) -> Vec<f32> {
        self.theta.to_vec1::<f32>().unwrap()
    }
}

impl GenerativeModuleT for ToyModule {
    fn loss(
        &self,
        batch: &MinibatchData,
        kl_weight: f64,
        train: bool,
    ) -> candle_core::Result<LossOutput> {
        let n = batch.input.dim(0)?;

        if !train && !self.eval_script.is_empty() {
            let t = self.eval_calls.get();
            self.eval_calls.set(t + 1);
            let value = self.eval_script[t.min(self.eval_script.len() - 1)];
            let reconstruction_n = (Tensor::ones(n, DType::F32, &Device::Cpu)? * value as f64)?;
            return Ok(LossOutput {
                loss: reconstruction_n.mean_all()?,
                reconstruction_n,
                kl_n: Tensor::zeros(n, DType::F32, &Device::Cpu)?,
                label_accuracy: None,
            });
        }

        if train {
            self.train_calls.set(self.train_calls.get() + 1);
        }

        let reconstruction_n = (batch.input.broadcast_sub(&self.theta)?.sqr()?.sum(1)? * 0.5)?;
        let kl_n = self.theta.sqr()?.sum_all()?.broadcast_as(n)?;
        let loss = (&reconstruction_n + (&kl_n * kl_weight)?)?.mean_all()?;

        let loss = match self.nan_after {
            Some(k) if train && self.train_calls.get() > k => (loss * f64::NAN)?,
            _ => loss,
        };

        Ok(LossOutput {
            loss,
            reconstruction_n,
            kl_n,
            label_accuracy: None,
        })
    }

    fn variable_map(&self) -> &VarMap {
        &self.varmap
    }
}

fn toy_data(nrows: usize) -> anyhow::Result<InMemoryData> {
    let arr = Array2::from_shape_fn((nrows, 3), |(i, j)| 1.0 + (i % 4) as f32 + j as f32);
    InMemoryData::new(&arr)
}

/// train on `nrows` rows, validate on 4 rows in a single batch
fn toy_splits(nrows: usize) -> anyhow::Result<DataSplits<InMemoryData>> {
    Ok(DataSplits::with_validation(toy_data(nrows)?, toy_data(4)?))
}

/// shows the trainer's `info!`/`warn!` lines with `RUST_LOG=info cargo test`
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quick_config() -> TrainConfig {
    TrainConfig {
        learning_rate: 0.05,
        batch_size: 16,
        max_epochs: 5,
        ..Default::default()
    }
}

/// remembers `theta` at the end of every epoch
struct ThetaRecorder {
    trace: Rc<RefCell<Vec<Vec<f32>>>>,
}

impl Callback for ThetaRecorder {
    fn name(&self) -> &str {
        "theta_recorder"
    }

    fn on_epoch_end(
        &mut self,
        _state: &TrainerState,
        _metrics: &EpochMetrics,
        module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<CallbackSignal> {
        let snapshot = module.parameters_snapshot()?;
        let theta = snapshot
            .get("theta")
            .ok_or_else(|| anyhow::anyhow!("theta"))?
            .to_vec1::<f32>()?;
        self.trace.borrow_mut().push(theta);
        Ok(CallbackSignal::Continue)
    }
}

#[test]
fn kl_warmup_over_epochs() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;

    let config = TrainConfig {
        n_epochs_kl_warmup: Some(5),
        ..quick_config()
    };
    let mut trainer = Trainer::new(&module, config.clone())?;
    let result = trainer.train(&mut toy_splits(8)?)?;
    assert_eq!(result.epochs, 5);
    assert!(trainer.kl_weight() >= 0.99);
    assert!(result.kl_weight >= 0.99);

    // weights used inside the epochs ramp up from zero
    let trace: Vec<f64> = trainer
        .history()
        .metric_trace("kl_weight")
        .into_iter()
        .map(|(_, w)| w)
        .collect();
    assert_eq!(trace, vec![0.0, 0.2, 0.4, 0.6, 0.8]);

    let module = ToyModule::new(3)?;
    let mut trainer = Trainer::new(
        &module,
        TrainConfig {
            max_epochs: 1,
            ..config
        },
    )?;
    trainer.train(&mut toy_splits(8)?)?;
    assert!(trainer.kl_weight() < 0.99);
    Ok(())
}

#[test]
fn kl_warmup_over_iterations() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;
    let mut trainer = Trainer::new(
        &module,
        TrainConfig {
            n_iter_kl_warmup: Some(1),
            max_epochs: 2,
            ..quick_config()
        },
    )?;
    trainer.train(&mut toy_splits(8)?)?;
    assert!(trainer.kl_weight() >= 0.99);
    Ok(())
}

#[test]
fn conflicting_warmups_fail_construction() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;
    let config = TrainConfig {
        n_epochs_kl_warmup: Some(5),
        n_iter_kl_warmup: Some(100),
        ..quick_config()
    };
    assert!(matches!(
        Trainer::new(&module, config),
        Err(TrainError::ConflictingKlWarmup { .. })
    ));
    Ok(())
}

#[test]
fn best_state_is_restored_from_last_improvement() -> anyhow::Result<()> {
    // validation improves at epochs 1 and 3 only
    let module = ToyModule::new(3)?.with_eval_script(&[5.0, 6.0, 4.0, 4.5, 7.0]);
    let config = TrainConfig {
        save_best_state: Some(MonitorConfig::new("elbo_validation", MonitorMode::Min)),
        ..quick_config()
    };

    let trace = Rc::new(RefCell::new(vec![]));
    let mut trainer = Trainer::new(&module, config)?;
    trainer.add_callback(Box::new(ThetaRecorder {
        trace: trace.clone(),
    }));

    let result = trainer.train(&mut toy_splits(8)?)?;
    assert_eq!(result.status, TrainStatus::Completed);
    assert_eq!(result.best_epoch, Some(3));
    assert_eq!(trainer.status(), TrainStatus::Completed);

    let trace = trace.borrow();
    assert_eq!(trace.len(), 5);
    assert_ne!(trace[2], trace[4]);
    assert_eq!(module.theta(), trace[2]);

    let best = trainer.get_best_state()?;
    assert_eq!(best.get("theta").unwrap().to_vec1::<f32>()?, trace[2]);
    Ok(())
}

#[test]
fn missing_monitored_metric_fails_at_restore() -> anyhow::Result<()> {
    init_logger();
    let module = ToyModule::new(3)?;
    let config = TrainConfig {
        save_best_state: Some(MonitorConfig::new("elbo_validation", MonitorMode::Min)),
        ..quick_config()
    };

    // no validation split, so `elbo_validation` never shows up
    let mut trainer = Trainer::new(&module, config)?;
    let err = trainer
        .train(&mut DataSplits::train_only(toy_data(8)?))
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::MissingBestState { .. })
    ));
    assert_eq!(trainer.status(), TrainStatus::Failed);
    assert_eq!(trainer.current_epoch(), 5);
    Ok(())
}

#[test]
fn early_stopping_ends_the_session() -> anyhow::Result<()> {
    init_logger();
    let module = ToyModule::new(3)?.with_eval_script(&[5.0, 4.0, 4.0, 4.0, 4.0]);
    let config = TrainConfig {
        max_epochs: 50,
        early_stopping: Some(EarlyStoppingConfig {
            patience: 2,
            ..Default::default()
        }),
        verbose: true,
        ..quick_config()
    };

    let mut trainer = Trainer::new(&module, config)?;
    let result = trainer.train(&mut toy_splits(8)?)?;
    assert!(result.stopped_early);
    assert_eq!(result.epochs, 4);
    assert_eq!(result.status, TrainStatus::Completed);
    Ok(())
}

#[test]
fn non_finite_loss_fails_and_keeps_best_state() -> anyhow::Result<()> {
    // one batch per epoch; the third step goes NaN
    let module = ToyModule::new(3)?.with_nan_after(2);
    let config = TrainConfig {
        save_best_state: Some(MonitorConfig::new("elbo_train", MonitorMode::Min)),
        ..quick_config()
    };

    let mut trainer = Trainer::new(&module, config)?;
    let err = trainer.train(&mut toy_splits(8)?).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::NonFiniteLoss {
            epoch: 3,
            iteration: 3,
            ..
        })
    ));
    assert_eq!(trainer.status(), TrainStatus::Failed);
    assert_eq!(trainer.current_epoch(), 2);
    assert!(trainer.best_state().is_some());
    Ok(())
}

#[test]
fn non_finite_validation_loss_fails_the_session() -> anyhow::Result<()> {
    // training stays finite; the third validation pass is NaN
    let module = ToyModule::new(3)?.with_eval_script(&[5.0, 4.0, f32::NAN, 3.0]);
    let config = TrainConfig {
        save_best_state: Some(MonitorConfig::new("elbo_validation", MonitorMode::Min)),
        ..quick_config()
    };

    let mut trainer = Trainer::new(&module, config)?;
    let err = trainer.train(&mut toy_splits(8)?).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::NonFiniteLoss {
            epoch: 3,
            iteration: 3,
            ..
        })
    ));
    assert_eq!(trainer.status(), TrainStatus::Failed);
    assert_eq!(trainer.history().len(), 2);
    assert_eq!(trainer.best_epoch(), Some(2));
    Ok(())
}

#[test]
fn evaluate_rejects_a_non_finite_loss() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?.with_eval_script(&[f32::NAN]);
    let mut trainer = Trainer::new(&module, quick_config())?;
    let err = trainer.evaluate(&mut toy_data(4)?, "test").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::NonFiniteLoss { .. })
    ));
    Ok(())
}

#[test]
fn a_session_runs_once() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;
    let mut trainer = Trainer::new(
        &module,
        TrainConfig {
            max_epochs: 1,
            ..quick_config()
        },
    )?;
    trainer.train(&mut toy_splits(8)?)?;

    let err = trainer.train(&mut toy_splits(8)?).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::SessionNotIdle(TrainStatus::Completed))
    ));
    Ok(())
}

#[test]
fn max_iterations_bounds_the_session() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;
    let config = TrainConfig {
        batch_size: 2,
        max_epochs: 100,
        max_iterations: Some(7),
        ..quick_config()
    };

    // 10 rows in batches of 2: five steps per epoch
    let mut trainer = Trainer::new(&module, config)?;
    let result = trainer.train(&mut DataSplits::train_only(toy_data(10)?))?;
    assert_eq!(result.iterations, 7);
    assert_eq!(result.epochs, 2);
    Ok(())
}

#[test]
fn training_moves_towards_the_data_mean() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;
    let config = TrainConfig {
        learning_rate: 0.1,
        max_epochs: 100,
        ..quick_config()
    };
    let mut trainer = Trainer::new(&module, config)?;
    let result = trainer.train(&mut toy_splits(8)?)?;

    let losses = result.history.metric_trace("loss_train");
    assert_eq!(losses.len(), 100);
    assert!(losses[99].1 < losses[0].1);

    let validation = result.history.metric_trace("elbo_validation");
    assert_eq!(validation.len(), 100);
    Ok(())
}

struct StopAt(usize);

impl Callback for StopAt {
    fn name(&self) -> &str {
        "stop_at"
    }

    fn on_epoch_end(
        &mut self,
        state: &TrainerState,
        _metrics: &EpochMetrics,
        _module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<CallbackSignal> {
        if state.epoch >= self.0 {
            Ok(CallbackSignal::Stop)
        } else {
            Ok(CallbackSignal::Continue)
        }
    }
}

#[test]
fn user_callback_can_stop_between_epochs() -> anyhow::Result<()> {
    let module = ToyModule::new(3)?;
    let mut trainer = Trainer::new(&module, quick_config())?;
    trainer.add_callback(Box::new(StopAt(2)));
    let result = trainer.train(&mut toy_splits(8)?)?;
    assert_eq!(result.epochs, 2);
    assert!(result.stopped_early);
    Ok(())
}

/// `InMemoryData` that logs the order in which the trainer drives it
struct RecordingLoader {
    inner: InMemoryData,
    events: Rc<RefCell<Vec<&'static str>>>,
}

impl DataLoader for RecordingLoader {
    fn minibatch_data(&self, batch_idx: usize, device: &Device) -> anyhow::Result<MinibatchData> {
        self.events.borrow_mut().push("batch");
        self.inner.minibatch_data(batch_idx, device)
    }

    fn num_minibatch(&self) -> usize {
        self.inner.num_minibatch()
    }

    fn num_samples(&self) -> usize {
        self.inner.num_samples()
    }

    fn sample_ids(&self) -> &[u32] {
        self.inner.sample_ids()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        self.events.borrow_mut().push("shuffle");
        self.inner.shuffle_minibatch(batch_size, rng)
    }

    fn resample_labels(&mut self, rng: &mut StdRng) -> anyhow::Result<()> {
        self.events.borrow_mut().push("resample");
        self.inner.resample_labels(rng)
    }
}

#[test]
fn labels_are_resampled_before_each_epoch_is_batched() -> anyhow::Result<()> {
    let labels: Vec<u32> = (0..12).map(|i| if i < 9 { 0 } else { 1 }).collect();
    let inner = toy_data(12)?
        .with_labels(labels)?
        .with_label_subsampling(LabelSubsampling {
            n_samples_per_label: 2,
            unlabeled: None,
        })?;

    let events = Rc::new(RefCell::new(vec![]));
    let loader = RecordingLoader {
        inner,
        events: events.clone(),
    };

    let module = ToyModule::new(3)?;
    let config = TrainConfig {
        batch_size: 3,
        max_epochs: 3,
        resample_labels: true,
        ..quick_config()
    };
    let mut trainer = Trainer::new(&module, config)?;
    let result = trainer.train(&mut DataSplits::train_only(loader))?;
    assert_eq!(result.epochs, 3);

    // 2 + 2 samples per epoch in batches of 3: two batches
    let events = events.borrow();
    let one_epoch = vec!["resample", "shuffle", "batch", "batch"];
    assert_eq!(*events, one_epoch.repeat(3));
    assert_eq!(result.iterations, 6);
    Ok(())
}

use crate::candle_callbacks::*;
use crate::candle_data_loader::{DataLoader, DataSplits};
use crate::candle_inference::{TrainConfig, TrainStatus};
use crate::candle_kl_annealing::KlAnnealing;
use crate::candle_metric_monitor::{tensor_to_scalar, EpochMetrics};
use crate::candle_model_traits::{GenerativeModuleT, LabelAccuracy, LossOutput};
use crate::candle_param_snapshot::ParameterSnapshot;
use crate::candle_train_error::TrainError;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

/// Metrics of one finished epoch
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub iteration: usize,
    pub metrics: EpochMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// `(epoch, value)` for every epoch that logged `name`
    pub fn metric_trace(&self, name: &str) -> Vec<(usize, f64)> {
        self.epochs
            .iter()
            .filter_map(|r| r.metrics.get(name).map(|v| (r.epoch, v)))
            .collect()
    }
}

/// How a completed session ended
#[derive(Debug, Clone, Serialize)]
pub struct TrainingResult {
    pub status: TrainStatus,
    pub epochs: usize,
    pub iterations: usize,
    pub stopped_early: bool,
    pub best_epoch: Option<usize>,
    pub kl_weight: f64,
    pub history: TrainingHistory,
}

/// running sums over the minibatches of one pass
#[derive(Default)]
struct LossAccumulator {
    n: usize,
    loss: f64,
    elbo: f64,
    reconstruction: f64,
    kl: f64,
    accuracy: Option<LabelAccuracy>,
}

impl LossAccumulator {
    fn add(&mut self, out: &LossOutput, loss_value: f64) -> anyhow::Result<()> {
        let n = out.reconstruction_n.dim(0)?;
        self.n += n;
        self.loss += loss_value * n as f64;
        self.elbo += tensor_to_scalar(&out.neg_elbo_n()?.sum_all()?)?;
        self.reconstruction += tensor_to_scalar(&out.reconstruction_n.sum_all()?)?;
        self.kl += tensor_to_scalar(&out.kl_n.sum_all()?)?;
        if let Some(acc) = out.label_accuracy {
            let tot = self.accuracy.get_or_insert_with(LabelAccuracy::default);
            tot.correct += acc.correct;
            tot.labelled += acc.labelled;
        }
        Ok(())
    }

    fn to_metrics(&self, tag: &str) -> EpochMetrics {
        let mut metrics = EpochMetrics::new();
        if self.n == 0 {
            return metrics;
        }
        let n = self.n as f64;
        metrics.insert(&format!("loss_{}", tag), self.loss / n);
        metrics.insert(&format!("elbo_{}", tag), self.elbo / n);
        metrics.insert(&format!("reconstruction_loss_{}", tag), self.reconstruction / n);
        metrics.insert(&format!("kl_local_{}", tag), self.kl / n);
        if let Some(acc) = self.accuracy.filter(|acc| acc.labelled > 0) {
            let accuracy = acc.correct as f64 / acc.labelled as f64;
            metrics.insert(&format!("accuracy_{}", tag), accuracy);
        }
        metrics
    }
}

///
/// Stochastic optimization of a `GenerativeModuleT` with KL
/// annealing, best-state checkpointing, early stopping and
/// per-epoch label re-subsampling.
///
/// A trainer runs one session: `Idle -> Running -> {Completed, Failed}`.
/// Counters and the best state stay readable afterwards.
///
pub struct Trainer<'a, M>
where
    M: GenerativeModuleT,
{
    module: &'a M,
    config: TrainConfig,
    annealing: KlAnnealing,
    status: TrainStatus,
    current_epoch: usize,
    current_iteration: usize,
    history: TrainingHistory,
    save_best_state: Option<SaveBestState>,
    early_stopping: Option<EarlyStopping>,
    subsample_labels: Option<SubsampleLabels>,
    callbacks: Vec<Box<dyn Callback + 'a>>,
    rng: StdRng,
}

impl<'a, M> Trainer<'a, M>
where
    M: GenerativeModuleT,
{
    /// Check the configuration and set up an idle session
    pub fn new(module: &'a M, config: TrainConfig) -> Result<Self, TrainError> {
        config.validate()?;

        let annealing = KlAnnealing::from_warmup(config.n_epochs_kl_warmup, config.n_iter_kl_warmup)?;

        let save_best_state = config
            .save_best_state
            .as_ref()
            .map(SaveBestState::new)
            .transpose()?;

        let early_stopping = config
            .early_stopping
            .as_ref()
            .map(EarlyStopping::new)
            .transpose()?;

        let subsample_labels = config.resample_labels.then_some(SubsampleLabels);
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            module,
            config,
            annealing,
            status: TrainStatus::Idle,
            current_epoch: 0,
            current_iteration: 0,
            history: TrainingHistory::default(),
            save_best_state,
            early_stopping,
            subsample_labels,
            callbacks: vec![],
            rng,
        })
    }

    /// Append a user callback; it fires after the built-in hooks
    pub fn add_callback(&mut self, callback: Box<dyn Callback + 'a>) {
        self.callbacks.push(callback);
    }

    pub fn status(&self) -> TrainStatus {
        self.status
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn current_iteration(&self) -> usize {
        self.current_iteration
    }

    /// KL weight at the current counters
    pub fn kl_weight(&self) -> f64 {
        self.annealing
            .kl_weight(self.current_epoch, self.current_iteration)
    }

    pub fn annealing(&self) -> KlAnnealing {
        self.annealing
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn best_state(&self) -> Option<&ParameterSnapshot> {
        self.save_best_state.as_ref().and_then(|s| s.best_state())
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.save_best_state.as_ref().and_then(|s| s.best_epoch())
    }

    /// The captured best state, or `MissingBestState`
    pub fn get_best_state(&self) -> Result<&ParameterSnapshot, TrainError> {
        self.best_state().ok_or_else(|| TrainError::MissingBestState {
            monitor: self
                .config
                .save_best_state
                .as_ref()
                .map(|m| m.monitor.clone())
                .unwrap_or_default(),
        })
    }

    fn state(&self) -> TrainerState {
        TrainerState {
            epoch: self.current_epoch,
            iteration: self.current_iteration,
            kl_weight: self.kl_weight(),
        }
    }

    fn iterations_exhausted(&self) -> bool {
        self.config
            .max_iterations
            .is_some_and(|max_iter| self.current_iteration >= max_iter)
    }

    ///
    /// Run the session over `data.train`, logging validation metrics
    /// every `check_val_every_n_epoch` epochs if `data.validation`
    /// exists. The session ends after `max_epochs` epochs, after
    /// `max_iterations` optimizer steps, or when a hook asks to stop.
    ///
    /// On a non-finite loss the session is `Failed` and the best
    /// state captured so far is left in place.
    ///
    pub fn train<D>(&mut self, data: &mut DataSplits<D>) -> anyhow::Result<TrainingResult>
    where
        D: DataLoader,
    {
        if self.status != TrainStatus::Idle {
            return Err(TrainError::SessionNotIdle(self.status).into());
        }
        self.status = TrainStatus::Running;

        match self.run(data) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.status = TrainStatus::Failed;
                Err(err)
            }
        }
    }

    fn run<D>(&mut self, data: &mut DataSplits<D>) -> anyhow::Result<TrainingResult>
    where
        D: DataLoader,
    {
        let device = self.config.device.clone();

        let mut adam = AdamW::new(
            self.module.variable_map().all_vars(),
            ParamsAdamW {
                lr: self.config.learning_rate as f64,
                weight_decay: self.config.weight_decay as f64,
                ..Default::default()
            },
        )?;

        let pb = ProgressBar::new(self.config.max_epochs as u64);

        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut stopped_early = false;

        while self.current_epoch < self.config.max_epochs && !self.iterations_exhausted() {
            ///////////////////////////
            // hooks before batching //
            ///////////////////////////

            let state = self.state();
            if let Some(hook) = self.subsample_labels.as_mut() {
                hook.on_epoch_start(&state, &mut data.train, &mut self.rng)?;
            }
            for cb in self.callbacks.iter_mut() {
                cb.on_epoch_start(&state, &mut data.train, &mut self.rng)?;
            }

            data.train
                .shuffle_minibatch(self.config.batch_size, &mut self.rng)?;

            ////////////////////////
            // optimization steps //
            ////////////////////////

            let mut train_loss = LossAccumulator::default();
            let mut kl_weight = self.kl_weight();

            for b in 0..data.train.num_minibatch() {
                if self.iterations_exhausted() {
                    break;
                }

                kl_weight = self.kl_weight();
                let minibatch = data.train.minibatch_data(b, &device)?;
                let out = self.module.loss(&minibatch, kl_weight, true)?;
                let loss_value = tensor_to_scalar(&out.loss)?;

                if !loss_value.is_finite() {
                    pb.finish_and_clear();
                    return Err(TrainError::NonFiniteLoss {
                        epoch: self.current_epoch + 1,
                        iteration: self.current_iteration + 1,
                        value: loss_value as f32,
                    }
                    .into());
                }

                adam.backward_step(&out.loss)?;
                self.current_iteration += 1;
                train_loss.add(&out, loss_value)?;
            }

            self.current_epoch += 1;

            /////////////////////
            // epoch summaries //
            /////////////////////

            let mut metrics = train_loss.to_metrics("train");
            metrics.insert("kl_weight", kl_weight);

            if let Some(valid) = data.validation.as_mut() {
                if self.current_epoch % self.config.check_val_every_n_epoch == 0 {
                    let valid_metrics = self
                        .evaluate_tagged(valid, "validation")
                        .inspect_err(|_| pb.finish_and_clear())?;
                    metrics.extend(valid_metrics);
                }
            }

            if self.config.verbose {
                info!(
                    "[{}] loss: {:.4} elbo: {:.4} kl_weight: {:.3}",
                    self.current_epoch,
                    metrics.get("loss_train").unwrap_or(f64::NAN),
                    metrics
                        .get("elbo_validation")
                        .or(metrics.get("elbo_train"))
                        .unwrap_or(f64::NAN),
                    kl_weight
                );
            }

            self.history.push(EpochRecord {
                epoch: self.current_epoch,
                iteration: self.current_iteration,
                metrics: metrics.clone(),
            });
            pb.inc(1);

            if self.fire_epoch_end(&metrics)? == CallbackSignal::Stop {
                stopped_early = true;
                break;
            }
        } // each epoch

        pb.finish_and_clear();

        let state = self.state();
        if let Some(save_best) = self.save_best_state.as_mut() {
            save_best.on_train_end(&state, self.module)?;
        }
        for cb in self.callbacks.iter_mut() {
            cb.on_train_end(&state, self.module)?;
        }

        self.status = TrainStatus::Completed;

        Ok(TrainingResult {
            status: self.status,
            epochs: self.current_epoch,
            iterations: self.current_iteration,
            stopped_early,
            best_epoch: self.best_epoch(),
            kl_weight: self.kl_weight(),
            history: self.history.clone(),
        })
    }

    /// Best state first, then early stopping, then user callbacks.
    /// Every hook sees the epoch even if an earlier one asked to stop.
    fn fire_epoch_end(&mut self, metrics: &EpochMetrics) -> anyhow::Result<CallbackSignal> {
        let state = self.state();
        let module: &dyn GenerativeModuleT = self.module;
        let mut signal = CallbackSignal::Continue;

        let mut hooks: Vec<&mut dyn Callback> = vec![];
        if let Some(cb) = self.save_best_state.as_mut() {
            hooks.push(cb);
        }
        if let Some(cb) = self.early_stopping.as_mut() {
            hooks.push(cb);
        }
        for cb in self.callbacks.iter_mut() {
            hooks.push(cb.as_mut());
        }

        for cb in hooks {
            if cb.on_epoch_end(&state, metrics, module)? == CallbackSignal::Stop {
                if signal == CallbackSignal::Continue {
                    info!("`{}` requested a stop at epoch {}", cb.name(), state.epoch);
                }
                signal = CallbackSignal::Stop;
            }
        }
        Ok(signal)
    }

    /// Deterministic pass over `data` with the current KL weight;
    /// metrics are tagged `_{tag}` (e.g., `elbo_test`). A non-finite
    /// loss is an error.
    pub fn evaluate<D>(&mut self, data: &mut D, tag: &str) -> anyhow::Result<EpochMetrics>
    where
        D: DataLoader,
    {
        self.evaluate_tagged(data, tag)
    }

    fn evaluate_tagged<D>(&mut self, data: &mut D, tag: &str) -> anyhow::Result<EpochMetrics>
    where
        D: DataLoader,
    {
        let kl_weight = self.kl_weight();
        data.shuffle_minibatch(self.config.batch_size, &mut self.rng)?;

        let mut acc = LossAccumulator::default();
        for b in 0..data.num_minibatch() {
            let minibatch = data.minibatch_data(b, &self.config.device)?;
            let out = self.module.loss(&minibatch, kl_weight, false)?;
            let loss_value = tensor_to_scalar(&out.loss)?;
            if !loss_value.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    epoch: self.current_epoch,
                    iteration: self.current_iteration,
                    value: loss_value as f32,
                }
                .into());
            }
            acc.add(&out, loss_value)?;
        }
        Ok(acc.to_metrics(tag))
    }
}

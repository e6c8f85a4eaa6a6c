use crate::candle_data_loader::DataLoader;
use crate::candle_inference::{EarlyStoppingConfig, MonitorConfig};
use crate::candle_metric_monitor::{EpochMetrics, MetricMonitor, MonitorOutcome};
use crate::candle_model_traits::GenerativeModuleT;
use crate::candle_param_snapshot::ParameterSnapshot;
use crate::candle_train_error::TrainError;

use log::info;
use rand::rngs::StdRng;

/// Read-only view of the trainer counters handed to callbacks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerState {
    /// finished epochs
    pub epoch: usize,
    /// finished optimizer steps
    pub iteration: usize,
    pub kl_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSignal {
    Continue,
    Stop,
}

///
/// Hooks fired by the trainer at epoch boundaries. Every method has a
/// no-op default so a callback only implements what it needs.
///
/// * `on_epoch_start` runs before any batch of the epoch exists
/// * `on_epoch_end` sees the epoch's metrics and may ask to stop
/// * `on_train_end` runs once, only when the session completes
///
pub trait Callback {
    fn name(&self) -> &str;

    fn on_epoch_start(
        &mut self,
        _state: &TrainerState,
        _train_data: &mut dyn DataLoader,
        _rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _state: &TrainerState,
        _metrics: &EpochMetrics,
        _module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<CallbackSignal> {
        Ok(CallbackSignal::Continue)
    }

    fn on_train_end(
        &mut self,
        _state: &TrainerState,
        _module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/////////////////////
// best-state save //
/////////////////////

/// Keep a deep copy of the parameters from the best monitored epoch
/// and load it back into the module when training completes
pub struct SaveBestState {
    monitor: MetricMonitor,
    best: Option<(usize, ParameterSnapshot)>,
}

impl SaveBestState {
    pub fn new(config: &MonitorConfig) -> Result<Self, TrainError> {
        Ok(Self {
            monitor: MetricMonitor::new(config)?,
            best: None,
        })
    }

    pub fn monitor(&self) -> &MetricMonitor {
        &self.monitor
    }

    /// Replace the snapshot with the module's current parameters
    pub fn on_improvement(
        &mut self,
        epoch: usize,
        module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<()> {
        self.best = Some((epoch, module.parameters_snapshot()?));
        Ok(())
    }

    /// Restore the captured snapshot into the live parameters
    pub fn finalize(&self, module: &dyn GenerativeModuleT) -> anyhow::Result<()> {
        let (epoch, snapshot) = self
            .best
            .as_ref()
            .ok_or_else(|| TrainError::MissingBestState {
                monitor: self.monitor.monitor().to_string(),
            })?;

        module.load_parameters(snapshot)?;
        info!(
            "restored parameters from epoch {} ({} = {})",
            epoch,
            self.monitor.monitor(),
            self.monitor.best_value()
        );
        Ok(())
    }

    pub fn best_state(&self) -> Option<&ParameterSnapshot> {
        self.best.as_ref().map(|(_, s)| s)
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|(e, _)| *e)
    }
}

impl Callback for SaveBestState {
    fn name(&self) -> &str {
        "save_best_state"
    }

    fn on_epoch_end(
        &mut self,
        state: &TrainerState,
        metrics: &EpochMetrics,
        module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<CallbackSignal> {
        if self.monitor.observe(metrics) == MonitorOutcome::Improved {
            self.on_improvement(state.epoch, module)?;
        }
        Ok(CallbackSignal::Continue)
    }

    fn on_train_end(
        &mut self,
        _state: &TrainerState,
        module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<()> {
        self.finalize(module)
    }
}

////////////////////
// early stopping //
////////////////////

/// Stop after `patience` due checks in a row without improvement
pub struct EarlyStopping {
    monitor: MetricMonitor,
    patience: usize,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Result<Self, TrainError> {
        if config.patience == 0 {
            return Err(TrainError::InvalidConfig(
                "early stopping patience must be positive".into(),
            ));
        }
        Ok(Self {
            monitor: MetricMonitor::new(&config.monitor)?.with_min_delta(config.min_delta),
            patience: config.patience,
            wait: 0,
            stopped_epoch: None,
        })
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn wait(&self) -> usize {
        self.wait
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_epoch_end(
        &mut self,
        state: &TrainerState,
        metrics: &EpochMetrics,
        _module: &dyn GenerativeModuleT,
    ) -> anyhow::Result<CallbackSignal> {
        match self.monitor.observe(metrics) {
            MonitorOutcome::Improved => self.wait = 0,
            MonitorOutcome::NotImproved => self.wait += 1,
            MonitorOutcome::NotDue | MonitorOutcome::Missing => {}
        }

        if self.wait >= self.patience {
            info!(
                "`{}` has not improved for {} checks; stopping at epoch {}",
                self.monitor.monitor(),
                self.wait,
                state.epoch
            );
            self.stopped_epoch = Some(state.epoch);
            Ok(CallbackSignal::Stop)
        } else {
            Ok(CallbackSignal::Continue)
        }
    }
}

//////////////////////////
// label re-subsampling //
//////////////////////////

/// Ask the training loader for a fresh label-stratified subsample
/// before every epoch
#[derive(Debug, Default)]
pub struct SubsampleLabels;

impl Callback for SubsampleLabels {
    fn name(&self) -> &str {
        "subsample_labels"
    }

    fn on_epoch_start(
        &mut self,
        _state: &TrainerState,
        train_data: &mut dyn DataLoader,
        rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        train_data.resample_labels(rng)
    }
}

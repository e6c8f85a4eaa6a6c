use crate::candle_train_error::TrainError;
use serde::Serialize;

/// Direction of improvement for a monitored metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorMode {
    Min,
    Max,
}

impl std::str::FromStr for MonitorMode {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            _ => Err(TrainError::UnknownMonitorMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// Which metric to watch, in which direction, how often
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitor: String,
    pub mode: MonitorMode,
    pub check_interval_epochs: usize,
}

impl MonitorConfig {
    pub fn new(monitor: &str, mode: MonitorMode) -> Self {
        Self {
            monitor: monitor.to_string(),
            mode,
            check_interval_epochs: 1,
        }
    }

    pub fn with_check_interval(mut self, check_interval_epochs: usize) -> Self {
        self.check_interval_epochs = check_interval_epochs;
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new("elbo_validation", MonitorMode::Min)
    }
}

#[derive(Debug, Clone)]
pub struct EarlyStoppingConfig {
    pub monitor: MonitorConfig,
    /// number of evaluations without improvement before stopping
    pub patience: usize,
    /// minimum change to count as an improvement
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            patience: 45,
            min_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub batch_size: usize,
    pub max_epochs: usize,
    pub max_iterations: Option<usize>,
    pub n_epochs_kl_warmup: Option<usize>,
    pub n_iter_kl_warmup: Option<usize>,
    pub check_val_every_n_epoch: usize,
    pub save_best_state: Option<MonitorConfig>,
    pub early_stopping: Option<EarlyStoppingConfig>,
    pub resample_labels: bool,
    pub seed: u64,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 0.0,
            batch_size: 128,
            max_epochs: 400,
            max_iterations: None,
            n_epochs_kl_warmup: None,
            n_iter_kl_warmup: None,
            check_val_every_n_epoch: 1,
            save_best_state: None,
            early_stopping: None,
            resample_labels: false,
            seed: 42,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }
}

impl TrainConfig {
    /// Reject configurations a session cannot run with
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size == 0 {
            return Err(TrainError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.check_val_every_n_epoch == 0 {
            return Err(TrainError::InvalidConfig(
                "check_val_every_n_epoch must be at least 1".into(),
            ));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(TrainError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }

        let monitors = self
            .save_best_state
            .iter()
            .chain(self.early_stopping.as_ref().map(|es| &es.monitor));

        for monitor in monitors {
            if monitor.check_interval_epochs == 0 {
                return Err(TrainError::InvalidConfig(format!(
                    "check interval for `{}` must be at least 1",
                    monitor.monitor
                )));
            }
        }

        if let Some(es) = self.early_stopping.as_ref() {
            if es.min_delta < 0.0 {
                return Err(TrainError::InvalidConfig(
                    "early stopping min_delta must be non-negative".into(),
                ));
            }
        }
        Ok(())
    }
}

/// `Idle -> Running -> {Completed, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrainStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

use crate::common::ComputeDevice;
use candle_vi::candle_inference::*;
use clap::Args;

/// Optimization flags shared by every fitting subcommand
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[arg(long, short = 'i', default_value_t = 400, help = "Maximum number of epochs")]
    pub epochs: usize,

    #[arg(long, help = "Stop after this many optimizer steps")]
    pub max_iterations: Option<usize>,

    #[arg(long, default_value_t = 0.01, help = "Learning rate (AdamW)")]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 0.0, help = "Weight decay (AdamW)")]
    pub weight_decay: f32,

    #[arg(long, short = 'b', default_value_t = 128, help = "Minibatch size")]
    pub batch_size: usize,

    #[arg(
        long,
        default_value_t = 1.0,
        help = "Fraction of samples used for training",
        long_help = "Fraction of samples used for training.\n\
		     The rest is held out to compute `*_validation` metrics.\n\
		     1.0 trains on everything without validation."
    )]
    pub train_size: f64,

    #[arg(long, help = "Linear KL warmup over this many epochs")]
    pub kl_warmup_epochs: Option<usize>,

    #[arg(
        long,
        conflicts_with = "kl_warmup_epochs",
        help = "Linear KL warmup over this many iterations"
    )]
    pub kl_warmup_iterations: Option<usize>,

    #[arg(long, default_value_t = 1, help = "Validate every N epochs")]
    pub check_val_every: usize,

    #[arg(long, help = "Restore the parameters of the best monitored epoch")]
    pub save_best: bool,

    #[arg(
        long,
        help = "Metric to monitor",
        long_help = "Metric to monitor for best-state saving and early stopping.\n\
		     Defaults to `elbo_validation` with a validation split,\n\
		     `elbo_train` without one."
    )]
    pub monitor: Option<Box<str>>,

    #[arg(long, default_value = "min", help = "Direction of improvement {min, max}")]
    pub mode: Box<str>,

    #[arg(long, default_value_t = 1, help = "Check the monitor every N epochs")]
    pub monitor_interval: usize,

    #[arg(long, help = "Early stopping after N checks without improvement")]
    pub patience: Option<usize>,

    #[arg(long, default_value_t = 0.0, help = "Minimum change counted as improvement")]
    pub min_delta: f64,

    #[arg(long, help = "Resample at most N cells per label every epoch")]
    pub labels_per_class: Option<usize>,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    pub seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number for cuda or metal")]
    pub device_no: usize,

    #[arg(short = 'v', long, help = "Verbose output")]
    pub verbose: bool,
}

impl TrainArgs {
    /// Monitored metric, depending on whether a validation split exists
    pub fn monitor_config(&self, has_validation: bool) -> anyhow::Result<MonitorConfig> {
        let default_monitor = if has_validation {
            "elbo_validation"
        } else {
            "elbo_train"
        };
        let monitor = self.monitor.as_deref().unwrap_or(default_monitor);
        let mode: MonitorMode = self.mode.parse()?;
        Ok(MonitorConfig::new(monitor, mode).with_check_interval(self.monitor_interval))
    }

    pub fn to_train_config(&self, has_validation: bool) -> anyhow::Result<TrainConfig> {
        let monitor = self.monitor_config(has_validation)?;

        let early_stopping = self.patience.map(|patience| EarlyStoppingConfig {
            monitor: monitor.clone(),
            patience,
            min_delta: self.min_delta,
        });

        let config = TrainConfig {
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            batch_size: self.batch_size,
            max_epochs: self.epochs,
            max_iterations: self.max_iterations,
            n_epochs_kl_warmup: self.kl_warmup_epochs,
            n_iter_kl_warmup: self.kl_warmup_iterations,
            check_val_every_n_epoch: self.check_val_every,
            save_best_state: self.save_best.then_some(monitor),
            early_stopping,
            resample_labels: self.labels_per_class.is_some(),
            seed: self.seed,
            device: self.device.to_device(self.device_no)?,
            verbose: self.verbose,
            show_progress: !self.verbose,
        };
        config.validate()?;
        Ok(config)
    }
}

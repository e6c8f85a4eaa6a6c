use crate::candle_inference::{MonitorConfig, MonitorMode};
use crate::candle_train_error::TrainError;

use candle_core::{DType, Tensor};
use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;

/// Scalar metrics logged at the end of an epoch, keyed by name
/// (e.g., `elbo_validation`, `reconstruction_loss_train`)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EpochMetrics {
    values: BTreeMap<String, f64>,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    /// Reduce a (scalar or single-element) tensor to `f64` first
    pub fn insert_tensor(&mut self, name: &str, value: &Tensor) -> candle_core::Result<()> {
        self.insert(name, tensor_to_scalar(value)?);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn extend(&mut self, other: EpochMetrics) {
        self.values.extend(other.values);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Convert a tensor with exactly one element to a plain `f64`
pub fn tensor_to_scalar(value: &Tensor) -> candle_core::Result<f64> {
    value
        .flatten_all()?
        .to_dtype(DType::F64)?
        .squeeze(0)?
        .to_scalar::<f64>()
}

/// What happened when the monitor looked at an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// check interval has not elapsed yet
    NotDue,
    /// the metric was missing from this epoch
    Missing,
    Improved,
    NotImproved,
}

///
/// Track one scalar metric across epochs and decide whether it
/// improved. Comparison is `<` in `min` mode and `>` in `max` mode,
/// optionally with a `min_delta` margin.
///
#[derive(Debug, Clone)]
pub struct MetricMonitor {
    monitor: String,
    mode: MonitorMode,
    best_value: f64,
    min_delta: f64,
    check_interval: usize,
    epochs_since_last_check: usize,
}

impl MetricMonitor {
    pub fn new(config: &MonitorConfig) -> Result<Self, TrainError> {
        if config.check_interval_epochs == 0 {
            return Err(TrainError::InvalidConfig(format!(
                "check interval for `{}` must be at least 1",
                config.monitor
            )));
        }

        let best_value = match config.mode {
            MonitorMode::Min => f64::INFINITY,
            MonitorMode::Max => f64::NEG_INFINITY,
        };

        Ok(Self {
            monitor: config.monitor.clone(),
            mode: config.mode,
            best_value,
            min_delta: 0.0,
            check_interval: config.check_interval_epochs,
            epochs_since_last_check: 0,
        })
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    pub fn best_value(&self) -> f64 {
        self.best_value
    }

    pub fn epochs_since_last_check(&self) -> usize {
        self.epochs_since_last_check
    }

    /// Record this epoch's value; true only if it was checked and improved
    pub fn record(&mut self, current: f64) -> bool {
        if !self.tick() {
            return false;
        }
        self.compare_and_update(current)
    }

    /// Look the monitored metric up in `metrics` and record it.
    ///
    /// A missing metric is logged and skipped; training goes on.
    pub fn observe(&mut self, metrics: &EpochMetrics) -> MonitorOutcome {
        if !self.tick() {
            return MonitorOutcome::NotDue;
        }

        match metrics.get(&self.monitor) {
            None => {
                warn!(
                    "`{}` is not available in this epoch's metrics; skipping the check",
                    self.monitor
                );
                MonitorOutcome::Missing
            }
            Some(current) => {
                if self.compare_and_update(current) {
                    MonitorOutcome::Improved
                } else {
                    MonitorOutcome::NotImproved
                }
            }
        }
    }

    /// Count one epoch; when the interval elapses, reset and say so
    fn tick(&mut self) -> bool {
        self.epochs_since_last_check += 1;
        if self.epochs_since_last_check >= self.check_interval {
            self.epochs_since_last_check = 0;
            true
        } else {
            false
        }
    }

    fn compare_and_update(&mut self, current: f64) -> bool {
        let improved = match self.mode {
            MonitorMode::Min => current < self.best_value - self.min_delta,
            MonitorMode::Max => current > self.best_value + self.min_delta,
        };
        if improved {
            self.best_value = current;
        }
        improved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn monitor(mode: MonitorMode, interval: usize) -> MetricMonitor {
        MetricMonitor::new(&MonitorConfig::new("elbo_validation", mode).with_check_interval(interval))
            .expect("valid monitor")
    }

    #[test]
    fn strictly_decreasing_always_improves_in_min_mode() {
        let mut mon = monitor(MonitorMode::Min, 1);
        assert_eq!(mon.best_value(), f64::INFINITY);
        for v in [10.0, 9.5, 3.0, -1.0, -7.25] {
            assert!(mon.record(v));
            assert_eq!(mon.best_value(), v);
        }
    }

    #[test]
    fn strictly_decreasing_with_interval() {
        let mut mon = monitor(MonitorMode::Min, 3);
        let values = [10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0];
        let improved: Vec<bool> = values.iter().map(|&v| mon.record(v)).collect();
        assert_eq!(
            improved,
            vec![false, false, true, false, false, true, false, false, true]
        );
        assert_eq!(mon.best_value(), 2.0);
    }

    #[test]
    fn constant_sequence_improves_once() {
        let mut mon = monitor(MonitorMode::Min, 1);
        assert!(mon.record(1.5));
        for _ in 0..10 {
            assert!(!mon.record(1.5));
        }

        let mut mon = monitor(MonitorMode::Max, 1);
        assert_eq!(mon.best_value(), f64::NEG_INFINITY);
        assert!(mon.record(0.25));
        for _ in 0..10 {
            assert!(!mon.record(0.25));
        }
    }

    #[test]
    fn max_mode_uses_greater_than() {
        let mut mon = monitor(MonitorMode::Max, 1);
        assert!(mon.record(0.5));
        assert!(!mon.record(0.4));
        assert!(mon.record(0.9));
        assert_eq!(mon.best_value(), 0.9);
    }

    #[test]
    fn min_delta_requires_a_margin() {
        let mut mon = monitor(MonitorMode::Min, 1).with_min_delta(0.1);
        assert!(mon.record(1.0));
        assert!(!mon.record(0.95));
        assert!(mon.record(0.85));
    }

    #[test]
    fn missing_metric_is_skipped() {
        let mut mon = monitor(MonitorMode::Min, 1);
        let mut metrics = EpochMetrics::new();
        metrics.insert("elbo_train", 3.0);
        assert_eq!(mon.observe(&metrics), MonitorOutcome::Missing);
        assert_eq!(mon.best_value(), f64::INFINITY);

        metrics.insert("elbo_validation", 2.0);
        assert_eq!(mon.observe(&metrics), MonitorOutcome::Improved);
        assert_eq!(mon.observe(&metrics), MonitorOutcome::NotImproved);
    }

    #[test]
    fn tensor_metrics_become_scalars() -> candle_core::Result<()> {
        let mut metrics = EpochMetrics::new();
        let t = Tensor::new(&[2.5f32], &Device::Cpu)?;
        metrics.insert_tensor("loss_train", &t)?;
        metrics.insert_tensor("kl_weight", &Tensor::new(0.5f64, &Device::Cpu)?)?;
        assert_eq!(metrics.get("loss_train"), Some(2.5));
        assert_eq!(metrics.get("kl_weight"), Some(0.5));
        Ok(())
    }

    #[test]
    fn zero_interval_is_a_configuration_error() {
        let config = MonitorConfig::new("elbo_validation", MonitorMode::Min).with_check_interval(0);
        assert!(MetricMonitor::new(&config).is_err());
    }
}

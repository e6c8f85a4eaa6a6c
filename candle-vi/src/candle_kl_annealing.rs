use crate::candle_train_error::TrainError;

/// Linear warmup of the KL term in the variational objective
///
/// kl_weight = min(1, elapsed / warmup)
///
/// where `elapsed` counts finished epochs or optimizer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlAnnealing {
    Disabled,
    Epochs(usize),
    Iterations(usize),
}

impl KlAnnealing {
    /// Build a schedule from the two warmup options.
    ///
    /// A zero warmup counts as unset. Setting both to positive values
    /// is rejected.
    pub fn from_warmup(
        n_epochs_kl_warmup: Option<usize>,
        n_iter_kl_warmup: Option<usize>,
    ) -> Result<Self, TrainError> {
        match (
            n_epochs_kl_warmup.filter(|&n| n > 0),
            n_iter_kl_warmup.filter(|&n| n > 0),
        ) {
            (Some(epochs), Some(iterations)) => {
                Err(TrainError::ConflictingKlWarmup { epochs, iterations })
            }
            (Some(epochs), None) => Ok(Self::Epochs(epochs)),
            (None, Some(iterations)) => Ok(Self::Iterations(iterations)),
            (None, None) => Ok(Self::Disabled),
        }
    }

    /// KL weight in [0, 1] at the given counters
    ///
    /// * `current_epoch` - number of finished epochs
    /// * `current_iteration` - number of finished optimizer steps
    pub fn kl_weight(&self, current_epoch: usize, current_iteration: usize) -> f64 {
        match *self {
            Self::Disabled => 1.0,
            Self::Epochs(warmup) => ramp(current_epoch, warmup),
            Self::Iterations(warmup) => ramp(current_iteration, warmup),
        }
    }

    pub fn is_saturated(&self, current_epoch: usize, current_iteration: usize) -> bool {
        self.kl_weight(current_epoch, current_iteration) >= 1.0
    }
}

impl Default for KlAnnealing {
    fn default() -> Self {
        Self::Disabled
    }
}

fn ramp(elapsed: usize, warmup: usize) -> f64 {
    if warmup == 0 {
        1.0
    } else {
        (elapsed as f64 / warmup as f64).min(1.0)
    }
}

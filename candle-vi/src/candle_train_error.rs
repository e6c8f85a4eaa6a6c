use thiserror::Error;

use crate::candle_inference::TrainStatus;

/// Errors raised by a training session.
///
/// Tensor-level failures stay `candle_core::Error`; everything here is
/// about how a session was configured or how it ended.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown monitor mode `{0}` (expected `min` or `max`)")]
    UnknownMonitorMode(String),

    #[error("unknown objective bound `{0}` (expected ELBO, IWELBO, CUBO or KL)")]
    UnknownObjectiveBound(String),

    #[error(
        "both n_epochs_kl_warmup ({epochs}) and n_iter_kl_warmup ({iterations}) are set; \
         keep only one of them"
    )]
    ConflictingKlWarmup { epochs: usize, iterations: usize },

    #[error("no best state was captured while monitoring `{monitor}`; nothing to restore")]
    MissingBestState { monitor: String },

    #[error("non-finite loss ({value}) at epoch {epoch}, iteration {iteration}")]
    NonFiniteLoss {
        epoch: usize,
        iteration: usize,
        value: f32,
    },

    #[error("a training session can only start from Idle, but it is {0:?}")]
    SessionNotIdle(TrainStatus),
}

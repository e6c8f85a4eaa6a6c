use crate::candle_data_loader::MinibatchData;
use crate::candle_param_snapshot::ParameterSnapshot;

use candle_core::{Result, Tensor};
use candle_nn::VarMap;

/// What a generative module reports for one minibatch
pub struct LossOutput {
    /// scalar objective to minimize
    pub loss: Tensor,
    /// per-sample negative log-likelihood (n,)
    pub reconstruction_n: Tensor,
    /// per-sample KL divergence (n,)
    pub kl_n: Tensor,
    /// label predictions, for modules with a classifier
    pub label_accuracy: Option<LabelAccuracy>,
}

/// Correct label predictions out of the labelled samples of a minibatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelAccuracy {
    pub correct: usize,
    pub labelled: usize,
}

impl LossOutput {
    /// per-sample negative ELBO: reconstruction + KL (n,)
    pub fn neg_elbo_n(&self) -> Result<Tensor> {
        self.reconstruction_n.add(&self.kl_n)
    }
}

///
/// A model the trainer can optimize. Parameters live in the module's
/// `VarMap`; the trainer only calls `loss` and steps the optimizer
/// over `variable_map().all_vars()`.
///
pub trait GenerativeModuleT {
    /// Evaluate the objective on a minibatch
    /// * `batch` - minibatch data
    /// * `kl_weight` - weight on the KL term in [0, 1]
    /// * `train` - whether the evaluation is stochastic
    fn loss(&self, batch: &MinibatchData, kl_weight: f64, train: bool) -> Result<LossOutput>;

    fn variable_map(&self) -> &VarMap;

    /// deep copy of every trainable parameter
    fn parameters_snapshot(&self) -> anyhow::Result<ParameterSnapshot> {
        ParameterSnapshot::capture(self.variable_map())
    }

    fn load_parameters(&self, snapshot: &ParameterSnapshot) -> anyhow::Result<()> {
        snapshot.restore(self.variable_map())
    }
}

/// A model whose likelihood can be evaluated at externally supplied
/// latent states, so that an auxiliary posterior can be fitted
/// against it with the model itself held fixed.
pub trait LatentLikelihoodT {
    fn dim_latent(&self) -> usize;

    /// log p(x | z) for each sample (n,)
    /// * `batch` - minibatch carrying `x`
    /// * `z_nk` - latent states (n x k)
    fn log_likelihood_given_latent(&self, batch: &MinibatchData, z_nk: &Tensor) -> Result<Tensor>;
}

pub trait EncoderModuleT {
    /// An encoder that spits out two results (latent inference, KL loss)
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `train` - whether to sample or to use the mean
    ///
    /// # Returns `(z_nk, kl_loss_n)`
    /// * `z_nk` - latent inference (n x k)
    /// * `kl_loss_n` - KL loss (n,)
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)>;

    /// Latent Gaussian parameters `(mean, log-variance)`, each n x k
    fn latent_gaussian_params(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out reconstruction
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor>;

    /// Get a representative dictionary matrix
    fn get_dictionary(&self) -> Result<Tensor>;

    /// A decoder that spits out reconstruction and log-likelihood
    /// * `z_nk` - latent states
    /// * `x_nd` - observed data to validate with
    fn forward_with_llik(&self, z_nk: &Tensor, x_nd: &Tensor) -> Result<(Tensor, Tensor)>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

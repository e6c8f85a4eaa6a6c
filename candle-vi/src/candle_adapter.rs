use crate::candle_data_loader::{DataLoader, DataSplits, MinibatchData};
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::*;
use crate::candle_metric_monitor::tensor_to_scalar;
use crate::candle_model_traits::*;
use crate::candle_seeded_init::{seeded_var, GaussianNoise, SeededInit};
use crate::candle_train_error::TrainError;
use crate::candle_trainer::{Trainer, TrainingResult};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{ops, VarBuilder, VarMap};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;

/// Which variational bound the adapter optimizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectiveBound {
    /// -E_q[log p(x|z)] + kl_weight * KL(q || p)
    Elbo,
    /// -(logsumexp_s log w_s - log S)
    Iwelbo,
    /// 0.5 * (logsumexp_s 2 log w_s - log S)
    Cubo,
    /// inclusive KL(p || q) with self-normalized importance weights
    Kl,
}

impl std::str::FromStr for ObjectiveBound {
    type Err = TrainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ELBO" => Ok(Self::Elbo),
            "IWELBO" => Ok(Self::Iwelbo),
            "CUBO" => Ok(Self::Cubo),
            "KL" => Ok(Self::Kl),
            _ => Err(TrainError::UnknownObjectiveBound(s.to_string())),
        }
    }
}

impl std::fmt::Display for ObjectiveBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Elbo => "ELBO",
            Self::Iwelbo => "IWELBO",
            Self::Cubo => "CUBO",
            Self::Kl => "KL",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub bound: ObjectiveBound,
    /// number of importance samples per data point
    pub n_path: usize,
    pub train: TrainConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            bound: ObjectiveBound::Elbo,
            n_path: 10,
            train: TrainConfig::default(),
        }
    }
}

///
/// Free-form Gaussian posterior `q(z_i) = N(mean_i, exp(lnvar_i))`
/// with one row per sample id, kept in its own `VarMap` so that an
/// optimizer over it never touches the model's parameters.
///
pub struct AuxiliaryPosterior {
    variable_map: VarMap,
    z_mean: Tensor,
    z_lnvar: Tensor,
    sample_ids: Vec<u32>,
    row_of_sample: HashMap<u32, u32>,
}

impl AuxiliaryPosterior {
    /// Will create these variables:
    /// * `aux.z.mean` (n x k), `N(0, 0.1^2)` drawn from `rng`
    /// * `aux.z.lnvar` (n x k), all -1
    pub fn new(
        sample_ids: &[u32],
        dim_latent: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);
        let n = sample_ids.len();

        let z_mean = seeded_var(
            &vb,
            (n, dim_latent),
            "aux.z.mean",
            SeededInit::Randn {
                mean: 0.,
                stdev: 0.1,
            },
            rng,
        )?;
        let z_lnvar = seeded_var(
            &vb,
            (n, dim_latent),
            "aux.z.lnvar",
            SeededInit::Const(-1.),
            rng,
        )?;

        let row_of_sample = sample_ids
            .iter()
            .enumerate()
            .map(|(row, &id)| (id, row as u32))
            .collect();

        Ok(Self {
            variable_map,
            z_mean,
            z_lnvar,
            sample_ids: sample_ids.to_vec(),
            row_of_sample,
        })
    }

    pub fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }

    pub fn sample_ids(&self) -> &[u32] {
        &self.sample_ids
    }

    /// `(mean, lnvar)` rows for the samples of a minibatch
    pub fn params(&self, samples: &Tensor) -> Result<(Tensor, Tensor)> {
        let rows = samples
            .to_vec1::<u32>()?
            .into_iter()
            .map(|id| {
                self.row_of_sample.get(&id).copied().ok_or_else(|| {
                    candle_core::Error::Msg(format!("sample {} has no posterior row", id))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let rows = Tensor::from_vec(rows, samples.dim(0)?, self.z_mean.device())?;
        Ok((
            self.z_mean.index_select(&rows, 0)?,
            self.z_lnvar.index_select(&rows, 0)?,
        ))
    }

    /// detached copies of all rows
    pub fn all_params(&self) -> Result<(Tensor, Tensor)> {
        Ok((
            self.z_mean.copy()?.detach(),
            self.z_lnvar.copy()?.detach(),
        ))
    }
}

/// Per-sample bounds (n,) computed from one shared set of draws
pub struct BoundEstimates {
    /// -E_q[log p(x|z)] + KL(q || p), the KL term analytic
    pub neg_elbo_n: Tensor,
    pub neg_iwelbo_n: Tensor,
    pub cubo_n: Tensor,
}

/// Frozen model + auxiliary posterior, trained through `Trainer`
pub struct AdapterModule<'a, M>
where
    M: LatentLikelihoodT,
{
    frozen: &'a M,
    posterior: &'a AuxiliaryPosterior,
    bound: ObjectiveBound,
    n_path: usize,
    noise: GaussianNoise,
}

impl<'a, M> AdapterModule<'a, M>
where
    M: LatentLikelihoodT,
{
    /// * `noise_seed` - seeds the draws of `z`
    pub fn new(
        frozen: &'a M,
        posterior: &'a AuxiliaryPosterior,
        bound: ObjectiveBound,
        n_path: usize,
        noise_seed: u64,
    ) -> std::result::Result<Self, TrainError> {
        if n_path == 0 {
            return Err(TrainError::InvalidConfig("n_path must be positive".into()));
        }
        Ok(Self {
            frozen,
            posterior,
            bound,
            n_path,
            noise: GaussianNoise::new(noise_seed),
        })
    }

    /// z(s, n, k) = mean(n, k) + exp(lnvar(n, k) / 2) * eps(s, n, k)
    fn sample_paths(&self, z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
        let (n, k) = z_mean.dims2()?;
        let eps = self.noise.sample((self.n_path, n, k), z_mean.device())?;
        eps.broadcast_mul(&(z_lnvar * 0.5)?.exp()?)?
            .broadcast_add(z_mean)
    }

    /// log p(x | z_s) for every path (s x n)
    fn path_log_likelihood(&self, batch: &MinibatchData, z_snk: &Tensor) -> Result<Tensor> {
        let llik = (0..z_snk.dim(0)?)
            .map(|s| {
                self.frozen
                    .log_likelihood_given_latent(batch, &z_snk.get(s)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&llik, 0)
    }

    /// log w = log p(x | z) + log p(z) - log q(z) (s x n)
    fn log_weights(
        &self,
        llik_sn: &Tensor,
        z_snk: &Tensor,
        z_mean: &Tensor,
        z_lnvar: &Tensor,
    ) -> Result<Tensor> {
        let log_prior_sn = standard_normal_log_density(z_snk)?;
        let log_q_sn = gaussian_log_density(z_snk, z_mean, z_lnvar)?;
        llik_sn.add(&log_prior_sn)?.sub(&log_q_sn)
    }

    fn log_n_path(&self) -> f64 {
        (self.n_path as f64).ln()
    }

    /// -IWELBO per sample (n,)
    fn neg_iwelbo_n(&self, log_w_sn: &Tensor) -> Result<Tensor> {
        (logsumexp(log_w_sn, 0)? - self.log_n_path())?.neg()
    }

    /// CUBO_2 per sample (n,)
    fn cubo_n(&self, log_w_sn: &Tensor) -> Result<Tensor> {
        (logsumexp(&(log_w_sn * 2.)?, 0)? - self.log_n_path())? * 0.5
    }

    /// -sum_s sg(w_s) log q(sg(z_s)) per sample (n,)
    fn inclusive_kl_n(
        &self,
        log_w_sn: &Tensor,
        z_snk: &Tensor,
        z_mean: &Tensor,
        z_lnvar: &Tensor,
    ) -> Result<Tensor> {
        let w_sn = ops::softmax(&log_w_sn.detach(), 0)?;
        let log_q_sn = gaussian_log_density(&z_snk.detach(), z_mean, z_lnvar)?;
        w_sn.mul(&log_q_sn)?.sum(0)?.neg()
    }

    /// -ELBO, -IWELBO and CUBO of a minibatch from the same `n_path`
    /// draws, detached from the graph
    pub fn bound_estimates(&self, batch: &MinibatchData) -> Result<BoundEstimates> {
        let (z_mean, z_lnvar) = self.posterior.params(&batch.samples)?;
        let z_snk = self.sample_paths(&z_mean, &z_lnvar)?;
        let llik_sn = self.path_log_likelihood(batch, &z_snk)?;
        let log_w_sn = self.log_weights(&llik_sn, &z_snk, &z_mean, &z_lnvar)?;

        let neg_elbo_n = llik_sn
            .mean(0)?
            .neg()?
            .add(&gaussian_kl_loss(&z_mean, &z_lnvar)?)?;

        Ok(BoundEstimates {
            neg_elbo_n: neg_elbo_n.detach(),
            neg_iwelbo_n: self.neg_iwelbo_n(&log_w_sn)?.detach(),
            cubo_n: self.cubo_n(&log_w_sn)?.detach(),
        })
    }

    ///
    /// Per-sample value of the bound being minimized: -ELBO, -IWELBO
    /// or CUBO. For the inclusive KL objective, which has no bound of
    /// its own, this is -IWELBO.
    ///
    pub fn bound_estimate_n(&self, batch: &MinibatchData) -> Result<Tensor> {
        let bounds = self.bound_estimates(batch)?;
        Ok(match self.bound {
            ObjectiveBound::Elbo => bounds.neg_elbo_n,
            ObjectiveBound::Iwelbo | ObjectiveBound::Kl => bounds.neg_iwelbo_n,
            ObjectiveBound::Cubo => bounds.cubo_n,
        })
    }

    /// `bound_estimate_n` averaged over every sample `data` serves
    pub fn average_bound<D>(
        &self,
        data: &mut D,
        batch_size: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> anyhow::Result<f64>
    where
        D: DataLoader,
    {
        data.shuffle_minibatch(batch_size, rng)?;
        let mut total = 0_f64;
        let mut ntot = 0_usize;
        for b in 0..data.num_minibatch() {
            let minibatch = data.minibatch_data(b, device)?;
            let bound_n = self.bound_estimate_n(&minibatch)?;
            ntot += bound_n.dim(0)?;
            total += tensor_to_scalar(&bound_n.sum_all()?)?;
        }
        Ok(if ntot > 0 { total / ntot as f64 } else { f64::NAN })
    }
}

impl<M> GenerativeModuleT for AdapterModule<'_, M>
where
    M: LatentLikelihoodT,
{
    fn loss(&self, batch: &MinibatchData, kl_weight: f64, train: bool) -> Result<LossOutput> {
        let (z_mean, z_lnvar) = self.posterior.params(&batch.samples)?;
        let kl_n = gaussian_kl_loss(&z_mean, &z_lnvar)?;

        if self.bound == ObjectiveBound::Elbo && !train {
            let llik_n = self
                .frozen
                .log_likelihood_given_latent(batch, &z_mean)?;
            let reconstruction_n = llik_n.neg()?;
            let loss = (&reconstruction_n + (&kl_n * kl_weight)?)?.mean_all()?;
            return Ok(LossOutput {
                loss,
                reconstruction_n,
                kl_n,
                label_accuracy: None,
            });
        }

        let z_snk = self.sample_paths(&z_mean, &z_lnvar)?;
        let llik_sn = self.path_log_likelihood(batch, &z_snk)?;
        let reconstruction_n = llik_sn.mean(0)?.neg()?;

        let objective_n = match self.bound {
            ObjectiveBound::Elbo => (&reconstruction_n + (&kl_n * kl_weight)?)?,
            ObjectiveBound::Iwelbo => {
                let log_w_sn = self.log_weights(&llik_sn, &z_snk, &z_mean, &z_lnvar)?;
                self.neg_iwelbo_n(&log_w_sn)?
            }
            ObjectiveBound::Cubo => {
                let log_w_sn = self.log_weights(&llik_sn, &z_snk, &z_mean, &z_lnvar)?;
                self.cubo_n(&log_w_sn)?
            }
            ObjectiveBound::Kl => {
                let log_w_sn = self.log_weights(&llik_sn, &z_snk, &z_mean, &z_lnvar)?;
                self.inclusive_kl_n(&log_w_sn, &z_snk, &z_mean, &z_lnvar)?
            }
        };

        Ok(LossOutput {
            loss: objective_n.mean_all()?,
            reconstruction_n,
            kl_n,
            label_accuracy: None,
        })
    }

    fn variable_map(&self) -> &VarMap {
        self.posterior.variable_map()
    }
}

pub struct AdapterOutput {
    /// posterior means (n x k), rows follow `sample_ids`
    pub z_mean: Tensor,
    /// posterior log-variances (n x k)
    pub z_lnvar: Tensor,
    pub sample_ids: Vec<u32>,
    pub bound: ObjectiveBound,
    /// average of `bound_estimate_n` at the initial posterior
    pub initial_bound_value: f64,
    /// average of `bound_estimate_n` after training
    pub bound_value: f64,
    pub training: TrainingResult,
}

///
/// Fit per-sample Gaussian posteriors against a frozen model on one
/// data set, typically a held-out split. Only the posterior parameters
/// are optimized; the model is used to evaluate `log p(x | z)`.
///
/// The set is the training split of the session, so monitors should
/// watch `*_train` metrics.
///
/// * `frozen` - trained model
/// * `data` - every sample it serves gets a posterior row
/// * `config` - bound, number of paths and the training loop setup;
///   `config.train.seed` also seeds the posterior and its draws
///
pub fn adapt<M, D>(
    frozen: &M,
    data: &mut D,
    config: &AdapterConfig,
) -> anyhow::Result<AdapterOutput>
where
    M: LatentLikelihoodT,
    D: DataLoader,
{
    let train = &config.train;
    train.validate()?;
    let mut rng = StdRng::seed_from_u64(train.seed);

    let sample_ids = data.sample_ids().to_vec();
    let posterior =
        AuxiliaryPosterior::new(&sample_ids, frozen.dim_latent(), &train.device, &mut rng)?;
    let noise_seed = rng.random();
    let module = AdapterModule::new(frozen, &posterior, config.bound, config.n_path, noise_seed)?;

    let initial_bound_value =
        module.average_bound(data, train.batch_size, &train.device, &mut rng)?;

    let training = {
        let mut splits = DataSplits::train_only(&mut *data);
        let mut trainer = Trainer::new(&module, train.clone())?;
        trainer.train(&mut splits)?
    };

    let bound_value = module.average_bound(data, train.batch_size, &train.device, &mut rng)?;

    info!(
        "adapter {} bound: {} -> {}",
        config.bound, initial_bound_value, bound_value
    );

    let (z_mean, z_lnvar) = posterior.all_params()?;

    Ok(AdapterOutput {
        z_mean,
        z_lnvar,
        sample_ids,
        bound: config.bound,
        initial_bound_value,
        bound_value,
        training,
    })
}

use crate::candle_loss_functions::gaussian_kl_loss;
use crate::candle_model_traits::*;
use crate::candle_seeded_init::{seeded_linear, GaussianNoise};
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use rand::rngs::StdRng;
use rand::Rng;

/// `log1p(x) -> ReLU MLP -> (mean, log-variance)` with a
/// reparameterized Gaussian sample on the latent
pub struct GaussianEncoder {
    n_features: usize,
    n_latent: usize,
    fc: Vec<Linear>,
    z_mean: Linear,
    z_lnvar: Linear,
    noise: GaussianNoise,
}

impl EncoderModuleT for GaussianEncoder {
    fn forward_t(&self, x_nd: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (z_mean_nk, z_lnvar_nk) = self.latent_gaussian_params(x_nd)?;
        let z_nk = self.reparameterize(&z_mean_nk, &z_lnvar_nk, train)?;
        Ok((z_nk, gaussian_kl_loss(&z_mean_nk, &z_lnvar_nk)?))
    }

    ///
    /// Evaluate latent Gaussian parameters: mu and log_var
    /// z ~ (mu(x), log_var(x))
    fn latent_gaussian_params(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let max_mean = (self.n_features as f64).sqrt();
        let min_lv = -8.;
        let max_lv = 8.;

        let mut h = (x_nd.clamp(0.0, f64::INFINITY)? + 1.0)?.log()?;
        for layer in self.fc.iter() {
            h = layer.forward(&h)?.relu()?;
        }

        let z_mean_nk = self.z_mean.forward(&h)?.clamp(-max_mean, max_mean)?;
        let z_lnvar_nk = self.z_lnvar.forward(&h)?.clamp(min_lv, max_lv)?;
        Ok((z_mean_nk, z_lnvar_nk))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl GaussianEncoder {
    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    fn reparameterize(&self, z_mean: &Tensor, z_lnvar: &Tensor, train: bool) -> Result<Tensor> {
        if train {
            let eps = self.noise.sample(z_mean.shape(), z_mean.device())?;
            z_mean + (z_lnvar * 0.5)?.exp()? * eps
        } else {
            Ok(z_mean.clone())
        }
    }

    /// Will create a new Gaussian encoder with these variables:
    ///
    /// * `enc.fc.{}.weight` where {} is the layer index
    /// * `enc.z.mean.weight`
    /// * `enc.z.lnvar.weight`
    ///
    /// # Arguments
    /// * `n_features` - the number of features
    /// * `n_latent` - latent dimension
    /// * `layers` - fully connected layers, each with the dim
    /// * `vs` - variable builder
    /// * `rng` - draws the initial weights and seeds the sampling noise
    pub fn new(
        n_features: usize,
        n_latent: usize,
        layers: &[usize],
        vs: VarBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut fc = vec![];
        let mut prev_dim = n_features;
        for (j, &next_dim) in layers.iter().enumerate() {
            fc.push(seeded_linear(
                prev_dim,
                next_dim,
                vs.pp(format!("enc.fc.{}", j)),
                rng,
            )?);
            prev_dim = next_dim;
        }

        let z_mean = seeded_linear(prev_dim, n_latent, vs.pp("enc.z.mean"), rng)?;
        let z_lnvar = seeded_linear(prev_dim, n_latent, vs.pp("enc.z.lnvar"), rng)?;
        let noise = GaussianNoise::new(rng.random());

        Ok(Self {
            n_features,
            n_latent,
            fc,
            z_mean,
            z_lnvar,
            noise,
        })
    }
}

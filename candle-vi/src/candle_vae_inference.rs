use crate::candle_data_loader::MinibatchData;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::VarMap;

/// Encoder-decoder pair sharing one `VarMap`
///
/// loss = mean_n [ -log p(x_n | z_n) + kl_weight * KL(q(z_n | x_n) || p(z)) ]
pub struct Vae<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    pub encoder: &'a Enc,
    pub decoder: &'a Dec,
    pub variable_map: &'a VarMap,
}

impl<'a, Enc, Dec> Vae<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    /// Build a VAE model
    /// * `encoder` - encoder module
    /// * `decoder` - decoder module
    /// * `variable_map` - where both keep their parameters
    pub fn build(
        encoder: &'a Enc,
        decoder: &'a Dec,
        variable_map: &'a VarMap,
    ) -> anyhow::Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent() {
            return Err(anyhow::anyhow!(
                "encoder latent dim {} vs. decoder latent dim {}",
                encoder.dim_latent(),
                decoder.dim_latent()
            ));
        }
        if encoder.dim_obs() != decoder.dim_obs() {
            return Err(anyhow::anyhow!(
                "encoder obs dim {} vs. decoder obs dim {}",
                encoder.dim_obs(),
                decoder.dim_obs()
            ));
        }

        Ok(Self {
            encoder,
            decoder,
            variable_map,
        })
    }
}

impl<Enc, Dec> GenerativeModuleT for Vae<'_, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    fn loss(&self, batch: &MinibatchData, kl_weight: f64, train: bool) -> Result<LossOutput> {
        let (z_nk, kl_n) = self.encoder.forward_t(&batch.input, train)?;
        let (_, llik_n) = self.decoder.forward_with_llik(&z_nk, batch.target())?;

        let reconstruction_n = llik_n.neg()?;
        let loss = (&reconstruction_n + (&kl_n * kl_weight)?)?.mean_all()?;

        Ok(LossOutput {
            loss,
            reconstruction_n,
            kl_n,
            label_accuracy: None,
        })
    }

    fn variable_map(&self) -> &VarMap {
        self.variable_map
    }
}

impl<Enc, Dec> LatentLikelihoodT for Vae<'_, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    fn dim_latent(&self) -> usize {
        self.decoder.dim_latent()
    }

    fn log_likelihood_given_latent(&self, batch: &MinibatchData, z_nk: &Tensor) -> Result<Tensor> {
        Ok(self.decoder.forward_with_llik(z_nk, batch.target())?.1)
    }
}

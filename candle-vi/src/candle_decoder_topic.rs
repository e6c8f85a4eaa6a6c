use crate::candle_aux_linear::*;
use crate::candle_loss_functions::topic_likelihood;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Module, VarBuilder};
use rand::rngs::StdRng;

///
/// Multinomial decoder for the Gaussian-latent VAE
///
/// ```text
/// theta(n, k) = softmax(z(n, :))_k
/// beta(d, k)  = softmax(W(:, k))_d
/// x(n, :)    ~ Multinomial( sum_k theta(n, k) * beta(:, k) )
/// ```
///
pub struct TopicDecoder {
    n_features: usize,
    n_topics: usize,
    beta_dk: LogSoftmaxLinear,
}

impl TopicDecoder {
    /// Will create `dictionary.weight` (features x topics)
    pub fn new(
        n_features: usize,
        n_topics: usize,
        vs: VarBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        Ok(Self {
            n_features,
            n_topics,
            beta_dk: log_softmax_linear(n_topics, n_features, vs.pp("dictionary"), rng)?,
        })
    }

    /// theta = softmax(z) (n x k)
    pub fn topic_proportions(&self, z_nk: &Tensor) -> Result<Tensor> {
        ops::softmax(z_nk, 1)
    }
}

impl DecoderModuleT for TopicDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor> {
        self.beta_dk.forward(&self.topic_proportions(z_nk)?)
    }

    fn get_dictionary(&self) -> Result<Tensor> {
        self.beta_dk.weight_dk()
    }

    /// the mixture is formed in log space to keep `log recon` finite
    fn forward_with_llik(&self, z_nk: &Tensor, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let log_theta_nk = ops::log_softmax(z_nk, 1)?;
        let log_recon_nd = self.beta_dk.forward_log(&log_theta_nk)?;
        let llik_n = topic_likelihood(x_nd, &log_recon_nd)?;
        Ok((log_recon_nd.exp()?, llik_n))
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    #[test]
    fn reconstruction_rows_are_distributions() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dec = TopicDecoder::new(7, 3, vb, &mut StdRng::seed_from_u64(0))?;

        let z = Tensor::randn(0f32, 1., (4, 3), &Device::Cpu)?;
        let x = Tensor::ones((4, 7), DType::F32, &Device::Cpu)?;
        let (recon, llik) = dec.forward_with_llik(&z, &x)?;

        assert_eq!(dec.get_dictionary()?.dims(), &[7, 3]);
        for s in recon.sum(1)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
        // llik = sum_d log recon(n, d) with unit counts
        let expected = recon.log()?.sum(1)?.to_vec1::<f32>()?;
        for (a, b) in llik.to_vec1::<f32>()?.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
        Ok(())
    }
}

use crate::candle_data_loader::MinibatchData;
use crate::candle_model_traits::*;
use crate::candle_seeded_init::seeded_linear;

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{ops, Linear, Module, VarBuilder, VarMap};
use rand::rngs::StdRng;

/// `z -> ReLU MLP -> label logits`
pub struct LatentClassifier {
    n_latent: usize,
    n_labels: usize,
    fc: Vec<Linear>,
    logits: Linear,
}

impl LatentClassifier {
    /// Will create these variables:
    /// * `cls.fc.{}.weight` where {} is the layer index
    /// * `cls.logits.weight` (labels x last hidden)
    pub fn new(
        n_latent: usize,
        n_labels: usize,
        layers: &[usize],
        vs: VarBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut fc = vec![];
        let mut prev_dim = n_latent;
        for (j, &next_dim) in layers.iter().enumerate() {
            fc.push(seeded_linear(
                prev_dim,
                next_dim,
                vs.pp(format!("cls.fc.{}", j)),
                rng,
            )?);
            prev_dim = next_dim;
        }
        let logits = seeded_linear(prev_dim, n_labels, vs.pp("cls.logits"), rng)?;
        Ok(Self {
            n_latent,
            n_labels,
            fc,
            logits,
        })
    }

    pub fn dim_latent(&self) -> usize {
        self.n_latent
    }

    pub fn num_labels(&self) -> usize {
        self.n_labels
    }
}

impl Module for LatentClassifier {
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor> {
        let mut h = z_nk.clone();
        for layer in self.fc.iter() {
            h = layer.forward(&h)?.relu()?;
        }
        self.logits.forward(&h)
    }
}

///
/// Semi-supervised VAE: the `Vae` objective plus a classifier on the
/// posterior mean of the latent states
///
/// ```text
/// loss = mean_n [ -log p(x_n | z_n) + kl_weight * KL_n ]
///      + classification_ratio * mean_{n labelled} CE(y_n, f(mu(x_n)))
/// ```
///
/// Samples labelled `unlabeled` only enter the ELBO.
///
pub struct LabelledVae<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    pub encoder: &'a Enc,
    pub decoder: &'a Dec,
    pub classifier: &'a LatentClassifier,
    pub variable_map: &'a VarMap,
    classification_ratio: f64,
    unlabeled: Option<u32>,
}

impl<'a, Enc, Dec> LabelledVae<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    /// * `classification_ratio` - weight of the cross-entropy term
    /// * `unlabeled` - label of samples without a known class
    pub fn build(
        encoder: &'a Enc,
        decoder: &'a Dec,
        classifier: &'a LatentClassifier,
        variable_map: &'a VarMap,
        classification_ratio: f64,
        unlabeled: Option<u32>,
    ) -> anyhow::Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent()
            || encoder.dim_latent() != classifier.dim_latent()
        {
            return Err(anyhow::anyhow!(
                "latent dims differ: encoder {}, decoder {}, classifier {}",
                encoder.dim_latent(),
                decoder.dim_latent(),
                classifier.dim_latent()
            ));
        }
        if encoder.dim_obs() != decoder.dim_obs() {
            return Err(anyhow::anyhow!(
                "encoder obs dim {} vs. decoder obs dim {}",
                encoder.dim_obs(),
                decoder.dim_obs()
            ));
        }
        if classification_ratio.is_nan() || classification_ratio < 0.0 {
            return Err(anyhow::anyhow!(
                "classification ratio must be non-negative, got {}",
                classification_ratio
            ));
        }

        Ok(Self {
            encoder,
            decoder,
            classifier,
            variable_map,
            classification_ratio,
            unlabeled,
        })
    }

    /// Label probabilities at the posterior mean (n x labels)
    pub fn classify(&self, x_nd: &Tensor) -> Result<Tensor> {
        let (z_mean_nk, _) = self.encoder.latent_gaussian_params(x_nd)?;
        ops::softmax(&self.classifier.forward(&z_mean_nk)?, 1)
    }

    /// rows whose label is known, checked against the classifier
    fn labelled_rows(&self, labels: &Tensor) -> Result<Vec<u32>> {
        let n_labels = self.classifier.num_labels() as u32;
        let mut rows = vec![];
        for (i, y) in labels.to_vec1::<u32>()?.into_iter().enumerate() {
            if Some(y) == self.unlabeled {
                continue;
            }
            if y >= n_labels {
                return Err(candle_core::Error::Msg(format!(
                    "label {} out of range (n_labels = {})",
                    y, n_labels
                )));
            }
            rows.push(i as u32);
        }
        Ok(rows)
    }

    /// `(cross entropy, accuracy)` over the labelled samples
    fn classification_loss(
        &self,
        x_nd: &Tensor,
        labels: &Tensor,
    ) -> Result<Option<(Tensor, LabelAccuracy)>> {
        let rows = self.labelled_rows(labels)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let m = rows.len();
        let rows = Tensor::from_vec(rows, m, labels.device())?;
        let x_md = x_nd.index_select(&rows, 0)?;
        let (z_mean_mk, _) = self.encoder.latent_gaussian_params(&x_md)?;
        let logits_ml = self.classifier.forward(&z_mean_mk)?;
        let y_m = labels.index_select(&rows, 0)?;

        let ce = candle_nn::loss::cross_entropy(&logits_ml, &y_m)?;

        let correct = logits_ml
            .argmax(D::Minus1)?
            .eq(&y_m)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()? as usize;

        let accuracy = LabelAccuracy {
            correct,
            labelled: y_m.dim(0)?,
        };
        Ok(Some((ce, accuracy)))
    }
}

impl<Enc, Dec> GenerativeModuleT for LabelledVae<'_, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    fn loss(&self, batch: &MinibatchData, kl_weight: f64, train: bool) -> Result<LossOutput> {
        let (z_nk, kl_n) = self.encoder.forward_t(&batch.input, train)?;
        let (_, llik_n) = self.decoder.forward_with_llik(&z_nk, batch.target())?;

        let reconstruction_n = llik_n.neg()?;
        let loss = (&reconstruction_n + (&kl_n * kl_weight)?)?.mean_all()?;

        let labels = batch
            .labels
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("labels are required".into()))?;

        let (loss, label_accuracy) = match self.classification_loss(&batch.input, labels)? {
            Some((ce, accuracy)) => ((loss + (ce * self.classification_ratio)?)?, Some(accuracy)),
            None => (loss, None),
        };

        Ok(LossOutput {
            loss,
            reconstruction_n,
            kl_n,
            label_accuracy,
        })
    }

    fn variable_map(&self) -> &VarMap {
        self.variable_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_decoder_topic::TopicDecoder;
    use crate::candle_encoder_gaussian::GaussianEncoder;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use rand::SeedableRng;

    struct Parts {
        varmap: VarMap,
        encoder: GaussianEncoder,
        decoder: TopicDecoder,
        classifier: LatentClassifier,
    }

    fn parts() -> Result<Parts> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        Ok(Parts {
            encoder: GaussianEncoder::new(5, 2, &[4], vb.clone(), &mut rng)?,
            decoder: TopicDecoder::new(5, 2, vb.clone(), &mut rng)?,
            classifier: LatentClassifier::new(2, 3, &[4], vb, &mut rng)?,
            varmap,
        })
    }

    fn batch(labels: &[u32]) -> Result<MinibatchData> {
        let n = labels.len();
        Ok(MinibatchData {
            input: Tensor::ones((n, 5), DType::F32, &Device::Cpu)?,
            output: None,
            labels: Some(Tensor::new(labels, &Device::Cpu)?),
            samples: Tensor::arange(0u32, n as u32, &Device::Cpu)?,
        })
    }

    #[test]
    fn accuracy_counts_only_labelled_samples() -> anyhow::Result<()> {
        let p = parts()?;
        let model =
            LabelledVae::build(&p.encoder, &p.decoder, &p.classifier, &p.varmap, 1.0, Some(3))?;

        let out = model.loss(&batch(&[0, 3, 2, 3])?, 1.0, false)?;
        let acc = out.label_accuracy.expect("two labelled samples");
        assert_eq!(acc.labelled, 2);
        assert!(acc.correct <= 2);

        let out = model.loss(&batch(&[3, 3])?, 1.0, false)?;
        assert!(out.label_accuracy.is_none());

        assert!(model.loss(&batch(&[0, 4])?, 1.0, false).is_err());

        let probs = model.classify(&batch(&[0, 1])?.input)?;
        assert_eq!(probs.dims(), &[2, 3]);
        for s in probs.sum(1)?.to_vec1::<f32>()? {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn classification_term_adds_to_the_elbo() -> anyhow::Result<()> {
        let p = parts()?;
        let build = |ratio: f64| {
            LabelledVae::build(&p.encoder, &p.decoder, &p.classifier, &p.varmap, ratio, None)
        };
        let plain = build(0.0)?;
        let weighted = build(2.0)?;

        let mb = batch(&[0, 1, 2])?;
        let base = plain.loss(&mb, 1.0, false)?.loss.to_scalar::<f32>()?;
        let more = weighted.loss(&mb, 1.0, false)?.loss.to_scalar::<f32>()?;
        // cross entropy is positive
        assert!(more > base);
        Ok(())
    }
}

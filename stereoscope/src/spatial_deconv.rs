use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vi::candle_data_loader::MinibatchData;
use candle_vi::candle_loss_functions::*;
use candle_vi::candle_model_traits::*;
use candle_vi::candle_seeded_init::{seeded_var, SeededInit};
use clap::ValueEnum;
use rand::rngs::StdRng;

/// How the minibatch likelihood is weighed against the prior on `eta`
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "kebab-case")]
pub enum PriorWeight {
    /// scale the batch mean by the number of spots
    NObs,
    /// plain sum over the batch
    Minibatch,
}

///
/// Spatial spots as mixtures of cell types learned by `RnaDeconv`
///
/// ```text
/// r(g, t)   = softplus(beta)(g) * W(g, t)      for t < T
/// r(g, T)   = softplus(eta)(g)                 (noise type)
/// x(n, g)   ~ NB( sum_t softplus(V)(t, n) * r(g, t), logits = px_o(g) )
/// eta(g)    ~ N(0, 1)
/// ```
///
/// `W` and `px_o` stay fixed; `V`, `beta` and `eta` are learned.
///
pub struct SpatialDeconv {
    n_spots: usize,
    n_labels: usize,
    w_gl: Tensor,
    px_o_g: Tensor,
    v_ls: Tensor,
    beta_g: Tensor,
    eta_g: Tensor,
    prior_weight: PriorWeight,
    variable_map: VarMap,
}

impl SpatialDeconv {
    /// Will create these variables:
    /// * `spatial.v` ((labels + 1) x spots)
    /// * `spatial.beta` (genes)
    /// * `spatial.eta` (genes)
    ///
    /// # Arguments
    /// * `n_spots` - number of spots; minibatch sample ids index them
    /// * `px_o_g` - NB logits from the single-cell model (genes)
    /// * `w_gl` - softplus-transformed cell type profiles (genes x labels)
    /// * `prior_weight` - minibatch reweighting
    /// * `rng` - draws the initial values
    pub fn new(
        n_spots: usize,
        px_o_g: &Tensor,
        w_gl: &Tensor,
        prior_weight: PriorWeight,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let (n_genes, n_labels) = w_gl.dims2()?;
        if px_o_g.dims() != [n_genes] {
            return Err(candle_core::Error::Msg(format!(
                "px_o has shape {:?}, expected [{}]",
                px_o_g.dims(),
                n_genes
            )));
        }

        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);

        let std_normal = SeededInit::Randn {
            mean: 0.,
            stdev: 1.,
        };
        let v_ls = seeded_var(&vb, (n_labels + 1, n_spots), "spatial.v", std_normal, rng)?;
        let beta_g = seeded_var(
            &vb,
            n_genes,
            "spatial.beta",
            SeededInit::Randn {
                mean: 0.,
                stdev: 0.01,
            },
            rng,
        )?;
        let eta_g = seeded_var(&vb, n_genes, "spatial.eta", std_normal, rng)?;

        Ok(Self {
            n_spots,
            n_labels,
            w_gl: w_gl.to_dtype(DType::F32)?.to_device(device)?.detach(),
            px_o_g: px_o_g.to_dtype(DType::F32)?.to_device(device)?.detach(),
            v_ls,
            beta_g,
            eta_g,
            prior_weight,
            variable_map,
        })
    }

    pub fn num_spots(&self) -> usize {
        self.n_spots
    }

    ///
    /// Cell type proportions per spot (spots x labels), or
    /// (spots x (labels + 1)) with the noise type kept. Rows sum to one.
    ///
    pub fn get_proportions(&self, keep_noise: bool) -> Result<Tensor> {
        let prop_sl = softplus(&self.v_ls)?.t()?.contiguous()?;
        let prop_sl = if keep_noise {
            prop_sl
        } else {
            prop_sl.narrow(1, 0, self.n_labels)?
        };
        prop_sl
            .broadcast_div(&prop_sl.sum_keepdim(1)?)?
            .detach()
            .copy()
    }

    /// r = [softplus(beta) * W | softplus(eta)] (genes x (labels + 1))
    fn rate_dictionary(&self) -> Result<Tensor> {
        let beta_g1 = softplus(&self.beta_g)?.unsqueeze(1)?;
        let eta_g1 = softplus(&self.eta_g)?.unsqueeze(1)?;
        let r_gl = self.w_gl.broadcast_mul(&beta_g1)?;
        Tensor::cat(&[&r_gl, &eta_g1], 1)
    }

    fn spot_index(&self, samples: &Tensor) -> Result<Tensor> {
        let ids = samples.to_vec1::<u32>()?;
        if let Some(bad) = ids.iter().find(|&&i| i as usize >= self.n_spots) {
            return Err(candle_core::Error::Msg(format!(
                "spot {} out of range (n_spots = {})",
                bad, self.n_spots
            )));
        }
        Ok(samples.clone())
    }

    /// -log N(eta | 0, I)
    fn neg_log_prior(&self) -> Result<Tensor> {
        standard_normal_log_density(&self.eta_g)?.neg()
    }
}

impl GenerativeModuleT for SpatialDeconv {
    fn loss(&self, batch: &MinibatchData, _kl_weight: f64, _train: bool) -> Result<LossOutput> {
        let x_ng = batch.target();
        let n = x_ng.dim(0)?;
        let spots = self.spot_index(&batch.samples)?;

        let v_nl = softplus(&self.v_ls)?
            .t()?
            .contiguous()?
            .index_select(&spots, 0)?;
        let rate_ng = v_nl.matmul(&self.rate_dictionary()?.t()?)?;

        let reconstruction_n = nb_log_likelihood(x_ng, &rate_ng, &self.px_o_g)?.neg()?;
        let neg_log_prior = self.neg_log_prior()?;

        let loss = match self.prior_weight {
            PriorWeight::NObs => (reconstruction_n.mean_all()? * self.n_spots as f64)?,
            PriorWeight::Minibatch => reconstruction_n.sum_all()?,
        }
        .add(&neg_log_prior)?;

        // spread the prior evenly over spots for reporting
        let kl_n = (neg_log_prior / self.n_spots as f64)?.broadcast_as(n)?;

        Ok(LossOutput {
            loss,
            reconstruction_n,
            kl_n,
            label_accuracy: None,
        })
    }

    fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }
}

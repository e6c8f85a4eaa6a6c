use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vi::candle_data_loader::MinibatchData;
use candle_vi::candle_loss_functions::{nb_log_likelihood, softplus};
use candle_vi::candle_model_traits::*;
use candle_vi::candle_seeded_init::{seeded_var, SeededInit};
use rand::rngs::StdRng;

///
/// Negative binomial model of single-cell counts given cell types
///
/// ```text
/// x(n,g) ~ NB( total_count = l(n) * softplus(W)(g, y(n)), logits = px_o(g) )
/// ```
///
/// where `l(n)` is the library size of cell `n` and `y(n)` its label.
///
pub struct RnaDeconv {
    n_genes: usize,
    n_labels: usize,
    w_gl: Tensor,
    px_o_g: Tensor,
    variable_map: VarMap,
}

impl RnaDeconv {
    /// Will create these variables, `N(0, 1)` from `rng`:
    /// * `rna.w` (genes x labels)
    /// * `rna.px_o` (genes)
    pub fn new(
        n_genes: usize,
        n_labels: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let variable_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&variable_map, DType::F32, device);
        let std_normal = SeededInit::Randn {
            mean: 0.,
            stdev: 1.,
        };
        let w_gl = seeded_var(&vb, (n_genes, n_labels), "rna.w", std_normal, rng)?;
        let px_o_g = seeded_var(&vb, n_genes, "rna.px_o", std_normal, rng)?;
        Ok(Self {
            n_genes,
            n_labels,
            w_gl,
            px_o_g,
            variable_map,
        })
    }

    pub fn num_genes(&self) -> usize {
        self.n_genes
    }

    pub fn num_labels(&self) -> usize {
        self.n_labels
    }

    /// Parameters for the spatial model: `(px_o, softplus(W))`,
    /// detached from the graph
    pub fn get_params(&self) -> Result<(Tensor, Tensor)> {
        Ok((
            self.px_o_g.copy()?.detach(),
            softplus(&self.w_gl)?.detach(),
        ))
    }

    /// per-cell negative log-likelihood (n,)
    fn reconstruction_loss(&self, batch: &MinibatchData) -> Result<Tensor> {
        let labels = batch
            .labels
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("cell type labels are required".into()))?;

        let x_ng = batch.target();
        let lib_n1 = x_ng.sum_keepdim(1)?;
        let w_lg = softplus(&self.w_gl)?.t()?.contiguous()?;
        let rate_ng = w_lg.index_select(labels, 0)?.broadcast_mul(&lib_n1)?;

        nb_log_likelihood(x_ng, &rate_ng, &self.px_o_g)?.neg()
    }
}

impl GenerativeModuleT for RnaDeconv {
    fn loss(&self, batch: &MinibatchData, _kl_weight: f64, _train: bool) -> Result<LossOutput> {
        let reconstruction_n = self.reconstruction_loss(batch)?;
        let kl_n = reconstruction_n.zeros_like()?;
        Ok(LossOutput {
            loss: reconstruction_n.mean_all()?,
            reconstruction_n,
            kl_n,
            label_accuracy: None,
        })
    }

    fn variable_map(&self) -> &VarMap {
        &self.variable_map
    }
}

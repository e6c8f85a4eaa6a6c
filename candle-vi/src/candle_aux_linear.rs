use crate::candle_seeded_init::{seeded_var, SeededInit};
use candle_core::{Result, Tensor};
use candle_nn::{ops, Module};
use rand::rngs::StdRng;

////////////////////////////////////
// Linear module with log-softmax //
////////////////////////////////////

/// `h_nk -> h_nk * softmax(W)^T` where the softmax runs over the output
/// features, so every column of the dictionary is a distribution
#[derive(Clone, Debug)]
pub struct LogSoftmaxLinear {
    weight_dk: Tensor,
}

impl LogSoftmaxLinear {
    pub fn new(weight_dk: Tensor) -> Self {
        Self { weight_dk }
    }

    /// log dictionary (d x k), each column sums to one after `exp`
    pub fn log_weight_dk(&self) -> Result<Tensor> {
        ops::log_softmax(&self.weight_dk, 0)
    }

    pub fn weight_dk(&self) -> Result<Tensor> {
        self.log_weight_dk()?.exp()
    }

    /// log of the mixture `h_nk * dictionary^T` computed in log space
    ///
    /// log recon(n, d) = logsumexp_k [ log h(n, k) + log W(d, k) ]
    ///
    /// * `log_h_nk` - log mixing proportions (n x k)
    pub fn forward_log(&self, log_h_nk: &Tensor) -> Result<Tensor> {
        let log_w_1dk = self.log_weight_dk()?.unsqueeze(0)?;
        let log_h_n1k = log_h_nk.unsqueeze(1)?;
        let log_nd = log_h_n1k.broadcast_add(&log_w_1dk)?;
        crate::candle_loss_functions::logsumexp(&log_nd, 2)
    }
}

impl Module for LogSoftmaxLinear {
    fn forward(&self, h_nk: &Tensor) -> Result<Tensor> {
        h_nk.matmul(&self.weight_dk()?.t()?)
    }
}

/// Will create `weight` (out_dim x in_dim), Kaiming-normal over the
/// fan-in, drawn from `rng`
pub fn log_softmax_linear(
    in_dim: usize,
    out_dim: usize,
    vb: candle_nn::VarBuilder,
    rng: &mut StdRng,
) -> Result<LogSoftmaxLinear> {
    let init_ws = SeededInit::Randn {
        mean: 0.,
        stdev: (2. / in_dim.max(1) as f32).sqrt(),
    };
    let ws = seeded_var(&vb, (out_dim, in_dim), "weight", init_ws, rng)?;
    Ok(LogSoftmaxLinear::new(ws))
}

use candle_core::{Result, Tensor};

const LN_2PI: f64 = 1.8378770664093453;

/// KL divergence loss between two Gaussian distributions
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// Topic model log-likelihood of multinomial data
///
/// llik(i) = sum_w x(i,w) * log pr(i,w)
///
/// * `x_nd` - data tensor (observed data)
/// * `log_recon_nd` - log-probability tensor (reconstruction)
///
pub fn topic_likelihood(x_nd: &Tensor, log_recon_nd: &Tensor) -> Result<Tensor> {
    x_nd.clamp(0.0, f64::INFINITY)?
        .mul(log_recon_nd)?
        .sum(x_nd.rank() - 1)
}

/// -0.0810614667f - x - log(x) + (0.5f + x) * log(1.0f + x);
pub fn approx_lgamma(x: &Tensor) -> Result<Tensor> {
    let term1 = (x.neg()? - 0.0810614667)?;
    let term2 = x.log()?.neg()?;
    let term3 = (x + 0.5)?.mul(&(x + 1.0)?.log()?)?;
    term1.add(&term2)?.add(&term3)
}

/// softplus(x) = log(1 + exp(x)) = max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()?.add(&tail)
}

/// Negative binomial log-likelihood with `total_count` and `logits`
/// parameterization; mean = total_count * exp(logits)
///
/// llik(i) = sum_g lgamma(x + r) - lgamma(r) - lgamma(x + 1)
///                 + x * o - (r + x) * softplus(o)
///
/// * `x_ng` - observed counts (n x g)
/// * `total_count_ng` - `r` (n x g), strictly positive
/// * `logits_g` - `o` broadcast against `x_ng`
///
pub fn nb_log_likelihood(x_ng: &Tensor, total_count_ng: &Tensor, logits_g: &Tensor) -> Result<Tensor> {
    let r_ng = (total_count_ng + 1e-8)?;
    let x_ng = x_ng.clamp(0.0, f64::INFINITY)?;

    let lgam = approx_lgamma(&(&x_ng + &r_ng)?)?
        .sub(&approx_lgamma(&r_ng)?)?
        .sub(&approx_lgamma(&(&x_ng + 1.0)?)?)?;

    let xo = x_ng.broadcast_mul(logits_g)?;
    let rx_sp = (&r_ng + &x_ng)?.broadcast_mul(&softplus(logits_g)?)?;

    lgam.add(&xo)?.sub(&rx_sp)?.sum(x_ng.rank() - 1)
}

/// Gaussian log density summed over the last axis
///
/// log N(z | mu, exp(lnvar)) = -0.5 * sum_k [ log(2 pi) + lnvar + (z - mu)^2 / exp(lnvar) ]
///
pub fn gaussian_log_density(z: &Tensor, mean: &Tensor, lnvar: &Tensor) -> Result<Tensor> {
    let sq = z.broadcast_sub(mean)?.sqr()?;
    let quad = sq.broadcast_div(&lnvar.exp()?)?;
    let lnvar = lnvar.broadcast_as(quad.shape())?;
    ((quad + lnvar)? + LN_2PI)?.sum(z.rank() - 1)? * (-0.5)
}

/// log N(z | 0, I) summed over the last axis
pub fn standard_normal_log_density(z: &Tensor) -> Result<Tensor> {
    (z.sqr()? + LN_2PI)?.sum(z.rank() - 1)? * (-0.5)
}

/// Numerically stable log(sum(exp(x))) along `dim`, which is removed
pub fn logsumexp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    let lse = x
        .broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .add(&max)?;
    lse.squeeze(dim)
}

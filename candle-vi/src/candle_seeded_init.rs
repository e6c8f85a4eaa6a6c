use candle_core::{Device, Result, Shape, Tensor, Var};
use candle_nn::{Init, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::sync::Mutex;

/// Initial values drawn from a caller-owned random source instead of
/// candle's global one, so a fixed seed gives a fixed model
#[derive(Debug, Clone, Copy)]
pub enum SeededInit {
    Const(f32),
    Randn { mean: f32, stdev: f32 },
    Uniform { lb: f32, ub: f32 },
}

impl SeededInit {
    pub fn sample<R: Rng>(&self, shape: &Shape, device: &Device, rng: &mut R) -> Result<Tensor> {
        let n = shape.elem_count();
        let values: Vec<f32> = match *self {
            SeededInit::Const(c) => vec![c; n],
            SeededInit::Randn { mean, stdev } => (0..n)
                .map(|_| {
                    let z: f32 = StandardNormal.sample(rng);
                    mean + stdev * z
                })
                .collect(),
            SeededInit::Uniform { lb, ub } => {
                if lb >= ub {
                    vec![lb; n]
                } else {
                    (0..n).map(|_| rng.random_range(lb..ub)).collect()
                }
            }
        };
        Tensor::from_vec(values, shape.clone(), device)
    }
}

/// `N(mean, stdev^2)` tensor of `shape` drawn from `rng`
pub fn randn_from<R: Rng, S: Into<Shape>>(
    rng: &mut R,
    mean: f32,
    stdev: f32,
    shape: S,
    device: &Device,
) -> Result<Tensor> {
    SeededInit::Randn { mean, stdev }.sample(&shape.into(), device, rng)
}

///
/// Register `name` under `vb` and fill it from `rng`. The returned
/// tensor is the variable itself, so the optimizer sees it.
///
pub fn seeded_var<S: Into<Shape>>(
    vb: &VarBuilder,
    shape: S,
    name: &str,
    init: SeededInit,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let shape = shape.into();
    let tensor = vb.get_with_hints(shape.clone(), name, Init::Const(0.))?;
    let values = init.sample(&shape, tensor.device(), rng)?;
    Var::from_tensor(&tensor)?.set(&values)?;
    Ok(tensor)
}

/// Same variables as `candle_nn::linear` (`weight`, `bias`) with the
/// same uniform fan-in scale, drawn from `rng`
pub fn seeded_linear(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
    rng: &mut StdRng,
) -> Result<Linear> {
    let bound = 1. / (in_dim.max(1) as f32).sqrt();
    let init = SeededInit::Uniform {
        lb: -bound,
        ub: bound,
    };
    let weight = seeded_var(&vb, (out_dim, in_dim), "weight", init, rng)?;
    let bias = seeded_var(&vb, out_dim, "bias", init, rng)?;
    Ok(Linear::new(weight, Some(bias)))
}

///
/// Seeded `N(0, 1)` noise for stochastic forward passes. Modules only
/// get `&self` in `loss`, hence the lock.
///
pub struct GaussianNoise {
    rng: Mutex<StdRng>,
}

impl GaussianNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn sample<S: Into<Shape>>(&self, shape: S, device: &Device) -> Result<Tensor> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| candle_core::Error::Msg("noise source lock poisoned".into()))?;
        randn_from(&mut *rng, 0., 1., shape, device)
    }
}

use crate::common::*;

use clap::Args;
use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{weighted::WeightedIndex, Distribution, Gamma, Poisson};
use rayon::prelude::*;

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// number of genes
    #[arg(short = 'g', long, default_value_t = 200)]
    pub n_genes: usize,

    /// number of cell types
    #[arg(short = 't', long, default_value_t = 5)]
    pub n_types: usize,

    /// number of single cells
    #[arg(short = 'c', long, default_value_t = 1000)]
    pub n_cells: usize,

    /// number of spatial spots
    #[arg(short = 's', long, default_value_t = 200)]
    pub n_spots: usize,

    /// number of cells mixed into each spot
    #[arg(long, default_value_t = 10)]
    pub cells_per_spot: usize,

    /// expected total count per cell
    #[arg(short, long, default_value_t = 1000.0)]
    pub depth: f32,

    /// gamma shape of the gene expression profiles
    #[arg(long, default_value_t = 0.5)]
    pub profile_shape: f32,

    /// negative binomial overdispersion (gamma shape of the cell-level noise)
    #[arg(long, default_value_t = 10.0)]
    pub overdisp: f32,

    /// concentration of the spot-level cell type proportions
    #[arg(long, default_value_t = 1.0)]
    pub alpha: f32,

    /// random seed
    #[arg(long, default_value_t = 42)]
    pub rseed: u64,

    /// output header
    #[arg(long, short, required = true)]
    pub out: Box<str>,
}

pub struct SimOut {
    /// expression profiles, each column sums to one (genes x types)
    pub profiles_gt: Array2<f32>,
    /// single-cell counts (cells x genes)
    pub sc_counts: Array2<f32>,
    pub sc_labels: Vec<u32>,
    /// spatial counts (spots x genes)
    pub st_counts: Array2<f32>,
    /// true cell type fractions (spots x types)
    pub proportions: Array2<f32>,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    info!("Simulating single-cell and spatial data...");
    let sim = generate(args)?;

    mkdir_parent(&args.out)?;
    let out = args.out.as_ref();

    let names: Vec<String> = (0..args.n_types).map(|t| format!("type_{}", t)).collect();
    let labels: Vec<&str> = sim
        .sc_labels
        .iter()
        .map(|&t| names[t as usize].as_str())
        .collect();

    write_dense_matrix(&sim.sc_counts, &format!("{}.sc_counts.tsv.gz", out))?;
    write_lines(&labels, &format!("{}.sc_labels.txt", out))?;
    write_dense_matrix(&sim.st_counts, &format!("{}.st_counts.tsv.gz", out))?;
    write_dense_matrix(&sim.proportions, &format!("{}.proportions.tsv.gz", out))?;
    write_dense_matrix(&sim.profiles_gt, &format!("{}.profiles.tsv.gz", out))?;
    write_lines(&names, &format!("{}.types.txt", out))?;

    info!("wrote {}.*", out);
    Ok(())
}

/// Generate
///
/// ```text
/// mu(g,t)   ~ Gamma(profile_shape, 1), normalized over g
/// x(n,g)    ~ Poisson( depth * mu(g, t(n)) * u(n,g) ),  u ~ Gamma(overdisp, 1/overdisp)
/// theta(s)  ~ Dirichlet(alpha)
/// t(s,c)    ~ Categorical(theta(s)),  c = 1 .. cells_per_spot
/// y(s,g)    = sum_c x(s,c,g)
/// ```
///
/// The reported proportions are the realized fractions of cell types
/// in each spot.
///
pub fn generate(args: &SimulateArgs) -> anyhow::Result<SimOut> {
    if args.n_types == 0 || args.n_genes == 0 {
        return Err(anyhow::anyhow!("need at least one gene and one cell type"));
    }
    if args.cells_per_spot == 0 {
        return Err(anyhow::anyhow!("cells_per_spot must be positive"));
    }

    let n_genes = args.n_genes;
    let n_types = args.n_types;
    let mut rng = StdRng::seed_from_u64(args.rseed);

    // expression profiles
    let rgamma = Gamma::new(args.profile_shape, 1.0)?;
    let mut profiles_gt = Array2::from_shape_fn((n_genes, n_types), |_| rgamma.sample(&mut rng));
    for mut col in profiles_gt.columns_mut() {
        let tot = col.sum().max(f32::MIN_POSITIVE);
        col.mapv_inplace(|x| x / tot);
    }

    let noise = Gamma::new(args.overdisp, 1.0 / args.overdisp)?;

    let sample_cell = |t: usize, rng: &mut StdRng| -> anyhow::Result<Vec<f32>> {
        profiles_gt
            .column(t)
            .iter()
            .map(|&mu| -> anyhow::Result<f32> {
                let lambda = args.depth * mu * noise.sample(rng);
                if lambda > 0.0 {
                    Ok(Poisson::new(lambda)?.sample(rng))
                } else {
                    Ok(0.0)
                }
            })
            .collect()
    };

    // single cells, balanced over types
    let sc_labels: Vec<u32> = (0..args.n_cells).map(|n| (n % n_types) as u32).collect();
    let cell_seed = args.rseed.wrapping_add(1);

    let sc_rows = sc_labels
        .par_iter()
        .enumerate()
        .map(|(n, &t)| {
            let mut rng = StdRng::seed_from_u64(cell_seed.wrapping_add(n as u64));
            sample_cell(t as usize, &mut rng)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    info!("sampled {} cells x {} genes", args.n_cells, n_genes);

    // spots
    let spot_seed = cell_seed.wrapping_add(args.n_cells as u64);
    let dirichlet = Gamma::new(args.alpha, 1.0)?;

    let spots = (0..args.n_spots)
        .into_par_iter()
        .map(|s| -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
            let mut rng = StdRng::seed_from_u64(spot_seed.wrapping_add(s as u64));

            // normalized gamma draws give a Dirichlet sample
            let theta: Vec<f32> = (0..n_types).map(|_| dirichlet.sample(&mut rng)).collect();
            let theta = if theta.iter().sum::<f32>() > 0.0 {
                theta
            } else {
                vec![1.0; n_types]
            };
            let types = WeightedIndex::new(&theta)?;

            let mut y_g = vec![0.0; n_genes];
            let mut ncells_t = vec![0.0; n_types];
            for _ in 0..args.cells_per_spot {
                let t = types.sample(&mut rng);
                ncells_t[t] += 1.0;
                for (y, x) in y_g.iter_mut().zip(sample_cell(t, &mut rng)?) {
                    *y += x;
                }
            }

            let frac_t = ncells_t
                .iter()
                .map(|&c| c / args.cells_per_spot as f32)
                .collect();
            Ok((y_g, frac_t))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    info!("mixed {} spots", args.n_spots);

    let (st_rows, prop_rows): (Vec<_>, Vec<_>) = spots.into_iter().unzip();

    Ok(SimOut {
        sc_counts: stack_rows(sc_rows, n_genes)?,
        sc_labels,
        st_counts: stack_rows(st_rows, n_genes)?,
        proportions: stack_rows(prop_rows, n_types)?,
        profiles_gt,
    })
}

fn stack_rows(rows: Vec<Vec<f32>>, ncols: usize) -> anyhow::Result<Array2<f32>> {
    let nrows = rows.len();
    Ok(Array2::from_shape_vec(
        (nrows, ncols),
        rows.into_iter().flatten().collect(),
    )?)
}

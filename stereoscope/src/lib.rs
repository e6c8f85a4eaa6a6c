pub mod common;
pub mod fit_rna;
pub mod fit_spatial;
pub mod rna_deconv;
pub mod simulate;
pub mod spatial_deconv;
pub mod train_args;

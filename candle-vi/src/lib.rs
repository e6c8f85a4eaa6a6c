pub mod candle_adapter;
pub mod candle_aux_linear;
pub mod candle_callbacks;
pub mod candle_data_loader;
pub mod candle_decoder_topic;
pub mod candle_encoder_gaussian;
pub mod candle_inference;
pub mod candle_kl_annealing;
pub mod candle_loss_functions;
pub mod candle_metric_monitor;
pub mod candle_model_traits;
pub mod candle_param_snapshot;
pub mod candle_seeded_init;
pub mod candle_train_error;
pub mod candle_trainer;
pub mod candle_vae_inference;
pub mod candle_vaec_inference;

pub use candle_core;
pub use candle_nn;

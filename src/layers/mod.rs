use candle_nn::init::Init;
use candle_nn::{Linear, VarBuilder};

pub mod attention;

mod embeddings;
pub use embeddings::{SinusoidalEmbeddings, SinusoidalEmbeddingsError};

mod feedforward;
pub use feedforward::PointwiseFeedForward;

mod history;
pub use history::{LayerHistory, LayerHistoryError};

mod layer_norm;
pub use layer_norm::{LayerNorm, LayerNormError};

/// Scaled uniform initialization for a dense weight.
pub(crate) fn scaled_uniform(in_dim: usize, out_dim: usize) -> Init {
    let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Dense layer with scaled uniform weights and zero bias.
pub(crate) fn dense(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
) -> Result<Linear, candle_core::Error> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", scaled_uniform(in_dim, out_dim))?;
    let bias = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Dense layer without a bias.
pub(crate) fn dense_no_bias(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
) -> Result<Linear, candle_core::Error> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", scaled_uniform(in_dim, out_dim))?;
    Ok(Linear::new(weight, None))
}

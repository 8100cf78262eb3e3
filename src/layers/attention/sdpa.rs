use candle_core::{DType, Tensor};
use candle_nn::ops::softmax;
use candle_nn::Dropout;
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, AttentionMaskError, AttentionScorer};

/// Errors for scaled dot-product attention.
#[derive(Debug, Snafu)]
pub enum ScaledDotProductAttentionError {
    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: AttentionMaskError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention weights"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot apply softmax temperature"))]
    Temperature { source: candle_core::Error },
}

/// Scaled dot-product attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct ScaledDotProductAttention {
    dropout: Dropout,
}

impl ScaledDotProductAttention {
    /// Construct a scaled dot-product attention module.
    ///
    /// * `dropout` - Dropout to apply to the attention weights.
    pub fn new(dropout: Dropout) -> Self {
        ScaledDotProductAttention { dropout }
    }
}

impl AttentionScorer for ScaledDotProductAttention {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        // Scores and softmax are computed in full precision.
        let query = query
            .contiguous()
            .and_then(|query| query.to_dtype(DType::F32))
            .context(AttentionScoresSnafu)?;
        let mut attn_scores = key
            .contiguous()
            .and_then(|key| key.to_dtype(DType::F32))
            .and_then(|key| key.transpose(3, 2))
            .and_then(|key| query.broadcast_matmul(&key))
            .context(AttentionScoresSnafu)?;

        let head_width = key.dim(3).context(TemperatureSnafu)?;
        let temperature = (head_width as f64).sqrt();
        attn_scores = (attn_scores / temperature).context(TemperatureSnafu)?;

        if let Some(mask) = attention_mask {
            attn_scores = mask.apply(&attn_scores).context(AttentionMaskSnafu)?;
        }

        // Apply attention weights.
        let attn_weights = softmax(&attn_scores, 3)
            .and_then(|weights| weights.to_dtype(value.dtype()))
            .and_then(|weights| self.dropout.forward(&weights, train))
            .context(AttentionWeightSnafu)?;
        attn_weights
            .broadcast_matmul(&value.contiguous().context(AttentionWeightSnafu)?)
            .context(AttentionWeightSnafu)
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use candle_nn::Dropout;
    use ndarray::array;

    use super::ScaledDotProductAttention;
    use crate::layers::attention::{AttentionMask, AttentionScorer};
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn attends_only_to_unmasked_positions() {
        let device = Device::Cpu;
        let scorer = ScaledDotProductAttention::new(Dropout::new(0.0));

        // Two key positions with clearly separated values; the second
        // position is blocked by the padding mask.
        let query = Tensor::zeros((1, 1, 1, 2), candle_core::DType::F32, &device).unwrap();
        let key = Tensor::from_slice(&[1f32, 0.0, 0.0, 1.0], (1, 1, 2, 2), &device).unwrap();
        let value = Tensor::from_slice(&[1f32, 2.0, 100.0, 200.0], (1, 1, 2, 2), &device).unwrap();

        let padding = Tensor::from_slice(&[1f32, 0.0], (1, 2), &device).unwrap();
        let mask = AttentionMask::encoder_padding(&padding, 1).unwrap();

        let output = scorer
            .forward(&query, &key, &value, Some(&mask), false)
            .unwrap();
        assert_tensor_eq::<f32>(output, array![[[[1.0f32, 2.0]]]], 1e-4);
    }

    #[test]
    fn uniform_scores_average_values() {
        let device = Device::Cpu;
        let scorer = ScaledDotProductAttention::new(Dropout::new(0.0));

        let query = Tensor::zeros((1, 1, 1, 2), candle_core::DType::F32, &device).unwrap();
        let key = Tensor::from_slice(&[1f32, 0.0, 0.0, 1.0], (1, 1, 2, 2), &device).unwrap();
        let value = Tensor::from_slice(&[1f32, 2.0, 3.0, 4.0], (1, 1, 2, 2), &device).unwrap();

        let output = scorer.forward(&query, &key, &value, None, false).unwrap();
        assert_tensor_eq::<f32>(output, array![[[[2.0f32, 3.0]]]], 1e-4);
    }
}

use candle_core::{DType, Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot apply attention mask"))]
    ApplyMask { source: candle_core::Error },

    #[snafu(display("Cannot create causal mask"))]
    CausalMask { source: candle_core::Error },

    #[snafu(display("Cannot intersect masks"))]
    IntersectMasks { source: candle_core::Error },

    #[snafu(display("Attention mask must be 4D, was {n_dims}D"))]
    MaskDims { n_dims: usize },

    #[snafu(display("Padding indicator must be 2D, was {n_dims}D"))]
    PaddingDims { n_dims: usize },

    #[snafu(display("Cannot create padding mask"))]
    PaddingMask { source: candle_core::Error },
}

/// Additive attention mask.
///
/// Holds `0` at positions that may be attended to and a large negative
/// value at blocked positions. The mask is added to raw attention scores
/// before the softmax. *Shape:* `(batch_size, heads, query_len, key_len)`
#[derive(Clone, Debug)]
pub struct AttentionMask {
    mask: Tensor,
}

impl AttentionMask {
    /// Create an attention mask from an additive mask tensor.
    ///
    /// * `mask` - Additive mask tensor.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn new(mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = mask.dims().len();
        ensure!(n_dims == 4, MaskDimsSnafu { n_dims });
        Ok(AttentionMask { mask })
    }

    /// Create a causal mask.
    ///
    /// A causal mask ensures that sequence elements cannot attend to
    /// succeeding elements.
    pub fn causal(
        batch_size: usize,
        n_heads: usize,
        seq_len: usize,
        device: &Device,
    ) -> Result<Self, AttentionMaskError> {
        let additive = Tensor::tril2(seq_len, DType::F32, device)
            .and_then(|indicator| indicator.affine(1e9, -1e9))
            .and_then(|mask| mask.reshape((1, 1, seq_len, seq_len)))
            .context(CausalMaskSnafu)?;
        let mask = Tensor::zeros(
            (batch_size, n_heads, seq_len, seq_len),
            DType::F32,
            device,
        )
        .and_then(|zeros| zeros.broadcast_add(&additive))
        .context(CausalMaskSnafu)?;

        Ok(AttentionMask { mask })
    }

    /// Create a padding mask for self-attention.
    ///
    /// Blocks attention to padded positions from every position of the same
    /// sequence.
    ///
    /// * `padding` - Padding indicator with `1` at real positions and `0`
    ///   at padded ones. *Shape:* `(batch_size, seq_len)`
    pub fn encoder_padding(padding: &Tensor, n_heads: usize) -> Result<Self, AttentionMaskError> {
        let (_, seq_len) = padding_dims(padding)?;
        Self::key_padding(padding, n_heads, seq_len)
    }

    /// Create a padding mask for encoder-decoder attention.
    ///
    /// Blocks attention to padded source positions from every target
    /// position.
    ///
    /// * `padding` - Source padding indicator. *Shape:* `(batch_size, src_len)`
    pub fn cross_padding(
        padding: &Tensor,
        n_heads: usize,
        tgt_len: usize,
    ) -> Result<Self, AttentionMaskError> {
        Self::key_padding(padding, n_heads, tgt_len)
    }

    fn key_padding(
        padding: &Tensor,
        n_heads: usize,
        query_len: usize,
    ) -> Result<Self, AttentionMaskError> {
        let (batch_size, key_len) = padding_dims(padding)?;
        let additive = padding
            .to_dtype(DType::F32)
            .and_then(|indicator| indicator.affine(1e9, -1e9))
            .and_then(|mask| mask.reshape((batch_size, 1, 1, key_len)))
            .context(PaddingMaskSnafu)?;
        let mask = Tensor::zeros(
            (batch_size, n_heads, query_len, key_len),
            DType::F32,
            padding.device(),
        )
        .and_then(|zeros| zeros.broadcast_add(&additive))
        .context(PaddingMaskSnafu)?;

        Ok(AttentionMask { mask })
    }

    /// Merge this mask with another mask.
    ///
    /// A position is attendable in the merged mask only when it is
    /// attendable in both masks.
    pub fn intersect(&self, other: &AttentionMask) -> Result<AttentionMask, AttentionMaskError> {
        Ok(AttentionMask {
            mask: self
                .mask
                .broadcast_add(&other.mask)
                .context(IntersectMasksSnafu)?,
        })
    }

    /// Add the mask to raw attention scores.
    ///
    /// * `scores` - Attention scores.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply(&self, scores: &Tensor) -> Result<Tensor, AttentionMaskError> {
        self.mask
            .to_dtype(scores.dtype())
            .and_then(|mask| scores.broadcast_add(&mask))
            .context(ApplyMaskSnafu)
    }

    /// Get the additive mask tensor.
    pub fn as_tensor(&self) -> &Tensor {
        &self.mask
    }
}

fn padding_dims(padding: &Tensor) -> Result<(usize, usize), AttentionMaskError> {
    match padding.dims() {
        [batch_size, seq_len] => Ok((*batch_size, *seq_len)),
        dims => PaddingDimsSnafu { n_dims: dims.len() }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};
    use ndarray::array;

    use super::AttentionMask;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn causal_mask_blocks_upper_triangle() {
        let mask = AttentionMask::causal(1, 1, 3, &Device::Cpu).unwrap();
        assert_tensor_eq::<f32>(
            mask.as_tensor(),
            array![[[
                [0.0f32, -1e9, -1e9],
                [0.0, 0.0, -1e9],
                [0.0, 0.0, 0.0]
            ]]],
            1e-4,
        );
    }

    #[test]
    fn padding_mask_blocks_padded_keys() {
        let padding = Tensor::from_slice(&[1f32, 1.0, 0.0], (1, 3), &Device::Cpu).unwrap();
        let mask = AttentionMask::encoder_padding(&padding, 2).unwrap();
        assert_eq!(mask.as_tensor().dims(), [1, 2, 3, 3]);
        assert_tensor_eq::<f32>(
            mask.as_tensor(),
            array![[
                [[0.0f32, 0.0, -1e9], [0.0, 0.0, -1e9], [0.0, 0.0, -1e9]],
                [[0.0, 0.0, -1e9], [0.0, 0.0, -1e9], [0.0, 0.0, -1e9]]
            ]],
            1e-4,
        );
    }

    #[test]
    fn cross_padding_mask_covers_target_length() {
        let padding = Tensor::from_slice(&[1f32, 0.0], (1, 2), &Device::Cpu).unwrap();
        let mask = AttentionMask::cross_padding(&padding, 1, 3).unwrap();
        assert_tensor_eq::<f32>(
            mask.as_tensor(),
            array![[[[0.0f32, -1e9], [0.0, -1e9], [0.0, -1e9]]]],
            1e-4,
        );
    }

    #[test]
    fn intersection_blocks_union_of_blocked_positions() {
        let causal = AttentionMask::causal(1, 1, 3, &Device::Cpu).unwrap();
        let padding = Tensor::from_slice(&[1f32, 1.0, 0.0], (1, 3), &Device::Cpu).unwrap();
        let padding = AttentionMask::encoder_padding(&padding, 1).unwrap();

        let merged = causal.intersect(&padding).unwrap();
        let values = merged
            .as_tensor()
            .reshape((3, 3))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(values[0][0], 0.0);
        assert!(values[0][1] <= -1e9);
        assert!(values[0][2] <= -1e9);
        assert_eq!(values[2][1], 0.0);
        assert!(values[2][2] <= -1e9);
    }

    #[test]
    fn rejects_non_2d_padding() {
        let padding = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(AttentionMask::encoder_padding(&padding, 1).is_err());
    }
}

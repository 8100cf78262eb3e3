use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax;
use candle_nn::Dropout;
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, AttentionMaskError, AttentionScorer};

/// Errors for relative-position attention.
#[derive(Debug, Snafu)]
pub enum RelativePositionAttentionError {
    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: AttentionMaskError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention weights"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Query length {query_len} must not be larger than key length {key_len}"))]
    QueryLen { query_len: usize, key_len: usize },

    #[snafu(display("Cannot build relative position indices"))]
    RelativeIndices { source: candle_core::Error },

    #[snafu(display("Cannot look up relative position embeddings"))]
    RelativeValues { source: candle_core::Error },
}

/// Dot-product attention with relative position representations.
///
/// Adds a learned bias to every raw attention score, looked up by the
/// clipped relative distance between the query and key positions. Query
/// positions are taken to be the last `query_len` of the `key_len` key
/// positions, which covers both full-sequence attention and incremental
/// decoding against cached keys.
///
/// See [Shaw et al., 2018](https://arxiv.org/abs/1803.02155).
pub struct RelativePositionAttention {
    embeddings: Tensor,
    max_relative_position: usize,
    n_heads: usize,
    dropout: Dropout,
}

impl RelativePositionAttention {
    /// Construct a relative-position attention module.
    ///
    /// * `embeddings` - Relative position embedding table.
    ///   *Shape:* `(2 * max_relative_position + 1, head_width)`
    /// * `max_relative_position` - Distance at which relative positions
    ///   are clipped.
    /// * `n_heads` - Number of attention heads.
    /// * `dropout` - Dropout to apply to the attention weights.
    pub fn new(
        embeddings: Tensor,
        max_relative_position: usize,
        n_heads: usize,
        dropout: Dropout,
    ) -> Self {
        RelativePositionAttention {
            embeddings,
            max_relative_position,
            n_heads,
            dropout,
        }
    }

    /// Add the relative position bias to the query-key scores.
    ///
    /// Decomposes the bias into a batched matrix multiplication with the
    /// query axis as the batch axis, so the looked-up embeddings are shared
    /// by all sequences and heads.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, head_width)`
    /// * `relative` - Embeddings per query-key position pair.
    ///   *Shape:* `(query_len, key_len, head_width)`
    fn relative_scores(query: &Tensor, relative: &Tensor) -> Result<Tensor, candle_core::Error> {
        let (batch_size, n_heads, query_len, head_width) = query.dims4()?;
        let key_len = relative.dim(1)?;

        let query = query
            .reshape((batch_size * n_heads, query_len, head_width))?
            .transpose(0, 1)?
            .contiguous()?;
        let relative = relative.transpose(1, 2)?.contiguous()?;

        query
            .matmul(&relative)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((batch_size, n_heads, query_len, key_len))
    }
}

impl AttentionScorer for RelativePositionAttention {
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        let query_len = query.dim(2).context(AttentionScoresSnafu)?;
        let key_len = key.dim(2).context(AttentionScoresSnafu)?;
        ensure!(
            query_len <= key_len,
            QueryLenSnafu { query_len, key_len }
        );

        let indices = relative_indices(
            query_len,
            key_len,
            self.max_relative_position,
            query.device(),
        )
        .context(RelativeIndicesSnafu)?;
        let relative = self
            .embeddings
            .index_select(&indices, 0)
            .and_then(|rows| rows.reshape((query_len, key_len, ())))
            .and_then(|rows| rows.to_dtype(DType::F32))
            .context(RelativeValuesSnafu)?;

        // Scores and softmax are computed in full precision. The query is
        // scaled down by the head count instead of the usual square root of
        // the head width.
        let query = query
            .contiguous()
            .and_then(|query| query.to_dtype(DType::F32))
            .and_then(|query| query.affine(1.0 / self.n_heads as f64, 0.0))
            .context(AttentionScoresSnafu)?;
        let key = key
            .contiguous()
            .and_then(|key| key.to_dtype(DType::F32))
            .context(AttentionScoresSnafu)?;

        let mut attn_scores = key
            .transpose(3, 2)
            .and_then(|key| query.broadcast_matmul(&key))
            .context(AttentionScoresSnafu)?;
        attn_scores = Self::relative_scores(&query, &relative)
            .and_then(|relative_scores| attn_scores.add(&relative_scores))
            .context(AttentionScoresSnafu)?;

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

/// Clipped relative distances between query and key positions.
///
/// The entry for query `i` and key `j` is
/// `clip(j - pos(i), -max_relative_position, max_relative_position)`
/// shifted by `max_relative_position` to index into the embedding table,
/// where `pos(i)` maps the queries onto the last `query_len` key positions.
///
/// Returns a flat index tensor. *Shape:* `(query_len * key_len,)`
fn relative_indices(
    query_len: usize,
    key_len: usize,
    max_relative_position: usize,
    device: &Device,
) -> Result<Tensor, candle_core::Error> {
    let max_relative = max_relative_position as i64;
    let mut indices = Vec::with_capacity(query_len * key_len);
    for query in 0..query_len {
        let query_pos = (key_len - query_len + query) as i64;
        for key in 0..key_len {
            let distance = (key as i64 - query_pos).clamp(-max_relative, max_relative);
            indices.push((distance + max_relative) as u32);
        }
    }

    Tensor::from_vec(indices, query_len * key_len, device)
}

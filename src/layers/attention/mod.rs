use candle_core::{Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::kv_cache::{KeyValueCache, KeyValueCacheError};
use crate::layers::{dense, scaled_uniform};

mod mask;
pub use mask::{AttentionMask, AttentionMaskError};

mod relative;
pub use relative::{RelativePositionAttention, RelativePositionAttentionError};

mod sdpa;
pub use sdpa::{ScaledDotProductAttention, ScaledDotProductAttentionError};

/// Trait implemented by modules that perform attention scoring.
pub trait AttentionScorer {
    /// Apply attention scores to the given key, query and value.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, head_width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, head_width)`
    /// * `value` - Value tensor.
    ///   *Shape:* `(batch_size, heads, key_len, head_width)`
    /// * `attention_mask` - Additive attention mask. Blocked positions are
    ///   ignored in attention.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: Attention values.
    /// *Shape:* `(batch_size, heads, query_len, head_width)`
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, BoxedError>;
}

/// Role of an attention sublayer, deciding how its cache is used.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttentionKind {
    /// Queries, keys and values come from the same sequence. Cached keys
    /// and values grow by one increment per call.
    SelfAttention,

    /// Keys and values come from the encoder output. They are projected
    /// once and reused on every call.
    CrossAttention,
}

/// Errors for multi-head attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadAttentionError {
    #[snafu(display("Cannot construct layer"))]
    AttentionConstruction { source: candle_core::Error },

    #[snafu(display("Cannot apply attention scorer"))]
    AttentionScorer { source: BoxedError },

    #[snafu(display("Cannot use key-value cache"))]
    Cache { source: KeyValueCacheError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Head count {n_heads} must be positive and divide hidden width {hidden_width}"))]
    HeadCount {
        n_heads: usize,
        hidden_width: usize,
    },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Multi-head attention.
///
/// Projects queries, keys and values, splits them into heads, scores them
/// with the configured scorer and projects the merged heads back to the
/// hidden width. Key-value projection goes through the supplied cache
/// according to the sublayer role.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    relative_embeddings: Option<Tensor>,
    scorer: Box<dyn AttentionScorer>,
    n_heads: usize,
}

impl MultiHeadAttention {
    /// Construct a multi-head attention module.
    ///
    /// * `vb` - Variable builder used for the attention parameters.
    /// * `hidden_width` - Hidden width of the projections.
    /// * `n_heads` - Number of attention heads.
    /// * `max_relative_position` - When set, score with relative position
    ///   representations clipped to this distance.
    /// * `dropout` - Dropout to apply to the attention weights.
    pub fn new(
        vb: VarBuilder,
        hidden_width: usize,
        n_heads: usize,
        max_relative_position: Option<usize>,
        dropout: Dropout,
    ) -> Result<Self, MultiHeadAttentionError> {
        ensure!(
            n_heads > 0 && hidden_width % n_heads == 0,
            HeadCountSnafu {
                n_heads,
                hidden_width,
            }
        );
        let head_width = hidden_width / n_heads;

        let query = dense(hidden_width, hidden_width, vb.push_prefix("query"))
            .context(AttentionConstructionSnafu)?;
        let key = dense(hidden_width, hidden_width, vb.push_prefix("key"))
            .context(AttentionConstructionSnafu)?;
        let value = dense(hidden_width, hidden_width, vb.push_prefix("value"))
            .context(AttentionConstructionSnafu)?;
        let relative_embeddings = max_relative_position
            .map(|max_relative| {
                vb.push_prefix("relative_embeddings").get_with_hints(
                    (2 * max_relative + 1, head_width),
                    "weight",
                    scaled_uniform(2 * max_relative + 1, head_width),
                )
            })
            .transpose()
            .context(AttentionConstructionSnafu)?;
        let output = dense(hidden_width, hidden_width, vb.push_prefix("output"))
            .context(AttentionConstructionSnafu)?;

        let scorer: Box<dyn AttentionScorer> =
            match (&relative_embeddings, max_relative_position) {
                (Some(embeddings), Some(max_relative)) => Box::new(RelativePositionAttention::new(
                    embeddings.clone(),
                    max_relative,
                    n_heads,
                    dropout,
                )),
                _ => Box::new(ScaledDotProductAttention::new(dropout)),
            };

        Ok(Self {
            query,
            key,
            value,
            output,
            relative_embeddings,
            scorer,
            n_heads,
        })
    }

    /// Apply attention to the given sequences.
    ///
    /// The query is always projected freshly. Without a cache, or during
    /// training, or with a pass-through cache, keys and values are also
    /// projected freshly. Otherwise a self-attention cache grows by the
    /// projected increment and an encoder-decoder cache projects once and
    /// reuses the stored projections.
    ///
    /// * `query` - Query sequence.
    ///   *Shape:* `(batch_size, query_len, hidden_width)`
    /// * `key` - Key sequence.
    ///   *Shape:* `(batch_size, key_len, hidden_width)`
    /// * `value` - Value sequence.
    ///   *Shape:* `(batch_size, key_len, hidden_width)`
    /// * `attention_mask` - Additive attention mask.
    /// * `train` - Whether the model is trained.
    /// * `cache` - Key-value cache of this sublayer.
    /// * `kind` - Role of this sublayer.
    ///
    /// Returns: Hidden representations after attention.
    /// *Shape:* `(batch_size, query_len, hidden_width)`
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
        cache: Option<&mut KeyValueCache>,
        kind: AttentionKind,
    ) -> Result<Tensor, MultiHeadAttentionError> {
        let query_states = self.query.forward(query).context(QkvSnafu)?;

        let (key_states, value_states) = match cache {
            Some(cache) if !train && cache.is_enabled() => match kind {
                AttentionKind::SelfAttention => {
                    let key_states = self.key.forward(key).context(QkvSnafu)?;
                    let value_states = self.value.forward(value).context(QkvSnafu)?;
                    cache
                        .append(&key_states, &value_states)
                        .context(CacheSnafu)?
                }
                AttentionKind::CrossAttention => cache
                    .reuse_projected(|| {
                        let key_states = self.key.forward(key)?;
                        let value_states = self.value.forward(value)?;
                        Ok((key_states, value_states))
                    })
                    .context(CacheSnafu)?,
            },
            _ => (
                self.key.forward(key).context(QkvSnafu)?,
                self.value.forward(value).context(QkvSnafu)?,
            ),
        };

        let attn = self
            .scorer
            .forward(
                &query_states.split_heads(self.n_heads)?,
                &key_states.split_heads(self.n_heads)?,
                &value_states.split_heads(self.n_heads)?,
                attention_mask,
                train,
            )
            .context(AttentionScorerSnafu)?
            .combine_heads()?;

        self.output.forward(&attn).context(OutputSnafu)
    }

    /// Append the parameters of this module to `params` in enumeration
    /// order, named relative to `prefix`.
    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        params.push((format!("{prefix}.query.weight"), self.query.weight().clone()));
        params.push((format!("{prefix}.key.weight"), self.key.weight().clone()));
        params.push((format!("{prefix}.value.weight"), self.value.weight().clone()));
        if let Some(bias) = self.query.bias() {
            params.push((format!("{prefix}.query.bias"), bias.clone()));
        }
        if let Some(bias) = self.key.bias() {
            params.push((format!("{prefix}.key.bias"), bias.clone()));
        }
        if let Some(bias) = self.value.bias() {
            params.push((format!("{prefix}.value.bias"), bias.clone()));
        }
        if let Some(embeddings) = &self.relative_embeddings {
            params.push((
                format!("{prefix}.relative_embeddings.weight"),
                embeddings.clone(),
            ));
        }
        params.push((
            format!("{prefix}.output.weight"),
            self.output.weight().clone(),
        ));
        if let Some(bias) = self.output.bias() {
            params.push((format!("{prefix}.output.bias"), bias.clone()));
        }
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, seq_len, hidden_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = hidden_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}

use candle_core::{ModuleT, Tensor};
use candle_nn::{Dropout, VarBuilder};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::config::ModelConfig;
use crate::kv_cache::{DecoderCache, KeyValueCache};
use crate::layers::attention::{
    AttentionKind, AttentionMask, MultiHeadAttention, MultiHeadAttentionError,
};
use crate::layers::{
    LayerNorm, LayerNormError, PointwiseFeedForward, SinusoidalEmbeddings,
    SinusoidalEmbeddingsError,
};

/// Transformer decoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerDecoderError {
    #[snafu(display("Cache has {cache_layers} layers, but the decoder has {n_layers}"))]
    CacheLayers {
        cache_layers: usize,
        n_layers: usize,
    },

    #[snafu(display("Cannot construct or apply cross-attention"))]
    CrossAttention { source: MultiHeadAttentionError },

    #[snafu(display("Cannot construct or apply embeddings"))]
    Embeddings { source: SinusoidalEmbeddingsError },

    #[snafu(display("Fast decoding requires the pre-norm configuration"))]
    FastPath,

    #[snafu(display("Cannot construct or apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Cannot construct or apply layer norm"))]
    LayerNorm { source: LayerNormError },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot construct or apply self-attention"))]
    SelfAttention { source: MultiHeadAttentionError },
}

/// Single decoder layer.
///
/// Applies self-attention over the decoder states, cross-attention over
/// the encoder output and a feed-forward block, each with a residual
/// connection and its own layer norm.
pub struct DecoderLayer {
    cross_attention: MultiHeadAttention,
    cross_attention_layer_norm: LayerNorm,
    dropout: Dropout,
    feed_forward: PointwiseFeedForward,
    ffn_layer_norm: LayerNorm,
    pre_norm: bool,
    self_attention: MultiHeadAttention,
    self_attention_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self, TransformerDecoderError> {
        let self_attention = MultiHeadAttention::new(
            vb.push_prefix("self_attention"),
            config.model_size,
            config.n_heads,
            config
                .use_relative_position
                .then_some(config.max_relative_position),
            Dropout::new(config.attention_dropout),
        )
        .context(SelfAttentionSnafu)?;
        let self_attention_layer_norm = LayerNorm::new(
            vb.push_prefix("self_attention_layer_norm"),
            config.model_size,
            config.use_l1_norm,
        )
        .context(LayerNormSnafu)?;
        // Cross-attention never uses relative position embeddings, its
        // keys come from the encoder.
        let cross_attention = MultiHeadAttention::new(
            vb.push_prefix("cross_attention"),
            config.model_size,
            config.n_heads,
            None,
            Dropout::new(config.attention_dropout),
        )
        .context(CrossAttentionSnafu)?;
        let cross_attention_layer_norm = LayerNorm::new(
            vb.push_prefix("cross_attention_layer_norm"),
            config.model_size,
            config.use_l1_norm,
        )
        .context(LayerNormSnafu)?;
        let feed_forward = PointwiseFeedForward::new(
            vb.push_prefix("ffn"),
            config.model_size,
            config.ffn_hidden_size,
            Dropout::new(config.ffn_dropout),
        )
        .context(FeedForwardSnafu)?;
        let ffn_layer_norm = LayerNorm::new(
            vb.push_prefix("ffn_layer_norm"),
            config.model_size,
            config.use_l1_norm,
        )
        .context(LayerNormSnafu)?;

        Ok(Self {
            cross_attention,
            cross_attention_layer_norm,
            dropout: Dropout::new(config.dropout),
            feed_forward,
            ffn_layer_norm,
            pre_norm: config.pre_norm,
            self_attention,
            self_attention_layer_norm,
        })
    }

    /// Apply the layer.
    ///
    /// * `input` - Decoder hidden representations.
    ///   *Shape:* `(batch_size, tgt_len, model_size)`
    /// * `encoder_output` - Encoded source representations.
    ///   *Shape:* `(batch_size, src_len, model_size)`
    /// * `self_attention_mask` - Mask for the self-attention sublayer.
    /// * `cross_attention_mask` - Mask for the cross-attention sublayer.
    /// * `train` - Whether the model is trained.
    /// * `caches` - Key-value caches of both attention sublayers.
    ///
    /// Returns the layer output.
    /// *Shape:* `(batch_size, tgt_len, model_size)`
    pub fn forward(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: Option<&AttentionMask>,
        cross_attention_mask: Option<&AttentionMask>,
        train: bool,
        caches: Option<(&mut KeyValueCache, &mut KeyValueCache)>,
    ) -> Result<Tensor, TransformerDecoderError> {
        let (self_cache, cross_cache) = match caches {
            Some((self_cache, cross_cache)) => (Some(self_cache), Some(cross_cache)),
            None => (None, None),
        };

        let attn_in = if self.pre_norm {
            self.self_attention_layer_norm
                .forward(input)
                .context(LayerNormSnafu)?
        } else {
            input.clone()
        };
        let attn_out = self
            .self_attention
            .forward(
                &attn_in,
                &attn_in,
                &attn_in,
                self_attention_mask,
                train,
                self_cache,
                AttentionKind::SelfAttention,
            )
            .context(SelfAttentionSnafu)?;
        let residual = self
            .dropout
            .forward(&attn_out, train)
            .and_then(|attn_out| attn_out + input)
            .context(ResidualSnafu)?;
        let hidden = if self.pre_norm {
            residual
        } else {
            self.self_attention_layer_norm
                .forward(&residual)
                .context(LayerNormSnafu)?
        };

        let cross_in = if self.pre_norm {
            self.cross_attention_layer_norm
                .forward(&hidden)
                .context(LayerNormSnafu)?
        } else {
            hidden.clone()
        };
        let cross_out = self
            .cross_attention
            .forward(
                &cross_in,
                encoder_output,
                encoder_output,
                cross_attention_mask,
                train,
                cross_cache,
                AttentionKind::CrossAttention,
            )
            .context(CrossAttentionSnafu)?;
        let residual = self
            .dropout
            .forward(&cross_out, train)
            .and_then(|cross_out| cross_out + &hidden)
            .context(ResidualSnafu)?;
        let hidden = if self.pre_norm {
            residual
        } else {
            self.cross_attention_layer_norm
                .forward(&residual)
                .context(LayerNormSnafu)?
        };

        let ffn_in = if self.pre_norm {
            self.ffn_layer_norm
                .forward(&hidden)
                .context(LayerNormSnafu)?
        } else {
            hidden.clone()
        };
        let residual = self
            .feed_forward
            .forward_t(&ffn_in, train)
            .context(FeedForwardSnafu)
            .and_then(|ffn_out| {
                self.dropout
                    .forward(&ffn_out, train)
                    .and_then(|ffn_out| ffn_out + &hidden)
                    .context(ResidualSnafu)
            })?;
        if self.pre_norm {
            Ok(residual)
        } else {
            self.ffn_layer_norm
                .forward(&residual)
                .context(LayerNormSnafu)
        }
    }

    /// Apply the layer with fixed pre-norm wiring.
    ///
    /// Equivalent to [`Self::forward`] for pre-norm models, without the
    /// normalization placement branches.
    fn forward_fast(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: Option<&AttentionMask>,
        cross_attention_mask: Option<&AttentionMask>,
        train: bool,
        caches: Option<(&mut KeyValueCache, &mut KeyValueCache)>,
    ) -> Result<Tensor, TransformerDecoderError> {
        let (self_cache, cross_cache) = match caches {
            Some((self_cache, cross_cache)) => (Some(self_cache), Some(cross_cache)),
            None => (None, None),
        };

        let hidden = self
            .self_attention_layer_norm
            .forward(input)
            .context(LayerNormSnafu)?;
        let hidden = self
            .self_attention
            .forward(
                &hidden,
                &hidden,
                &hidden,
                self_attention_mask,
                train,
                self_cache,
                AttentionKind::SelfAttention,
            )
            .context(SelfAttentionSnafu)?;
        let hidden = self
            .dropout
            .forward(&hidden, train)
            .and_then(|hidden| hidden + input)
            .context(ResidualSnafu)?;

        let residual = hidden.clone();
        let hidden = self
            .cross_attention_layer_norm
            .forward(&hidden)
            .context(LayerNormSnafu)?;
        let hidden = self
            .cross_attention
            .forward(
                &hidden,
                encoder_output,
                encoder_output,
                cross_attention_mask,
                train,
                cross_cache,
                AttentionKind::CrossAttention,
            )
            .context(CrossAttentionSnafu)?;
        let hidden = self
            .dropout
            .forward(&hidden, train)
            .and_then(|hidden| hidden + residual)
            .context(ResidualSnafu)?;

        let residual = hidden.clone();
        let hidden = self
            .ffn_layer_norm
            .forward(&hidden)
            .context(LayerNormSnafu)?;
        self.feed_forward
            .forward_t(&hidden, train)
            .context(FeedForwardSnafu)
            .and_then(|hidden| {
                self.dropout
                    .forward(&hidden, train)
                    .and_then(|hidden| hidden + residual)
                    .context(ResidualSnafu)
            })
    }

    fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        self.self_attention
            .append_params(&format!("{prefix}.self_attention"), params);
        self.self_attention_layer_norm
            .append_params(&format!("{prefix}.self_attention_layer_norm"), params);
        self.cross_attention
            .append_params(&format!("{prefix}.cross_attention"), params);
        self.cross_attention_layer_norm
            .append_params(&format!("{prefix}.cross_attention_layer_norm"), params);
        self.feed_forward
            .append_params(&format!("{prefix}.ffn"), params);
        self.ffn_layer_norm
            .append_params(&format!("{prefix}.ffn_layer_norm"), params);
    }
}

/// Transformer decoder stack.
pub struct TransformerDecoder {
    dropout: Dropout,
    embeddings: SinusoidalEmbeddings,
    layers: Vec<DecoderLayer>,
    output_layer_norm: Option<LayerNorm>,
}

impl TransformerDecoder {
    /// Construct a decoder stack.
    ///
    /// * `config` - Model configuration.
    /// * `vb` - Variable store.
    /// * `embeddings_vb` - Variable store for the embeddings. Passing
    ///   the encoder embeddings path ties both embedding tables.
    pub fn new(
        config: &ModelConfig,
        vb: VarBuilder,
        embeddings_vb: VarBuilder,
    ) -> Result<Self, TransformerDecoderError> {
        let embeddings = SinusoidalEmbeddings::new(
            embeddings_vb,
            config.tgt_vocab_size,
            config.emb_size,
            config.max_position,
            config.padding_idx,
        )
        .context(EmbeddingsSnafu)?;

        let layers = (0..config.n_decoder_layers)
            .map(|n| DecoderLayer::new(config, vb.push_prefix(format!("layer_{n}"))))
            .collect::<Result<Vec<_>, _>>()?;

        // Pre-norm models normalize the last decoder state, post-norm
        // models already normalize after every residual sum.
        let output_layer_norm = config
            .pre_norm
            .then(|| {
                LayerNorm::new(
                    vb.push_prefix("output_layer_norm"),
                    config.model_size,
                    config.use_l1_norm,
                )
            })
            .transpose()
            .context(LayerNormSnafu)?;

        Ok(Self {
            dropout: Dropout::new(config.dropout),
            embeddings,
            layers,
            output_layer_norm,
        })
    }

    /// Decode a batch of token identifiers.
    ///
    /// * `input` - Target token identifiers.
    ///   *Shape:* `(batch_size, tgt_len)`
    /// * `encoder_output` - Encoded source representations.
    ///   *Shape:* `(batch_size, src_len, model_size)`
    /// * `self_attention_mask` - Mask for the self-attention sublayers.
    /// * `cross_attention_mask` - Mask for the cross-attention sublayers.
    /// * `step` - Decoding step, used to position single-token inputs
    ///   during incremental decoding.
    /// * `train` - Whether the model is trained.
    /// * `cache` - Decoder key-value cache.
    ///
    /// Returns the decoded representations.
    /// *Shape:* `(batch_size, tgt_len, model_size)`
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: Option<&AttentionMask>,
        cross_attention_mask: Option<&AttentionMask>,
        step: usize,
        train: bool,
        mut cache: Option<&mut DecoderCache>,
    ) -> Result<Tensor, TransformerDecoderError> {
        if let Some(cache) = &cache {
            ensure!(
                cache.n_layers() == self.layers.len(),
                CacheLayersSnafu {
                    cache_layers: cache.n_layers(),
                    n_layers: self.layers.len(),
                }
            );
        }

        let embeddings = self
            .embeddings
            .forward(input, true, train, step)
            .context(EmbeddingsSnafu)?;
        let mut hidden = self
            .dropout
            .forward(&embeddings, train)
            .context(ResidualSnafu)?;

        for (n, layer) in self.layers.iter().enumerate() {
            let caches = cache.as_mut().map(|cache| cache.layer(n));
            hidden = layer.forward(
                &hidden,
                encoder_output,
                self_attention_mask,
                cross_attention_mask,
                train,
                caches,
            )?;
        }

        match &self.output_layer_norm {
            Some(norm) => norm.forward(&hidden).context(LayerNormSnafu),
            None => Ok(hidden),
        }
    }

    /// Decode without normalization placement branches.
    ///
    /// Fixed pre-norm wiring for the decoding loop, equivalent to
    /// [`Self::forward`]. Fails for post-norm models.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_fast(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: Option<&AttentionMask>,
        cross_attention_mask: Option<&AttentionMask>,
        step: usize,
        train: bool,
        mut cache: Option<&mut DecoderCache>,
    ) -> Result<Tensor, TransformerDecoderError> {
        let output_layer_norm = self.output_layer_norm.as_ref().context(FastPathSnafu)?;
        if let Some(cache) = &cache {
            ensure!(
                cache.n_layers() == self.layers.len(),
                CacheLayersSnafu {
                    cache_layers: cache.n_layers(),
                    n_layers: self.layers.len(),
                }
            );
        }

        let embeddings = self
            .embeddings
            .forward(input, true, train, step)
            .context(EmbeddingsSnafu)?;
        let mut hidden = self
            .dropout
            .forward(&embeddings, train)
            .context(ResidualSnafu)?;

        for (n, layer) in self.layers.iter().enumerate() {
            let caches = cache.as_mut().map(|cache| cache.layer(n));
            hidden = layer.forward_fast(
                &hidden,
                encoder_output,
                self_attention_mask,
                cross_attention_mask,
                train,
                caches,
            )?;
        }

        output_layer_norm.forward(&hidden).context(LayerNormSnafu)
    }

    /// Embeddings of the decoder.
    pub fn embeddings(&self) -> &SinusoidalEmbeddings {
        &self.embeddings
    }

    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        for (n, layer) in self.layers.iter().enumerate() {
            layer.append_params(&format!("{prefix}.layer_{n}"), params);
        }
        if let Some(norm) = &self.output_layer_norm {
            norm.append_params(&format!("{prefix}.output_layer_norm"), params);
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::{TransformerDecoder, TransformerDecoderError};
    use crate::config::ModelConfig;
    use crate::kv_cache::DecoderCache;
    use crate::layers::attention::AttentionMask;
    use crate::util::tests::{assert_tensor_eq, pseudo_random_tensor};

    fn config() -> ModelConfig {
        ModelConfig::default()
            .src_vocab_size(16)
            .tgt_vocab_size(16)
            .model_size(8)
            .emb_size(8)
            .ffn_hidden_size(16)
            .n_encoder_layers(2)
            .n_decoder_layers(2)
            .n_heads(2)
            .max_position(16)
    }

    fn decoder(config: &ModelConfig) -> TransformerDecoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TransformerDecoder::new(config, vb.clone(), vb.push_prefix("embeddings"))
            .expect("Cannot construct decoder")
    }

    fn encoder_output() -> Tensor {
        pseudo_random_tensor(&[1, 4, 8], 42, &Device::Cpu).expect("Cannot construct encoder output")
    }

    fn cross_mask(tgt_len: usize) -> AttentionMask {
        let padding =
            Tensor::ones((1, 4), DType::F32, &Device::Cpu).expect("Cannot construct padding");
        AttentionMask::cross_padding(&padding, 2, tgt_len).expect("Cannot construct mask")
    }

    #[test]
    fn incremental_and_full_decoding_agree() {
        let config = config()
            .use_relative_position(true)
            .max_relative_position(2);
        let decoder = decoder(&config);
        let encoder_output = encoder_output();

        let input =
            Tensor::from_slice(&[5u32, 6, 2], (1, 3), &Device::Cpu).expect("Cannot construct input");
        let causal = AttentionMask::causal(1, 2, 3, &Device::Cpu).expect("Cannot construct mask");
        let full = decoder
            .forward(
                &input,
                &encoder_output,
                Some(&causal),
                Some(&cross_mask(3)),
                0,
                false,
                None,
            )
            .expect("Cannot decode input");

        let mut cache = DecoderCache::new(2);
        let mut steps = Vec::new();
        for (step, &token) in [5u32, 6, 2].iter().enumerate() {
            let input = Tensor::from_slice(&[token], (1, 1), &Device::Cpu)
                .expect("Cannot construct input");
            let output = decoder
                .forward(
                    &input,
                    &encoder_output,
                    None,
                    Some(&cross_mask(1)),
                    step,
                    false,
                    Some(&mut cache),
                )
                .expect("Cannot decode step");
            steps.push(output);
        }
        let incremental = Tensor::cat(&steps, 1).expect("Cannot concatenate steps");

        assert_tensor_eq::<f32>(full, incremental, 1e-4);
    }

    #[test]
    fn fast_path_matches_standard_path() {
        let config = config();
        let decoder = decoder(&config);
        let encoder_output = encoder_output();

        let input =
            Tensor::from_slice(&[5u32, 6, 2], (1, 3), &Device::Cpu).expect("Cannot construct input");
        let causal = AttentionMask::causal(1, 2, 3, &Device::Cpu).expect("Cannot construct mask");

        let standard = decoder
            .forward(
                &input,
                &encoder_output,
                Some(&causal),
                Some(&cross_mask(3)),
                0,
                false,
                None,
            )
            .expect("Cannot decode input");
        let fast = decoder
            .forward_fast(
                &input,
                &encoder_output,
                Some(&causal),
                Some(&cross_mask(3)),
                0,
                false,
                None,
            )
            .expect("Cannot decode input");

        assert_tensor_eq::<f32>(standard, fast, 1e-6);
    }

    #[test]
    fn fast_path_requires_pre_norm() {
        let config = config().pre_norm(false);
        let decoder = decoder(&config);
        let encoder_output = encoder_output();

        let input =
            Tensor::from_slice(&[5u32], (1, 1), &Device::Cpu).expect("Cannot construct input");
        let error = decoder
            .forward_fast(&input, &encoder_output, None, None, 0, false, None)
            .expect_err("Fast decoding should reject post-norm models");

        assert!(matches!(error, TransformerDecoderError::FastPath));
    }

    #[test]
    fn cache_must_match_layer_count() {
        let config = config();
        let decoder = decoder(&config);
        let encoder_output = encoder_output();

        let input =
            Tensor::from_slice(&[5u32], (1, 1), &Device::Cpu).expect("Cannot construct input");
        let mut cache = DecoderCache::new(3);
        let error = decoder
            .forward(
                &input,
                &encoder_output,
                None,
                None,
                0,
                false,
                Some(&mut cache),
            )
            .expect_err("Cache with a mismatched layer count should be rejected");

        assert!(matches!(
            error,
            TransformerDecoderError::CacheLayers {
                cache_layers: 3,
                n_layers: 2,
            }
        ));
    }
}

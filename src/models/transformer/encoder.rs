use candle_core::{ModuleT, Tensor};
use candle_nn::{Dropout, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::config::ModelConfig;
use crate::layers::attention::{
    AttentionKind, AttentionMask, MultiHeadAttention, MultiHeadAttentionError,
};
use crate::layers::{
    LayerHistory, LayerHistoryError, LayerNorm, LayerNormError, PointwiseFeedForward,
    SinusoidalEmbeddings, SinusoidalEmbeddingsError,
};

/// Transformer encoder errors.
#[derive(Debug, Snafu)]
pub enum TransformerEncoderError {
    #[snafu(display("Cannot construct or apply self-attention"))]
    Attention { source: MultiHeadAttentionError },

    #[snafu(display("Cannot construct or apply embeddings"))]
    Embeddings { source: SinusoidalEmbeddingsError },

    #[snafu(display("Cannot construct or apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Cannot construct or apply layer history"))]
    History { source: LayerHistoryError },

    #[snafu(display("Cannot construct or apply layer norm"))]
    LayerNorm { source: LayerNormError },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },
}

/// Single encoder layer.
///
/// Wraps self-attention and a feed-forward block with residual
/// connections. With `pre_norm` the normalizations are applied before
/// each block and the residuals use the un-normalized input, otherwise
/// they are applied after the residual sums.
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    attention_layer_norm: LayerNorm,
    dropout: Dropout,
    feed_forward: PointwiseFeedForward,
    ffn_layer_norm: LayerNorm,
    pre_norm: bool,
}

impl EncoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self, TransformerEncoderError> {
        let attention = MultiHeadAttention::new(
            vb.push_prefix("attention"),
            config.model_size,
            config.n_heads,
            config
                .use_relative_position
                .then_some(config.max_relative_position),
            Dropout::new(config.attention_dropout),
        )
        .context(AttentionSnafu)?;
        let attention_layer_norm = LayerNorm::new(
            vb.push_prefix("attention_layer_norm"),
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
            attention,
            attention_layer_norm,
            dropout: Dropout::new(config.dropout),
            feed_forward,
            ffn_layer_norm,
            pre_norm: config.pre_norm,
        })
    }

    /// Apply the layer.
    ///
    /// * `input` - Hidden representations.
    ///   *Shape:* `(batch_size, seq_len, model_size)`
    /// * `mask` - Self-attention mask.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns the layer output.
    /// *Shape:* `(batch_size, seq_len, model_size)`
    pub fn forward(
        &self,
        input: &Tensor,
        mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor, TransformerEncoderError> {
        let attn_in = if self.pre_norm {
            self.attention_layer_norm
                .forward(input)
                .context(LayerNormSnafu)?
        } else {
            input.clone()
        };
        let attn_out = self
            .attention
            .forward(
                &attn_in,
                &attn_in,
                &attn_in,
                Some(mask),
                train,
                None,
                AttentionKind::SelfAttention,
            )
            .context(AttentionSnafu)?;
        let residual = self
            .dropout
            .forward(&attn_out, train)
            .and_then(|attn_out| attn_out + input)
            .context(ResidualSnafu)?;
        let attn_out = if self.pre_norm {
            residual
        } else {
            self.attention_layer_norm
                .forward(&residual)
                .context(LayerNormSnafu)?
        };

        let ffn_in = if self.pre_norm {
            self.ffn_layer_norm
                .forward(&attn_out)
                .context(LayerNormSnafu)?
        } else {
            attn_out.clone()
        };
        let residual = self
            .feed_forward
            .forward_t(&ffn_in, train)
            .context(FeedForwardSnafu)
            .and_then(|ffn_out| {
                self.dropout
                    .forward(&ffn_out, train)
                    .and_then(|ffn_out| ffn_out + &attn_out)
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

    fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        self.attention
            .append_params(&format!("{prefix}.attention"), params);
        self.feed_forward
            .append_params(&format!("{prefix}.ffn"), params);
        self.attention_layer_norm
            .append_params(&format!("{prefix}.attention_layer_norm"), params);
        self.ffn_layer_norm
            .append_params(&format!("{prefix}.ffn_layer_norm"), params);
    }
}

/// Transformer encoder stack.
///
/// Embeds token identifiers and applies the configured number of encoder
/// layers. With `use_history` the residual stream between layers is
/// replaced by a dense aggregation over all previous layer outputs.
pub struct TransformerEncoder {
    dropout: Dropout,
    embeddings: SinusoidalEmbeddings,
    history: Option<LayerHistory>,
    layers: Vec<EncoderLayer>,
    output_layer_norm: Option<LayerNorm>,
}

impl TransformerEncoder {
    /// Construct an encoder stack.
    ///
    /// * `config` - Model configuration.
    /// * `vb` - Variable store.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self, TransformerEncoderError> {
        let embeddings = SinusoidalEmbeddings::new(
            vb.push_prefix("embeddings"),
            config.src_vocab_size,
            config.emb_size,
            config.max_position,
            config.padding_idx,
        )
        .context(EmbeddingsSnafu)?;

        let layers = (0..config.n_encoder_layers)
            .map(|n| EncoderLayer::new(config, vb.push_prefix(format!("layer_{n}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let history = config
            .use_history
            .then(|| {
                LayerHistory::new(
                    vb.push_prefix("history"),
                    config.n_encoder_layers,
                    config.model_size,
                    config.use_l1_norm,
                )
            })
            .transpose()
            .context(HistorySnafu)?;

        let output_layer_norm = config
            .final_norm
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
            history,
            layers,
            output_layer_norm,
        })
    }

    /// Encode a batch of token identifiers.
    ///
    /// * `input` - Token identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `mask` - Self-attention mask.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns the encoded representations.
    /// *Shape:* `(batch_size, seq_len, model_size)`
    pub fn forward(
        &mut self,
        input: &Tensor,
        mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor, TransformerEncoderError> {
        if let Some(history) = &mut self.history {
            history.clear(true);
        }

        let embeddings = self
            .embeddings
            .forward(input, false, train, 0)
            .context(EmbeddingsSnafu)?;
        let mut hidden = self
            .dropout
            .forward(&embeddings, train)
            .context(ResidualSnafu)?;

        if let Some(history) = &mut self.history {
            history.add(hidden.clone()).context(HistorySnafu)?;
        }

        for layer in &self.layers {
            if let Some(history) = &mut self.history {
                hidden = history.pop().context(HistorySnafu)?;
            }
            hidden = layer.forward(&hidden, mask, train)?;
            if let Some(history) = &mut self.history {
                history.add(hidden.clone()).context(HistorySnafu)?;
            }
        }
        if let Some(history) = &mut self.history {
            hidden = history.pop().context(HistorySnafu)?;
        }

        match &self.output_layer_norm {
            Some(norm) => norm.forward(&hidden).context(LayerNormSnafu),
            None => Ok(hidden),
        }
    }

    /// Embeddings of the encoder.
    pub fn embeddings(&self) -> &SinusoidalEmbeddings {
        &self.embeddings
    }

    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        if let Some(history) = &self.history {
            history.append_params(&format!("{prefix}.history"), params);
        }
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
    use rstest::rstest;

    use super::TransformerEncoder;
    use crate::config::ModelConfig;
    use crate::layers::attention::AttentionMask;
    use crate::util::tests::assert_tensor_eq;

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

    fn encoder(config: &ModelConfig) -> TransformerEncoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TransformerEncoder::new(config, vb).expect("Cannot construct encoder")
    }

    fn all_visible(batch_size: usize, seq_len: usize, n_heads: usize) -> AttentionMask {
        let padding = Tensor::ones((batch_size, seq_len), DType::F32, &Device::Cpu)
            .expect("Cannot construct padding");
        AttentionMask::encoder_padding(&padding, n_heads).expect("Cannot construct mask")
    }

    #[rstest]
    #[case::pre_norm(true)]
    #[case::post_norm(false)]
    fn encodes_to_model_width(#[case] pre_norm: bool) {
        let config = config().pre_norm(pre_norm).final_norm(pre_norm);
        let mut encoder = encoder(&config);

        let input =
            Tensor::from_slice(&[5u32, 6, 2, 3, 4, 2], (2, 3), &Device::Cpu).expect("Cannot construct input");
        let output = encoder
            .forward(&input, &all_visible(2, 3, 2), false)
            .expect("Cannot encode input");

        assert_eq!(output.dims(), [2, 3, 8]);
    }

    #[test]
    fn padded_positions_do_not_influence_others() {
        let config = config();
        let mut encoder = encoder(&config);

        let padding = Tensor::from_slice(&[1f32, 1.0, 0.0], (1, 3), &Device::Cpu)
            .expect("Cannot construct padding");
        let mask = AttentionMask::encoder_padding(&padding, 2).expect("Cannot construct mask");

        let first = Tensor::from_slice(&[5u32, 6, 2], (1, 3), &Device::Cpu)
            .expect("Cannot construct input");
        let second = Tensor::from_slice(&[5u32, 6, 9], (1, 3), &Device::Cpu)
            .expect("Cannot construct input");

        let first_out = encoder
            .forward(&first, &mask, false)
            .expect("Cannot encode input")
            .narrow(1, 0, 2)
            .expect("Cannot narrow output");
        let second_out = encoder
            .forward(&second, &mask, false)
            .expect("Cannot encode input")
            .narrow(1, 0, 2)
            .expect("Cannot narrow output");

        assert_tensor_eq::<f32>(first_out, second_out, 1e-6);
    }

    #[test]
    fn history_is_cleared_between_passes() {
        let config = config().use_history(true);
        let mut encoder = encoder(&config);

        let input = Tensor::from_slice(&[5u32, 6, 2], (1, 3), &Device::Cpu)
            .expect("Cannot construct input");
        let mask = all_visible(1, 3, 2);

        let first = encoder
            .forward(&input, &mask, false)
            .expect("Cannot encode input");
        let second = encoder
            .forward(&input, &mask, false)
            .expect("Cannot encode input");

        assert_eq!(first.dims(), [1, 3, 8]);
        assert_tensor_eq::<f32>(first, second, 1e-6);
    }

    #[test]
    fn relative_positions_are_supported() {
        let config = config().use_relative_position(true).max_relative_position(2);
        let mut encoder = encoder(&config);

        let input = Tensor::from_slice(&[5u32, 6, 2, 3], (1, 4), &Device::Cpu)
            .expect("Cannot construct input");
        let output = encoder
            .forward(&input, &all_visible(1, 4, 2), false)
            .expect("Cannot encode input");

        assert_eq!(output.dims(), [1, 4, 8]);
    }
}

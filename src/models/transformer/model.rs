use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::config::{ConfigError, ModelConfig};
use crate::layers::attention::{AttentionMask, AttentionMaskError};

use super::decoder::{TransformerDecoder, TransformerDecoderError};
use super::encoder::{TransformerEncoder, TransformerEncoderError};
use super::output::{OutputLayer, OutputLayerError};

/// Transformer model errors.
#[derive(Debug, Snafu)]
pub enum TransformerModelError {
    #[snafu(display("Invalid model configuration"))]
    Config { source: ConfigError },

    #[snafu(display("Cannot construct or apply the decoder"))]
    Decoder { source: TransformerDecoderError },

    #[snafu(display("Cannot construct or apply the encoder"))]
    Encoder { source: TransformerEncoderError },

    #[snafu(display("Cannot construct an attention mask"))]
    Mask { source: AttentionMaskError },

    #[snafu(display("Decoding requires a machine-translation model"))]
    MissingDecoder,

    #[snafu(display("Cannot construct or apply the output layer"))]
    Output { source: OutputLayerError },

    #[snafu(display("Padding indicator must be 2D"))]
    PaddingDims { source: candle_core::Error },
}

/// Sequence-to-sequence transformer.
///
/// A machine-translation model pairs the encoder with a decoder and
/// projects decoder states to the target vocabulary. A language model
/// drops the decoder and projects the causally-masked encoder states to
/// the source vocabulary.
pub struct TransformerModel {
    config: ModelConfig,
    decoder: Option<TransformerDecoder>,
    encoder: TransformerEncoder,
    output: OutputLayer,
}

impl TransformerModel {
    /// Construct a model from a validated configuration.
    ///
    /// * `config` - Model configuration.
    /// * `vb` - Variable store.
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self, TransformerModelError> {
        config.validate().context(ConfigSnafu)?;

        tracing::debug!(
            n_encoder_layers = config.n_encoder_layers,
            n_decoder_layers = config.n_decoder_layers,
            model_size = config.model_size,
            n_heads = config.n_heads,
            src_vocab_size = config.src_vocab_size,
            tgt_vocab_size = config.tgt_vocab_size,
            machine_translation = config.machine_translation,
            "Constructing transformer model"
        );

        let encoder =
            TransformerEncoder::new(&config, vb.push_prefix("encoder")).context(EncoderSnafu)?;

        let decoder = config
            .machine_translation
            .then(|| {
                TransformerDecoder::new(
                    &config,
                    vb.push_prefix("decoder"),
                    decoder_embeddings_vb(&config, &vb),
                )
            })
            .transpose()
            .context(DecoderSnafu)?;

        // Tying the projection to the decoder embedding table reuses the
        // variable registered under the embedding path.
        let output_vb = if config.machine_translation && config.shared_output_embeddings {
            decoder_embeddings_vb(&config, &vb)
        } else {
            vb.push_prefix("output")
        };
        let vocab_size = if config.machine_translation {
            config.tgt_vocab_size
        } else {
            config.src_vocab_size
        };
        let output =
            OutputLayer::new(output_vb, config.model_size, vocab_size).context(OutputSnafu)?;

        Ok(Self {
            config,
            decoder,
            encoder,
            output,
        })
    }

    /// Encode a batch of source sequences.
    ///
    /// * `input` - Source token identifiers.
    ///   *Shape:* `(batch_size, src_len)`
    /// * `mask` - Encoder self-attention mask.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns the encoded representations.
    /// *Shape:* `(batch_size, src_len, model_size)`
    pub fn make_encoder(
        &mut self,
        input: &Tensor,
        mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor, TransformerModelError> {
        self.encoder
            .forward(input, mask, train)
            .context(EncoderSnafu)
    }

    /// Decode a batch of full target sequences.
    ///
    /// The incremental, cache-backed path used by the decoding driver is
    /// exposed by [`TransformerDecoder::forward`] instead.
    ///
    /// * `input` - Target token identifiers.
    ///   *Shape:* `(batch_size, tgt_len)`
    /// * `encoder_output` - Encoded source representations.
    ///   *Shape:* `(batch_size, src_len, model_size)`
    /// * `self_attention_mask` - Decoder self-attention mask.
    /// * `cross_attention_mask` - Encoder-decoder attention mask.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns the decoded representations.
    /// *Shape:* `(batch_size, tgt_len, model_size)`
    pub fn make_decoder(
        &self,
        input: &Tensor,
        encoder_output: &Tensor,
        self_attention_mask: &AttentionMask,
        cross_attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor, TransformerModelError> {
        let decoder = self.decoder.as_ref().context(MissingDecoderSnafu)?;
        decoder
            .forward(
                input,
                encoder_output,
                Some(self_attention_mask),
                Some(cross_attention_mask),
                0,
                train,
                None,
            )
            .context(DecoderSnafu)
    }

    /// Full language-model forward pass.
    ///
    /// The causal mask is derived from the shape of the padding indicator,
    /// its values are not consulted.
    ///
    /// * `input` - Token identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `padding` - Padding indicator.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns a distribution over the source vocabulary.
    /// *Shape:* `(batch_size, seq_len, src_vocab_size)`
    pub fn make_lm(
        &mut self,
        input: &Tensor,
        padding: &Tensor,
        train: bool,
    ) -> Result<Tensor, TransformerModelError> {
        let (batch_size, seq_len) = padding.dims2().context(PaddingDimsSnafu)?;
        let mask = AttentionMask::causal(batch_size, self.config.n_heads, seq_len, padding.device())
            .context(MaskSnafu)?;
        let hidden = self
            .encoder
            .forward(input, &mask, train)
            .context(EncoderSnafu)?;
        self.output.forward(&hidden, true).context(OutputSnafu)
    }

    /// Full machine-translation forward pass.
    ///
    /// * `encoder_input` - Source token identifiers.
    ///   *Shape:* `(batch_size, src_len)`
    /// * `decoder_input` - Target token identifiers.
    ///   *Shape:* `(batch_size, tgt_len)`
    /// * `encoder_padding` - Source padding indicator.
    ///   *Shape:* `(batch_size, src_len)`
    /// * `decoder_padding` - Target padding indicator.
    ///   *Shape:* `(batch_size, tgt_len)`
    /// * `train` - Whether the model is trained.
    ///
    /// Returns a distribution over the target vocabulary.
    /// *Shape:* `(batch_size, tgt_len, tgt_vocab_size)`
    pub fn make_mt(
        &mut self,
        encoder_input: &Tensor,
        decoder_input: &Tensor,
        encoder_padding: &Tensor,
        decoder_padding: &Tensor,
        train: bool,
    ) -> Result<Tensor, TransformerModelError> {
        let encoder_mask = self.make_mt_mask_enc(encoder_padding)?;
        let (self_attention_mask, cross_attention_mask) =
            self.make_mt_mask_dec(encoder_padding, decoder_padding)?;

        let encoder_output = self
            .encoder
            .forward(encoder_input, &encoder_mask, train)
            .context(EncoderSnafu)?;
        let decoder = self.decoder.as_ref().context(MissingDecoderSnafu)?;
        let hidden = decoder
            .forward(
                decoder_input,
                &encoder_output,
                Some(&self_attention_mask),
                Some(&cross_attention_mask),
                0,
                train,
                None,
            )
            .context(DecoderSnafu)?;
        self.output.forward(&hidden, true).context(OutputSnafu)
    }

    /// Build the encoder self-attention mask.
    ///
    /// * `encoder_padding` - Source padding indicator.
    ///   *Shape:* `(batch_size, src_len)`
    pub fn make_mt_mask_enc(
        &self,
        encoder_padding: &Tensor,
    ) -> Result<AttentionMask, TransformerModelError> {
        AttentionMask::encoder_padding(encoder_padding, self.config.n_heads).context(MaskSnafu)
    }

    /// Build the decoder-side masks.
    ///
    /// Returns the causal self-attention mask and the cross-attention mask
    /// blocking padded source positions. The target padding indicator only
    /// supplies the target length, causality subsumes its values.
    ///
    /// * `encoder_padding` - Source padding indicator.
    ///   *Shape:* `(batch_size, src_len)`
    /// * `decoder_padding` - Target padding indicator.
    ///   *Shape:* `(batch_size, tgt_len)`
    pub fn make_mt_mask_dec(
        &self,
        encoder_padding: &Tensor,
        decoder_padding: &Tensor,
    ) -> Result<(AttentionMask, AttentionMask), TransformerModelError> {
        let (batch_size, tgt_len) = decoder_padding.dims2().context(PaddingDimsSnafu)?;
        let self_attention_mask = AttentionMask::causal(
            batch_size,
            self.config.n_heads,
            tgt_len,
            decoder_padding.device(),
        )
        .context(MaskSnafu)?;
        let cross_attention_mask =
            AttentionMask::cross_padding(encoder_padding, self.config.n_heads, tgt_len)
                .context(MaskSnafu)?;
        Ok((self_attention_mask, cross_attention_mask))
    }

    /// Enumerate every learnable parameter in a stable order.
    ///
    /// The names equal the variable-store paths used at construction, the
    /// order is reproducible across processes for a fixed configuration.
    /// Tied embedding tables appear once, under their physical path.
    pub fn params(&self) -> Vec<(String, Tensor)> {
        let mut params = Vec::new();
        self.encoder.append_params("encoder", &mut params);
        if let Some(decoder) = &self.decoder {
            decoder.append_params("decoder", &mut params);
        }
        self.encoder
            .embeddings()
            .append_params("encoder.embeddings", &mut params);
        if let Some(decoder) = &self.decoder {
            if !self.config.shared_embeddings {
                decoder
                    .embeddings()
                    .append_params("decoder.embeddings", &mut params);
            }
        }
        if !(self.config.machine_translation && self.config.shared_output_embeddings) {
            self.output.append_params("output", &mut params);
        }
        params
    }

    /// Configuration of the model.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Decoder of the model, absent for language models.
    pub fn decoder(&self) -> Option<&TransformerDecoder> {
        self.decoder.as_ref()
    }

    /// Encoder of the model.
    pub fn encoder(&self) -> &TransformerEncoder {
        &self.encoder
    }
}

fn decoder_embeddings_vb<'a>(config: &ModelConfig, vb: &VarBuilder<'a>) -> VarBuilder<'a> {
    if config.shared_embeddings {
        vb.push_prefix("encoder").push_prefix("embeddings")
    } else {
        vb.push_prefix("decoder").push_prefix("embeddings")
    }
}

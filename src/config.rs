use candle_core::DType;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

/// Configuration errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Embedding size {emb_size} must equal model size {model_size}"))]
    EmbeddingSize { emb_size: usize, model_size: usize },

    #[snafu(display("Head count {n_heads} must be positive and divide model size {model_size}"))]
    HeadCount { n_heads: usize, model_size: usize },

    #[snafu(display("Cannot deserialize configuration"))]
    JsonRead { source: serde_json::Error },

    #[snafu(display("Cannot serialize configuration"))]
    JsonWrite { source: serde_json::Error },

    #[snafu(display("Layer count must be at least one, {side} has {n_layers}"))]
    LayerCount { side: &'static str, n_layers: usize },

    #[snafu(display("Maximum position must be positive"))]
    MaxPosition,

    #[snafu(display("Model size and FFN hidden size must be positive"))]
    ModelSize,

    #[snafu(display("Embedding sharing requires a machine-translation model"))]
    ShareWithoutDecoder,

    #[snafu(display(
        "Shared embeddings require equal vocabularies, source has {src_vocab_size}, \
         target has {tgt_vocab_size}"
    ))]
    SharedVocab {
        src_vocab_size: usize,
        tgt_vocab_size: usize,
    },

    #[snafu(display("Vocabulary size must be greater than one, {side} has {vocab_size}"))]
    VocabSize { side: &'static str, vocab_size: usize },
}

/// Transformer model configuration.
///
/// Carries every switch the engine needs to build a model: sizes, layer
/// counts, normalization placement, relative-position attention, embedding
/// sharing and numeric precision. Validated once at model construction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelConfig {
    pub(crate) src_vocab_size: usize,
    pub(crate) tgt_vocab_size: usize,
    pub(crate) model_size: usize,
    pub(crate) emb_size: usize,
    pub(crate) ffn_hidden_size: usize,
    pub(crate) n_encoder_layers: usize,
    pub(crate) n_decoder_layers: usize,
    pub(crate) n_heads: usize,
    pub(crate) max_relative_position: usize,
    pub(crate) use_relative_position: bool,
    pub(crate) max_position: usize,
    pub(crate) padding_idx: usize,
    pub(crate) dropout: f32,
    pub(crate) attention_dropout: f32,
    pub(crate) ffn_dropout: f32,
    pub(crate) pre_norm: bool,
    pub(crate) final_norm: bool,
    pub(crate) use_history: bool,
    pub(crate) machine_translation: bool,
    pub(crate) shared_embeddings: bool,
    pub(crate) shared_output_embeddings: bool,
    pub(crate) use_fp16: bool,
    pub(crate) use_l1_norm: bool,
}

impl ModelConfig {
    /// Source vocabulary size.
    ///
    /// Default: `0` (must be set)
    pub fn src_vocab_size(mut self, src_vocab_size: usize) -> Self {
        self.src_vocab_size = src_vocab_size;
        self
    }

    /// Target vocabulary size.
    ///
    /// Default: `0` (must be set)
    pub fn tgt_vocab_size(mut self, tgt_vocab_size: usize) -> Self {
        self.tgt_vocab_size = tgt_vocab_size;
        self
    }

    /// Hidden width of the encoder and decoder layers.
    ///
    /// Default: `512`
    pub fn model_size(mut self, model_size: usize) -> Self {
        self.model_size = model_size;
        self
    }

    /// Embedding width. Must equal the model size, the embedder output
    /// feeds the residual stream without a projection.
    ///
    /// Default: `512`
    pub fn emb_size(mut self, emb_size: usize) -> Self {
        self.emb_size = emb_size;
        self
    }

    /// Intermediate width of the feed-forward sublayers.
    ///
    /// Default: `2048`
    pub fn ffn_hidden_size(mut self, ffn_hidden_size: usize) -> Self {
        self.ffn_hidden_size = ffn_hidden_size;
        self
    }

    /// Number of encoder layers.
    ///
    /// Default: `6`
    pub fn n_encoder_layers(mut self, n_encoder_layers: usize) -> Self {
        self.n_encoder_layers = n_encoder_layers;
        self
    }

    /// Number of decoder layers.
    ///
    /// Default: `6`
    pub fn n_decoder_layers(mut self, n_decoder_layers: usize) -> Self {
        self.n_decoder_layers = n_decoder_layers;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `8`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Maximum relative distance of the relative-position attention window.
    ///
    /// Default: `8`
    pub fn max_relative_position(mut self, max_relative_position: usize) -> Self {
        self.max_relative_position = max_relative_position;
        self
    }

    /// Use relative-position attention in the encoder and decoder
    /// self-attention sublayers.
    ///
    /// Default: `false`
    pub fn use_relative_position(mut self, use_relative_position: bool) -> Self {
        self.use_relative_position = use_relative_position;
        self
    }

    /// Maximum absolute position. The positional table has
    /// `max_position + 2` rows.
    ///
    /// Default: `1024`
    pub fn max_position(mut self, max_position: usize) -> Self {
        self.max_position = max_position;
        self
    }

    /// Token id used for padding.
    ///
    /// Default: `1`
    pub fn padding_idx(mut self, padding_idx: usize) -> Self {
        self.padding_idx = padding_idx;
        self
    }

    /// Dropout applied to embeddings and sublayer outputs.
    ///
    /// Default: `0.1`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Dropout applied to attention weights.
    ///
    /// Default: `0.1`
    pub fn attention_dropout(mut self, attention_dropout: f32) -> Self {
        self.attention_dropout = attention_dropout;
        self
    }

    /// Dropout applied inside the feed-forward sublayers.
    ///
    /// Default: `0.1`
    pub fn ffn_dropout(mut self, ffn_dropout: f32) -> Self {
        self.ffn_dropout = ffn_dropout;
        self
    }

    /// Apply layer normalization before each sublayer rather than after the
    /// residual sum.
    ///
    /// Default: `true`
    pub fn pre_norm(mut self, pre_norm: bool) -> Self {
        self.pre_norm = pre_norm;
        self
    }

    /// Normalize the encoder output after the last layer.
    ///
    /// Default: `true`
    pub fn final_norm(mut self, final_norm: bool) -> Self {
        self.final_norm = final_norm;
        self
    }

    /// Aggregate all previous encoder layer outputs (dense residuals)
    /// instead of plain residual connections.
    ///
    /// Default: `false`
    pub fn use_history(mut self, use_history: bool) -> Self {
        self.use_history = use_history;
        self
    }

    /// Build a machine-translation model (encoder and decoder). When false,
    /// the model is an encoder-only language model.
    ///
    /// Default: `true`
    pub fn machine_translation(mut self, machine_translation: bool) -> Self {
        self.machine_translation = machine_translation;
        self
    }

    /// Share the decoder token-embedding table with the encoder.
    ///
    /// Default: `false`
    pub fn shared_embeddings(mut self, shared_embeddings: bool) -> Self {
        self.shared_embeddings = shared_embeddings;
        self
    }

    /// Share the output projection with the decoder token-embedding table.
    ///
    /// Default: `false`
    pub fn shared_output_embeddings(mut self, shared_output_embeddings: bool) -> Self {
        self.shared_output_embeddings = shared_output_embeddings;
        self
    }

    /// Serialize parameters as IEEE half floats and compute in `f16`.
    ///
    /// Default: `false`
    pub fn use_fp16(mut self, use_fp16: bool) -> Self {
        self.use_fp16 = use_fp16;
        self
    }

    /// Normalize with mean absolute deviation instead of standard deviation.
    ///
    /// Default: `false`
    pub fn use_l1_norm(mut self, use_l1_norm: bool) -> Self {
        self.use_l1_norm = use_l1_norm;
        self
    }

    /// Compute dtype implied by the precision switch.
    pub fn dtype(&self) -> DType {
        if self.use_fp16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.src_vocab_size > 1,
            VocabSizeSnafu {
                side: "source",
                vocab_size: self.src_vocab_size,
            }
        );
        ensure!(
            self.model_size > 0 && self.ffn_hidden_size > 0,
            ModelSizeSnafu
        );
        ensure!(
            self.emb_size == self.model_size,
            EmbeddingSizeSnafu {
                emb_size: self.emb_size,
                model_size: self.model_size,
            }
        );
        ensure!(
            self.n_heads > 0 && self.model_size % self.n_heads == 0,
            HeadCountSnafu {
                n_heads: self.n_heads,
                model_size: self.model_size,
            }
        );
        ensure!(
            self.n_encoder_layers > 0,
            LayerCountSnafu {
                side: "encoder",
                n_layers: self.n_encoder_layers,
            }
        );
        ensure!(self.max_position > 0, MaxPositionSnafu);
        if self.machine_translation {
            ensure!(
                self.tgt_vocab_size > 1,
                VocabSizeSnafu {
                    side: "target",
                    vocab_size: self.tgt_vocab_size,
                }
            );
            ensure!(
                self.n_decoder_layers > 0,
                LayerCountSnafu {
                    side: "decoder",
                    n_layers: self.n_decoder_layers,
                }
            );
        } else {
            ensure!(
                !self.shared_embeddings && !self.shared_output_embeddings,
                ShareWithoutDecoderSnafu
            );
        }
        if self.shared_embeddings {
            ensure!(
                self.src_vocab_size == self.tgt_vocab_size,
                SharedVocabSnafu {
                    src_vocab_size: self.src_vocab_size,
                    tgt_vocab_size: self.tgt_vocab_size,
                }
            );
        }

        Ok(())
    }

    /// Deserialize a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).context(JsonReadSnafu)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).context(JsonWriteSnafu)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            src_vocab_size: 0,
            tgt_vocab_size: 0,
            model_size: 512,
            emb_size: 512,
            ffn_hidden_size: 2048,
            n_encoder_layers: 6,
            n_decoder_layers: 6,
            n_heads: 8,
            max_relative_position: 8,
            use_relative_position: false,
            max_position: 1024,
            padding_idx: 1,
            dropout: 0.1,
            attention_dropout: 0.1,
            ffn_dropout: 0.1,
            pre_norm: true,
            final_norm: true,
            use_history: false,
            machine_translation: true,
            shared_embeddings: false,
            shared_output_embeddings: false,
            use_fp16: false,
            use_l1_norm: false,
        }
    }
}

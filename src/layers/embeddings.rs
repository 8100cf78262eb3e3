use candle_core::Tensor;
use candle_nn::{Embedding, Init, Module, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for sinusoidal embeddings.
#[derive(Debug, Snafu)]
pub enum SinusoidalEmbeddingsError {
    #[snafu(display("Cannot construct embedding tables"))]
    EmbeddingConstruction { source: candle_core::Error },

    #[snafu(display("Cannot get input shape"))]
    InputDims { source: candle_core::Error },

    #[snafu(display("Embedding width {embedding_width} must be even for the sinusoidal table"))]
    OddWidth { embedding_width: usize },

    #[snafu(display("Cannot look up position embeddings"))]
    PositionLookup { source: candle_core::Error },

    #[snafu(display(
        "Position {position} does not fit the positional table of length {max_length}"
    ))]
    SequenceLength { position: usize, max_length: usize },

    #[snafu(display("Cannot look up token embeddings"))]
    TokenLookup { source: candle_core::Error },
}

/// Token embeddings summed with fixed sinusoidal position embeddings.
///
/// Token embeddings are learned and scaled by the square root of the
/// embedding width before the position signal is added. Position
/// embeddings are precomputed on the host and never trained. The rows
/// of padding tokens are zeroed at lookup time, so padded positions
/// carry only the position signal.
#[derive(Debug)]
pub struct SinusoidalEmbeddings {
    embedding_width: usize,
    max_length: usize,
    padding_idx: usize,
    position_embeddings: Tensor,
    token_embeddings: Embedding,
}

impl SinusoidalEmbeddings {
    /// Construct an embedding layer.
    ///
    /// * `vb` - Variable store.
    /// * `vocab_size` - Number of rows in the token table.
    /// * `embedding_width` - Width of the embeddings. Must be even.
    /// * `max_position` - Largest position representable in the
    ///   sinusoidal table.
    /// * `padding_idx` - Token identifier used for padding.
    pub fn new(
        vb: VarBuilder,
        vocab_size: usize,
        embedding_width: usize,
        max_position: usize,
        padding_idx: usize,
    ) -> Result<Self, SinusoidalEmbeddingsError> {
        ensure!(embedding_width % 2 == 0, OddWidthSnafu { embedding_width });

        // One row per position, plus slack for the padding offset.
        let max_length = max_position + 2;

        let weight = vb
            .get_with_hints(
                (vocab_size, embedding_width),
                "weight",
                Init::Randn {
                    mean: 0.0,
                    stdev: 1.0 / (embedding_width as f64).sqrt(),
                },
            )
            .context(EmbeddingConstructionSnafu)?;
        let token_embeddings = Embedding::new(weight, embedding_width);

        let table = sinusoidal_table(max_length, embedding_width, padding_idx);
        let position_embeddings =
            Tensor::from_vec(table, (max_length, embedding_width), vb.device())
                .and_then(|table| table.to_dtype(vb.dtype()))
                .context(EmbeddingConstructionSnafu)?;

        Ok(Self {
            embedding_width,
            max_length,
            padding_idx,
            position_embeddings,
            token_embeddings,
        })
    }

    /// Embed a batch of token identifiers.
    ///
    /// Positions start at the padding index plus one. During decoder
    /// inference with a single-token input, the row is placed at the
    /// position given by `step` instead of at the sequence start.
    ///
    /// * `input` - Token identifiers.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `is_decoder` - Whether the caller is a decoder stack.
    /// * `train` - Whether the model is trained.
    /// * `step` - Decoding step, used for single-token inputs.
    ///
    /// Returns the summed embeddings.
    /// *Shape:* `(batch_size, seq_len, embedding_width)`
    pub fn forward(
        &self,
        input: &Tensor,
        is_decoder: bool,
        train: bool,
        step: usize,
    ) -> Result<Tensor, SinusoidalEmbeddingsError> {
        let (_, seq_len) = input.dims2().context(InputDimsSnafu)?;

        let single_step = is_decoder && !train && seq_len == 1;
        let last_position = if single_step {
            step + self.padding_idx + 1
        } else {
            seq_len + self.padding_idx
        };
        ensure!(
            last_position < self.max_length,
            SequenceLengthSnafu {
                position: last_position,
                max_length: self.max_length
            }
        );

        let positions: Vec<u32> = if single_step {
            vec![(step + self.padding_idx + 1) as u32]
        } else {
            (0..seq_len as u32)
                .map(|position| position + self.padding_idx as u32 + 1)
                .collect()
        };
        let position_embeddings = Tensor::from_vec(positions, seq_len, input.device())
            .and_then(|positions| self.position_embeddings.index_select(&positions, 0))
            .context(PositionLookupSnafu)?;

        let token_embeddings = self
            .token_embeddings
            .forward(input)
            .and_then(|embeddings| embeddings.affine((self.embedding_width as f64).sqrt(), 0.0))
            .context(TokenLookupSnafu)?;

        // Zero out padding tokens, leaving only the position signal.
        let not_padding = input
            .ne(self.padding_idx as u32)
            .and_then(|mask| mask.to_dtype(token_embeddings.dtype()))
            .and_then(|mask| mask.unsqueeze(2))
            .context(TokenLookupSnafu)?;

        token_embeddings
            .broadcast_mul(&not_padding)
            .and_then(|embeddings| embeddings.broadcast_add(&position_embeddings))
            .context(TokenLookupSnafu)
    }

    /// Token embedding matrix.
    /// *Shape:* `(vocab_size, embedding_width)`
    pub fn token_weight(&self) -> &Tensor {
        self.token_embeddings.embeddings()
    }

    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        params.push((
            format!("{prefix}.weight"),
            self.token_embeddings.embeddings().clone(),
        ));
    }
}

/// Build the sinusoidal position table row-major on the host.
///
/// The first half of each row holds sines, the second half cosines,
/// both over frequencies that decay exponentially with the channel.
/// The row at the padding index is zeroed.
fn sinusoidal_table(max_length: usize, width: usize, padding_idx: usize) -> Vec<f32> {
    let channel_size = width / 2;
    let denominator = channel_size.saturating_sub(1).max(1) as f64;

    let mut table = Vec::with_capacity(max_length * width);
    for position in 0..max_length {
        for channel in 0..channel_size {
            let frequency = (-(channel as f64) * 10_000f64.ln() / denominator).exp();
            table.push((position as f64 * frequency).sin() as f32);
        }
        for channel in 0..channel_size {
            let frequency = (-(channel as f64) * 10_000f64.ln() / denominator).exp();
            table.push((position as f64 * frequency).cos() as f32);
        }
    }

    for value in &mut table[padding_idx * width..(padding_idx + 1) * width] {
        *value = 0.0;
    }

    table
}

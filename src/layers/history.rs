use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::layers::{LayerNorm, LayerNormError};

/// Errors for the layer history.
#[derive(Debug, Snafu)]
pub enum LayerHistoryError {
    #[snafu(display("Cannot aggregate stored layers"))]
    Aggregate { source: candle_core::Error },

    #[snafu(display("History holds its capacity of {capacity} layers already"))]
    Capacity { capacity: usize },

    #[snafu(display("Cannot pop from an empty history"))]
    Empty,

    #[snafu(display("Cannot construct combination weights"))]
    HistoryConstruction { source: candle_core::Error },

    #[snafu(display("History storage was released, clear it with reset first"))]
    Inactive,

    #[snafu(display("Cannot construct entry normalization"))]
    NormConstruction { source: LayerNormError },

    #[snafu(display("Cannot normalize entry"))]
    NormalizeEntry { source: LayerNormError },
}

/// Dense residual aggregation across encoder layers.
///
/// Stores the output of every layer and replaces the plain residual stream
/// with a weighted combination of all stored outputs. Entries after the
/// first are normalized on the way in, one normalization per non-embedding
/// layer. The combination weights are learned, starting out as the uniform
/// mean over the stored entries.
///
/// See [Wang et al., 2019](https://arxiv.org/abs/1906.01787).
pub struct LayerHistory {
    weights: Vec<Tensor>,
    norms: Vec<LayerNorm>,
    entries: Option<Vec<Tensor>>,
}

impl LayerHistory {
    /// Construct a layer history.
    ///
    /// * `vb` - Variable store.
    /// * `n_layers` - Number of layers whose outputs are aggregated, not
    ///   counting the embedding.
    /// * `size` - Hidden width of the stored layers.
    /// * `use_l1` - Normalize entries with the mean absolute deviation.
    pub fn new(
        vb: VarBuilder,
        n_layers: usize,
        size: usize,
        use_l1: bool,
    ) -> Result<Self, LayerHistoryError> {
        let mut weights = Vec::with_capacity(n_layers + 1);
        for depth in 0..=n_layers {
            let count = depth + 1;
            let weight = vb
                .get_with_hints(
                    count,
                    &format!("weight_{depth}"),
                    Init::Const(1.0 / count as f64),
                )
                .context(HistoryConstructionSnafu)?;
            weights.push(weight);
        }

        let norms = (0..n_layers)
            .map(|norm| LayerNorm::new(vb.push_prefix(format!("norm_{norm}")), size, use_l1))
            .collect::<Result<Vec<_>, _>>()
            .context(NormConstructionSnafu)?;

        Ok(Self {
            weights,
            norms,
            entries: Some(Vec::new()),
        })
    }

    /// Number of stored layers.
    pub fn count(&self) -> usize {
        self.entries.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Store a layer output.
    ///
    /// The first stored entry is kept raw, every later entry is normalized
    /// by its own normalization.
    ///
    /// * `entry` - Layer output.
    ///   *Shape:* `(batch_size, seq_len, hidden_width)`
    pub fn add(&mut self, entry: Tensor) -> Result<(), LayerHistoryError> {
        let entries = self.entries.as_mut().context(InactiveSnafu)?;
        ensure!(
            entries.len() < self.weights.len(),
            CapacitySnafu {
                capacity: self.weights.len(),
            }
        );

        let entry = match entries.len() {
            0 => entry,
            count => self.norms[count - 1]
                .forward(&entry)
                .context(NormalizeEntrySnafu)?,
        };
        entries.push(entry);

        Ok(())
    }

    /// Combine all stored layers into a single representation.
    ///
    /// Returns the mean of the stored entries.
    /// *Shape:* `(batch_size, seq_len, hidden_width)`
    pub fn pop(&self) -> Result<Tensor, LayerHistoryError> {
        let entries = self.entries.as_ref().context(InactiveSnafu)?;
        ensure!(!entries.is_empty(), EmptySnafu);

        let count = entries.len();
        let weight = self.weights[count - 1]
            .reshape((count, 1, 1, 1))
            .context(AggregateSnafu)?;
        Tensor::stack(entries, 0)
            .and_then(|stack| stack.broadcast_mul(&weight))
            .and_then(|weighted| weighted.sum(0))
            .context(AggregateSnafu)
    }

    /// Discard all stored layers.
    ///
    /// With `reset` the history is ready for the next pass. Without it the
    /// storage itself is released and the history must be cleared with
    /// `reset` before it accepts entries again.
    pub fn clear(&mut self, reset: bool) {
        self.entries = if reset { Some(Vec::new()) } else { None };
    }

    /// Append the parameters of this module to `params` in enumeration
    /// order, named relative to `prefix`.
    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        for (depth, weight) in self.weights.iter().enumerate() {
            params.push((format!("{prefix}.weight_{depth}"), weight.clone()));
        }
        for (i, norm) in self.norms.iter().enumerate() {
            norm.append_params(&format!("{prefix}.norm_{i}"), params);
        }
    }
}

use candle_core::{DType, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::layers::dense_no_bias;

/// Output layer errors.
#[derive(Debug, Snafu)]
pub enum OutputLayerError {
    #[snafu(display("Cannot normalize the vocabulary distribution"))]
    Normalize { source: candle_core::Error },

    #[snafu(display("Cannot construct the output projection"))]
    OutputConstruction { source: candle_core::Error },

    #[snafu(display("Cannot project hidden representations to the vocabulary"))]
    Project { source: candle_core::Error },
}

/// Projection of hidden representations to the vocabulary.
pub struct OutputLayer {
    output: Linear,
}

impl OutputLayer {
    /// Construct an output layer.
    ///
    /// * `vb` - Variable store.
    /// * `hidden_width` - Width of the hidden representations.
    /// * `vocab_size` - Size of the output vocabulary.
    pub fn new(
        vb: VarBuilder,
        hidden_width: usize,
        vocab_size: usize,
    ) -> Result<Self, OutputLayerError> {
        let output = dense_no_bias(hidden_width, vocab_size, vb).context(OutputConstructionSnafu)?;
        Ok(Self { output })
    }

    /// Project hidden representations to the vocabulary.
    ///
    /// * `input` - Hidden representations.
    ///   *Shape:* `(batch_size, seq_len, hidden_width)`
    /// * `normalize` - Apply a softmax over the vocabulary axis.
    ///
    /// Returns logits, or a distribution when `normalize` is set.
    /// *Shape:* `(batch_size, seq_len, vocab_size)`
    pub fn forward(&self, input: &Tensor, normalize: bool) -> Result<Tensor, OutputLayerError> {
        let logits = self.output.forward(input).context(ProjectSnafu)?;
        if !normalize {
            return Ok(logits);
        }

        // Half precision overflows too easily in the softmax sums.
        let dtype = logits.dtype();
        if dtype == DType::F16 {
            logits
                .to_dtype(DType::F32)
                .and_then(|logits| candle_nn::ops::softmax(&logits, D::Minus1))
                .and_then(|distribution| distribution.to_dtype(dtype))
                .context(NormalizeSnafu)
        } else {
            candle_nn::ops::softmax(&logits, D::Minus1).context(NormalizeSnafu)
        }
    }

    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        params.push((format!("{prefix}.weight"), self.output.weight().clone()));
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::Array2;

    use super::OutputLayer;
    use crate::util::tests::{assert_tensor_eq, pseudo_random_tensor};

    #[test]
    fn distribution_sums_to_one() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let output = OutputLayer::new(vb, 8, 16).expect("Cannot construct output layer");

        let hidden =
            pseudo_random_tensor(&[2, 3, 8], 42, &Device::Cpu).expect("Cannot construct input");
        let distribution = output
            .forward(&hidden, true)
            .expect("Cannot project hidden representations");

        assert_eq!(distribution.dims(), [2, 3, 16]);
        let sums = distribution
            .sum(2)
            .expect("Cannot sum the vocabulary axis");
        assert_tensor_eq::<f32>(sums, Array2::<f32>::ones((2, 3)), 1e-5);
    }

    #[test]
    fn logits_are_unnormalized() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let output = OutputLayer::new(vb, 8, 16).expect("Cannot construct output layer");

        let hidden =
            pseudo_random_tensor(&[1, 2, 8], 42, &Device::Cpu).expect("Cannot construct input");
        let logits = output
            .forward(&hidden, false)
            .expect("Cannot project hidden representations");
        let distribution = output
            .forward(&hidden, true)
            .expect("Cannot project hidden representations");

        let softmaxed = candle_nn::ops::softmax(&logits, 2).expect("Cannot apply softmax");
        assert_tensor_eq::<f32>(softmaxed, distribution, 1e-6);
    }
}

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use crate::layers::dense;

/// Point-wise feed-forward layer.
///
/// This layer is applied pointwise, meaning that the same transformation is
/// applied to each sequence element:
///
/// `max(0, xW_1 + b_1)W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an intermediate width and `W_2`
/// and `b_2` transform the output of the rectifier back to the input width.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct PointwiseFeedForward {
    dropout: Dropout,
    intermediate: Linear,
    output: Linear,
}

impl PointwiseFeedForward {
    /// Construct a point-wise feed-forward layer.
    ///
    /// * `vb` - Variable builder used for the layer parameters.
    /// * `hidden_width` - Width of the layer input and output.
    /// * `intermediate_width` - Intermediate width inside the layer.
    /// * `dropout` - Dropout applied to the rectifier output.
    pub fn new(
        vb: VarBuilder,
        hidden_width: usize,
        intermediate_width: usize,
        dropout: Dropout,
    ) -> Result<Self, candle_core::Error> {
        let intermediate = dense(
            hidden_width,
            intermediate_width,
            vb.push_prefix("intermediate"),
        )?;
        let output = dense(intermediate_width, hidden_width, vb.push_prefix("output"))?;

        Ok(Self {
            dropout,
            intermediate,
            output,
        })
    }

    /// Append the parameters of this module to `params` in enumeration
    /// order, named relative to `prefix`.
    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        params.push((
            format!("{prefix}.intermediate.weight"),
            self.intermediate.weight().clone(),
        ));
        if let Some(bias) = self.intermediate.bias() {
            params.push((format!("{prefix}.intermediate.bias"), bias.clone()));
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

impl ModuleT for PointwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let hidden = self
            .intermediate
            .forward(xs)?
            .relu()
            .and_then(|hidden| self.dropout.forward(&hidden, train))?;
        self.output.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{Dropout, VarBuilder, VarMap};
    use ndarray::array;

    use super::PointwiseFeedForward;
    use crate::util::tests::{assert_tensor_eq, pseudo_random_tensor};

    #[test]
    fn output_has_input_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let feedforward = PointwiseFeedForward::new(vb, 4, 8, Dropout::new(0.0)).unwrap();

        let input = pseudo_random_tensor(&[2, 3, 4], 13, &Device::Cpu).unwrap();
        let output = feedforward.forward_t(&input, false).unwrap();
        assert_eq!(output.dims(), [2, 3, 4]);
    }

    #[test]
    fn rectifier_zeroes_negative_activations() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let feedforward = PointwiseFeedForward::new(vb, 2, 2, Dropout::new(0.0)).unwrap();

        let identity = Tensor::from_slice(&[1f32, 0.0, 0.0, 1.0], (2, 2), &device).unwrap();
        varmap.set_one("intermediate.weight", identity.clone()).unwrap();
        varmap.set_one("output.weight", identity).unwrap();

        let input = Tensor::from_slice(&[-1f32, 2.0], (1, 2), &device).unwrap();
        let output = feedforward.forward_t(&input, false).unwrap();
        assert_tensor_eq::<f32>(output, array![[0.0f32, 2.0]], 1e-6);
    }
}

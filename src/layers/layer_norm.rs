use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

/// Errors for layer normalization.
#[derive(Debug, Snafu)]
pub enum LayerNormError {
    #[snafu(display("Cannot construct layer"))]
    LayerNormConstruction { source: candle_core::Error },

    #[snafu(display("Cannot normalize input"))]
    Normalize { source: candle_core::Error },
}

/// Layer normalization over the last dimension.
///
/// Standardizes the input with the population standard deviation, or with
/// the mean absolute deviation for the `L1` variant. No stabilizing epsilon
/// is added, so a constant input row yields non-finite output.
///
/// See [Ba et al., 2016](https://arxiv.org/abs/1607.06450).
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    use_l1: bool,
}

impl LayerNorm {
    /// Construct a layer normalization module.
    ///
    /// * `vb` - Variable builder used for the normalization parameters.
    /// * `size` - Width of the normalized dimension.
    /// * `use_l1` - Normalize with the mean absolute deviation instead of
    ///   the standard deviation.
    pub fn new(vb: VarBuilder, size: usize, use_l1: bool) -> Result<Self, LayerNormError> {
        let weight = vb
            .get_with_hints(size, "weight", candle_nn::init::ONE)
            .context(LayerNormConstructionSnafu)?;
        let bias = vb
            .get_with_hints(size, "bias", candle_nn::init::ZERO)
            .context(LayerNormConstructionSnafu)?;

        Ok(Self {
            weight,
            bias,
            use_l1,
        })
    }

    /// Normalize the input over its last dimension.
    ///
    /// Reduced-precision inputs are standardized in full precision and cast
    /// back before the affine transform.
    ///
    /// * `input` - Input tensor. *Shape:* `(..., size)`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, LayerNormError> {
        self.normalize(input).context(NormalizeSnafu)
    }

    fn normalize(&self, input: &Tensor) -> Result<Tensor, candle_core::Error> {
        let dtype = input.dtype();
        let input = input.to_dtype(DType::F32)?;

        let mean = input.mean_keepdim(D::Minus1)?;
        let centered = input.broadcast_sub(&mean)?;
        let spread = if self.use_l1 {
            centered.abs()?.mean_keepdim(D::Minus1)?
        } else {
            centered.sqr()?.mean_keepdim(D::Minus1)?.sqrt()?
        };

        centered
            .broadcast_div(&spread)?
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }

    /// Get the scale parameter.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Get the shift parameter.
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Append the parameters of this module to `params` in enumeration
    /// order, named relative to `prefix`.
    pub(crate) fn append_params(&self, prefix: &str, params: &mut Vec<(String, Tensor)>) {
        params.push((format!("{prefix}.weight"), self.weight.clone()));
        params.push((format!("{prefix}.bias"), self.bias.clone()));
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, D};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::array;

    use super::LayerNorm;
    use crate::util::tests::{assert_tensor_eq, pseudo_random_tensor};

    fn layer_norm(size: usize, use_l1: bool) -> (VarMap, LayerNorm) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer_norm = LayerNorm::new(vb, size, use_l1).unwrap();
        (varmap, layer_norm)
    }

    #[test]
    fn standardizes_every_row() {
        let (_varmap, layer_norm) = layer_norm(4, false);
        let input = pseudo_random_tensor(&[2, 3, 4], 11, &Device::Cpu).unwrap();

        let output = layer_norm.forward(&input).unwrap();
        let means = output
            .mean_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let variances = output
            .sqr()
            .unwrap()
            .mean_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        for mean in means {
            assert!(mean.abs() < 1e-5);
        }
        for variance in variances {
            assert!((variance - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn l1_variant_uses_mean_absolute_deviation() {
        let (_varmap, layer_norm) = layer_norm(2, true);
        let input = Tensor::from_slice(&[1f32, 3.0], (1, 2), &Device::Cpu).unwrap();

        let output = layer_norm.forward(&input).unwrap();
        assert_tensor_eq::<f32>(output, array![[-1.0f32, 1.0]], 1e-5);
    }

    #[test]
    fn applies_the_affine_transform_after_standardizing() {
        let (mut varmap, layer_norm) = layer_norm(2, false);
        let device = Device::Cpu;
        varmap
            .set_one("weight", Tensor::from_slice(&[2f32, 2.0], (2,), &device).unwrap())
            .unwrap();
        varmap
            .set_one("bias", Tensor::from_slice(&[0.5f32, 0.5], (2,), &device).unwrap())
            .unwrap();

        let input = Tensor::from_slice(&[1f32, 3.0], (1, 2), &device).unwrap();
        let output = layer_norm.forward(&input).unwrap();
        assert_tensor_eq::<f32>(output, array![[-1.5f32, 2.5]], 1e-5);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::error::Error;
    use std::fmt::Debug;

    use approx::{assert_abs_diff_eq, AbsDiffEq};
    use candle_core::{Device, Tensor, WithDType};
    use ndarray::{ArrayBase, ArrayD, Dimension, OwnedRepr};
    use rand_core::RngCore;
    use rand_pcg::Pcg32;

    // Like TryInto, but we need our own trait so that we can implement it
    // for external types.
    pub trait IntoArrayD<T> {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>>;
    }

    impl<T> IntoArrayD<T> for Tensor
    where
        T: WithDType,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            (&self).into_arrayd()
        }
    }

    impl<T> IntoArrayD<T> for &Tensor
    where
        T: WithDType,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            let data = self.reshape(((),))?.to_vec1()?;
            Ok(ArrayD::from_shape_vec(self.shape().dims(), data)?)
        }
    }

    impl<D, T> IntoArrayD<T> for ArrayBase<OwnedRepr<T>, D>
    where
        D: Dimension,
        T: Clone,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            Ok(self.into_dyn())
        }
    }

    // The array! macro only nests up to three dimensions; a fourth level
    // of nesting yields an array of [T; N] elements, which stands for the
    // trailing axis.
    impl<D, T, const N: usize> IntoArrayD<T> for ArrayBase<OwnedRepr<[T; N]>, D>
    where
        D: Dimension,
        T: Clone,
    {
        fn into_arrayd(self) -> Result<ArrayD<T>, Box<dyn Error>> {
            let mut shape = self.shape().to_vec();
            shape.push(N);
            let data = self
                .iter()
                .flat_map(|inner| inner.iter().cloned())
                .collect();
            Ok(ArrayD::from_shape_vec(shape, data)?)
        }
    }

    pub(crate) fn assert_tensor_eq<T>(a: impl IntoArrayD<T>, b: impl IntoArrayD<T>, epsilon: T)
    where
        T: AbsDiffEq<Epsilon = T> + Clone + Debug,
    {
        let a = a.into_arrayd().expect("Cannot convert array");
        let b = b.into_arrayd().expect("Cannot convert array");

        assert_eq!(
            a.shape(),
            b.shape(),
            "Shape mismatch: {:?}, {:?}",
            a.shape(),
            b.shape()
        );

        assert_abs_diff_eq!(a, b, epsilon = epsilon);
    }

    /// Deterministic test tensor with values in `(-1, 1)`.
    ///
    /// * `shape` - Shape of the tensor.
    /// * `seed` - PRNG seed.
    /// * `device` - The device to allocate the tensor on.
    pub(crate) fn pseudo_random_tensor(
        shape: &[usize],
        seed: u64,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let mut rng = Pcg32::new(seed, 0);
        let n_elements = shape.iter().product();
        let values = (0..n_elements)
            .map(|_| {
                let next = rng.next_u32();

                // Generate a uniform random number in [0, 1). We don't use
                // rand's uniform sampler, because we want full control over
                // the sampling, so that test vectors don't get invalidated
                // by changes in the rand crate.
                let mantissa_bits_shift = u32::BITS - f32::MANTISSA_DIGITS;
                let zero_one =
                    (next >> mantissa_bits_shift) as f32 / (1 << f32::MANTISSA_DIGITS) as f32;

                // We have not used the least significant bit while generating
                // the random number, so we can use it to pick the sign.
                let sign = (next & 1) as f32;
                zero_one - sign
            })
            .collect::<Vec<_>>();
        Tensor::from_vec(values, shape, device)
    }
}

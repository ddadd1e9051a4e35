use burn::tensor::{backend, Float, Tensor};

pub trait TensorFloatExtension {
    /// `out[i] = x[0] * ... * x[i - 1]`, with `out[0] = 1`
    fn prod_cumulative_exclusive(
        self,
        dim: usize,
    ) -> Self;

    /// `out[i] = x[0] + ... + x[i]`
    fn sum_cumulative(
        self,
        dim: usize,
    ) -> Self;
}

impl<B: backend::Backend, const D: usize> TensorFloatExtension
    for Tensor<B, D, Float>
{
    fn prod_cumulative_exclusive(
        self,
        dim: usize,
    ) -> Self {
        assert!(dim < D, "dim should be less than self.dims().len()");

        let mut result = self.to_owned();

        let dims_batch = {
            let mut dims = self.dims();
            dims[dim] = 1;
            dims
        };
        let mut state_batch = Tensor::ones(dims_batch, &self.device());
        let mut ranges_batch = dims_batch.map(|dim| 0..dim);

        for (index, value_batch) in self.iter_dim(dim).enumerate() {
            ranges_batch[dim] = index..(index + 1);
            result = result
                .slice_assign(ranges_batch.to_owned(), state_batch.to_owned());
            state_batch = state_batch * value_batch;
        }

        result
    }

    fn sum_cumulative(
        self,
        dim: usize,
    ) -> Self {
        assert!(dim < D, "dim should be less than self.dims().len()");

        let mut result = self.to_owned();

        let dims_batch = {
            let mut dims = self.dims();
            dims[dim] = 1;
            dims
        };
        let mut state_batch = Tensor::zeros(dims_batch, &self.device());
        let mut ranges_batch = dims_batch.map(|dim| 0..dim);

        for (index, value_batch) in self.iter_dim(dim).enumerate() {
            ranges_batch[dim] = index..(index + 1);
            state_batch = state_batch + value_batch;
            result = result
                .slice_assign(ranges_batch.to_owned(), state_batch.to_owned());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Backend = burn::backend::NdArray;

    #[test]
    fn prod_cumulative_exclusive() {
        let device = Default::default();

        let input = Tensor::<Backend, 2>::from_floats(
            [[0.5, 0.5, 0.5], [1.0, 0.0, 2.0]],
            &device,
        );
        let target = Tensor::<Backend, 2>::from_floats(
            [[1.0, 0.5, 0.25], [1.0, 1.0, 0.0]],
            &device,
        );
        let output = input.prod_cumulative_exclusive(1);
        output.into_data().assert_approx_eq(&target.into_data(), 6);
    }

    #[test]
    fn sum_cumulative() {
        let device = Default::default();

        let input = Tensor::<Backend, 2>::from_floats(
            [[0.1, 0.2, 0.3, 0.4], [1.0, 0.0, 2.0, -1.0]],
            &device,
        );
        let target = Tensor::<Backend, 2>::from_floats(
            [[0.1, 0.3, 0.6, 1.0], [1.0, 1.0, 3.0, 2.0]],
            &device,
        );
        let output = input.sum_cumulative(1);
        output.into_data().assert_approx_eq(&target.into_data(), 5);
    }
}

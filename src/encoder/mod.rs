use crate::error::*;
use burn::prelude::*;
use std::f32::consts::PI;

#[derive(Config, Debug)]
pub struct PositionalEncoderConfig {
    #[config(default = 10)]
    pub encoding_factor: usize,
}

#[derive(Debug, Module)]
pub struct PositionalEncoder<B: Backend> {
    /// `[1, 2 * L, 1]`
    freqs: Tensor<B, 3>,
    /// `[1, 2 * L, 1]`
    phases: Tensor<B, 3>,
}

impl PositionalEncoderConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<PositionalEncoder<B>> {
        let encoding_factor = self.encoding_factor;
        if encoding_factor == 0 {
            return Err(Error::Validation(
                "Encoding factor".into(),
                "greater than 0".into(),
            ));
        }

        let shape = [1, 2 * encoding_factor, 1];
        let freqs = (0..encoding_factor)
            .flat_map(|level| [2.0_f32.powi(level as i32) * PI; 2])
            .collect::<Vec<_>>();
        let phases = [0.0, PI / 2.0].repeat(encoding_factor);

        Ok(PositionalEncoder {
            freqs: Tensor::from_data(TensorData::new(freqs, shape), device),
            phases: Tensor::from_data(TensorData::new(phases, shape), device),
        })
    }

    pub fn get_output_size(
        &self,
        input_size: usize,
    ) -> usize {
        input_size * (2 * self.encoding_factor + 1)
    }
}

impl<B: Backend> PositionalEncoder<B> {
    /// `[N, D]` to `[N, D * (2 * L + 1)]`
    pub fn forward(
        &self,
        coordinates: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let count = coordinates.dims()[0];
        let coordinates = coordinates.unsqueeze_dim::<3>(1);
        let features = (coordinates.to_owned() * self.freqs.to_owned()
            + self.phases.to_owned())
        .sin();

        Tensor::cat(vec![coordinates, features], 1).reshape([count as i32, -1])
    }
}

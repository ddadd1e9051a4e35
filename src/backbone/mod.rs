//! Image feature extraction for the source and query views.

use crate::{error::*, *};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation,
};

/// The feature maps of a batch of `V` images.
#[derive(Clone, Debug)]
pub struct FeatureMaps<B: Backend> {
    /// `[V, C1, H, W]`, projected for both rendering stages
    pub rendering: Tensor<B, 4>,
    /// `[V, C2, H', W']`, fused across scales for semantic decoding
    pub semantic: Tensor<B, 4>,
}

/// Extracts feature maps from images.
pub trait FeatureBackbone<B: Backend> {
    /// `images`: `[V, H, W, 3]` with values in `[0, 1]`
    fn extract(
        &self,
        images: Tensor<B, 4>,
    ) -> Result<FeatureMaps<B>>;
}

/// A small convolutional backbone with a half-resolution semantic branch.
#[derive(Config, Debug)]
pub struct ConvBackboneConfig {
    #[config(default = 32)]
    pub hidden_size: usize,
    #[config(default = 32)]
    pub rendering_size: usize,
    #[config(default = 64)]
    pub semantic_size: usize,
}

#[derive(Debug, Module)]
pub struct ConvBackbone<B: Backend> {
    stem: Vec<Conv2d<B>>,
    rendering_layer: Conv2d<B>,
    semantic_down_layer: Conv2d<B>,
    semantic_fusion_layer: Conv2d<B>,
}

impl ConvBackboneConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<ConvBackbone<B>> {
        let h = self.hidden_size;
        if [h, self.rendering_size, self.semantic_size].contains(&0) {
            return Err(Error::Validation(
                "Backbone channel counts".into(),
                "greater than 0".into(),
            ));
        }

        let conv3 = |input: usize, output: usize, stride: usize| {
            Conv2dConfig::new([input, output], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let conv1 = |input: usize, output: usize| {
            Conv2dConfig::new([input, output], [1, 1]).init(device)
        };

        Ok(ConvBackbone {
            stem: vec![conv3(3, h, 1), conv3(h, h, 1)],
            rendering_layer: conv1(h, self.rendering_size),
            semantic_down_layer: conv3(h, self.semantic_size, 2),
            semantic_fusion_layer: conv1(h + self.semantic_size, self.semantic_size),
        })
    }
}

impl<B: Backend> FeatureBackbone<B> for ConvBackbone<B> {
    fn extract(
        &self,
        images: Tensor<B, 4>,
    ) -> Result<FeatureMaps<B>> {
        let [view_count, height, width, channel_count] = images.dims();
        if channel_count != 3 || view_count == 0 {
            return Err(Error::ShapeMismatch(
                "Images".into(),
                vec![view_count.max(1), height, width, 3],
                images.dims().to_vec(),
            ));
        }

        let mut features = images.permute([0, 3, 1, 2]);
        for layer in &self.stem {
            features = activation::relu(layer.forward(features));
        }

        let semantic =
            activation::relu(self.semantic_down_layer.forward(features.to_owned()));
        let [_, _, semantic_height, semantic_width] = semantic.dims();
        // Fuses the full-resolution features, taken at the strided cells
        let strided =
            downsample(features.to_owned(), [semantic_height, semantic_width]);
        let semantic = self
            .semantic_fusion_layer
            .forward(Tensor::cat(vec![strided, semantic], 1));

        Ok(FeatureMaps {
            rendering: self.rendering_layer.forward(features),
            semantic,
        })
    }
}

/// Keeps every other cell of `features` so it fits `size`.
fn downsample<B: Backend>(
    features: Tensor<B, 4>,
    size: [usize; 2],
) -> Tensor<B, 4> {
    let device = features.device();
    let [_, _, height, width] = features.dims();
    let indices = |count: usize, limit: usize| {
        Tensor::<B, 1, Int>::arange_step(0..(2 * count) as i64, 2, &device)
            .clamp_max(limit as i64 - 1)
    };

    features
        .select(2, indices(size[0], height))
        .select(3, indices(size[1], width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    #[test]
    fn feature_map_shapes() {
        let device = Default::default();
        let backbone = ConvBackboneConfig::new()
            .with_hidden_size(4)
            .with_rendering_size(5)
            .with_semantic_size(7)
            .init::<Backend>(&device)
            .unwrap();

        let maps = backbone
            .extract(Tensor::random([2, 9, 8, 3], Distribution::Default, &device))
            .unwrap();
        assert_eq!(maps.rendering.dims(), [2, 5, 9, 8]);
        assert_eq!(maps.semantic.dims(), [2, 7, 5, 4]);

        assert!(backbone
            .extract(Tensor::zeros([2, 9, 8, 4], &device))
            .is_err());
    }

    #[test]
    fn downsample_keeps_even_cells() {
        let device = Default::default();
        let features = Tensor::<Backend, 1, Int>::arange(0..15, &device)
            .float()
            .reshape([1, 1, 3, 5]);

        downsample(features, [2, 3]).into_data().assert_approx_eq(
            &TensorData::from([[[[0.0f32, 2.0, 4.0], [10.0, 12.0, 14.0]]]]),
            6,
        );
    }
}

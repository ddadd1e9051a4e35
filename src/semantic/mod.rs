//! Decoding of per-pixel class logits from the query-view feature map.

use crate::{aggregator::MlpConfig, error::*, *};
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct SemanticHeadConfig {
    /// Channels of the query-view semantic feature map.
    #[config(default = 64)]
    pub feature_size: usize,
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 20)]
    pub num_classes: usize,
    /// The label of unlabeled pixels, excluded by the loss and the metric.
    #[config(default = 20)]
    pub ignore_label: usize,
    /// Channels of the per-ray latent fused into the selected pixels, if any.
    #[config(default = "None")]
    pub ray_feature_size: Option<usize>,
}

#[derive(Debug, Module)]
pub struct SemanticHead<B: Backend> {
    feature_size: usize,
    num_classes: usize,
    fusion_layer: Option<nn::Linear<B>>,
    decoder: aggregator::Mlp<B>,
}

impl SemanticHeadConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<SemanticHead<B>> {
        if self.num_classes == 0 {
            return Err(Error::Validation(
                "Class count".into(),
                "greater than 0".into(),
            ));
        }

        Ok(SemanticHead {
            feature_size: self.feature_size,
            num_classes: self.num_classes,
            fusion_layer: self.ray_feature_size.map(|size| {
                nn::LinearConfig::new(size, self.feature_size).init(device)
            }),
            decoder: MlpConfig::new(
                self.feature_size,
                self.hidden_size,
                self.num_classes,
            )
            .init(device),
        })
    }
}

impl<B: Backend> SemanticHead<B> {
    /// `K`
    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Whether [`forward_selected`](Self::forward_selected) takes per-ray latents.
    #[inline]
    pub fn fuses_ray_features(&self) -> bool {
        self.fusion_layer.is_some()
    }

    /// Decodes every cell of `feature_map` (`[C, H', W']`) into `[H', W', K]` logits.
    pub fn forward_dense(
        &self,
        feature_map: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>> {
        let [_, height, width] = self.check(&feature_map)?;
        let features = cells(feature_map);

        Ok(self
            .decoder
            .forward(features)
            .reshape([height, width, self.num_classes]))
    }

    /// Decodes only the pixels at `pixel_indices` into `[N, K]` logits, in the same order.
    ///
    /// - `image_size`: `[H, W]` of the image the row-major indices refer to
    /// - `ray_features`: `[N, C_r]`, the per-ray latents fused into the pixels when
    ///   the head was built with a fusion layer; they receive no gradient
    pub fn forward_selected(
        &self,
        feature_map: Tensor<B, 3>,
        pixel_indices: &[usize],
        image_size: [usize; 2],
        ray_features: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 2>> {
        let [_, map_height, map_width] = self.check(&feature_map)?;
        let [height, width] = image_size;
        let pixel_count = height * width;
        if let Some(index) = pixel_indices.iter().find(|&&i| i >= pixel_count) {
            return Err(Error::Validation(
                format!("Pixel index {index}"),
                format!("less than {pixel_count}"),
            ));
        }

        let device = feature_map.device();
        let cell_indices = pixel_indices
            .iter()
            .map(|&index| {
                let row = (index / width * map_height / height).min(map_height - 1);
                let col = (index % width * map_width / width).min(map_width - 1);
                (row * map_width + col) as i64
            })
            .collect::<Vec<_>>();
        let cell_indices = Tensor::<B, 1, Int>::from_data(
            TensorData::new(cell_indices, [pixel_indices.len()]),
            &device,
        );
        let mut features = cells(feature_map).select(0, cell_indices);

        match (&self.fusion_layer, ray_features) {
            (Some(fusion_layer), Some(ray_features)) => {
                let expected = [pixel_indices.len(), fusion_layer.weight.val().dims()[0]];
                if ray_features.dims() != expected {
                    return Err(Error::ShapeMismatch(
                        "Ray features".into(),
                        expected.to_vec(),
                        ray_features.dims().to_vec(),
                    ));
                }
                features =
                    features + fusion_layer.forward(ray_features.detach());
            },
            (None, Some(_)) => {
                return Err(Error::Validation(
                    "Ray features".into(),
                    "given only to a head with a fusion layer".into(),
                ));
            },
            _ => {},
        }

        Ok(self.decoder.forward(features))
    }

    fn check(
        &self,
        feature_map: &Tensor<B, 3>,
    ) -> Result<[usize; 3]> {
        let dims = feature_map.dims();
        if dims[0] != self.feature_size || dims[1] == 0 || dims[2] == 0 {
            return Err(Error::ShapeMismatch(
                "Semantic feature map".into(),
                vec![self.feature_size, dims[1].max(1), dims[2].max(1)],
                dims.to_vec(),
            ));
        }
        Ok(dims)
    }
}

/// `[C, H, W]` to `[H * W, C]`
fn cells<B: Backend>(feature_map: Tensor<B, 3>) -> Tensor<B, 2> {
    let [channels, height, width] = feature_map.dims();
    feature_map
        .reshape([channels, height * width])
        .swap_dims(0, 1)
}

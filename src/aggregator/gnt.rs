use super::*;
use crate::encoder::{PositionalEncoder, PositionalEncoderConfig};
use burn::module::Param;

/// Attention across views, then across samples, repeated `depth` times.
#[derive(Config, Debug)]
pub struct GntNetworkConfig {
    /// Channels of the source feature maps.
    #[config(default = 32)]
    pub feature_size: usize,
    #[config(default = 64)]
    pub hidden_size: usize,
    #[config(default = 4)]
    pub depth: usize,
    #[config(default = 4)]
    pub head_count: usize,
    #[config(default = "PositionalEncoderConfig::new()")]
    pub point_encoder: PositionalEncoderConfig,
    #[config(default = "PositionalEncoderConfig::new()")]
    pub direction_encoder: PositionalEncoderConfig,
    /// Initializes the point queries with a view-weighted mean instead of a maximum.
    #[config(default = false)]
    pub anti_alias_pooling: bool,
    /// Predicts per-sample densities for alpha compositing instead of the ray color.
    #[config(default = false)]
    pub density_readout: bool,
}

#[derive(Debug, Module)]
pub struct GntNetwork<B: Backend> {
    feature_size: usize,
    color_feature_layer: Mlp<B>,
    view_layers: Vec<ViewTransformer<B>>,
    query_layers: Vec<Mlp<B>>,
    ray_layers: Vec<RayTransformer<B>>,
    point_encoder: PositionalEncoder<B>,
    direction_encoder: PositionalEncoder<B>,
    output_norm: nn::LayerNorm<B>,
    color_layer: nn::Linear<B>,
    /// Per-sample `[r, g, b, sigma]`, present for the density readout.
    density_layer: Option<nn::Linear<B>>,
    /// `[1]`, present for anti-alias pooling.
    sharpness: Option<Param<Tensor<B, 1>>>,
}

impl GntNetworkConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<GntNetwork<B>> {
        let h = self.hidden_size;
        if h == 0 {
            return Err(Error::Validation(
                "Hidden size".into(),
                "greater than 0".into(),
            ));
        }
        if self.depth == 0 {
            return Err(Error::Validation(
                "Transformer depth".into(),
                "greater than 0".into(),
            ));
        }

        let encoded_size = self.point_encoder.get_output_size(3)
            + self.direction_encoder.get_output_size(3);

        let mut view_layers = Vec::with_capacity(self.depth);
        let mut query_layers = Vec::with_capacity(self.depth.div_ceil(2));
        let mut ray_layers = Vec::with_capacity(self.depth);
        for index in 0..self.depth {
            view_layers.push(ViewTransformerConfig::new(h).init(device));
            if index % 2 == 0 {
                query_layers
                    .push(MlpConfig::new(h + encoded_size, h, h).init(device));
            }
            ray_layers.push(
                RayTransformerConfig::new(h)
                    .with_head_count(self.head_count)
                    .init(device)?,
            );
        }

        Ok(GntNetwork {
            feature_size: self.feature_size,
            color_feature_layer: MlpConfig::new(3 + self.feature_size, h, h)
                .init(device),
            view_layers,
            query_layers,
            ray_layers,
            point_encoder: self.point_encoder.init(device)?,
            direction_encoder: self.direction_encoder.init(device)?,
            output_norm: layer_norm(h, device),
            color_layer: nn::LinearConfig::new(h, 3).init(device),
            density_layer: self
                .density_readout
                .then(|| nn::LinearConfig::new(h, 4).init(device)),
            sharpness: self.anti_alias_pooling.then(|| {
                Param::from_tensor(Tensor::ones([1], device))
            }),
        })
    }
}

impl<B: Backend> GntNetwork<B> {
    /// Initial point queries, `[R, S, D]`.
    fn pool(
        &self,
        features: Tensor<B, 4>,
        directions: Tensor<B, 4>,
        mask: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let sharpness = match &self.sharpness {
            Some(sharpness) => sharpness.val(),
            None => return masked_max(features, mask),
        };

        let [ray_count, point_count, view_count, _] = directions.dims();
        let dot = directions.slice([0..ray_count, 0..point_count, 0..view_count, 3..4]);
        let closeness =
            ((dot - 1.0) * sharpness.abs().reshape([1, 1, 1, 1])).exp();
        let nearest = closeness.to_owned().swap_dims(2, 3).min_dim(3).swap_dims(2, 3);
        let weights = (closeness - nearest) * mask;
        let weights =
            weights.to_owned() / (weights.sum_dim(2) + 1e-8);

        (features * weights).sum_dim(2).squeeze::<3>(2)
    }

    /// `[R, S, E]`, the encodings of the points and of their ray directions.
    fn encode(
        &self,
        samples: &SampleSet<B>,
        rays: &RayBatch<B>,
    ) -> Tensor<B, 3> {
        let [ray_count, point_count, _] = samples.positions.dims();

        let points = self
            .point_encoder
            .forward(samples.positions.to_owned().reshape([ray_count * point_count, 3]))
            .reshape([ray_count as i32, point_count as i32, -1]);

        let directions = rays.directions.to_owned();
        let norms = directions.to_owned().powf_scalar(2.0).sum_dim(1).sqrt();
        let directions = self
            .direction_encoder
            .forward(directions / norms.clamp_min(1e-6))
            .unsqueeze_dim::<3>(1)
            .repeat_dim(1, point_count);

        Tensor::cat(vec![points, directions], 2)
    }
}

impl<B: Backend> RenderingModel<B> for GntNetwork<B> {
    fn feature_size(&self) -> usize {
        self.feature_size
    }

    fn aggregate(
        &self,
        bundle: &ViewFeatureBundle<B>,
        samples: &SampleSet<B>,
        rays: &RayBatch<B>,
    ) -> Result<Aggregation<B>> {
        check_bundle(bundle, samples, self.feature_size)?;

        let mask = bundle.mask_float();
        let directions = bundle.directions.to_owned();
        let features = self
            .color_feature_layer
            .forward(bundle.colored_features())
            * mask.to_owned();
        let encodings = self.encode(samples, rays);

        let mut queries =
            self.pool(features.to_owned(), directions.to_owned(), mask.to_owned());
        let mut attention = None;
        let mut query_layers = self.query_layers.iter();

        for (index, (view_layer, ray_layer)) in
            self.view_layers.iter().zip(&self.ray_layers).enumerate()
        {
            queries = view_layer.forward(
                queries,
                features.to_owned(),
                directions.to_owned(),
                mask.to_owned(),
            );
            if index % 2 == 0 {
                if let Some(query_layer) = query_layers.next() {
                    queries = query_layer.forward(Tensor::cat(
                        vec![queries, encodings.to_owned()],
                        2,
                    ));
                }
            }
            let (outputs, weights) = ray_layer.forward(queries);
            queries = outputs;
            attention = Some(weights);
        }

        let queries = self.output_norm.forward(queries);
        let features = queries.to_owned().mean_dim(1).squeeze::<2>(1);

        if let Some(density_layer) = &self.density_layer {
            let [ray_count, point_count, _] = queries.dims();
            let outputs = density_layer.forward(queries);
            let rgb = activation::sigmoid(
                outputs.to_owned().slice([0..ray_count, 0..point_count, 0..3]),
            );
            let sigma = activation::relu(
                outputs
                    .slice([0..ray_count, 0..point_count, 3..4])
                    .squeeze::<2>(2),
            );
            let alpha = -(-sigma).exp() + 1.0;

            return Ok(Aggregation::Radiance {
                rgb,
                alpha,
                features,
            });
        }

        let rgb = self.color_layer.forward(features.to_owned());
        // Averaged over heads and queries, rows still sum to one
        let weights = match attention {
            Some(attention) => attention
                .mean_dim(1)
                .mean_dim(2)
                .squeeze::<3>(2)
                .squeeze::<2>(1),
            None => {
                let [ray_count, point_count] = samples.depths.dims();
                Tensor::full(
                    [ray_count, point_count],
                    1.0 / point_count as f64,
                    &samples.depths.device(),
                )
            },
        };

        Ok(Aggregation::Color {
            rgb,
            weights,
            features,
        })
    }
}

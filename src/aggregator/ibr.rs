use super::*;

/// Mean and variance pooling across views, a density per sample and a
/// blend of the source colors.
#[derive(Config, Debug)]
pub struct IbrNetworkConfig {
    /// Channels of the source feature maps.
    #[config(default = 32)]
    pub feature_size: usize,
    #[config(default = 32)]
    pub hidden_size: usize,
    #[config(default = 16)]
    pub geometry_size: usize,
    #[config(default = 4)]
    pub head_count: usize,
}

#[derive(Debug, Module)]
pub struct IbrNetwork<B: Backend> {
    feature_size: usize,
    direction_layer: Mlp<B>,
    base_layer: Mlp<B>,
    /// Outputs a feature residual and a visibility logit.
    visibility_layer: Mlp<B>,
    visibility_output_layer: Mlp<B>,
    geometry_layer: Mlp<B>,
    ray_attention: nn::attention::MultiHeadAttention<B>,
    density_layer: Mlp<B>,
    blending_layer: Mlp<B>,
}

impl IbrNetworkConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<IbrNetwork<B>> {
        let input_size = 3 + self.feature_size;
        let h = self.hidden_size;
        let g = self.geometry_size;
        if h == 0 || g == 0 {
            return Err(Error::Validation(
                "Hidden and geometry sizes".into(),
                "greater than 0".into(),
            ));
        }
        if self.head_count == 0 || g % self.head_count != 0 {
            return Err(Error::Validation(
                format!("Head count {}", self.head_count),
                format!("a divisor of the geometry size {g}"),
            ));
        }

        Ok(IbrNetwork {
            feature_size: self.feature_size,
            direction_layer: MlpConfig::new(4, 16, input_size).init(device),
            base_layer: MlpConfig::new(3 * input_size, 2 * h, h).init(device),
            visibility_layer: MlpConfig::new(h, h, h + 1).init(device),
            visibility_output_layer: MlpConfig::new(h, h, 1).init(device),
            geometry_layer: MlpConfig::new(2 * h + 1, 2 * g, g).init(device),
            ray_attention: nn::attention::MultiHeadAttentionConfig::new(
                g,
                self.head_count,
            )
            .with_dropout(0.0)
            .init(device),
            density_layer: MlpConfig::new(g, g, 1).init(device),
            blending_layer: MlpConfig::new(h + 1 + 4, 8, 1).init(device),
        })
    }
}

impl<B: Backend> RenderingModel<B> for IbrNetwork<B> {
    fn feature_size(&self) -> usize {
        self.feature_size
    }

    fn aggregate(
        &self,
        bundle: &ViewFeatureBundle<B>,
        samples: &SampleSet<B>,
        _rays: &RayBatch<B>,
    ) -> Result<Aggregation<B>> {
        check_bundle(bundle, samples, self.feature_size)?;

        let [ray_count, point_count, view_count, _] = bundle.colors.dims();
        let mask = bundle.mask_float();
        let directions = bundle.directions.to_owned();
        let seen_count = mask.to_owned().sum_dim(2);

        let inputs = bundle.colored_features()
            + self.direction_layer.forward(directions.to_owned());
        let weights = mask.to_owned() / (seen_count.to_owned() + 1e-8);
        let (mean, variance) =
            weighted_mean_variance(inputs.to_owned(), weights.to_owned());
        let global = Tensor::cat(vec![mean, variance], 3).repeat_dim(2, view_count);

        let features = activation::relu(
            self.base_layer.forward(Tensor::cat(vec![global, inputs], 3)),
        );

        let [.., hidden_size] = features.dims();
        let outputs = self.visibility_layer.forward(features.to_owned() * weights);
        let residual = outputs.to_owned().slice([
            0..ray_count,
            0..point_count,
            0..view_count,
            0..hidden_size,
        ]);
        let visibility = activation::sigmoid(outputs.slice([
            0..ray_count,
            0..point_count,
            0..view_count,
            hidden_size..hidden_size + 1,
        ])) * mask.to_owned();
        let features = features + residual;
        let visibility = activation::sigmoid(
            self.visibility_output_layer
                .forward(features.to_owned() * visibility),
        ) * mask.to_owned();

        let weights = visibility.to_owned()
            / (visibility.to_owned().sum_dim(2) + 1e-8);
        let (mean, variance) =
            weighted_mean_variance(features.to_owned(), weights.to_owned());
        let geometry = self
            .geometry_layer
            .forward(Tensor::cat(
                vec![mean, variance, weights.mean_dim(2)],
                3,
            ))
            .squeeze::<3>(2);

        let geometry = self
            .ray_attention
            .forward(nn::attention::MhaInput::self_attn(geometry))
            .context;
        let is_seen = seen_count.squeeze::<3>(3).squeeze::<2>(2).clamp_max(1.0);
        let sigma = activation::relu(
            self.density_layer.forward(geometry.to_owned()).squeeze::<2>(2),
        ) * is_seen;
        let alpha = -(-sigma).exp() + 1.0;

        let scores = self
            .blending_layer
            .forward(Tensor::cat(vec![features, visibility, directions], 3));
        let scores = scores * mask.to_owned() + (mask.to_owned() - 1.0) * 1e9;
        let blending = activation::softmax(scores, 2) * mask;
        let rgb = (bundle.colors.to_owned() * blending)
            .sum_dim(2)
            .squeeze::<3>(2);

        Ok(Aggregation::Radiance {
            rgb,
            alpha,
            features: geometry.mean_dim(1).squeeze::<2>(1),
        })
    }
}

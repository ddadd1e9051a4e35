use super::*;
use burn::nn::attention::{MhaInput, MultiHeadAttentionConfig};

/// Attention across the source views of every sample point.
#[derive(Config, Debug)]
pub struct ViewTransformerConfig {
    pub hidden_size: usize,
    /// Channels of the relative direction encoding.
    #[config(default = 4)]
    pub direction_size: usize,
}

#[derive(Debug, Module)]
pub struct ViewTransformer<B: Backend> {
    attention_norm: nn::LayerNorm<B>,
    query_layer: nn::Linear<B>,
    key_layer: nn::Linear<B>,
    value_layer: nn::Linear<B>,
    direction_layer: Mlp<B>,
    score_layer: Mlp<B>,
    output_layer: nn::Linear<B>,
    feed_forward_norm: nn::LayerNorm<B>,
    feed_forward: Mlp<B>,
}

/// Self-attention across the samples of every ray.
#[derive(Config, Debug)]
pub struct RayTransformerConfig {
    pub hidden_size: usize,
    #[config(default = 4)]
    pub head_count: usize,
}

#[derive(Debug, Module)]
pub struct RayTransformer<B: Backend> {
    attention_norm: nn::LayerNorm<B>,
    attention: nn::attention::MultiHeadAttention<B>,
    feed_forward_norm: nn::LayerNorm<B>,
    feed_forward: Mlp<B>,
}

impl ViewTransformerConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ViewTransformer<B> {
        let h = self.hidden_size;
        let linear = || nn::LinearConfig::new(h, h).with_bias(false).init(device);

        ViewTransformer {
            attention_norm: layer_norm(h, device),
            query_layer: linear(),
            key_layer: linear(),
            value_layer: linear(),
            direction_layer: MlpConfig::new(self.direction_size, (h / 8).max(1), h)
                .init(device),
            score_layer: MlpConfig::new(h, (h / 8).max(1), h).init(device),
            output_layer: nn::LinearConfig::new(h, h).init(device),
            feed_forward_norm: layer_norm(h, device),
            feed_forward: MlpConfig::new(h, 4 * h, h).init(device),
        }
    }
}

impl<B: Backend> ViewTransformer<B> {
    /// Updates the point queries from the views that see them.
    ///
    /// - `queries`: `[R, S, D]`
    /// - `keys`: `[R, S, V, D]`
    /// - `directions`: `[R, S, V, 4]`
    /// - `mask`: `[R, S, V, 1]`, one for valid views
    ///
    /// A point seen by no view receives a zero attention update.
    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 4>,
        directions: Tensor<B, 4>,
        mask: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let residual = queries.to_owned();
        let queries = self
            .query_layer
            .forward(self.attention_norm.forward(queries))
            .unsqueeze_dim::<4>(2);
        let keys = self.key_layer.forward(keys);
        let values = self.value_layer.forward(keys.to_owned());
        let positions = self.direction_layer.forward(directions);

        // Vector attention, one weight per channel
        let scores = self
            .score_layer
            .forward(keys - queries + positions.to_owned());
        let scores = scores * mask.to_owned() + (mask.to_owned() - 1.0) * 1e9;
        let attention = activation::softmax(scores, 2) * mask;

        let outputs = ((values + positions) * attention)
            .sum_dim(2)
            .squeeze::<3>(2);
        let outputs = self.output_layer.forward(outputs) + residual;

        self.feed_forward
            .forward(self.feed_forward_norm.forward(outputs.to_owned()))
            + outputs
    }
}

impl RayTransformerConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<RayTransformer<B>> {
        let h = self.hidden_size;
        if self.head_count == 0 || h % self.head_count != 0 {
            return Err(Error::Validation(
                format!("Head count {}", self.head_count),
                format!("a divisor of the hidden size {h}"),
            ));
        }

        Ok(RayTransformer {
            attention_norm: layer_norm(h, device),
            attention: MultiHeadAttentionConfig::new(h, self.head_count)
                .with_dropout(0.0)
                .init(device),
            feed_forward_norm: layer_norm(h, device),
            feed_forward: MlpConfig::new(h, 4 * h, h).init(device),
        })
    }
}

impl<B: Backend> RayTransformer<B> {
    /// Updates the point features `inputs` (`[R, S, D]`) from the other points of their ray.
    ///
    /// Also returns the attention weights, `[R, heads, S, S]`.
    pub fn forward(
        &self,
        inputs: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let output = self.attention.forward(MhaInput::self_attn(
            self.attention_norm.forward(inputs.to_owned()),
        ));
        let outputs = output.context + inputs;
        let outputs = self
            .feed_forward
            .forward(self.feed_forward_norm.forward(outputs.to_owned()))
            + outputs;

        (outputs, output.weights)
    }
}

pub(crate) fn layer_norm<B: Backend>(
    size: usize,
    device: &B::Device,
) -> nn::LayerNorm<B> {
    nn::LayerNormConfig::new(size).with_epsilon(1e-6).init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    #[test]
    fn view_transformer_is_invariant_to_view_order() {
        let device = Default::default();

        let model = ViewTransformerConfig::new(16).init::<Backend>(&device);
        let queries =
            Tensor::<Backend, 3>::random([2, 3, 16], Distribution::Default, &device);
        let keys = Tensor::<Backend, 4>::random(
            [2, 3, 4, 16],
            Distribution::Default,
            &device,
        );
        let directions = Tensor::<Backend, 4>::random(
            [2, 3, 4, 4],
            Distribution::Default,
            &device,
        );
        let mask = Tensor::<Backend, 4>::from_floats(
            [[[[1.0], [0.0], [1.0], [1.0]]; 3]; 2],
            &device,
        );

        let order = Tensor::<Backend, 1, Int>::from_ints([2, 0, 3, 1], &device);
        let permute = |x: Tensor<Backend, 4>| x.select(2, order.to_owned());

        let outputs = model.forward(
            queries.to_owned(),
            keys.to_owned(),
            directions.to_owned(),
            mask.to_owned(),
        );
        let outputs_permuted = model.forward(
            queries,
            permute(keys),
            permute(directions),
            permute(mask),
        );

        outputs
            .into_data()
            .assert_approx_eq(&outputs_permuted.into_data(), 4);
    }

    #[test]
    fn view_transformer_ignores_invalid_values() {
        let device = Default::default();

        let model = ViewTransformerConfig::new(8).init::<Backend>(&device);
        let queries =
            Tensor::<Backend, 3>::random([1, 2, 8], Distribution::Default, &device);
        let keys = Tensor::<Backend, 4>::random(
            [1, 2, 3, 8],
            Distribution::Default,
            &device,
        );
        let directions = Tensor::<Backend, 4>::random(
            [1, 2, 3, 4],
            Distribution::Default,
            &device,
        );
        let mask =
            Tensor::<Backend, 4>::from_floats([[[[1.0], [0.0], [0.0]]; 2]], &device);

        let outputs = model.forward(
            queries.to_owned(),
            keys.to_owned(),
            directions.to_owned(),
            mask.to_owned(),
        );
        // Only the placeholders of invalid views change
        let keys_changed = keys.slice_assign(
            [0..1, 0..2, 1..3, 0..8],
            Tensor::full([1, 2, 2, 8], 1e3, &device),
        );
        let outputs_changed = model.forward(queries, keys_changed, directions, mask);

        outputs
            .into_data()
            .assert_approx_eq(&outputs_changed.into_data(), 4);
    }

    #[test]
    fn view_transformer_without_valid_views_is_finite() {
        let device = Default::default();

        let model = ViewTransformerConfig::new(8).init::<Backend>(&device);
        let outputs = model.forward(
            Tensor::<Backend, 3>::zeros([1, 2, 8], &device),
            Tensor::ones([1, 2, 3, 8], &device),
            Tensor::ones([1, 2, 3, 4], &device),
            Tensor::zeros([1, 2, 3, 1], &device),
        );

        let values = outputs.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn ray_transformer_output_shape() {
        let device = Default::default();

        let model = RayTransformerConfig::new(16)
            .init::<Backend>(&device)
            .unwrap();
        let (outputs, weights) = model.forward(Tensor::random(
            [3, 5, 16],
            Distribution::Default,
            &device,
        ));
        assert_eq!(outputs.dims(), [3, 5, 16]);
        assert_eq!(weights.dims(), [3, 4, 5, 5]);

        // Attention rows are distributions
        weights.sum_dim(3).into_data().assert_approx_eq(
            &Tensor::<Backend, 4>::ones([3, 4, 5, 1], &device).into_data(),
            4,
        );

        let config_invalid = RayTransformerConfig::new(16).with_head_count(3);
        assert!(config_invalid.init::<Backend>(&device).is_err());
    }
}

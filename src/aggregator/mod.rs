//! Multi-view aggregation of projected features into ray colors.
//!
//! Stage A attends across the source views of every sample point, and stage B
//! attends across the samples of every ray. Both stages ignore invalid views,
//! so their outputs do not depend on the order of the source views.

pub mod gnt;
pub mod ibr;
pub mod transformer;

pub use gnt::*;
pub use ibr::*;
pub use transformer::*;

use crate::{
    camera::RayBatch,
    compositor::{self, StageOutput},
    error::*,
    projector::ViewFeatureBundle,
    sampler::SampleSet,
    *,
};
use burn::{prelude::*, tensor::activation};

/// What stage B hands to the compositor.
#[derive(Clone, Debug)]
pub enum Aggregation<B: Backend> {
    /// The ray color is predicted directly, along with how much every sample contributed.
    Color {
        /// `[R, 3]`
        rgb: Tensor<B, 2>,
        /// `[R, S]`, summing to one along `S`
        weights: Tensor<B, 2>,
        /// `[R, C]`
        features: Tensor<B, 2>,
    },
    /// Per-sample colors and opacities to be alpha-composited.
    Radiance {
        /// `[R, S, 3]`
        rgb: Tensor<B, 3>,
        /// `[R, S]`, in `[0, 1]`
        alpha: Tensor<B, 2>,
        /// `[R, C]`
        features: Tensor<B, 2>,
    },
}

/// A network that turns multi-view observations of sample points into ray outputs.
pub trait RenderingModel<B: Backend> {
    /// The channel count `C` of the source feature maps it consumes.
    fn feature_size(&self) -> usize;

    /// Aggregates the observations in `bundle` of the points in `samples`.
    fn aggregate(
        &self,
        bundle: &ViewFeatureBundle<B>,
        samples: &SampleSet<B>,
        rays: &RayBatch<B>,
    ) -> Result<Aggregation<B>>;

    /// Composites an aggregation into the outputs of one stage.
    ///
    /// - `visibility`: `[R, S]`, one for samples seen by any source view
    fn composite(
        &self,
        aggregation: Aggregation<B>,
        samples: &SampleSet<B>,
        visibility: Tensor<B, 2>,
        white_background: bool,
    ) -> StageOutput<B> {
        let depths = samples.depths.to_owned();
        let valid = compositor::valid_rays(visibility);

        match aggregation {
            Aggregation::Color {
                rgb,
                weights,
                features,
            } => StageOutput::new(
                compositor::composite_weights(
                    rgb,
                    weights,
                    depths,
                    white_background,
                ),
                None,
                valid,
                features,
            ),
            Aggregation::Radiance {
                rgb,
                alpha,
                features,
            } => StageOutput::new(
                compositor::composite_radiance(
                    rgb,
                    alpha.to_owned(),
                    depths,
                    white_background,
                ),
                Some(alpha),
                valid,
                features,
            ),
        }
    }
}

impl<B: Backend> Aggregation<B> {
    /// `[R, C]`
    pub fn features(&self) -> &Tensor<B, 2> {
        match self {
            Self::Color { features, .. } | Self::Radiance { features, .. } => {
                features
            },
        }
    }
}

/// Two linear layers with a ReLU between them.
#[derive(Config, Debug)]
pub struct MlpConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    #[config(default = true)]
    pub bias: bool,
}

#[derive(Debug, Module)]
pub struct Mlp<B: Backend> {
    hidden_layer: nn::Linear<B>,
    output_layer: nn::Linear<B>,
}

impl MlpConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Mlp<B> {
        Mlp {
            hidden_layer: nn::LinearConfig::new(self.input_size, self.hidden_size)
                .with_bias(self.bias)
                .init(device),
            output_layer: nn::LinearConfig::new(
                self.hidden_size,
                self.output_size,
            )
            .with_bias(self.bias)
            .init(device),
        }
    }
}

impl<B: Backend> Mlp<B> {
    pub fn forward<const D: usize>(
        &self,
        inputs: Tensor<B, D>,
    ) -> Tensor<B, D> {
        self.output_layer
            .forward(activation::relu(self.hidden_layer.forward(inputs)))
    }
}

/// Rejects bundles whose feature channels or point counts do not match.
pub(crate) fn check_bundle<B: Backend>(
    bundle: &ViewFeatureBundle<B>,
    samples: &SampleSet<B>,
    feature_size: usize,
) -> Result<()> {
    let [ray_count, point_count, view_count, size] = bundle.features.dims();
    if size != feature_size {
        return Err(Error::ShapeMismatch(
            "Projected feature channels".into(),
            vec![feature_size],
            vec![size],
        ));
    }
    let expected = [ray_count, point_count, 3];
    if samples.positions.dims() != expected {
        return Err(Error::ShapeMismatch(
            "Sample positions".into(),
            expected.to_vec(),
            samples.positions.dims().to_vec(),
        ));
    }
    if view_count == 0 {
        return Err(Error::Validation(
            "Projected view count".into(),
            "greater than 0".into(),
        ));
    }

    Ok(())
}

/// `[R, S, V, D]` to `[R, S, D]`, the largest value over valid views.
///
/// Points seen by no view get zeros.
pub(crate) fn masked_max<B: Backend>(
    values: Tensor<B, 4>,
    mask: Tensor<B, 4>,
) -> Tensor<B, 3> {
    // Reduced along the last axis, the only one the ndarray backward supports.
    let visible = mask.to_owned().sum_dim(2).squeeze::<3>(2).clamp_max(1.0);
    let values = values * mask.to_owned() + (mask - 1.0) * 1e9;

    values.swap_dims(2, 3).max_dim(3).squeeze::<3>(3) * visible
}

/// Weighted mean and variance over views.
///
/// - `values`: `[R, S, V, D]`
/// - `weights`: `[R, S, V, 1]`, summing to one (or zero) along `V`
///
/// Returns two `[R, S, 1, D]` tensors.
pub(crate) fn weighted_mean_variance<B: Backend>(
    values: Tensor<B, 4>,
    weights: Tensor<B, 4>,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let mean = (values.to_owned() * weights.to_owned()).sum_dim(2);
    let variance = ((values - mean.to_owned()).powf_scalar(2.0) * weights)
        .sum_dim(2);

    (mean, variance)
}

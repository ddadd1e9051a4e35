//! Alpha compositing of per-sample contributions along rays.

use crate::{tensor::TensorFloatExtension, *};
use burn::prelude::*;

/// Keeps the transmittance positive when an opacity reaches one.
pub const TRANSMITTANCE_EPSILON: f64 = 1e-10;

/// A ray is trusted when more than this many of its samples are seen.
pub const VALID_SAMPLE_THRESHOLD: usize = 8;

/// The composited quantities of one ray batch.
#[derive(Clone, Debug)]
pub struct Composite<B: Backend> {
    /// `[R, 3]`
    pub rgb: Tensor<B, 2>,
    /// `[R]`
    pub depth: Tensor<B, 1>,
    /// `[R, S]`
    pub weights: Tensor<B, 2>,
    /// `[R]`
    pub acc: Tensor<B, 1>,
}

/// Everything one stage (coarse or fine) produces for a ray batch.
#[derive(Clone, Debug)]
pub struct StageOutput<B: Backend> {
    /// `[R, 3]`
    pub rgb: Tensor<B, 2>,
    /// `[R]`
    pub depth: Tensor<B, 1>,
    /// `[R, S]`
    pub weights: Tensor<B, 2>,
    /// `[R, S]`, present when opacities were predicted per sample
    pub alpha: Option<Tensor<B, 2>>,
    /// `[R]`
    pub acc: Tensor<B, 1>,
    /// `[R]`
    pub valid: Tensor<B, 1, Bool>,
    /// `[R, C]`, the per-ray latent feature
    pub features: Tensor<B, 2>,
}

/// Composites per-sample colors `rgb` (`[R, S, 3]`) with opacities `alpha` (`[R, S]`).
///
/// `w_i = alpha_i * prod_{j < i} (1 - alpha_j)`
pub fn composite_radiance<B: Backend>(
    rgb: Tensor<B, 3>,
    alpha: Tensor<B, 2>,
    depths: Tensor<B, 2>,
    white_background: bool,
) -> Composite<B> {
    let alpha = alpha.clamp(0.0, 1.0);
    // Added after the subtraction, where it survives in single precision
    let transmittance = ((-alpha.to_owned() + 1.0) + TRANSMITTANCE_EPSILON)
        .prod_cumulative_exclusive(1);
    let weights = alpha * transmittance;

    let rgb = (rgb * weights.to_owned().unsqueeze_dim::<3>(2))
        .sum_dim(1)
        .squeeze::<2>(1);

    finish(rgb, weights, depths, white_background)
}

/// Composites a ray color `rgb` (`[R, 3]`) predicted directly, whose
/// contributions along the ray are given as `weights` (`[R, S]`).
pub fn composite_weights<B: Backend>(
    rgb: Tensor<B, 2>,
    weights: Tensor<B, 2>,
    depths: Tensor<B, 2>,
    white_background: bool,
) -> Composite<B> {
    finish(rgb, weights, depths, white_background)
}

/// `[R]`, true for rays with more than [`VALID_SAMPLE_THRESHOLD`] seen samples,
/// or with every sample seen when the rays are shorter than that.
///
/// - `visibility`: `[R, S]`, one for samples seen by any source view
pub fn valid_rays<B: Backend>(visibility: Tensor<B, 2>) -> Tensor<B, 1, Bool> {
    let [_, point_count] = visibility.dims();
    let threshold = VALID_SAMPLE_THRESHOLD.min(point_count.saturating_sub(1));

    visibility
        .sum_dim(1)
        .squeeze::<1>(1)
        .greater_elem(threshold as f64 + 0.5)
}

fn finish<B: Backend>(
    rgb: Tensor<B, 2>,
    weights: Tensor<B, 2>,
    depths: Tensor<B, 2>,
    white_background: bool,
) -> Composite<B> {
    let acc = weights.to_owned().sum_dim(1);
    let depth = (weights.to_owned() * depths).sum_dim(1).squeeze::<1>(1);
    let rgb = if white_background {
        rgb + (-acc.to_owned() + 1.0)
    } else {
        rgb
    };

    Composite {
        rgb,
        depth,
        weights,
        acc: acc.squeeze::<1>(1),
    }
}

impl<B: Backend> StageOutput<B> {
    /// `R`
    #[inline]
    pub fn len(&self) -> usize {
        self.rgb.dims()[0]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn new(
        composite: Composite<B>,
        alpha: Option<Tensor<B, 2>>,
        valid: Tensor<B, 1, Bool>,
        features: Tensor<B, 2>,
    ) -> Self {
        Self {
            rgb: composite.rgb,
            depth: composite.depth,
            weights: composite.weights,
            alpha,
            acc: composite.acc,
            valid,
            features,
        }
    }

    /// Concatenates the outputs of consecutive ray chunks.
    ///
    /// Returns `None` when `outputs` is empty.
    pub fn cat(outputs: Vec<Self>) -> Option<Self> {
        if outputs.is_empty() {
            return None;
        }

        let has_alpha = outputs.iter().all(|output| output.alpha.is_some());
        let mut rgb = Vec::with_capacity(outputs.len());
        let mut depth = Vec::with_capacity(outputs.len());
        let mut weights = Vec::with_capacity(outputs.len());
        let mut alpha = Vec::with_capacity(outputs.len());
        let mut acc = Vec::with_capacity(outputs.len());
        let mut valid = Vec::with_capacity(outputs.len());
        let mut features = Vec::with_capacity(outputs.len());

        for output in outputs {
            rgb.push(output.rgb);
            depth.push(output.depth);
            weights.push(output.weights);
            alpha.extend(output.alpha);
            acc.push(output.acc);
            valid.push(output.valid);
            features.push(output.features);
        }

        Some(Self {
            rgb: Tensor::cat(rgb, 0),
            depth: Tensor::cat(depth, 0),
            weights: Tensor::cat(weights, 0),
            alpha: has_alpha.then(|| Tensor::cat(alpha, 0)),
            acc: Tensor::cat(acc, 0),
            valid: Tensor::cat(valid, 0),
            features: Tensor::cat(features, 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    #[test]
    fn opaque_first_sample_takes_all_weight() {
        let device = Default::default();

        // Midpoints of 4 bins in [0.1, 2.0]
        let depths = Tensor::<Backend, 2>::from_floats(
            [[0.3375, 0.8125, 1.2875, 1.7625]],
            &device,
        );
        let rgb = Tensor::<Backend, 3>::ones([1, 4, 3], &device);
        let alpha = Tensor::<Backend, 2>::ones([1, 4], &device);

        let output = composite_radiance(rgb, alpha, depths, false);

        output.weights.to_owned().into_data().assert_approx_eq(
            &TensorData::from([[1.0f32, 0.0, 0.0, 0.0]]),
            6,
        );
        output
            .acc
            .into_data()
            .assert_approx_eq(&TensorData::from([1.0f32]), 6);
        output
            .depth
            .into_data()
            .assert_approx_eq(&TensorData::from([0.3375f32]), 6);
        output
            .rgb
            .into_data()
            .assert_approx_eq(&TensorData::from([[1.0f32, 1.0, 1.0]]), 6);
    }

    #[test]
    fn transmittance_stays_positive_behind_opaque_sample() {
        type Backend = burn::backend::Autodiff<burn::backend::NdArray>;
        let device = Default::default();

        let depths = Tensor::<Backend, 2>::from_floats([[0.5, 1.0, 1.5]], &device);
        let rgb = Tensor::<Backend, 3>::ones([1, 3, 3], &device);
        let alpha =
            Tensor::<Backend, 2>::from_floats([[1.0, 0.5, 0.5]], &device).require_grad();

        let output = composite_radiance(rgb, alpha.to_owned(), depths, false);
        let weights = output.weights.to_owned().into_data().to_vec::<f32>().unwrap();
        assert_eq!(weights[0], 1.0);
        assert!(weights[1] > 0.0 && weights[1] < 1e-9);
        assert!(weights[2] > 0.0 && weights[2] < weights[1]);

        let gradients = output.weights.slice([0..1, 1..2]).sum().backward();
        let gradient = alpha.grad(&gradients).unwrap().into_data().to_vec::<f32>().unwrap();
        assert!(gradient.iter().all(|g| g.is_finite()));
        assert!(gradient[1] > 0.0);
    }

    #[test]
    fn transparent_samples_leave_background() {
        let device = Default::default();

        let depths =
            Tensor::<Backend, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let rgb = Tensor::<Backend, 3>::full([1, 3, 3], 0.3, &device);
        let alpha = Tensor::<Backend, 2>::zeros([1, 3], &device);

        let output = composite_radiance(
            rgb.to_owned(),
            alpha.to_owned(),
            depths.to_owned(),
            false,
        );
        output
            .rgb
            .into_data()
            .assert_approx_eq(&TensorData::from([[0.0f32, 0.0, 0.0]]), 6);
        output
            .acc
            .into_data()
            .assert_approx_eq(&TensorData::from([0.0f32]), 6);

        let output = composite_radiance(rgb, alpha, depths, true);
        output
            .rgb
            .into_data()
            .assert_approx_eq(&TensorData::from([[1.0f32, 1.0, 1.0]]), 6);
    }

    #[test]
    fn weights_follow_transmittance() {
        let device = Default::default();

        let depths =
            Tensor::<Backend, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let rgb = Tensor::<Backend, 3>::from_floats(
            [[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]],
            &device,
        );
        let alpha =
            Tensor::<Backend, 2>::from_floats([[0.5, 0.5, 0.5]], &device);

        let output = composite_radiance(rgb, alpha, depths, true);

        output.weights.into_data().assert_approx_eq(
            &TensorData::from([[0.5f32, 0.25, 0.125]]),
            5,
        );
        output
            .depth
            .into_data()
            .assert_approx_eq(&TensorData::from([1.375f32]), 5);
        // The white background fills the remaining 0.125
        output.rgb.into_data().assert_approx_eq(
            &TensorData::from([[0.625f32, 0.375, 0.25]]),
            5,
        );
    }

    #[test]
    fn weights_bounded_for_random_opacities() {
        let device = Default::default();

        let alpha = Tensor::<Backend, 2>::random(
            [64, 32],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let depths = Tensor::<Backend, 1, Int>::arange(1..33, &device)
            .float()
            .unsqueeze_dim::<2>(0)
            .repeat_dim(0, 64);
        let rgb = Tensor::<Backend, 3>::random(
            [64, 32, 3],
            Distribution::Default,
            &device,
        );

        let output = composite_radiance(rgb, alpha, depths, false);

        let weights = output.weights.into_data().to_vec::<f32>().unwrap();
        assert!(weights.iter().all(|w| *w >= 0.0));
        let acc = output.acc.into_data().to_vec::<f32>().unwrap();
        assert!(acc.iter().all(|a| *a <= 1.0 + 1e-5));
    }

    #[test]
    fn direct_color_with_weights() {
        let device = Default::default();

        let rgb = Tensor::<Backend, 2>::from_floats([[0.2, 0.4, 0.6]], &device);
        let weights =
            Tensor::<Backend, 2>::from_floats([[0.25, 0.25, 0.5]], &device);
        let depths =
            Tensor::<Backend, 2>::from_floats([[1.0, 2.0, 4.0]], &device);

        let output = composite_weights(rgb, weights, depths, true);
        output
            .depth
            .into_data()
            .assert_approx_eq(&TensorData::from([2.75f32]), 6);
        output
            .rgb
            .into_data()
            .assert_approx_eq(&TensorData::from([[0.2f32, 0.4, 0.6]]), 6);
    }

    #[test]
    fn valid_rays_need_enough_seen_samples() {
        let device = Default::default();

        let mut rows = [[1.0f32; 10]; 3];
        rows[1][0] = 0.0;
        rows[2][0] = 0.0;
        rows[2][1] = 0.0;
        let visibility = Tensor::<Backend, 2>::from_floats(rows, &device);
        assert_eq!(
            valid_rays(visibility).into_data().to_vec::<bool>().unwrap(),
            vec![true, true, false]
        );

        // Short rays must be fully seen
        let visibility = Tensor::<Backend, 2>::from_floats(
            [[1.0, 1.0, 1.0, 1.0], [1.0, 0.0, 1.0, 1.0]],
            &device,
        );
        assert_eq!(
            valid_rays(visibility).into_data().to_vec::<bool>().unwrap(),
            vec![true, false]
        );
    }

    #[test]
    fn stage_outputs_concatenate_in_order() {
        let device = Default::default();

        let stage = |value: f32, count: usize| {
            let composite = composite_weights(
                Tensor::<Backend, 2>::full([count, 3], value, &device),
                Tensor::full([count, 2], 0.5, &device),
                Tensor::ones([count, 2], &device),
                false,
            );
            StageOutput::new(
                composite,
                None,
                Tensor::<Backend, 1>::ones([count], &device).greater_elem(0.0),
                Tensor::full([count, 4], value, &device),
            )
        };

        let output = StageOutput::cat(vec![stage(1.0, 2), stage(2.0, 1)]).unwrap();
        assert_eq!(output.len(), 3);
        assert!(output.alpha.is_none());
        output.features.into_data().assert_approx_eq(
            &TensorData::from([[1.0f32; 4], [1.0; 4], [2.0; 4]]),
            6,
        );

        assert!(StageOutput::<Backend>::cat(vec![]).is_none());
    }
}

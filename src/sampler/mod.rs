//! Depth sampling along rays: stratified coarse samples and
//! importance-resampled fine samples.

use crate::{error::*, tensor::TensorFloatExtension, *};
use burn::prelude::*;
use rand::{rngs::StdRng, Rng};

/// Probability mass added to every bin before importance resampling.
pub const PDF_FLOOR: f32 = 1e-5;

/// Ordered depths along each ray and the points they reach.
#[derive(Clone, Debug)]
pub struct SampleSet<B: Backend> {
    /// `[R, N]`, strictly increasing along `N`
    pub depths: Tensor<B, 2>,
    /// `[R, N, 3]`
    pub positions: Tensor<B, 3>,
}

impl<B: Backend> SampleSet<B> {
    /// Places `o + t * d` for every depth `t`.
    pub fn from_depths(
        rays: &camera::RayBatch<B>,
        depths: Tensor<B, 2>,
    ) -> Self {
        let positions = rays.origins.to_owned().unsqueeze_dim::<3>(1)
            + rays.directions.to_owned().unsqueeze_dim::<3>(1)
                * depths.to_owned().unsqueeze_dim::<3>(2);

        Self { depths, positions }
    }

    /// `N`
    #[inline]
    pub fn points_per_ray(&self) -> usize {
        self.depths.dims()[1]
    }
}

/// Draws `points_per_ray` stratified depths between the bounds of each ray.
///
/// Bin `k` covers `[k / N, (k + 1) / N]` of the depth range, or of the
/// inverse-depth range when `inverse_uniform` is set. A deterministic sample
/// sits at the bin midpoint; otherwise it is jittered uniformly inside the bin.
pub fn sample_coarse<B: Backend>(
    rays: &camera::RayBatch<B>,
    points_per_ray: usize,
    inverse_uniform: bool,
    deterministic: bool,
    rng: &mut StdRng,
) -> Result<SampleSet<B>> {
    if points_per_ray == 0 {
        return Err(Error::Validation(
            "Point count per ray".into(),
            "greater than 0".into(),
        ));
    }
    rays.validate()?;

    let device = rays.device();
    let ray_count = rays.len();
    let fractions =
        stratified([ray_count, points_per_ray], deterministic, rng, &device);

    let near = rays.near.to_owned();
    let far = rays.far.to_owned();
    let depths = if inverse_uniform {
        let near_inverse = near.recip();
        let far_inverse = far.recip();
        (near_inverse.to_owned() + (far_inverse - near_inverse) * fractions)
            .recip()
    } else {
        near.to_owned() + (far - near) * fractions
    };

    Ok(SampleSet::from_depths(rays, depths))
}

/// Resamples `importance_points_per_ray` depths where the coarse `weights`
/// concentrate, then merges them with the coarse depths.
///
/// The result holds `N + M` sorted depths, all of which are evaluated again.
pub fn sample_fine<B: Backend>(
    rays: &camera::RayBatch<B>,
    coarse: &SampleSet<B>,
    weights: Tensor<B, 2>,
    importance_points_per_ray: usize,
    inverse_uniform: bool,
    deterministic: bool,
    rng: &mut StdRng,
) -> Result<SampleSet<B>> {
    let [ray_count, points_per_ray] = coarse.depths.dims();
    if points_per_ray < 3 {
        return Err(Error::Validation(
            format!("Coarse point count per ray {points_per_ray}"),
            "at least 3 for importance resampling".into(),
        ));
    }
    if weights.dims() != [ray_count, points_per_ray] {
        return Err(Error::ShapeMismatch(
            "Coarse weights".into(),
            vec![ray_count, points_per_ray],
            weights.dims().to_vec(),
        ));
    }
    if importance_points_per_ray == 0 {
        return Ok(coarse.to_owned());
    }

    let depths = coarse.depths.to_owned();
    let (bins, weights) = {
        let values = if inverse_uniform {
            depths.to_owned().recip()
        } else {
            depths.to_owned()
        };
        let midpoints = (values
            .to_owned()
            .slice([0..ray_count, 1..points_per_ray])
            + values.slice([0..ray_count, 0..points_per_ray - 1]))
            * 0.5;
        let weights = weights
            .detach()
            .slice([0..ray_count, 1..points_per_ray - 1]);

        // Inverse depths decrease along the ray
        if inverse_uniform {
            (reverse_columns(midpoints), reverse_columns(weights))
        } else {
            (midpoints, weights)
        }
    };

    let samples = sample_pdf(
        bins,
        weights,
        importance_points_per_ray,
        deterministic,
        rng,
    );
    let samples = if inverse_uniform {
        samples.recip()
    } else {
        samples
    };

    let depths = Tensor::cat(vec![depths, samples], 1).sort(1);

    Ok(SampleSet::from_depths(rays, depths))
}

/// Inverse-CDF sampling of the piecewise-uniform density over `bins`.
///
/// - `bins`: `[R, K + 1]` increasing edges
/// - `weights`: `[R, K]` non-negative masses
///
/// Returns `[R, count]` increasing samples.
pub fn sample_pdf<B: Backend>(
    bins: Tensor<B, 2>,
    weights: Tensor<B, 2>,
    count: usize,
    deterministic: bool,
    rng: &mut StdRng,
) -> Tensor<B, 2> {
    let [ray_count, bin_count] = weights.dims();
    let device = weights.device();

    let weights = weights + PDF_FLOOR;
    let pdf = weights.to_owned() / weights.sum_dim(1);
    // [R, K + 1]
    let cdf = Tensor::cat(
        vec![Tensor::zeros([ray_count, 1], &device), pdf.sum_cumulative(1)],
        1,
    );

    let u = stratified([ray_count, count], deterministic, rng, &device);

    // [R, count], the last edge whose cdf is at most `u`
    let lower = (u.to_owned().unsqueeze_dim::<3>(2)
        - cdf
            .to_owned()
            .slice([0..ray_count, 1..bin_count + 1])
            .unsqueeze_dim::<3>(1))
    .greater_equal_elem(0.0)
    .int()
    .sum_dim(2)
    .squeeze::<2>(2)
    .clamp_max(bin_count as i64 - 1);
    let upper = lower.to_owned().add_scalar(1);

    let cdf_lower = cdf.to_owned().gather(1, lower.to_owned());
    let cdf_upper = cdf.gather(1, upper.to_owned());
    let bin_lower = bins.to_owned().gather(1, lower);
    let bin_upper = bins.gather(1, upper);

    let denominator = cdf_upper - cdf_lower.to_owned();
    let denominator =
        denominator.to_owned().mask_fill(denominator.lower_elem(PDF_FLOOR), 1.0);
    let t = (u - cdf_lower) / denominator;

    bin_lower.to_owned() + t * (bin_upper - bin_lower)
}

/// `(k + j) / N` for column `k`, with `j = 0.5` or `j ~ U[0, 1)`.
fn stratified<B: Backend>(
    shape: [usize; 2],
    deterministic: bool,
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, 2> {
    let [row_count, column_count] = shape;

    let jitters = if deterministic {
        Tensor::full(shape, 0.5, device)
    } else {
        let values = (0..row_count * column_count)
            .map(|_| rng.gen::<f32>())
            .collect::<Vec<_>>();
        Tensor::from_data(TensorData::new(values, shape), device)
    };

    (Tensor::<B, 1, Int>::arange(0..column_count as i64, device)
        .float()
        .unsqueeze_dim::<2>(0)
        + jitters)
        / column_count as f64
}

fn reverse_columns<B: Backend>(tensor: Tensor<B, 2>) -> Tensor<B, 2> {
    let column_count = tensor.dims()[1];
    let indices =
        Tensor::<B, 1, Int>::arange(0..column_count as i64, &tensor.device())
            .mul_scalar(-1)
            .add_scalar(column_count as i64 - 1);
    tensor.select(1, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::camera_at;
    use rand::SeedableRng;

    type Backend = burn::backend::NdArray;

    fn single_ray(
        near: f64,
        far: f64,
    ) -> camera::RayBatch<Backend> {
        let camera = camera_at([0.0; 3], 1, 1);
        camera.rays([near, far], 1, &Default::default()).unwrap()
    }

    fn to_vec(tensor: Tensor<Backend, 2>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_strictly_increasing(values: &[f32]) {
        assert!(
            values.windows(2).all(|w| w[0] < w[1]),
            "Values should be strictly increasing: {values:?}"
        );
    }

    #[test]
    fn coarse_deterministic_midpoints() {
        let rays = single_ray(0.1, 2.0);
        let mut rng = StdRng::seed_from_u64(0);

        let samples = sample_coarse(&rays, 4, false, true, &mut rng).unwrap();
        samples.depths.to_owned().into_data().assert_approx_eq(
            &TensorData::from([[0.3375f32, 0.8125, 1.2875, 1.7625]]),
            5,
        );
        assert_eq!(samples.positions.dims(), [1, 4, 3]);

        // The ray of a 1x1 camera points along +Z with unit depth scale
        samples
            .positions
            .slice([0..1, 0..4, 2..3])
            .reshape([1, 4])
            .into_data()
            .assert_approx_eq(&samples.depths.into_data(), 5);
    }

    #[test]
    fn coarse_inverse_uniform_midpoints() {
        let rays = single_ray(0.1, 2.0);
        let mut rng = StdRng::seed_from_u64(0);

        let samples = sample_coarse(&rays, 4, true, true, &mut rng).unwrap();
        let target = [0.125, 0.375, 0.625, 0.875]
            .map(|fraction: f32| 1.0 / (10.0 - 9.5 * fraction));
        samples
            .depths
            .to_owned()
            .into_data()
            .assert_approx_eq(&TensorData::from([target]), 5);
        assert_strictly_increasing(&to_vec(samples.depths));
    }

    #[test]
    fn coarse_stochastic_within_bins() {
        let rays = single_ray(1.0, 3.0);

        let mut rng = StdRng::seed_from_u64(0x3D65);
        let depths =
            to_vec(sample_coarse(&rays, 8, false, false, &mut rng).unwrap().depths);
        for (k, depth) in depths.iter().enumerate() {
            let lower = 1.0 + 0.25 * k as f32;
            assert!((lower..lower + 0.25).contains(depth), "{depths:?}");
        }
        assert_strictly_increasing(&depths);

        let mut rng = StdRng::seed_from_u64(0x3D65);
        let depths_again =
            to_vec(sample_coarse(&rays, 8, false, false, &mut rng).unwrap().depths);
        assert_eq!(depths, depths_again);
    }

    #[test]
    fn coarse_rejects_invalid_options() {
        let rays = single_ray(0.1, 2.0);
        let mut rng = StdRng::seed_from_u64(0);

        let output = sample_coarse(&rays, 0, false, true, &mut rng);
        assert!(matches!(output, Err(Error::Validation(..))));
    }

    #[test]
    fn fine_merge_is_strictly_increasing() {
        let rays = single_ray(0.5, 4.0);
        let mut rng = StdRng::seed_from_u64(7);

        for inverse_uniform in [false, true] {
            for deterministic in [false, true] {
                let coarse = sample_coarse(
                    &rays,
                    16,
                    inverse_uniform,
                    deterministic,
                    &mut rng,
                )
                .unwrap();
                let weights = Tensor::random(
                    [1, 16],
                    burn::tensor::Distribution::Default,
                    &Default::default(),
                );
                let fine = sample_fine(
                    &rays,
                    &coarse,
                    weights,
                    24,
                    inverse_uniform,
                    deterministic,
                    &mut rng,
                )
                .unwrap();

                assert_eq!(fine.depths.dims(), [1, 40]);
                assert_eq!(fine.positions.dims(), [1, 40, 3]);
                let depths = to_vec(fine.depths);
                assert_strictly_increasing(&depths);
                for depth in to_vec(coarse.depths) {
                    assert!(depths.contains(&depth));
                }
            }
        }
    }

    #[test]
    fn fine_with_collapsed_weights() {
        let rays = single_ray(1.0, 2.0);
        let mut rng = StdRng::seed_from_u64(0);

        let coarse = sample_coarse(&rays, 5, false, true, &mut rng).unwrap();
        let weights = Tensor::zeros([1, 5], &Default::default());
        let fine =
            sample_fine(&rays, &coarse, weights, 6, false, true, &mut rng)
                .unwrap();

        let depths = to_vec(fine.depths);
        assert!(depths.iter().all(|depth| depth.is_finite()));
        assert_strictly_increasing(&depths);
    }

    #[test]
    fn fine_concentrates_on_heavy_bin() {
        let rays = single_ray(0.0001, 1.0);
        let mut rng = StdRng::seed_from_u64(0);

        // Midpoint depths 0.05, 0.15, ..., 0.95
        let coarse = sample_coarse(&rays, 10, false, true, &mut rng).unwrap();
        let weights = Tensor::from_floats(
            [[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]],
            &Default::default(),
        );
        let fine =
            sample_fine(&rays, &coarse, weights, 8, false, true, &mut rng)
                .unwrap();

        // The heavy interior weight owns the bin between midpoints 0.5 and 0.6
        let heavy = to_vec(fine.depths)
            .into_iter()
            .filter(|depth| (0.5..=0.6).contains(depth))
            .count();
        assert!(heavy >= 8, "Only {heavy} samples in the heavy bin");
    }

    #[test]
    fn fine_rejects_mismatched_weights() {
        let rays = single_ray(0.1, 2.0);
        let mut rng = StdRng::seed_from_u64(0);

        let coarse = sample_coarse(&rays, 4, false, true, &mut rng).unwrap();
        let weights = Tensor::zeros([1, 3], &Default::default());
        let output =
            sample_fine(&rays, &coarse, weights, 4, false, true, &mut rng);
        assert!(matches!(output, Err(Error::ShapeMismatch(..))));
    }

    #[test]
    fn sample_pdf_uniform_weights() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(0);

        let bins = Tensor::<Backend, 2>::from_floats([[0.0, 1.0, 2.0, 3.0, 4.0]], &device);
        let weights = Tensor::ones([1, 4], &device);
        let samples = sample_pdf(bins, weights, 4, true, &mut rng);
        samples
            .into_data()
            .assert_approx_eq(&TensorData::from([[0.5f32, 1.5, 2.5, 3.5]]), 4);
    }
}

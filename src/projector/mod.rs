//! Projection of sample points into the source views.

use crate::{camera::Camera, error::*, *};
use burn::prelude::*;

/// The posed source views and their feature maps.
#[derive(Clone, Debug)]
pub struct SourceViews<B: Backend> {
    /// `[V, H, W, 3]`
    pub images: Tensor<B, 4>,
    /// `[V, C, H_f, W_f]`
    pub features: Tensor<B, 4>,
    /// `V` cameras sharing one image size
    pub cameras: Vec<Camera>,
}

/// The multi-view observations of every sample point.
#[derive(Clone, Debug)]
pub struct ViewFeatureBundle<B: Backend> {
    /// `[R, S, V, 3]`
    pub colors: Tensor<B, 4>,
    /// `[R, S, V, C]`
    pub features: Tensor<B, 4>,
    /// `[R, S, V, 4]`, the unit difference of viewing directions and their dot product
    pub directions: Tensor<B, 4>,
    /// `[R, S, V]`, in front of the source camera and inside its image
    pub mask: Tensor<B, 3, Bool>,
}

/// Projects points into source views and samples what they see there.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Projector {
    /// How far past the image border, in normalized coordinates, a projection still counts.
    pub boundary_tolerance: f64,
}

impl<B: Backend> SourceViews<B> {
    pub fn new(
        images: Tensor<B, 4>,
        features: Tensor<B, 4>,
        cameras: Vec<Camera>,
    ) -> Result<Self> {
        let view_count = cameras.len();
        if view_count == 0 {
            return Err(Error::Validation(
                "Source view count".into(),
                "greater than 0".into(),
            ));
        }
        for camera in &cameras {
            camera.validate()?;
        }

        let camera = cameras[0];
        if cameras.iter().any(|c| {
            c.image_height != camera.image_height
                || c.image_width != camera.image_width
        }) {
            return Err(Error::Validation(
                "Source camera image sizes".into(),
                "identical".into(),
            ));
        }

        let image_dims = [
            view_count,
            camera.image_height as usize,
            camera.image_width as usize,
            3,
        ];
        if images.dims() != image_dims {
            return Err(Error::ShapeMismatch(
                "Source images".into(),
                image_dims.to_vec(),
                images.dims().to_vec(),
            ));
        }
        if features.dims()[0] != view_count {
            return Err(Error::ShapeMismatch(
                "Source feature maps".into(),
                vec![view_count],
                features.dims()[0..1].to_vec(),
            ));
        }

        Ok(Self {
            images,
            features,
            cameras,
        })
    }

    /// `V`
    #[inline]
    pub fn view_count(&self) -> usize {
        self.cameras.len()
    }

    /// `C`
    #[inline]
    pub fn feature_size(&self) -> usize {
        self.features.dims()[1]
    }
}

impl<B: Backend> ViewFeatureBundle<B> {
    /// `[R, S, V, 1]`, one for valid views
    pub fn mask_float(&self) -> Tensor<B, 4> {
        self.mask.to_owned().float().unsqueeze_dim(3)
    }

    /// `[R, S, V, 3 + C]`
    pub fn colored_features(&self) -> Tensor<B, 4> {
        Tensor::cat(vec![self.colors.to_owned(), self.features.to_owned()], 3)
    }

    /// `[R, S]`, one for points seen by at least one view
    pub fn visibility(&self) -> Tensor<B, 2> {
        self.mask
            .to_owned()
            .float()
            .sum_dim(2)
            .squeeze::<2>(2)
            .clamp_max(1.0)
    }
}

impl Projector {
    /// Projects `positions` (`[R, S, 3]`) into every source view.
    ///
    /// The validity mask is recomputed on every call.
    pub fn project<B: Backend>(
        &self,
        positions: Tensor<B, 3>,
        query: &Camera,
        views: &SourceViews<B>,
    ) -> Result<ViewFeatureBundle<B>> {
        let [ray_count, point_count, _] = positions.dims();
        let device = positions.device();
        let count = ray_count * point_count;
        let view_count = views.view_count();
        let [_, feature_size, feature_height, feature_width] =
            views.features.dims();
        let [_, image_height, image_width, _] = views.images.dims();

        let points = positions.reshape([count, 3]);
        let points_homogeneous = Tensor::cat(
            vec![points.to_owned(), Tensor::ones([count, 1], &device)],
            1,
        );
        let to_query = normalize(
            vector(query.center(), &device).unsqueeze_dim::<2>(0)
                - points.to_owned(),
        );

        let mut colors = Vec::with_capacity(view_count);
        let mut features = Vec::with_capacity(view_count);
        let mut directions = Vec::with_capacity(view_count);
        let mut masks = Vec::with_capacity(view_count);

        for (index, camera) in views.cameras.iter().enumerate() {
            // [P, 4]
            let pixels = points_homogeneous
                .to_owned()
                .matmul(matrix_transposed(&camera.projection()?, &device));
            let depths = pixels.to_owned().slice([0..count, 2..3]);
            let pixels = (pixels.slice([0..count, 0..2])
                / depths.to_owned().clamp_min(1e-8))
            .clamp(-1e6, 1e6);

            let x = normalize_coordinate(
                pixels.to_owned().slice([0..count, 0..1]).reshape([count]),
                camera.image_width as usize,
            );
            let y = normalize_coordinate(
                pixels.slice([0..count, 1..2]).reshape([count]),
                camera.image_height as usize,
            );

            let bound = 1.0 + self.boundary_tolerance;
            // [P, 1]
            let mask = (depths.greater_elem(0.0).float().reshape([count])
                * x.to_owned().abs().lower_equal_elem(bound).float()
                * y.to_owned().abs().lower_equal_elem(bound).float())
            .unsqueeze_dim::<2>(1);

            let image = views
                .images
                .to_owned()
                .slice([index..index + 1, 0..image_height, 0..image_width, 0..3])
                .reshape([image_height * image_width, 3]);
            let feature = views
                .features
                .to_owned()
                .slice([
                    index..index + 1,
                    0..feature_size,
                    0..feature_height,
                    0..feature_width,
                ])
                .reshape([feature_size, feature_height * feature_width])
                .swap_dims(0, 1);

            colors.push(
                sample_bilinear(
                    image,
                    [image_height, image_width],
                    x.to_owned(),
                    y.to_owned(),
                ) * mask.to_owned(),
            );
            features.push(
                sample_bilinear(feature, [feature_height, feature_width], x, y)
                    * mask.to_owned(),
            );

            let to_source = normalize(
                vector(camera.center(), &device).unsqueeze_dim::<2>(0)
                    - points.to_owned(),
            );
            let difference = to_query.to_owned() - to_source.to_owned();
            let dot = (to_query.to_owned() * to_source).sum_dim(1);
            directions.push(Tensor::cat(vec![normalize(difference), dot], 1));

            masks.push(mask.reshape([count]));
        }

        Ok(ViewFeatureBundle {
            colors: Tensor::stack::<3>(colors, 1).reshape([
                ray_count,
                point_count,
                view_count,
                3,
            ]),
            features: Tensor::stack::<3>(features, 1).reshape([
                ray_count,
                point_count,
                view_count,
                feature_size,
            ]),
            directions: Tensor::stack::<3>(directions, 1).reshape([
                ray_count,
                point_count,
                view_count,
                4,
            ]),
            mask: Tensor::stack::<2>(masks, 1)
                .reshape([ray_count, point_count, view_count])
                .greater_elem(0.5),
        })
    }
}

/// Samples `map` (`[H * W, C]`, row-major cells) at normalized coordinates
/// with align-corners semantics. Out-of-range coordinates read the border.
pub fn sample_bilinear<B: Backend>(
    map: Tensor<B, 2>,
    size: [usize; 2],
    x: Tensor<B, 1>,
    y: Tensor<B, 1>,
) -> Tensor<B, 2> {
    let [height, width] = size;
    let x = ((x + 1.0) * (0.5 * (width - 1) as f64)).clamp(0.0, (width - 1) as f64);
    let y = ((y + 1.0) * (0.5 * (height - 1) as f64)).clamp(0.0, (height - 1) as f64);

    // Truncation is flooring for non-negative values
    let x0 = x.to_owned().int();
    let y0 = y.to_owned().int();
    let x1 = x0.to_owned().add_scalar(1).clamp_max(width as i64 - 1);
    let y1 = y0.to_owned().add_scalar(1).clamp_max(height as i64 - 1);
    let fx = (x - x0.to_owned().float()).unsqueeze_dim::<2>(1);
    let fy = (y - y0.to_owned().float()).unsqueeze_dim::<2>(1);

    let at = |row: Tensor<B, 1, Int>, col: Tensor<B, 1, Int>| {
        map.to_owned().select(0, row.mul_scalar(width as i64) + col)
    };

    at(y0.to_owned(), x0.to_owned())
        * (-fx.to_owned() + 1.0)
        * (-fy.to_owned() + 1.0)
        + at(y0, x1.to_owned()) * fx.to_owned() * (-fy.to_owned() + 1.0)
        + at(y1.to_owned(), x0) * (-fx.to_owned() + 1.0) * fy.to_owned()
        + at(y1, x1) * fx * fy
}

/// Maps pixel coordinates in `[0, size - 1]` to `[-1, 1]`.
fn normalize_coordinate<B: Backend>(
    pixels: Tensor<B, 1>,
    size: usize,
) -> Tensor<B, 1> {
    pixels * (2.0 / (size.max(2) - 1) as f64) - 1.0
}

fn normalize<B: Backend>(vectors: Tensor<B, 2>) -> Tensor<B, 2> {
    let norms = vectors.to_owned().powf_scalar(2.0).sum_dim(1).sqrt();
    vectors / norms.clamp_min(1e-6)
}

fn vector<B: Backend>(
    values: [f64; 3],
    device: &B::Device,
) -> Tensor<B, 1> {
    Tensor::from_floats(values.map(|v| v as f32), device)
}

fn matrix_transposed<B: Backend>(
    matrix: &[[f64; 4]; 4],
    device: &B::Device,
) -> Tensor<B, 2> {
    let values = (0..4)
        .flat_map(|col| (0..4).map(move |row| matrix[row][col] as f32))
        .collect::<Vec<_>>();
    Tensor::from_data(TensorData::new(values, [4, 4]), device)
}

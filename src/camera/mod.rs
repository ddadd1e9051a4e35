//! Pinhole cameras and the rays cast through their pixels.

use crate::{error::*, *};
use burn::prelude::*;
use rand::{rngs::StdRng, seq::index};
use std::ops::Range;

/// The length of a camera in the flat layout, `[H, W, K (16), C2W (16)]`.
pub const CAMERA_FLAT_LEN: usize = 34;

/// A pinhole camera.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Camera {
    /// Image height.
    pub image_height: u32,
    /// Image width.
    pub image_width: u32,
    /// Intrinsic matrix in **row-major order**, i.e., `K[row][col]`.
    ///
    /// Only the upper-left `3x3` block takes part in projection.
    pub intrinsics: [[f64; 4]; 4],
    /// Affine transformation from camera space to world space.
    ///
    /// It is in **row-major order**, i.e., `M[row][col]`.
    ///
    /// # Format
    ///
    /// ```plaintext
    /// [R     | T  ]
    /// [0 0 0 | 1  ]
    /// ```
    pub camera_to_world: [[f64; 4]; 4],
}

/// How pixels are drawn when only a subset of rays is rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum PixelSampling {
    /// Every pixel is equally likely.
    #[default]
    Uniform,
    /// Only pixels inside the central crop of the given side ratio.
    Center(f64),
}

/// A batch of rays sharing one query camera.
#[derive(Clone, Debug)]
pub struct RayBatch<B: Backend> {
    /// `[R, 3]`
    pub origins: Tensor<B, 2>,
    /// `[R, 3]`, not normalized: a unit step along it is a unit step in camera depth.
    pub directions: Tensor<B, 2>,
    /// `[R, 1]`
    pub near: Tensor<B, 2>,
    /// `[R, 1]`
    pub far: Tensor<B, 2>,
    /// Row-major index of each ray's pixel in the query image.
    pub pixel_indices: Vec<usize>,
    /// The query camera.
    pub camera: Camera,
}

impl Camera {
    /// Parses the flat layout `[H, W, K (16), C2W (16)]`.
    pub fn from_flat(values: &[f32]) -> Result<Self> {
        if values.len() != CAMERA_FLAT_LEN {
            return Err(Error::ShapeMismatch(
                "Flat camera".into(),
                vec![CAMERA_FLAT_LEN],
                vec![values.len()],
            ));
        }

        let matrix = |offset: usize| {
            let mut m = [[0.0; 4]; 4];
            for (index, value) in values[offset..offset + 16].iter().enumerate()
            {
                m[index / 4][index % 4] = *value as f64;
            }
            m
        };

        let camera = Self {
            image_height: values[0] as u32,
            image_width: values[1] as u32,
            intrinsics: matrix(2),
            camera_to_world: matrix(18),
        };
        camera.validate()?;

        Ok(camera)
    }

    /// Rejects cameras that cannot take part in projection.
    pub fn validate(&self) -> Result<()> {
        if self.image_height == 0 || self.image_width == 0 {
            return Err(Error::Validation(
                format!(
                    "Camera image size {}x{}",
                    self.image_width, self.image_height
                ),
                "non-zero".into(),
            ));
        }
        if !self.intrinsics.iter().flatten().all(|v| v.is_finite()) {
            return Err(Error::NonFiniteCamera("Intrinsic matrix".into()));
        }
        if !self.camera_to_world.iter().flatten().all(|v| v.is_finite()) {
            return Err(Error::NonFiniteCamera("Camera-to-world matrix".into()));
        }

        self.intrinsics_inverse()?;
        self.world_to_camera()?;

        Ok(())
    }

    /// Position of the camera centre in world space.
    #[inline]
    pub const fn center(&self) -> [f64; 3] {
        let m = &self.camera_to_world;
        [m[0][3], m[1][3], m[2][3]]
    }

    /// Inverse of the upper-left `3x3` block of the intrinsics.
    pub fn intrinsics_inverse(&self) -> Result<[[f64; 3]; 3]> {
        let k = &self.intrinsics;
        let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| {
            k[r0][c0] * k[r1][c1] - k[r0][c1] * k[r1][c0]
        };

        let det = k[0][0] * cofactor(1, 2, 1, 2) - k[0][1] * cofactor(1, 2, 0, 2)
            + k[0][2] * cofactor(1, 2, 0, 1);
        if !det.is_finite() || det.abs() < 1e-12 {
            return Err(Error::SingularCamera(det));
        }

        let inv = 1.0 / det;
        Ok([
            [
                cofactor(1, 2, 1, 2) * inv,
                -cofactor(0, 2, 1, 2) * inv,
                cofactor(0, 1, 1, 2) * inv,
            ],
            [
                -cofactor(1, 2, 0, 2) * inv,
                cofactor(0, 2, 0, 2) * inv,
                -cofactor(0, 1, 0, 2) * inv,
            ],
            [
                cofactor(1, 2, 0, 1) * inv,
                -cofactor(0, 2, 0, 1) * inv,
                cofactor(0, 1, 0, 1) * inv,
            ],
        ])
    }

    /// Affine transformation from world space to camera space.
    pub fn world_to_camera(&self) -> Result<[[f64; 4]; 4]> {
        invert(&self.camera_to_world).ok_or_else(|| {
            Error::Validation(
                "Camera-to-world matrix".into(),
                "invertible".into(),
            )
        })
    }

    /// `K * W2C`, mapping homogeneous world points to homogeneous pixels.
    pub fn projection(&self) -> Result<[[f64; 4]; 4]> {
        Ok(multiply(&self.intrinsics, &self.world_to_camera()?))
    }

    /// The `[rows, columns]` of the pixel grid sampled at `stride`.
    #[inline]
    pub fn grid_size(
        &self,
        stride: usize,
    ) -> [usize; 2] {
        let stride = stride.max(1);
        [
            (self.image_height as usize).div_ceil(stride),
            (self.image_width as usize).div_ceil(stride),
        ]
    }

    /// Casts one ray through every `stride`-th pixel in row-major order.
    pub fn rays<B: Backend>(
        &self,
        depth_range: [f64; 2],
        stride: usize,
        device: &B::Device,
    ) -> Result<RayBatch<B>> {
        if stride == 0 {
            return Err(Error::Validation(
                "Render stride".into(),
                "greater than 0".into(),
            ));
        }

        let width = self.image_width as usize;
        let pixel_indices = (0..self.image_height as usize)
            .step_by(stride)
            .flat_map(|row| {
                (0..width).step_by(stride).map(move |col| row * width + col)
            })
            .collect();

        self.rays_at(depth_range, pixel_indices, device)
    }

    /// Casts `count` rays through randomly drawn, distinct pixels.
    pub fn rays_sampled<B: Backend>(
        &self,
        depth_range: [f64; 2],
        count: usize,
        sampling: PixelSampling,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Result<RayBatch<B>> {
        let height = self.image_height as usize;
        let width = self.image_width as usize;

        let (rows, cols) = match sampling {
            PixelSampling::Uniform => (0..height, 0..width),
            PixelSampling::Center(ratio) => {
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(Error::Validation(
                        format!("Center ratio {ratio}"),
                        "in (0, 1]".into(),
                    ));
                }
                (
                    crop(height, ratio),
                    crop(width, ratio),
                )
            },
        };

        let candidate_count = rows.len() * cols.len();
        let count = count.min(candidate_count);
        let mut pixel_indices = index::sample(rng, candidate_count, count)
            .into_iter()
            .map(|candidate| {
                let row = rows.start + candidate / cols.len();
                let col = cols.start + candidate % cols.len();
                row * width + col
            })
            .collect::<Vec<_>>();
        pixel_indices.sort_unstable();

        self.rays_at(depth_range, pixel_indices, device)
    }

    /// Casts one ray per given row-major pixel index.
    pub fn rays_at<B: Backend>(
        &self,
        depth_range: [f64; 2],
        pixel_indices: Vec<usize>,
        device: &B::Device,
    ) -> Result<RayBatch<B>> {
        self.validate()?;

        let [near, far] = depth_range;
        if !(near.is_finite() && far.is_finite() && near < far) {
            return Err(Error::Validation(
                format!("Depth range [{near}, {far}]"),
                "finite with near < far".into(),
            ));
        }

        let width = self.image_width as usize;
        let pixel_count = self.image_height as usize * width;
        if let Some(index) = pixel_indices.iter().find(|&&i| i >= pixel_count) {
            return Err(Error::Validation(
                format!("Pixel index {index}"),
                format!("less than {pixel_count}"),
            ));
        }

        let k_inv = self.intrinsics_inverse()?;
        let c2w = &self.camera_to_world;
        // R * K^-1
        let unproject = {
            let mut m = [[0.0; 3]; 3];
            for (r, row) in m.iter_mut().enumerate() {
                for (c, value) in row.iter_mut().enumerate() {
                    *value = (0..3).map(|i| c2w[r][i] * k_inv[i][c]).sum();
                }
            }
            m
        };

        let ray_count = pixel_indices.len();
        let directions = pixel_indices
            .iter()
            .flat_map(|&index| {
                let pixel = [(index % width) as f64, (index / width) as f64, 1.0];
                unproject.map(|row| {
                    (row[0] * pixel[0] + row[1] * pixel[1] + row[2] * pixel[2])
                        as f32
                })
            })
            .collect::<Vec<_>>();
        let origin = self.center().map(|v| v as f32);

        Ok(RayBatch {
            origins: Tensor::<B, 1>::from_floats(origin, device)
                .unsqueeze_dim::<2>(0)
                .repeat_dim(0, ray_count),
            directions: Tensor::from_data(
                TensorData::new(directions, [ray_count, 3]),
                device,
            ),
            near: Tensor::full([ray_count, 1], near, device),
            far: Tensor::full([ray_count, 1], far, device),
            pixel_indices,
            camera: *self,
        })
    }
}

impl<B: Backend> RayBatch<B> {
    /// `R`
    #[inline]
    pub fn len(&self) -> usize {
        self.pixel_indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixel_indices.is_empty()
    }

    #[inline]
    pub fn device(&self) -> B::Device {
        self.origins.device()
    }

    /// The contiguous sub-batch of rays in `range`.
    pub fn slice(
        &self,
        range: Range<usize>,
    ) -> Self {
        Self {
            origins: self.origins.to_owned().slice([range.to_owned(), 0..3]),
            directions: self
                .directions
                .to_owned()
                .slice([range.to_owned(), 0..3]),
            near: self.near.to_owned().slice([range.to_owned(), 0..1]),
            far: self.far.to_owned().slice([range.to_owned(), 0..1]),
            pixel_indices: self.pixel_indices[range].to_vec(),
            camera: self.camera,
        }
    }

    /// The sub-batch of rays at `indices`, in their given order.
    pub fn select(
        &self,
        indices: &[usize],
    ) -> Result<Self> {
        let ray_count = self.len();
        if let Some(index) = indices.iter().find(|&&i| i >= ray_count) {
            return Err(Error::Validation(
                format!("Ray index {index}"),
                format!("less than {ray_count}"),
            ));
        }

        let device = self.device();
        let positions = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                indices.iter().map(|&i| i as i64).collect::<Vec<_>>(),
                [indices.len()],
            ),
            &device,
        );

        Ok(Self {
            origins: self.origins.to_owned().select(0, positions.to_owned()),
            directions: self
                .directions
                .to_owned()
                .select(0, positions.to_owned()),
            near: self.near.to_owned().select(0, positions.to_owned()),
            far: self.far.to_owned().select(0, positions),
            pixel_indices: indices
                .iter()
                .map(|&i| self.pixel_indices[i])
                .collect(),
            camera: self.camera,
        })
    }

    /// Checks the per-ray invariants.
    pub fn validate(&self) -> Result<()> {
        let ray_count = self.len();
        for (name, dims) in [
            ("Ray origins", self.origins.dims().to_vec()),
            ("Ray directions", self.directions.dims().to_vec()),
        ] {
            if dims != [ray_count, 3] {
                return Err(Error::ShapeMismatch(
                    name.into(),
                    vec![ray_count, 3],
                    dims,
                ));
            }
        }
        for (name, dims) in [
            ("Ray near bounds", self.near.dims().to_vec()),
            ("Ray far bounds", self.far.dims().to_vec()),
        ] {
            if dims != [ray_count, 1] {
                return Err(Error::ShapeMismatch(
                    name.into(),
                    vec![ray_count, 1],
                    dims,
                ));
            }
        }

        let has_inverted_bounds = (self.far.to_owned() - self.near.to_owned())
            .lower_equal_elem(0.0)
            .any()
            .into_scalar();
        if has_inverted_bounds {
            return Err(Error::Validation(
                "Ray bounds".into(),
                "near < far".into(),
            ));
        }

        Ok(())
    }
}

fn crop(
    size: usize,
    ratio: f64,
) -> Range<usize> {
    let kept = ((size as f64 * ratio).round() as usize).clamp(1, size.max(1));
    let start = (size - kept) / 2;
    start..start + kept
}

fn multiply(
    lhs: &[[f64; 4]; 4],
    rhs: &[[f64; 4]; 4],
) -> [[f64; 4]; 4] {
    let mut out = [[0.0; 4]; 4];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = (0..4).map(|i| lhs[r][i] * rhs[i][c]).sum();
        }
    }
    out
}

/// Gauss-Jordan elimination with partial pivoting.
fn invert(matrix: &[[f64; 4]; 4]) -> Option<[[f64; 4]; 4]> {
    let mut a = *matrix;
    let mut inv = [[0.0; 4]; 4];
    for (i, row) in inv.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for col in 0..4 {
        let pivot = (col..4).max_by(|&x, &y| {
            a[x][col].abs().total_cmp(&a[y][col].abs())
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        inv.swap(col, pivot);

        let scale = 1.0 / a[col][col];
        for c in 0..4 {
            a[col][c] *= scale;
            inv[col][c] *= scale;
        }
        for row in 0..4 {
            if row != col {
                let factor = a[row][col];
                for c in 0..4 {
                    a[row][c] -= factor * a[col][c];
                    inv[row][c] -= factor * inv[col][c];
                }
            }
        }
    }

    Some(inv)
}

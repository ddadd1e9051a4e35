//! Coarse-to-fine rendering of ray batches, chunk by chunk.

pub use crate::compositor::StageOutput;

use crate::{
    aggregator::RenderingModel,
    camera::{Camera, RayBatch},
    error::*,
    projector::{Projector, SourceViews},
    sampler::{self, SampleSet},
    *,
};
use burn::prelude::*;
use rand::rngs::StdRng;

#[derive(Config, Debug)]
pub struct RenderConfig {
    #[config(default = 64)]
    pub points_per_ray: usize,
    /// Zero disables the fine stage.
    #[config(default = 64)]
    pub importance_points_per_ray: usize,
    /// Samples uniformly in inverse depth.
    #[config(default = false)]
    pub inverse_uniform: bool,
    /// Uses bin midpoints instead of random draws.
    #[config(default = false)]
    pub deterministic: bool,
    #[config(default = false)]
    pub white_background: bool,
    #[config(default = 4096)]
    pub rays_per_chunk: usize,
    /// Evaluates the fine stage with the coarse network.
    #[config(default = true)]
    pub single_net: bool,
    /// Renders every `render_stride`-th pixel of full images.
    #[config(default = 1)]
    pub render_stride: usize,
    #[config(default = 0.0)]
    pub boundary_tolerance: f64,
}

#[derive(Clone, Debug)]
pub struct Renderer {
    config: RenderConfig,
    projector: Projector,
}

/// The outputs of both stages for one ray batch, in ray order.
#[derive(Clone, Debug)]
pub struct RenderOutput<B: Backend> {
    pub coarse: StageOutput<B>,
    /// Present when importance points are drawn.
    pub fine: Option<StageOutput<B>>,
}

/// One stage of a rendered image.
#[derive(Clone, Debug)]
pub struct ImageStage<B: Backend> {
    /// `[H, W, 3]`
    pub rgb: Tensor<B, 3>,
    /// `[H, W]`
    pub depth: Tensor<B, 2>,
    /// `[H, W]`
    pub acc: Tensor<B, 2>,
    /// `[H, W]`
    pub valid: Tensor<B, 2, Bool>,
    /// `[H, W, C]`
    pub features: Tensor<B, 3>,
}

/// A rendered image, subsampled by the render stride.
#[derive(Clone, Debug)]
pub struct ImageOutput<B: Backend> {
    pub coarse: ImageStage<B>,
    pub fine: Option<ImageStage<B>>,
    /// Row-major indices of the rendered pixels in the full image.
    pub pixel_indices: Vec<usize>,
}

impl RenderConfig {
    pub fn init(&self) -> Result<Renderer> {
        if self.points_per_ray == 0 {
            return Err(Error::Validation(
                "Point count per ray".into(),
                "greater than 0".into(),
            ));
        }
        if self.importance_points_per_ray > 0 && self.points_per_ray < 3 {
            return Err(Error::Validation(
                format!("Point count per ray {}", self.points_per_ray),
                "at least 3 when importance points are drawn".into(),
            ));
        }
        if self.rays_per_chunk == 0 {
            return Err(Error::Validation(
                "Ray count per chunk".into(),
                "greater than 0".into(),
            ));
        }
        if self.render_stride == 0 {
            return Err(Error::Validation(
                "Render stride".into(),
                "greater than 0".into(),
            ));
        }
        if !(self.boundary_tolerance.is_finite() && self.boundary_tolerance >= 0.0)
        {
            return Err(Error::Validation(
                format!("Boundary tolerance {}", self.boundary_tolerance),
                "finite and non-negative".into(),
            ));
        }

        Ok(Renderer {
            config: self.to_owned(),
            projector: Projector {
                boundary_tolerance: self.boundary_tolerance,
            },
        })
    }
}

impl Renderer {
    #[inline]
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Renders `rays` against the source `views`.
    ///
    /// `fine` is used for the fine stage unless the config shares one network.
    /// Results do not depend on the chunk size when sampling deterministically.
    pub fn render<B: Backend, M: RenderingModel<B>>(
        &self,
        coarse: &M,
        fine: Option<&M>,
        rays: &RayBatch<B>,
        views: &SourceViews<B>,
        rng: &mut StdRng,
    ) -> Result<RenderOutput<B>> {
        rays.validate()?;
        if rays.is_empty() {
            return Err(Error::Validation(
                "Ray count".into(),
                "greater than 0".into(),
            ));
        }

        let has_fine_stage = self.config.importance_points_per_ray > 0;
        let fine = if !has_fine_stage || self.config.single_net {
            coarse
        } else {
            fine.ok_or_else(|| {
                Error::Validation(
                    "Fine network".into(),
                    "given when networks are not shared".into(),
                )
            })?
        };
        for model in [coarse, fine] {
            if model.feature_size() != views.feature_size() {
                return Err(Error::ShapeMismatch(
                    "Source feature channels".into(),
                    vec![model.feature_size()],
                    vec![views.feature_size()],
                ));
            }
        }

        let ray_count = rays.len();
        let chunk_size = self.config.rays_per_chunk;
        let chunk_count = ray_count.div_ceil(chunk_size);
        let mut coarse_outputs = Vec::with_capacity(chunk_count);
        let mut fine_outputs = Vec::with_capacity(chunk_count);

        for (index, start) in (0..ray_count).step_by(chunk_size).enumerate() {
            let chunk = rays.slice(start..(start + chunk_size).min(ray_count));
            log::debug!(
                target: "semantic_nerf::renderer",
                "chunk {} of {} ({} rays)",
                index + 1,
                chunk_count,
                chunk.len(),
            );

            let (coarse_output, fine_output) =
                self.render_chunk(coarse, fine, &chunk, views, rng)?;
            coarse_outputs.push(coarse_output);
            fine_outputs.extend(fine_output);
        }

        let coarse = StageOutput::cat(coarse_outputs).ok_or_else(|| {
            Error::Validation("Rendered chunk count".into(), "greater than 0".into())
        })?;
        let fine = StageOutput::cat(fine_outputs);

        Ok(RenderOutput { coarse, fine })
    }

    /// Renders every `render_stride`-th pixel of the query `camera`.
    #[allow(clippy::too_many_arguments)]
    pub fn render_image<B: Backend, M: RenderingModel<B>>(
        &self,
        coarse: &M,
        fine: Option<&M>,
        camera: &Camera,
        depth_range: [f64; 2],
        views: &SourceViews<B>,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Result<ImageOutput<B>> {
        let stride = self.config.render_stride;
        let rays = camera.rays(depth_range, stride, device)?;
        let size = camera.grid_size(stride);

        let output = self.render(coarse, fine, &rays, views, rng)?;
        log::debug!(
            target: "semantic_nerf::renderer",
            "rendered image of {}x{} pixels",
            size[1],
            size[0],
        );

        Ok(ImageOutput {
            coarse: ImageStage::new(output.coarse, size),
            fine: output.fine.map(|fine| ImageStage::new(fine, size)),
            pixel_indices: rays.pixel_indices,
        })
    }

    fn render_chunk<B: Backend, M: RenderingModel<B>>(
        &self,
        coarse: &M,
        fine: &M,
        rays: &RayBatch<B>,
        views: &SourceViews<B>,
        rng: &mut StdRng,
    ) -> Result<(StageOutput<B>, Option<StageOutput<B>>)> {
        let config = &self.config;

        let samples = sampler::sample_coarse(
            rays,
            config.points_per_ray,
            config.inverse_uniform,
            config.deterministic,
            rng,
        )?;
        let coarse_output = self.evaluate(coarse, rays, &samples, views)?;

        if config.importance_points_per_ray == 0 {
            return Ok((coarse_output, None));
        }

        let samples = sampler::sample_fine(
            rays,
            &samples,
            coarse_output.weights.to_owned(),
            config.importance_points_per_ray,
            config.inverse_uniform,
            config.deterministic,
            rng,
        )?;
        let fine_output = self.evaluate(fine, rays, &samples, views)?;

        Ok((coarse_output, Some(fine_output)))
    }

    fn evaluate<B: Backend, M: RenderingModel<B>>(
        &self,
        model: &M,
        rays: &RayBatch<B>,
        samples: &SampleSet<B>,
        views: &SourceViews<B>,
    ) -> Result<StageOutput<B>> {
        let bundle = self.projector.project(
            samples.positions.to_owned(),
            &rays.camera,
            views,
        )?;
        let visibility = bundle.visibility();
        let aggregation = model.aggregate(&bundle, samples, rays)?;

        Ok(model.composite(
            aggregation,
            samples,
            visibility,
            self.config.white_background,
        ))
    }
}

impl<B: Backend> RenderOutput<B> {
    /// The fine stage if present, else the coarse one.
    #[inline]
    pub fn finest(&self) -> &StageOutput<B> {
        self.fine.as_ref().unwrap_or(&self.coarse)
    }
}

impl<B: Backend> ImageStage<B> {
    /// Lays the per-ray outputs of `stage` out on a `[rows, columns]` grid.
    pub fn new(
        stage: StageOutput<B>,
        size: [usize; 2],
    ) -> Self {
        let [rows, cols] = size;
        let feature_size = stage.features.dims()[1];

        Self {
            rgb: stage.rgb.reshape([rows, cols, 3]),
            depth: stage.depth.reshape([rows, cols]),
            acc: stage.acc.reshape([rows, cols]),
            valid: stage.valid.reshape([rows, cols]),
            features: stage.features.reshape([rows, cols, feature_size]),
        }
    }
}

impl<B: Backend> ImageOutput<B> {
    /// The fine stage if present, else the coarse one.
    #[inline]
    pub fn finest(&self) -> &ImageStage<B> {
        self.fine.as_ref().unwrap_or(&self.coarse)
    }
}

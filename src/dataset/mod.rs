//! Posed scene records served to training and evaluation.

use crate::{camera::Camera, error::*, projector::SourceViews, *};
use burn::{data::dataset::Dataset, prelude::*};

/// The radius of the region of interest around the world origin.
pub const SCENE_RADIUS: f64 = 0.5 * std::f64::consts::SQRT_2 * 1.1;

/// One query view, its source views and the depth range between them.
#[derive(Clone, Debug)]
pub struct SceneItem {
    /// `[H, W, 3]`
    pub query_image: TensorData,
    pub query_camera: Camera,
    /// `[V, H_s, W_s, 3]`
    pub source_images: TensorData,
    pub source_cameras: Vec<Camera>,
    pub depth_range: [f64; 2],
    /// `[H, W]` class indices
    pub labels: Option<TensorData>,
}

#[derive(Clone, Debug)]
pub struct SceneInput<B: Backend> {
    /// `[H, W, 3]`
    pub query_image: Tensor<B, 3>,
    pub query_camera: Camera,
    /// `[V, H_s, W_s, 3]`
    pub source_images: Tensor<B, 4>,
    pub source_cameras: Vec<Camera>,
    pub depth_range: [f64; 2],
    /// `[H, W]`
    pub labels: Option<Tensor<B, 2, Int>>,
}

#[derive(Clone, Debug, Default)]
pub struct SceneDataset {
    items: Vec<SceneItem>,
}

#[derive(Clone, Debug)]
pub struct SceneDatasetSplit {
    pub test: SceneDataset,
    pub train: SceneDataset,
}

impl SceneItem {
    pub fn new(
        query_image: TensorData,
        query_camera: Camera,
        source_images: TensorData,
        source_cameras: Vec<Camera>,
        depth_range: [f64; 2],
        labels: Option<TensorData>,
    ) -> Result<Self> {
        query_camera.validate()?;
        let query_size = [
            query_camera.image_height as usize,
            query_camera.image_width as usize,
        ];
        let expected = [query_size[0], query_size[1], 3];
        if query_image.shape != expected {
            return Err(Error::ShapeMismatch(
                "Query image".into(),
                expected.to_vec(),
                query_image.shape,
            ));
        }
        if let Some(labels) = &labels {
            if labels.shape != query_size {
                return Err(Error::ShapeMismatch(
                    "Labels".into(),
                    query_size.to_vec(),
                    labels.shape.to_owned(),
                ));
            }
        }

        let camera = source_cameras.first().ok_or_else(|| {
            Error::Validation("Source view count".into(), "greater than 0".into())
        })?;
        let expected = [
            source_cameras.len(),
            camera.image_height as usize,
            camera.image_width as usize,
            3,
        ];
        if source_images.shape != expected {
            return Err(Error::ShapeMismatch(
                "Source images".into(),
                expected.to_vec(),
                source_images.shape,
            ));
        }

        let [near, far] = depth_range;
        if !(near.is_finite() && far.is_finite() && 0.0 < near && near < far) {
            return Err(Error::Validation(
                format!("Depth range [{near}, {far}]"),
                "finite with 0 < near < far".into(),
            ));
        }

        Ok(Self {
            query_image,
            query_camera,
            source_images,
            source_cameras,
            depth_range,
            labels,
        })
    }

    pub fn into_input<B: Backend>(
        self,
        device: &B::Device,
    ) -> SceneInput<B> {
        SceneInput {
            query_image: Tensor::from_data(self.query_image, device),
            query_camera: self.query_camera,
            source_images: Tensor::from_data(self.source_images, device),
            source_cameras: self.source_cameras,
            depth_range: self.depth_range,
            labels: self.labels.map(|labels| Tensor::from_data(labels, device)),
        }
    }
}

impl<B: Backend> SceneInput<B> {
    /// The source views with their extracted `features` (`[V, C, H_f, W_f]`).
    pub fn source_views(
        &self,
        features: Tensor<B, 4>,
    ) -> Result<SourceViews<B>> {
        SourceViews::new(
            self.source_images.to_owned(),
            features,
            self.source_cameras.to_owned(),
        )
    }
}

impl SceneDataset {
    pub fn new(items: Vec<SceneItem>) -> Self {
        Self { items }
    }

    pub fn split_for_training(
        self,
        ratio: f32,
    ) -> SceneDatasetSplit {
        let mut train = self.items;
        let test = train.split_off(
            (ratio.clamp(0.0, 1.0) * (train.len() as f32)).round() as usize,
        );

        SceneDatasetSplit {
            test: SceneDataset::new(test),
            train: SceneDataset::new(train),
        }
    }
}

impl Dataset<SceneItem> for SceneDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(
        &self,
        index: usize,
    ) -> Option<SceneItem> {
        self.items.get(index).cloned()
    }
}

/// The depth range of a query camera enclosing the region of interest
/// around the world origin.
pub fn depth_range_around_origin(camera: &Camera) -> Result<[f64; 2]> {
    let origin_depth = camera.world_to_camera()?[2][3];
    let near = (origin_depth - SCENE_RADIUS).max(0.1 * origin_depth);
    let far = origin_depth + SCENE_RADIUS;

    if !(near > 0.0 && near < far) {
        return Err(Error::Validation(
            format!("Depth of the world origin {origin_depth}"),
            "positive".into(),
        ));
    }

    Ok([near, far])
}

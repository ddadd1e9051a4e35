extern crate anyhow;
extern crate burn;
extern crate image;
extern crate kdam;
extern crate log;
extern crate rand;
extern crate thiserror;

pub mod aggregator;
pub mod backbone;
pub mod camera;
pub mod compositor;
pub mod dataset;
pub mod encoder;
pub mod error;
pub mod experiment;
pub mod loss;
pub mod metric;
pub mod projector;
pub mod renderer;
pub mod sampler;
pub mod semantic;
pub mod tensor;
pub mod visual;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::*;

    pub use aggregator::{
        GntNetwork, GntNetworkConfig, IbrNetwork, IbrNetworkConfig,
        RenderingModel,
    };
    pub use backbone::{ConvBackbone, ConvBackboneConfig, FeatureBackbone};
    pub use camera::{Camera, PixelSampling, RayBatch};
    pub use dataset::{SceneDataset, SceneItem};
    pub use experiment::{ExperimentConfig, LogMetricsSink, MetricsSink};
    pub use renderer::{RenderConfig, Renderer};
    pub use semantic::{SemanticHead, SemanticHeadConfig};

    pub use burn::backend;
    pub use burn::prelude::{Config, Module};
}

pub mod tester;
pub mod trainer;

pub use tester::*;
pub use trainer::*;

use crate::{
    aggregator::{GntNetwork, GntNetworkConfig, RenderingModel},
    backbone::{ConvBackbone, ConvBackboneConfig, FeatureBackbone},
    semantic::{SemanticHead, SemanticHeadConfig},
    *,
};

use anyhow::{bail, Result};
use burn::{
    data::dataset::Dataset, prelude::*, tensor::backend::AutodiffBackend,
};
use kdam::tqdm;
use std::{fs, path::PathBuf};

#[derive(Config, Debug)]
pub struct ExperimentConfig {
    pub artifact_directory: String,
    #[config(default = "ConvBackboneConfig::new()")]
    pub backbone: ConvBackboneConfig,
    #[config(default = "GntNetworkConfig::new()")]
    pub network: GntNetworkConfig,
    #[config(default = "SemanticHeadConfig::new()")]
    pub semantic: SemanticHeadConfig,
    #[config(default = "renderer::RenderConfig::new()")]
    pub renderer: renderer::RenderConfig,
    #[config(default = "TrainerConfig::new()")]
    pub trainer: TrainerConfig,
    #[config(default = 0.8)]
    pub train_ratio: f32,
}

pub struct Experiment<B: AutodiffBackend> {
    pub trainer: Trainer<B>,
    pub tester: Tester<B::InnerBackend>,
}

/// The trainable parts of the pipeline.
#[derive(Clone, Debug)]
pub struct Models<B: Backend, M, F> {
    pub backbone: F,
    pub coarse: M,
    /// Present when the fine stage has its own network.
    pub fine: Option<M>,
    pub semantic: SemanticHead<B>,
}

/// Where training and evaluation scalars are reported.
pub trait MetricsSink {
    fn record(
        &mut self,
        step: usize,
        name: &str,
        value: f64,
    );
}

/// Reports every scalar as an `info` log record.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetricsSink;

/// Keeps every scalar in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryMetricsSink {
    pub records: Vec<(usize, String, f64)>,
}

impl ExperimentConfig {
    pub fn init<B: AutodiffBackend>(
        &self,
        dataset: dataset::SceneDataset,
        device: &B::Device,
    ) -> Result<Experiment<B>> {
        let artifact_directory = PathBuf::from(&self.artifact_directory);

        let datasets = dataset.split_for_training(self.train_ratio);
        if datasets.train.is_empty() {
            bail!("No scene item left for training");
        }

        let progress_bar = {
            let mut bar = tqdm!(
                desc = format!("Training on {} items", datasets.train.len()),
                colour = "orangered",
                dynamic_ncols = true,
                force_refresh = true,
                total = self.trainer.step_count,
                unit = "steps",
                bar_format = "{desc suffix=''} {postfix} ┃ \
                {percentage:.0}% = {count}/{total} {unit} ┃ \
                {rate:.1} {unit}/s ┃ \
                {remaining human=true} \
                ┃{animation}┃"
            );
            bar.postfix = "┃ PSNR = 0.00 dB".into();
            bar
        };

        let _ = fs::remove_dir_all(&artifact_directory);
        fs::create_dir_all(&artifact_directory)?;
        self.save(artifact_directory.join("config.json"))?;
        log::info!(
            target: "semantic_nerf::experiment",
            "artifacts in {}",
            artifact_directory.display(),
        );

        let validation = datasets.test.get(0);

        Ok(Experiment {
            tester: self.trainer.init_tester(
                artifact_directory.to_owned(),
                datasets.test,
                &self.renderer,
                device,
            )?,
            trainer: self.trainer.init_trainer(
                artifact_directory,
                datasets.train,
                validation,
                &self.renderer,
                progress_bar,
                device,
            )?,
        })
    }

    /// Builds the backbone, the networks and the semantic head.
    ///
    /// The fine network is only built when the stages do not share one.
    pub fn init_models<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<Models<B, GntNetwork<B>, ConvBackbone<B>>> {
        if self.backbone.rendering_size != self.network.feature_size {
            bail!(
                "The backbone yields {} rendering channels but the network reads {}",
                self.backbone.rendering_size,
                self.network.feature_size,
            );
        }
        if self.backbone.semantic_size != self.semantic.feature_size {
            bail!(
                "The backbone yields {} semantic channels but the head reads {}",
                self.backbone.semantic_size,
                self.semantic.feature_size,
            );
        }
        if self.semantic.num_classes != self.trainer.num_classes
            || self.semantic.ignore_label != self.trainer.ignore_label
        {
            bail!("The semantic head and the trainer disagree on the labels");
        }

        let has_fine_network = !self.renderer.single_net
            && self.renderer.importance_points_per_ray > 0;

        Ok(Models {
            backbone: self.backbone.init(device)?,
            coarse: self.network.init(device)?,
            fine: if has_fine_network {
                Some(self.network.init(device)?)
            } else {
                None
            },
            semantic: self.semantic.init(device)?,
        })
    }
}

impl<B: Backend, M: RenderingModel<B>, F: FeatureBackbone<B>> Models<B, M, F> {
    /// The network of the fine stage when it has its own.
    #[inline]
    pub fn fine(&self) -> Option<&M> {
        self.fine.as_ref()
    }
}

impl MetricsSink for LogMetricsSink {
    fn record(
        &mut self,
        step: usize,
        name: &str,
        value: f64,
    ) {
        log::info!(target: "semantic_nerf::metric", "step {step} ┃ {name} = {value:.6}");
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(
        &mut self,
        step: usize,
        name: &str,
        value: f64,
    ) {
        self.records.push((step, name.to_owned(), value));
    }
}

impl MemoryMetricsSink {
    /// The values recorded under `name`, in order.
    pub fn values(
        &self,
        name: &str,
    ) -> Vec<f64> {
        self.records
            .iter()
            .filter(|(_, key, _)| key == name)
            .map(|(_, _, value)| *value)
            .collect()
    }
}

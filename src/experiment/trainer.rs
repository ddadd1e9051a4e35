use super::*;

use crate::{
    camera::{PixelSampling, RayBatch},
    renderer::RenderOutput,
};
use anyhow::anyhow;
use burn::{
    module::AutodiffModule,
    optim::{self, GradientsParams, Optimizer},
    record,
    tensor::{ElementConversion, Numeric},
};
use kdam::{term, Bar, BarExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::io::{stderr, IsTerminal};

#[derive(Config, Debug)]
pub struct TrainerConfig {
    /// For the rendering networks.
    #[config(default = 5e-4)]
    pub learning_rate_network: f64,
    #[config(default = 1e-3)]
    pub learning_rate_semantic: f64,
    #[config(default = 1e-3)]
    pub learning_rate_backbone: f64,
    /// Every learning rate is scaled by this factor each `learning_rate_decay_steps`.
    #[config(default = 0.5)]
    pub learning_rate_decay_factor: f64,
    #[config(default = 50000)]
    pub learning_rate_decay_steps: usize,
    #[config(default = 512)]
    pub rays_per_step: usize,
    /// Draws rays from the central crop of side ratio `center_ratio` only.
    #[config(default = false)]
    pub sample_center: bool,
    #[config(default = 0.8)]
    pub center_ratio: f64,
    #[config(default = 0.25)]
    pub render_loss_scale: f64,
    #[config(default = 0.75)]
    pub semantic_loss_scale: f64,
    #[config(default = 20)]
    pub num_classes: usize,
    #[config(default = 20)]
    pub ignore_label: usize,
    /// Decodes semantics at the sampled rays only instead of the whole map.
    #[config(default = true)]
    pub select_inds_loss: bool,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 10000)]
    pub save_interval: usize,
    #[config(default = 250000)]
    pub step_count: usize,
    #[config(default = 0)]
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub struct Trainer<B: AutodiffBackend> {
    pub(super) artifact_directory: PathBuf,
    pub(super) config: TrainerConfig,
    pub(super) dataset: dataset::SceneDataset,
    pub(super) device: B::Device,
    pub(super) metric_fidelity_psnr: metric::PsnrMetric<B::InnerBackend>,
    pub(super) progress_bar: Bar,
    pub(super) render_loss: loss::RenderLoss,
    pub(super) renderer: renderer::Renderer,
    pub(super) semantic_loss: loss::SemanticLoss,
    /// A held-out item rendered at every checkpoint.
    pub(super) validation: Option<dataset::SceneItem>,
    pub(super) validation_renderer: renderer::Renderer,
}

impl TrainerConfig {
    pub(super) fn init_trainer<B: AutodiffBackend>(
        &self,
        artifact_directory: PathBuf,
        dataset: dataset::SceneDataset,
        validation: Option<dataset::SceneItem>,
        renderer: &renderer::RenderConfig,
        progress_bar: Bar,
        device: &B::Device,
    ) -> Result<Trainer<B>> {
        for (name, value) in [
            ("Ray count per step", self.rays_per_step),
            ("Step count", self.step_count),
            ("Learning rate decay steps", self.learning_rate_decay_steps),
            ("Log interval", self.log_interval),
            ("Save interval", self.save_interval),
        ] {
            if value == 0 {
                bail!("{name} should be greater than 0");
            }
        }

        Ok(Trainer {
            artifact_directory,
            config: self.to_owned(),
            dataset,
            device: device.to_owned(),
            metric_fidelity_psnr: metric::PsnrMetric::init(),
            progress_bar,
            render_loss: loss::RenderLossConfig::new()
                .with_scale(self.render_loss_scale)
                .init(),
            renderer: renderer.init()?,
            semantic_loss: loss::SemanticLossConfig::new()
                .with_scale(self.semantic_loss_scale)
                .with_ignore_label(self.ignore_label)
                .init(),
            validation,
            validation_renderer: renderer.to_owned().with_deterministic(true).init()?,
        })
    }

    pub(super) fn init_tester<B: Backend>(
        &self,
        artifact_directory: PathBuf,
        dataset: dataset::SceneDataset,
        renderer: &renderer::RenderConfig,
        device: &B::Device,
    ) -> Result<Tester<B>> {
        Ok(Tester {
            artifact_directory,
            dataset,
            device: device.to_owned(),
            ignore_label: self.ignore_label,
            metric_fidelity: metric::PsnrMetric::init(),
            metric_similarity: metric::SsimMetric::init(),
            num_classes: self.num_classes,
            renderer: renderer.to_owned().with_deterministic(true).init()?,
            seed: self.seed,
        })
    }

    /// The factor on the learning rates before the given zero-based step.
    pub fn learning_rate_factor(
        &self,
        step: usize,
    ) -> f64 {
        let period = self.learning_rate_decay_steps.max(1);
        self.learning_rate_decay_factor.powi((step / period) as i32)
    }
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn train<M, F>(
        &self,
        models: Models<B, M, F>,
        sink: &mut dyn MetricsSink,
    ) -> Result<Models<B::InnerBackend, M::InnerModule, F::InnerModule>>
    where
        M: RenderingModel<B> + AutodiffModule<B>,
        F: FeatureBackbone<B> + AutodiffModule<B>,
        M::InnerModule: RenderingModel<B::InnerBackend>,
        F::InnerModule: FeatureBackbone<B::InnerBackend>,
    {
        if self.dataset.is_empty() {
            bail!("No scene item to train on");
        }
        let Models {
            mut backbone,
            mut coarse,
            mut fine,
            semantic: mut semantic_head,
        } = models;
        if semantic_head.num_classes() != self.config.num_classes {
            bail!(
                "The semantic head decodes {} classes instead of {}",
                semantic_head.num_classes(),
                self.config.num_classes,
            );
        }

        let sampling = if self.config.sample_center {
            PixelSampling::Center(self.config.center_ratio)
        } else {
            PixelSampling::Uniform
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut optimizer_backbone = optim::AdamConfig::new().init();
        let mut optimizer_coarse = optim::AdamConfig::new().init();
        let mut optimizer_fine = optim::AdamConfig::new().init();
        let mut optimizer_semantic = optim::AdamConfig::new().init();
        let mut progress_bar = self.progress_bar.to_owned();

        // Initializing the Progress Bar
        term::init(stderr().is_terminal());
        progress_bar.reset(None);

        // Training
        for step in 1..=self.config.step_count {
            let input = self
                .dataset
                .get(rng.gen_range(0..self.dataset.len()))
                .ok_or_else(|| anyhow!("No scene item to train on"))?
                .into_input::<B>(&self.device);
            let [height, width, _] = input.query_image.dims();

            let maps = backbone.extract(input.source_images.to_owned())?;
            let views = input.source_views(maps.rendering)?;
            let rays = input.query_camera.rays_sampled(
                input.depth_range,
                self.config.rays_per_step,
                sampling,
                &mut rng,
                &self.device,
            )?;

            let output =
                self.renderer
                    .render(&coarse, fine.as_ref(), &rays, &views, &mut rng)?;
            let targets = select_pixels(
                input.query_image.to_owned().reshape([height * width, 3]),
                &rays.pixel_indices,
            );

            let loss_render = self.render_loss.forward(&output, targets.to_owned());
            let loss_semantic = match input.labels.to_owned() {
                Some(labels) => Some(self.semantic_loss(
                    &backbone,
                    &semantic_head,
                    input.query_image.to_owned(),
                    labels,
                    &rays,
                    &output,
                )?),
                None => None,
            };
            let loss = match loss_semantic.to_owned() {
                Some(loss_semantic) => loss_render.to_owned() + loss_semantic,
                None => loss_render.to_owned(),
            };

            let learning_rate_factor = self.config.learning_rate_factor(step - 1);
            let mut gradients = loss.backward();
            let gradients_backbone =
                GradientsParams::from_module(&mut gradients, &backbone);
            let gradients_coarse = GradientsParams::from_module(&mut gradients, &coarse);
            let gradients_fine = fine
                .as_ref()
                .map(|fine| GradientsParams::from_module(&mut gradients, fine));
            let gradients_semantic =
                GradientsParams::from_module(&mut gradients, &semantic_head);

            backbone = optimizer_backbone.step(
                self.config.learning_rate_backbone * learning_rate_factor,
                backbone,
                gradients_backbone,
            );
            coarse = optimizer_coarse.step(
                self.config.learning_rate_network * learning_rate_factor,
                coarse,
                gradients_coarse,
            );
            fine = match (fine, gradients_fine) {
                (Some(model), Some(gradients)) => Some(optimizer_fine.step(
                    self.config.learning_rate_network * learning_rate_factor,
                    model,
                    gradients,
                )),
                (model, _) => model,
            };
            semantic_head = optimizer_semantic.step(
                self.config.learning_rate_semantic * learning_rate_factor,
                semantic_head,
                gradients_semantic,
            );

            // Profiling
            if step % self.config.log_interval == 0 || step == 1 {
                let fidelity_psnr = self
                    .metric_fidelity_psnr
                    .forward(output.finest().rgb.to_owned().inner(), targets.inner())
                    .into_scalar()
                    .elem::<f64>();
                progress_bar.postfix = format!("┃ PSNR = {:.2} dB", fidelity_psnr);

                sink.record(step, "loss", loss.into_scalar().elem());
                sink.record(step, "loss_render", loss_render.into_scalar().elem());
                if let Some(loss_semantic) = loss_semantic {
                    sink.record(step, "loss_semantic", loss_semantic.into_scalar().elem());
                }
                sink.record(step, "psnr", fidelity_psnr);
                sink.record(
                    step,
                    "learning_rate_network",
                    self.config.learning_rate_network * learning_rate_factor,
                );
            }

            if step % self.config.save_interval == 0 || step == self.config.step_count {
                self.save(step, &backbone, &coarse, fine.as_ref(), &semantic_head)?;

                if let Some(item) = &self.validation {
                    let fidelity_psnr = self.validate(
                        item.to_owned(),
                        &Models {
                            backbone: backbone.valid(),
                            coarse: coarse.valid(),
                            fine: fine.as_ref().map(|fine| fine.valid()),
                            semantic: semantic_head.valid(),
                        },
                    )?;
                    sink.record(step, "validation_psnr", fidelity_psnr);
                }
            }

            progress_bar.update(1)?;
        }

        // Terminating the Progress Bar
        {
            progress_bar.clear()?;
            progress_bar
                .set_bar_format(
                    "{desc suffix=''} ┃ \
                    {total} {unit} ┃ \
                    {rate:.1} {unit}/s ┃ \
                    {elapsed human=true}\n",
                )
                .map_err(|e| anyhow!(e))?;
            progress_bar
                .set_description(format!("Trained on {} items", self.dataset.len()));
            progress_bar.refresh()?;
        }

        Ok(Models {
            backbone: backbone.valid(),
            coarse: coarse.valid(),
            fine: fine.map(|fine| fine.valid()),
            semantic: semantic_head.valid(),
        })
    }

    /// The semantic loss of the query view, at the sampled rays or over the whole map.
    fn semantic_loss<F: FeatureBackbone<B>>(
        &self,
        backbone: &F,
        head: &semantic::SemanticHead<B>,
        query_image: Tensor<B, 3>,
        labels: Tensor<B, 2, Int>,
        rays: &RayBatch<B>,
        output: &RenderOutput<B>,
    ) -> Result<Tensor<B, 1>> {
        let [height, width, _] = query_image.dims();
        let feature_map = backbone
            .extract(query_image.unsqueeze_dim(0))?
            .semantic
            .squeeze::<3>(0);
        let labels = labels.reshape([height * width]);

        let (logits, labels) = if self.config.select_inds_loss {
            let ray_features = head
                .fuses_ray_features()
                .then(|| output.finest().features.to_owned());
            let logits = head.forward_selected(
                feature_map,
                &rays.pixel_indices,
                [height, width],
                ray_features,
            )?;
            (logits, select_pixels(labels, &rays.pixel_indices))
        } else {
            let [_, map_height, map_width] = feature_map.dims();
            let logits = head
                .forward_dense(feature_map)?
                .reshape([map_height * map_width, head.num_classes()]);
            let pixel_indices =
                cell_centers([height, width], [map_height, map_width]);
            (logits, select_pixels(labels, &pixel_indices))
        };

        Ok(self.semantic_loss.forward(logits, labels))
    }

    /// The PSNR of a deterministic render of `item`.
    fn validate<M, F>(
        &self,
        item: dataset::SceneItem,
        models: &Models<B::InnerBackend, M, F>,
    ) -> Result<f64>
    where
        M: RenderingModel<B::InnerBackend>,
        F: FeatureBackbone<B::InnerBackend>,
    {
        let input = item.into_input::<B::InnerBackend>(&self.device);
        let [height, width, _] = input.query_image.dims();

        let maps = models.backbone.extract(input.source_images.to_owned())?;
        let views = input.source_views(maps.rendering)?;
        let output = self.validation_renderer.render_image(
            &models.coarse,
            models.fine(),
            &input.query_camera,
            input.depth_range,
            &views,
            &mut StdRng::seed_from_u64(self.config.seed),
            &self.device,
        )?;
        let stage = output.finest();
        let [rows, cols, _] = stage.rgb.dims();

        let target = select_pixels(
            input.query_image.reshape([height * width, 3]),
            &output.pixel_indices,
        )
        .reshape([rows, cols, 3]);
        let fidelity_psnr = self
            .metric_fidelity_psnr
            .forward(stage.rgb.to_owned(), target)
            .into_scalar()
            .elem::<f64>();

        log::info!(
            target: "semantic_nerf::experiment",
            "Validation ┃ PSNR = {:.2} dB",
            fidelity_psnr,
        );

        Ok(fidelity_psnr)
    }

    fn save<M: Module<B>, F: Module<B>>(
        &self,
        step: usize,
        backbone: &F,
        coarse: &M,
        fine: Option<&M>,
        semantic_head: &semantic::SemanticHead<B>,
    ) -> Result<()> {
        let directory = self.artifact_directory.join(format!("checkpoint-{step:06}"));
        fs::create_dir_all(&directory)?;
        let recorder = record::DefaultRecorder::new();

        backbone.to_owned().save_file(directory.join("backbone"), &recorder)?;
        coarse.to_owned().save_file(directory.join("network-coarse"), &recorder)?;
        if let Some(fine) = fine {
            fine.to_owned().save_file(directory.join("network-fine"), &recorder)?;
        }
        semantic_head
            .to_owned()
            .save_file(directory.join("semantic-head"), &recorder)?;

        log::info!(
            target: "semantic_nerf::experiment",
            "saved checkpoint to {}",
            directory.display(),
        );

        Ok(())
    }
}

/// The rows of `tensor` at the given row-major pixel indices.
pub(super) fn select_pixels<B: Backend, const D: usize, K: Numeric<B>>(
    tensor: Tensor<B, D, K>,
    pixel_indices: &[usize],
) -> Tensor<B, D, K> {
    let indices = Tensor::<B, 1, Int>::from_data(
        TensorData::new(
            pixel_indices.iter().map(|&index| index as i64).collect::<Vec<_>>(),
            [pixel_indices.len()],
        ),
        &tensor.device(),
    );
    tensor.select(0, indices)
}

/// The row-major index of the image pixel at the center of every map cell.
fn cell_centers(
    image_size: [usize; 2],
    map_size: [usize; 2],
) -> Vec<usize> {
    let [height, width] = image_size;
    let [map_height, map_width] = map_size;
    let center = |cell: usize, count: usize, limit: usize| {
        ((2 * cell + 1) * limit / (2 * count)).min(limit - 1)
    };

    (0..map_height)
        .flat_map(|row| {
            (0..map_width).map(move |col| {
                center(row, map_height, height) * width
                    + center(col, map_width, width)
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        dataset::{tests::scene_item, SceneDataset},
        encoder::PositionalEncoderConfig,
    };
    use burn::backend::{Autodiff, NdArray};

    type Backend = Autodiff<NdArray>;

    /// A tiny experiment writing to a fresh directory named `name`.
    pub(crate) fn experiment_config(name: &str) -> ExperimentConfig {
        let directory = std::env::temp_dir().join(format!("semantic-nerf-{name}"));
        let encoder = PositionalEncoderConfig::new().with_encoding_factor(2);

        ExperimentConfig::new(directory.to_string_lossy().into_owned())
            .with_backbone(
                ConvBackboneConfig::new()
                    .with_hidden_size(4)
                    .with_rendering_size(4)
                    .with_semantic_size(4),
            )
            .with_network(
                GntNetworkConfig::new()
                    .with_feature_size(4)
                    .with_hidden_size(8)
                    .with_depth(1)
                    .with_head_count(2)
                    .with_point_encoder(encoder.to_owned())
                    .with_direction_encoder(encoder),
            )
            .with_semantic(
                SemanticHeadConfig::new()
                    .with_feature_size(4)
                    .with_hidden_size(8)
                    .with_num_classes(4)
                    .with_ignore_label(4),
            )
            .with_renderer(
                renderer::RenderConfig::new()
                    .with_points_per_ray(4)
                    .with_importance_points_per_ray(4)
                    .with_rays_per_chunk(8)
                    .with_render_stride(2),
            )
            .with_trainer(
                TrainerConfig::new()
                    .with_num_classes(4)
                    .with_ignore_label(4)
                    .with_rays_per_step(8)
                    .with_step_count(2)
                    .with_log_interval(1)
                    .with_save_interval(1),
            )
            .with_train_ratio(0.5)
    }

    #[test]
    fn learning_rate_decays_by_steps() {
        let config = TrainerConfig::new().with_learning_rate_decay_steps(10);
        assert_eq!(config.learning_rate_factor(0), 1.0);
        assert_eq!(config.learning_rate_factor(9), 1.0);
        assert_eq!(config.learning_rate_factor(10), 0.5);
        assert_eq!(config.learning_rate_factor(25), 0.25);
    }

    #[test]
    fn cell_centers_of_half_resolution_map() {
        assert_eq!(cell_centers([4, 4], [2, 2]), vec![5, 7, 13, 15]);
        assert_eq!(cell_centers([3, 1], [2, 1]), vec![0, 2]);
    }

    #[test]
    fn train_selected_semantics() {
        let device = Default::default();
        let config = experiment_config("train-selected");
        let experiment = config
            .init::<Backend>(SceneDataset::new(vec![scene_item(4, true); 2]), &device)
            .unwrap();
        let models = config.init_models::<Backend>(&device).unwrap();
        assert!(models.fine.is_none());

        let mut sink = MemoryMetricsSink::default();
        let models = experiment.trainer.train(models, &mut sink).unwrap();
        assert!(models.fine.is_none());

        let losses = sink.values("loss");
        assert_eq!(losses.len(), 2);
        assert!(losses.iter().all(|loss| loss.is_finite()));
        assert_eq!(sink.values("loss_semantic").len(), 2);

        let validation = sink.values("validation_psnr");
        assert_eq!(validation.len(), 2);
        assert!(validation.iter().all(|psnr| psnr.is_finite()));

        let directory = PathBuf::from(&config.artifact_directory);
        assert!(directory.join("config.json").is_file());
        for step in ["checkpoint-000001", "checkpoint-000002"] {
            assert!(directory.join(step).join("backbone.mpk").is_file());
            assert!(directory.join(step).join("semantic-head.mpk").is_file());
        }
    }

    #[test]
    fn train_is_reproducible_with_seed() {
        let device = Default::default();
        let mut config = experiment_config("train-seeded").with_train_ratio(1.0);
        config.trainer = config.trainer.with_step_count(4).with_save_interval(4);
        let dataset = SceneDataset::new(vec![scene_item(4, true), scene_item(6, false)]);
        let experiment = config.init::<Backend>(dataset, &device).unwrap();
        let models = config.init_models::<Backend>(&device).unwrap();

        let mut first = MemoryMetricsSink::default();
        let mut second = MemoryMetricsSink::default();
        experiment.trainer.train(models.to_owned(), &mut first).unwrap();
        experiment.trainer.train(models, &mut second).unwrap();

        assert_eq!(first.values("loss").len(), 4);
        assert_eq!(first.values("loss"), second.values("loss"));
        assert_eq!(first.values("psnr"), second.values("psnr"));
        assert!(first.values("validation_psnr").is_empty());
    }

    #[test]
    fn train_dense_semantics_with_fine_network() {
        let device = Default::default();
        let mut config = experiment_config("train-dense");
        config.renderer = config.renderer.with_single_net(false);
        config.trainer = config
            .trainer
            .with_select_inds_loss(false)
            .with_sample_center(true)
            .with_step_count(1);
        let experiment = config
            .init::<Backend>(SceneDataset::new(vec![scene_item(4, true); 2]), &device)
            .unwrap();
        let models = config.init_models::<Backend>(&device).unwrap();
        assert!(models.fine.is_some());

        let mut sink = MemoryMetricsSink::default();
        let models = experiment.trainer.train(models, &mut sink).unwrap();
        assert!(models.fine.is_some());
        assert!(sink.values("loss_semantic")[0].is_finite());

        let directory = PathBuf::from(&config.artifact_directory);
        assert!(directory
            .join("checkpoint-000001")
            .join("network-fine.mpk")
            .is_file());
    }

    #[test]
    fn mismatched_models_are_rejected() {
        let device = Default::default();
        let mut config = experiment_config("mismatched");
        config.network = config.network.with_feature_size(5);
        assert!(config.init_models::<Backend>(&device).is_err());

        let config = experiment_config("mismatched").with_train_ratio(0.0);
        let experiment = config
            .init::<Backend>(SceneDataset::new(vec![scene_item(2, false)]), &device);
        assert!(experiment.is_err());
    }
}

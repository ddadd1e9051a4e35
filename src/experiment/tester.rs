use super::{trainer::select_pixels, *};

use burn::tensor::ElementConversion;
use rand::{rngs::StdRng, SeedableRng};
use std::time;

#[derive(Clone, Debug)]
pub struct Tester<B: Backend> {
    pub(super) artifact_directory: PathBuf,
    pub(super) dataset: dataset::SceneDataset,
    pub(super) device: B::Device,
    pub(super) ignore_label: usize,
    pub(super) metric_fidelity: metric::PsnrMetric<B>,
    pub(super) metric_similarity: metric::SsimMetric<B>,
    pub(super) num_classes: usize,
    pub(super) renderer: renderer::Renderer,
    pub(super) seed: u64,
}

#[derive(Config, Debug)]
pub struct EvaluationOutput {
    pub fps: f64,
    /// Mean PSNR over the items.
    pub fidelity: f64,
    /// Mean SSIM over the items.
    pub ssim: f64,
    /// Over every labeled pixel of all items.
    pub miou: Option<f64>,
    pub items: Vec<EvaluationOutputItem>,
}

#[derive(Config, Debug)]
pub struct EvaluationOutputItem {
    pub index: usize,
    pub fidelity: f64,
    pub ssim: f64,
    pub miou: Option<f64>,
}

impl<B: Backend> Tester<B> {
    /// Renders every item, scores it and writes its images under `renders/`.
    pub fn test<M, F>(
        &self,
        models: &Models<B, M, F>,
    ) -> Result<EvaluationOutput>
    where
        M: RenderingModel<B>,
        F: FeatureBackbone<B>,
    {
        let count = self.dataset.len();
        let render_directory = self.artifact_directory.join("renders");
        let mut eval_items = vec![];
        let mut metric_iou = metric::IouMetric::new(self.num_classes, self.ignore_label);
        let mut has_labels = false;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut time_secs_rendering = 0.0;

        fs::create_dir_all(&render_directory)?;
        log::info!(target: "semantic_nerf::experiment", "Testing on {} items", count);

        for (index, item) in self.dataset.iter().enumerate() {
            let timer_from_input_to_output = time::Instant::now();

            let input = item.into_input::<B>(&self.device);
            let [height, width, _] = input.query_image.dims();

            let maps = models.backbone.extract(input.source_images.to_owned())?;
            let views = input.source_views(maps.rendering)?;
            let output = self.renderer.render_image(
                &models.coarse,
                models.fine(),
                &input.query_camera,
                input.depth_range,
                &views,
                &mut rng,
                &self.device,
            )?;
            let stage = output.finest();
            let [rows, cols, feature_size] = stage.features.dims();
            let pixel_count = output.pixel_indices.len();

            let feature_map = models
                .backbone
                .extract(input.query_image.to_owned().unsqueeze_dim(0))?
                .semantic
                .squeeze::<3>(0);
            let ray_features = models.semantic.fuses_ray_features().then(|| {
                stage.features.to_owned().reshape([pixel_count, feature_size])
            });
            let predictions = models
                .semantic
                .forward_selected(
                    feature_map,
                    &output.pixel_indices,
                    [height, width],
                    ray_features,
                )?
                .argmax(1)
                .reshape([rows, cols]);

            time_secs_rendering +=
                timer_from_input_to_output.elapsed().as_secs_f64();

            let target = select_pixels(
                input.query_image.reshape([height * width, 3]),
                &output.pixel_indices,
            )
            .reshape([rows, cols, 3]);
            let fidelity = self
                .metric_fidelity
                .forward(stage.rgb.to_owned(), target.to_owned())
                .into_scalar()
                .elem::<f64>();
            let ssim = self
                .metric_similarity
                .forward(stage.rgb.to_owned(), target)
                .into_scalar()
                .elem::<f64>();

            let miou = match input.labels {
                Some(labels) => {
                    let labels = select_pixels(
                        labels.reshape([height * width]),
                        &output.pixel_indices,
                    )
                    .reshape([rows, cols]);
                    let mut metric_iou_item =
                        metric::IouMetric::new(self.num_classes, self.ignore_label);
                    metric_iou_item.update(predictions.to_owned(), labels.to_owned())?;
                    metric_iou.update(predictions.to_owned(), labels.to_owned())?;
                    has_labels = true;

                    visual::label_image(labels)?
                        .save(render_directory.join(format!("{index:03}-labels.png")))?;
                    Some(metric_iou_item.mean())
                },
                None => None,
            };

            visual::rgb_image(stage.rgb.to_owned())?
                .save(render_directory.join(format!("{index:03}-rgb.png")))?;
            visual::depth_image(stage.depth.to_owned(), Some(input.depth_range))?
                .save(render_directory.join(format!("{index:03}-depth.png")))?;
            visual::label_image(predictions)?
                .save(render_directory.join(format!("{index:03}-semantic.png")))?;

            log::info!(
                target: "semantic_nerf::experiment",
                "Item {:03} ┃ PSNR = {:.2} dB ┃ SSIM = {:.4} ┃ mIoU = {}",
                index,
                fidelity,
                ssim,
                miou.map_or("n/a".into(), |miou| format!("{miou:.4}")),
            );
            eval_items.push(EvaluationOutputItem {
                index,
                fidelity,
                ssim,
                miou,
            });
        }

        let fps_rendering = if time_secs_rendering > 0.0 {
            count as f64 / time_secs_rendering
        } else {
            0.0
        };
        log::info!(
            target: "semantic_nerf::experiment",
            "Rendering time ┃ {:.3} sec ┃ {:.2} FPS",
            time_secs_rendering,
            fps_rendering,
        );

        let average = |score: fn(&EvaluationOutputItem) -> f64| {
            if eval_items.is_empty() {
                0.0
            } else {
                eval_items.iter().map(score).sum::<f64>() / eval_items.len() as f64
            }
        };
        let eval_output = EvaluationOutput {
            fps: fps_rendering,
            fidelity: average(|item| item.fidelity),
            ssim: average(|item| item.ssim),
            miou: has_labels.then(|| metric_iou.mean()),
            items: eval_items,
        };

        eval_output
            .save(self.artifact_directory.join("evaluation-output.json"))?;

        Ok(eval_output)
    }
}

extern crate semantic_nerf;

use burn::{prelude::TensorData, tensor::backend::AutodiffBackend};
use semantic_nerf::prelude::*;

/// A camera at `x` on a line two units in front of the origin, facing it.
fn camera(
    x: f64,
    size: u32,
) -> Camera {
    let focal = size as f64;
    let center = size as f64 / 2.0;

    Camera {
        image_height: size,
        image_width: size,
        intrinsics: [
            [focal, 0.0, center, 0.0],
            [0.0, focal, center, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
        camera_to_world: [
            [1.0, 0.0, 0.0, x],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, -2.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    }
}

/// A striped image whose stripes shift with the camera.
fn image(
    x: f64,
    size: usize,
) -> Vec<f32> {
    (0..size * size)
        .flat_map(|index| {
            let col = (index % size) as f32 + x as f32 * size as f32;
            let row = (index / size) as f32;
            [
                (col * 0.3).sin() * 0.5 + 0.5,
                (row * 0.2).cos() * 0.5 + 0.5,
                ((col + row) * 0.1).sin() * 0.5 + 0.5,
            ]
        })
        .collect()
}

fn scene_item(
    x: f64,
    size: usize,
    class_count: usize,
) -> anyhow::Result<SceneItem> {
    let offsets = [-0.2, 0.2];
    let source_images = offsets.iter().flat_map(|&dx| image(x + dx, size)).collect();
    let query_camera = camera(x, size as u32);
    let labels = (0..size * size)
        .map(|index| ((index % size) * class_count / size) as i64)
        .collect();

    Ok(SceneItem::new(
        TensorData::new(image(x, size), [size, size, 3]),
        query_camera,
        TensorData::new(source_images, [offsets.len(), size, size, 3]),
        offsets.iter().map(|&dx| camera(x + dx, size as u32)).collect(),
        dataset::depth_range_around_origin(&query_camera)?,
        Some(TensorData::new(labels, [size, size])),
    )?)
}

fn run<B: AutodiffBackend>(device: &B::Device) -> anyhow::Result<()> {
    let config = ExperimentConfig::new("artifacts/experiment".into())
        .with_network(GntNetworkConfig::new().with_depth(2))
        .with_renderer(
            RenderConfig::new()
                .with_points_per_ray(32)
                .with_importance_points_per_ray(16)
                .with_render_stride(2),
        )
        .with_trainer(
            experiment::TrainerConfig::new()
                .with_rays_per_step(256)
                .with_step_count(100)
                .with_save_interval(50)
                .with_log_interval(10),
        );

    let dataset = SceneDataset::new(
        (0..10)
            .map(|index| scene_item(index as f64 * 0.05 - 0.25, 32, 20))
            .collect::<anyhow::Result<_>>()?,
    );
    let experiment = config.init::<B>(dataset, device)?;
    let models = config.init_models::<B>(device)?;

    let models = experiment.trainer.train(models, &mut LogMetricsSink)?;
    let output = experiment.tester.test(&models)?;
    println!(
        "PSNR = {:.2} dB ┃ SSIM = {:.4} ┃ mIoU = {:.4}",
        output.fidelity,
        output.ssim,
        output.miou.unwrap_or_default(),
    );

    Ok(())
}

fn main() -> anyhow::Result<()> {
    type InnerBackend = backend::Wgpu;
    type Backend = backend::Autodiff<InnerBackend>;

    let device = backend::wgpu::WgpuDevice::BestAvailable;

    run::<Backend>(&device)
}

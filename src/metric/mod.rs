use crate::error::*;
use burn::{
    prelude::*,
    tensor::{module::conv2d, ops::ConvOptions},
};
use std::marker::PhantomData;

#[derive(Clone, Debug)]
pub struct PsnrMetric<B: Backend> {
    coefficient: f64,
    _b: PhantomData<B>,
}

/// Structural similarity over a Gaussian window.
#[derive(Clone, Debug)]
pub struct SsimMetric<B: Backend> {
    window_size: usize,
    sigma: f64,
    constants: [f64; 2],
    _b: PhantomData<B>,
}

/// Intersection over union from an accumulated confusion matrix.
#[derive(Clone, Debug)]
pub struct IouMetric {
    num_classes: usize,
    ignore_label: usize,
    /// `confusion[label * K + prediction]`
    confusion: Vec<u64>,
}

impl<B: Backend> PsnrMetric<B> {
    pub fn init() -> Self {
        Self {
            coefficient: -10.0 / std::f64::consts::LN_10,
            _b: PhantomData,
        }
    }

    pub fn forward<const D: usize>(
        &self,
        outputs: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let error = outputs - targets;
        self.from_mse((error.to_owned() * error).mean())
    }

    pub fn from_mse(
        &self,
        loss: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        loss.log() * self.coefficient
    }
}

impl<B: Backend> SsimMetric<B> {
    pub fn init() -> Self {
        Self {
            window_size: 11,
            sigma: 1.5,
            constants: [0.01f64.powi(2), 0.03f64.powi(2)],
            _b: PhantomData,
        }
    }

    /// The mean SSIM of two `[H, W, C]` images with values in `[0, 1]`.
    ///
    /// The window shrinks to the largest odd size fitting smaller images.
    pub fn forward(
        &self,
        outputs: Tensor<B, 3>,
        targets: Tensor<B, 3>,
    ) -> Tensor<B, 1> {
        let [height, width, channels] = outputs.dims();
        let size = self.window_size.min(height).min(width).max(1);
        let size = size - (1 - size % 2);

        let window = self.window(size, channels, &outputs.device());
        let options = ConvOptions::new([1, 1], [0, 0], [1, 1], channels);
        let filter = |x: Tensor<B, 4>| {
            conv2d(x, window.to_owned(), None, options.to_owned())
        };
        // [H, W, C] to [1, C, H, W]
        let planar =
            |x: Tensor<B, 3>| x.swap_dims(0, 2).swap_dims(1, 2).unsqueeze::<4>();
        let x = planar(outputs);
        let y = planar(targets);

        let mean_x = filter(x.to_owned());
        let mean_y = filter(y.to_owned());
        let mean_xx = mean_x.to_owned() * mean_x.to_owned();
        let mean_yy = mean_y.to_owned() * mean_y.to_owned();
        let mean_xy = mean_x * mean_y;
        let variance_x = filter(x.to_owned() * x.to_owned()) - mean_xx.to_owned();
        let variance_y = filter(y.to_owned() * y.to_owned()) - mean_yy.to_owned();
        let covariance = filter(x * y) - mean_xy.to_owned();

        let [c1, c2] = self.constants;
        let similarity = ((mean_xy * 2.0 + c1) * (covariance * 2.0 + c2))
            / ((mean_xx + mean_yy + c1) * (variance_x + variance_y + c2));

        similarity.mean()
    }

    /// `[C, 1, size, size]`, one normalized Gaussian kernel per channel.
    fn window(
        &self,
        size: usize,
        channels: usize,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let center = (size / 2) as f64;
        let gaussian = (0..size)
            .map(|i| (-(i as f64 - center).powi(2) / (2.0 * self.sigma.powi(2))).exp())
            .collect::<Vec<_>>();
        let total = gaussian.iter().sum::<f64>().powi(2);
        let kernel = gaussian
            .iter()
            .flat_map(|a| gaussian.iter().map(move |b| (a * b / total) as f32))
            .collect::<Vec<_>>();

        Tensor::from_data(
            TensorData::new(kernel.repeat(channels), [channels, 1, size, size]),
            device,
        )
    }
}

impl IouMetric {
    pub fn new(
        num_classes: usize,
        ignore_label: usize,
    ) -> Self {
        Self {
            num_classes,
            ignore_label,
            confusion: vec![0; num_classes * num_classes],
        }
    }

    /// Accumulates `predictions` against `labels`, both class indices of one shape.
    pub fn update<B: Backend, const D: usize>(
        &mut self,
        predictions: Tensor<B, D, Int>,
        labels: Tensor<B, D, Int>,
    ) -> Result<()> {
        if predictions.dims() != labels.dims() {
            return Err(Error::ShapeMismatch(
                "Predictions".into(),
                labels.dims().to_vec(),
                predictions.dims().to_vec(),
            ));
        }

        let predictions = to_indices(predictions)?;
        let labels = to_indices(labels)?;
        let classes = 0..self.num_classes as i64;

        for (prediction, label) in predictions.into_iter().zip(labels) {
            if label == self.ignore_label as i64
                || !classes.contains(&label)
                || !classes.contains(&prediction)
            {
                continue;
            }
            self.confusion
                [label as usize * self.num_classes + prediction as usize] += 1;
        }

        Ok(())
    }

    /// The IoU of every class, `None` for classes neither labeled nor predicted.
    pub fn per_class(&self) -> Vec<Option<f64>> {
        let k = self.num_classes;
        (0..k)
            .map(|class| {
                let hits = self.confusion[class * k + class];
                let labeled: u64 =
                    self.confusion[class * k..(class + 1) * k].iter().sum();
                let predicted: u64 =
                    (0..k).map(|label| self.confusion[label * k + class]).sum();
                let union = labeled + predicted - hits;
                (union > 0).then(|| hits as f64 / union as f64)
            })
            .collect()
    }

    /// The mean IoU over the classes present, zero if there are none.
    pub fn mean(&self) -> f64 {
        let ious = self.per_class().into_iter().flatten().collect::<Vec<_>>();
        if ious.is_empty() {
            return 0.0;
        }
        ious.iter().sum::<f64>() / ious.len() as f64
    }

    pub fn reset(&mut self) {
        self.confusion.fill(0);
    }
}

fn to_indices<B: Backend, const D: usize>(
    tensor: Tensor<B, D, Int>
) -> Result<Vec<i64>> {
    Ok(tensor.into_data().convert::<i64>().to_vec::<i64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Backend = burn::backend::NdArray;

    #[test]
    fn psnr_metric_output() {
        let device = Default::default();
        let metric = PsnrMetric::<Backend>::init();

        let outputs = Tensor::<Backend, 2>::from_floats(
            [[0.0, 0.1, 0.2], [0.5, 0.4, 0.3]],
            &device,
        );
        let targets = Tensor::<Backend, 2>::from_floats(
            [[0.5, 0.6, 0.7], [0.0, 0.9, 0.8]],
            &device,
        );
        metric
            .forward(outputs, targets)
            .into_data()
            .assert_approx_eq(&TensorData::from([6.0206003f32]), 4);

        let outputs = Tensor::<Backend, 2>::from_floats(
            [[0.0, 0.1, 0.2], [0.5, 0.4, 0.3]],
            &device,
        );
        let targets = Tensor::<Backend, 2>::from_floats(
            [[0.0, 0.6, 0.7], [0.0, 0.4, 0.3]],
            &device,
        );
        metric
            .forward(outputs, targets)
            .into_data()
            .assert_approx_eq(&TensorData::from([9.0309f32]), 4);
    }

    #[test]
    fn ssim_metric_output() {
        let device = Default::default();
        let metric = SsimMetric::<Backend>::init();

        let image = Tensor::<Backend, 1, Int>::arange(0..432, &device)
            .float()
            .div_scalar(9.0)
            .sin()
            .mul_scalar(0.5)
            .add_scalar(0.5)
            .reshape([12, 12, 3]);

        metric
            .forward(image.to_owned(), image.to_owned())
            .into_data()
            .assert_approx_eq(&TensorData::from([1.0f32]), 4);

        let inverted = image.to_owned().neg().add_scalar(1.0);
        let similarity = metric
            .forward(image.to_owned(), inverted)
            .into_scalar();
        assert!(similarity < 0.5);

        let shifted = image.to_owned().add_scalar(0.05);
        let similarity = metric.forward(image.to_owned(), shifted).into_scalar();
        assert!(similarity > 0.5 && similarity < 1.0);

        // Smaller than the window
        let small = image.slice([0..4, 0..3, 0..3]);
        metric
            .forward(small.to_owned(), small)
            .into_data()
            .assert_approx_eq(&TensorData::from([1.0f32]), 4);
    }

    #[test]
    fn iou_metric_output() {
        let device = Default::default();
        let mut metric = IouMetric::new(3, 3);

        let predictions =
            Tensor::<Backend, 1, Int>::from_ints([0, 0, 1, 1, 2, 0], &device);
        let labels = Tensor::<Backend, 1, Int>::from_ints([0, 1, 1, 1, 3, 3], &device);
        metric.update(predictions, labels).unwrap();

        // Class 2 is predicted only on an ignored pixel
        assert_eq!(metric.per_class(), vec![Some(0.5), Some(2.0 / 3.0), None]);
        assert!((metric.mean() - 7.0 / 12.0).abs() < 1e-9);

        metric.reset();
        assert_eq!(metric.mean(), 0.0);

        let mismatched = metric.update(
            Tensor::<Backend, 1, Int>::from_ints([0, 1], &device),
            Tensor::<Backend, 1, Int>::from_ints([0], &device),
        );
        assert!(mismatched.is_err());
    }
}

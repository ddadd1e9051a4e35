//! Training objectives for rendered colors and decoded semantics.

use crate::{renderer::RenderOutput, *};
use burn::{prelude::*, tensor::activation};

#[derive(Config, Debug)]
pub struct RenderLossConfig {
    #[config(default = 0.25)]
    pub scale: f64,
}

#[derive(Config, Debug)]
pub struct SemanticLossConfig {
    #[config(default = 0.75)]
    pub scale: f64,
    #[config(default = 20)]
    pub ignore_label: usize,
}

/// Mean squared color error over valid rays, summed over both stages.
#[derive(Clone, Debug)]
pub struct RenderLoss {
    scale: f64,
}

/// Cross entropy over labeled pixels.
#[derive(Clone, Debug)]
pub struct SemanticLoss {
    scale: f64,
    ignore_label: usize,
}

impl RenderLossConfig {
    pub fn init(&self) -> RenderLoss {
        RenderLoss { scale: self.scale }
    }
}

impl SemanticLossConfig {
    pub fn init(&self) -> SemanticLoss {
        SemanticLoss {
            scale: self.scale,
            ignore_label: self.ignore_label,
        }
    }
}

impl RenderLoss {
    /// The scaled loss of both stages against `targets` (`[R, 3]`).
    pub fn forward<B: Backend>(
        &self,
        output: &RenderOutput<B>,
        targets: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let mut loss = masked_mse(
            output.coarse.rgb.to_owned(),
            targets.to_owned(),
            output.coarse.valid.to_owned(),
        );
        if let Some(fine) = &output.fine {
            loss = loss
                + masked_mse(fine.rgb.to_owned(), targets, fine.valid.to_owned());
        }

        loss * self.scale
    }
}

impl SemanticLoss {
    #[inline]
    pub fn ignore_label(&self) -> usize {
        self.ignore_label
    }

    /// The scaled loss of `logits` (`[N, K]`) against `labels` (`[N]`).
    ///
    /// Pixels labeled [`ignore_label`](Self::ignore_label), or beyond the
    /// classes, take no part in it. It is zero without any labeled pixel.
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [count, class_count] = logits.dims();
        let ignored = labels.to_owned().equal_elem(self.ignore_label as i64);
        let labeled = ignored.to_owned().bool_not().float()
            * labels
                .to_owned()
                .lower_elem(class_count as i64)
                .float()
            * labels.to_owned().greater_equal_elem(0).float();
        let indices = labels
            .mask_fill(ignored, 0)
            .clamp(0, class_count as i64 - 1)
            .reshape([count, 1]);

        let log_probabilities = activation::log_softmax(logits, 1)
            .gather(1, indices)
            .reshape([count]);
        let loss = -(log_probabilities * labeled.to_owned()).sum()
            / labeled.sum().clamp_min(1.0);

        loss * self.scale
    }
}

/// `sum((x - y)^2 * m) / (3 * sum(m))`
fn masked_mse<B: Backend>(
    outputs: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    valid: Tensor<B, 1, Bool>,
) -> Tensor<B, 1> {
    let [_, channel_count] = outputs.dims();
    let mask = valid.float().unsqueeze_dim::<2>(1);

    ((outputs - targets).powf_scalar(2.0) * mask.to_owned()).sum()
        / (mask.sum() * channel_count as f64 + 1e-8)
}

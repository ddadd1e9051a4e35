//! Color-coded images of rendered outputs.

use crate::{error::*, *};
use burn::prelude::*;
use image::RgbImage;

/// The colors of the 20 ScanNet classes, followed by the color of unlabeled pixels.
pub const SCANNET_COLOR_MAP: [[u8; 3]; 21] = [
    [174, 199, 232], // wall
    [152, 223, 138], // floor
    [31, 119, 180],  // cabinet
    [255, 187, 120], // bed
    [188, 189, 34],  // chair
    [140, 86, 75],   // sofa
    [255, 152, 150], // table
    [214, 39, 40],   // door
    [197, 176, 213], // window
    [148, 103, 189], // bookshelf
    [196, 156, 148], // picture
    [23, 190, 207],  // counter
    [247, 182, 210], // desk
    [219, 219, 141], // curtain
    [255, 127, 14],  // refrigerator
    [91, 163, 138],  // shower curtain
    [44, 160, 44],   // toilet
    [112, 128, 144], // sink
    [227, 119, 194], // bathtub
    [82, 84, 163],   // other furniture
    [248, 166, 116], // unlabeled
];

/// The color of `label`. Labels outside the map share the unlabeled color.
#[inline]
pub fn label_color(label: i64) -> [u8; 3] {
    let invalid = SCANNET_COLOR_MAP.len() - 1;
    let index = usize::try_from(label).map_or(invalid, |label| label.min(invalid));
    SCANNET_COLOR_MAP[index]
}

/// The jet colormap at `value` in `[0, 1]`.
pub fn jet_color(value: f32) -> [u8; 3] {
    let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let channel = |center: f32| {
        ((1.5 - (4.0 * value - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// `rgb`: `[H, W, 3]` with values in `[0, 1]`
pub fn rgb_image<B: Backend>(rgb: Tensor<B, 3>) -> Result<RgbImage> {
    let [height, width, channel_count] = rgb.dims();
    if channel_count != 3 {
        return Err(Error::ShapeMismatch(
            "RGB image".into(),
            vec![height, width, 3],
            rgb.dims().to_vec(),
        ));
    }

    let pixels = to_floats(rgb)?
        .into_iter()
        .map(|value| (value.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();

    from_raw([height, width], pixels)
}

/// `depth`: `[H, W]`, normalized into `range` or else into its own extent
pub fn depth_image<B: Backend>(
    depth: Tensor<B, 2>,
    range: Option<[f64; 2]>,
) -> Result<RgbImage> {
    let [height, width] = depth.dims();
    let values = to_floats(depth)?;

    let [low, high] = range.map(|range| range.map(|v| v as f32)).unwrap_or_else(|| {
        values
            .iter()
            .filter(|v| v.is_finite())
            .fold([f32::INFINITY, f32::NEG_INFINITY], |[low, high], &v| {
                [low.min(v), high.max(v)]
            })
    });
    let extent = (high - low).max(f32::EPSILON);

    let pixels = values
        .into_iter()
        .flat_map(|value| jet_color((value - low) / extent))
        .collect();

    from_raw([height, width], pixels)
}

/// `labels`: `[H, W]` class indices
pub fn label_image<B: Backend>(labels: Tensor<B, 2, Int>) -> Result<RgbImage> {
    let [height, width] = labels.dims();
    let pixels = labels
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()?
        .into_iter()
        .flat_map(label_color)
        .collect();

    from_raw([height, width], pixels)
}

fn to_floats<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    Ok(tensor.into_data().convert::<f32>().to_vec::<f32>()?)
}

fn from_raw(
    size: [usize; 2],
    pixels: Vec<u8>,
) -> Result<RgbImage> {
    let [height, width] = size;
    let len = pixels.len();

    RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        Error::ShapeMismatch("Image pixels".into(), vec![height * width * 3], vec![len])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type Backend = burn::backend::NdArray;

    #[test]
    fn label_colors() {
        assert_eq!(label_color(0), [174, 199, 232]);
        assert_eq!(label_color(19), [82, 84, 163]);
        assert_eq!(label_color(20), [248, 166, 116]);
        assert_eq!(label_color(255), [248, 166, 116]);
        assert_eq!(label_color(-1), [248, 166, 116]);
    }

    #[test]
    fn jet_colors() {
        assert_eq!(jet_color(0.0), [0, 0, 128]);
        assert_eq!(jet_color(0.5), [128, 255, 128]);
        assert_eq!(jet_color(1.0), [128, 0, 0]);
        assert_eq!(jet_color(f32::NAN), [0, 0, 128]);
    }

    #[test]
    fn images_from_tensors() {
        let device = Default::default();

        let rgb = Tensor::<Backend, 3>::from_floats(
            [[[0.0, 0.5, 1.0], [2.0, -1.0, 0.2]]],
            &device,
        );
        let image = rgb_image(rgb).unwrap();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, [0, 128, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [255, 0, 51]);

        let depth = Tensor::<Backend, 2>::from_floats([[1.0], [2.0], [3.0]], &device);
        let image = depth_image(depth.to_owned(), None).unwrap();
        assert_eq!(image.dimensions(), (1, 3));
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 128]);
        assert_eq!(image.get_pixel(0, 2).0, [128, 0, 0]);
        let image = depth_image(depth, Some([0.0, 4.0])).unwrap();
        assert_eq!(image.get_pixel(0, 1).0, [128, 255, 128]);

        let labels = Tensor::<Backend, 2, Int>::from_ints([[1, 20]], &device);
        let image = label_image(labels).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [152, 223, 138]);
        assert_eq!(image.get_pixel(1, 0).0, [248, 166, 116]);

        let gray = Tensor::<Backend, 3>::zeros([2, 2, 1], &device);
        assert!(rgb_image(gray).is_err());
    }
}

//! Runs a [`SuperResModel`] over a decoded image of any supported layout.
//!
//! Gray images are replicated to three channels before inference and
//! collapsed back afterwards. An alpha plane is replicated to three channels,
//! pushed through the same model, and collapsed with luma weights. The result
//! keeps the input's channel layout and bit depth.

use anyhow::{bail, Result};
use image::{DynamicImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use ndarray::Array4;
use tracing::trace;

use super::SuperResModel;

const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Samples above this mark the image as 16-bit content.
const EIGHT_BIT_CEILING: f32 = 256.0;

/// Planar copy of an image's samples.
struct Planes {
    width: usize,
    height: usize,
    channels: usize,
    sixteen_bit: bool,
    samples: Vec<f32>,
}

impl Planes {
    fn from_image(image: &DynamicImage) -> Self {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let (channels, sixteen_bit, samples): (usize, bool, Vec<f32>) = match image {
            DynamicImage::ImageLuma8(buf) => (1, false, widen(buf.as_raw())),
            DynamicImage::ImageLumaA8(buf) => (2, false, widen(buf.as_raw())),
            DynamicImage::ImageRgb8(buf) => (3, false, widen(buf.as_raw())),
            DynamicImage::ImageRgba8(buf) => (4, false, widen(buf.as_raw())),
            DynamicImage::ImageLuma16(buf) => (1, true, widen(buf.as_raw())),
            DynamicImage::ImageLumaA16(buf) => (2, true, widen(buf.as_raw())),
            DynamicImage::ImageRgb16(buf) => (3, true, widen(buf.as_raw())),
            DynamicImage::ImageRgba16(buf) => (4, true, widen(buf.as_raw())),
            other => (4, true, widen(other.to_rgba16().as_raw())),
        };
        Self {
            width,
            height,
            channels,
            sixteen_bit,
            samples,
        }
    }

    fn has_alpha(&self) -> bool {
        self.channels == 2 || self.channels == 4
    }

    fn color_channels(&self) -> usize {
        if self.channels >= 3 {
            3
        } else {
            1
        }
    }

    /// Divisor mapping stored samples into `[0, 1]`.
    ///
    /// Decided from the values actually present: a 16-bit image whose samples
    /// all sit at or below 256 is normalized as if it were 8-bit.
    fn value_range(&self) -> f32 {
        let max = self.samples.iter().copied().fold(0.0f32, f32::max);
        if max > EIGHT_BIT_CEILING {
            u16::MAX as f32
        } else {
            u8::MAX as f32
        }
    }

    fn sample(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.samples[(y * self.width + x) * self.channels + channel]
    }

    /// `[1, 3, H, W]` tensor of the color planes; gray is replicated.
    fn color_tensor(&self, range: f32) -> Array4<f32> {
        let color = self.color_channels();
        Array4::from_shape_fn((1, 3, self.height, self.width), |(_, c, y, x)| {
            let source = if color == 1 { 0 } else { c };
            self.sample(x, y, source) / range
        })
    }

    /// `[1, 3, H, W]` tensor with the alpha plane in every channel.
    fn alpha_tensor(&self, range: f32) -> Array4<f32> {
        let alpha = self.channels - 1;
        Array4::from_shape_fn((1, 3, self.height, self.width), |(_, _, y, x)| {
            self.sample(x, y, alpha) / range
        })
    }
}

fn widen<T: Copy + Into<f32>>(raw: &[T]) -> Vec<f32> {
    raw.iter().map(|&v| v.into()).collect()
}

fn luma(tensor: &Array4<f32>, y: usize, x: usize) -> f32 {
    LUMA_WEIGHTS
        .iter()
        .enumerate()
        .map(|(c, w)| tensor[[0, c, y, x]] * w)
        .sum()
}

fn quantize(value: f32, range: f32) -> f32 {
    (value.clamp(0.0, 1.0) * range).round()
}

/// Upscales `image` by the model's factor, preserving channel layout and
/// sample depth.
pub fn enhance(model: &mut dyn SuperResModel, image: &DynamicImage) -> Result<DynamicImage> {
    let planes = Planes::from_image(image);
    if planes.width == 0 || planes.height == 0 {
        bail!("cannot upscale an empty image");
    }

    let scale = model.scale() as usize;
    let out_w = planes.width * scale;
    let out_h = planes.height * scale;
    let range = planes.value_range();

    trace!(
        width = planes.width,
        height = planes.height,
        channels = planes.channels,
        range,
        "Enhancing image"
    );

    let color = checked_output(model.upscale(planes.color_tensor(range))?, out_h, out_w)?;
    let alpha = if planes.has_alpha() {
        Some(checked_output(
            model.upscale(planes.alpha_tensor(range))?,
            out_h,
            out_w,
        )?)
    } else {
        None
    };

    let color_channels = planes.color_channels();
    let out_channels = planes.channels;
    let mut samples = Vec::with_capacity(out_w * out_h * out_channels);
    for y in 0..out_h {
        for x in 0..out_w {
            if color_channels == 1 {
                samples.push(quantize(luma(&color, y, x), range));
            } else {
                for c in 0..3 {
                    samples.push(quantize(color[[0, c, y, x]], range));
                }
            }
            if let Some(alpha) = &alpha {
                samples.push(quantize(luma(alpha, y, x), range));
            }
        }
    }

    rebuild(out_w as u32, out_h as u32, out_channels, planes.sixteen_bit, samples)
}

fn checked_output(output: Array4<f32>, out_h: usize, out_w: usize) -> Result<Array4<f32>> {
    let (_, channels, height, width) = output.dim();
    if channels != 3 || height != out_h || width != out_w {
        bail!(
            "model output has shape [{channels}, {height}, {width}], expected [3, {out_h}, {out_w}]"
        );
    }
    Ok(output)
}

fn rebuild(
    width: u32,
    height: u32,
    channels: usize,
    sixteen_bit: bool,
    samples: Vec<f32>,
) -> Result<DynamicImage> {
    macro_rules! buffer {
        ($pixel:ident, $variant:ident, $ty:ty) => {{
            let raw: Vec<$ty> = samples.iter().map(|&v| v as $ty).collect();
            match ImageBuffer::<$pixel<$ty>, _>::from_raw(width, height, raw) {
                Some(buf) => DynamicImage::$variant(buf),
                None => bail!("sample count does not match {width}x{height}"),
            }
        }};
    }

    let image = match (channels, sixteen_bit) {
        (1, false) => buffer!(Luma, ImageLuma8, u8),
        (2, false) => buffer!(LumaA, ImageLumaA8, u8),
        (3, false) => buffer!(Rgb, ImageRgb8, u8),
        (4, false) => buffer!(Rgba, ImageRgba8, u8),
        (1, true) => buffer!(Luma, ImageLuma16, u16),
        (2, true) => buffer!(LumaA, ImageLumaA16, u16),
        (3, true) => buffer!(Rgb, ImageRgb16, u16),
        (4, true) => buffer!(Rgba, ImageRgba16, u16),
        (other, _) => bail!("unsupported channel count {other}"),
    };
    Ok(image)
}

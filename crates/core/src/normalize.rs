//! Letterbox normalization: fit any image into the model's fixed frame size.
//!
//! Every source image and every driving frame goes through [`normalize`]
//! before it reaches the animation model. The result is always an RGB8 buffer
//! of exactly the target size: content scaled uniformly with an anti-aliased
//! filter, centered, and zero-padded on the shorter axis.

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::{Array4, ArrayViewD, Axis};

use crate::types::FrameSize;

/// Placement of the scaled content inside the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    pub content: FrameSize,
    pub pad_left: u32,
    pub pad_top: u32,
}

impl Letterbox {
    pub fn pad_right(&self, target: FrameSize) -> u32 {
        target.width - self.content.width - self.pad_left
    }

    pub fn pad_bottom(&self, target: FrameSize) -> u32 {
        target.height - self.content.height - self.pad_top
    }
}

/// Computes the letterbox geometry for a `source` image inside `target`.
///
/// The scale factor is `min(target_h / src_h, target_w / src_w)`, evaluated
/// exactly in integer arithmetic so the limiting axis always lands on the
/// target edge. The free axis is floored. Odd leftover padding goes to the
/// trailing (right/bottom) edge.
pub fn letterbox(source: FrameSize, target: FrameSize) -> Result<Letterbox> {
    if target.is_empty() {
        bail!("letterbox target must be non-empty, got {target}");
    }
    if source.is_empty() {
        bail!("cannot normalize an empty {source} image");
    }

    let (sw, sh) = (source.width as u64, source.height as u64);
    let (tw, th) = (target.width as u64, target.height as u64);

    let (new_w, new_h) = if th * sw <= tw * sh {
        (sw * th / sh, th)
    } else {
        (tw, sh * tw / sw)
    };

    if new_w == 0 || new_h == 0 {
        bail!(
            "source image {source} is too thin to letterbox into {target}: \
             scaled size would be {new_w}x{new_h}"
        );
    }

    let content = FrameSize::new(new_w as u32, new_h as u32);
    Ok(Letterbox {
        content,
        pad_left: (target.width - content.width) / 2,
        pad_top: (target.height - content.height) / 2,
    })
}

/// Letterboxes `image` into `target`, returning an RGB8 buffer of exactly
/// that size. Grayscale, alpha and 16-bit inputs are converted to RGB8 first.
pub fn normalize(image: &DynamicImage, target: FrameSize) -> Result<RgbImage> {
    let rgb = image.to_rgb8();
    normalize_rgb(rgb, target)
}

/// Same as [`normalize`] for a buffer that is already RGB8.
pub fn normalize_rgb(rgb: RgbImage, target: FrameSize) -> Result<RgbImage> {
    let source = FrameSize::new(rgb.width(), rgb.height());
    let placement = letterbox(source, target)?;

    if source == target {
        return Ok(rgb);
    }

    let resized = if placement.content == source {
        rgb
    } else {
        imageops::resize(
            &rgb,
            placement.content.width,
            placement.content.height,
            FilterType::Triangle,
        )
    };

    let mut canvas = RgbImage::new(target.width, target.height);
    imageops::replace(
        &mut canvas,
        &resized,
        placement.pad_left as i64,
        placement.pad_top as i64,
    );
    Ok(canvas)
}

/// Decodes an uploaded still image (JPEG or PNG).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("failed to decode source image")
}

/// Encodes a normalized frame as PNG for display.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .context("failed to encode PNG preview")?;
    Ok(out.into_inner())
}

/// RGB8 HWC buffer -> `[1, 3, H, W]` f32 tensor in `[0, 1]`.
pub fn to_nchw_tensor(image: &RgbImage) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// `[1, 3, H, W]` (or `[3, H, W]`) f32 tensor in `[0, 1]` -> RGB8 buffer.
/// Values are clamped and rounded.
pub fn from_nchw_tensor(tensor: ArrayViewD<'_, f32>) -> Result<RgbImage> {
    let chw = match tensor.ndim() {
        4 => {
            if tensor.shape()[0] != 1 {
                bail!(
                    "expected a single-image batch, got shape {:?}",
                    tensor.shape()
                );
            }
            tensor.index_axis_move(Axis(0), 0)
        }
        3 => tensor,
        _ => bail!("expected NCHW or CHW tensor, got shape {:?}", tensor.shape()),
    };

    let shape = chw.shape();
    if shape[0] != 3 {
        bail!("expected 3 channels, got shape {:?}", shape);
    }
    let (h, w) = (shape[1], shape[2]);

    let mut image = RgbImage::new(w as u32, h as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        for c in 0..3 {
            let value = chw[[c, y as usize, x as usize]];
            pixel[c] = (value * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(image)
}

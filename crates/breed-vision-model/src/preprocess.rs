//! Image decoding and the fixed tensor transform applied before inference.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Deserialize;

use crate::config::PreprocessConfig;
use crate::error::{ModelError, ModelResult};

/// Longest side a full (uncropped) resize may produce.
pub const MAX_RESIZED_SIDE: u32 = 8192;

/// Decode raw upload bytes into an RGB image.
///
/// Grayscale, palette and alpha images are converted to three channels.
pub fn decode_image(bytes: &[u8]) -> ModelResult<RgbImage> {
    if bytes.is_empty() {
        return Err(ModelError::EmptyInput);
    }
    let image = image::load_from_memory(bytes).map_err(|e| ModelError::InvalidImage {
        reason: e.to_string(),
    })?;
    Ok(image.to_rgb8())
}

/// How the image is scaled before cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    /// Scale so the shorter side has this length, keeping the aspect ratio.
    ShorterSide(u32),
    /// Scale to exactly this size.
    Exact { width: u32, height: u32 },
}

/// Resize, optional center crop, scale to [0, 1], per-channel normalize.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTransform {
    resize: Resize,
    crop: Option<u32>,
    mean: [f32; 3],
    std: [f32; 3],
}

impl ImageTransform {
    pub fn new(resize: Resize, crop: Option<u32>, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            resize,
            crop,
            mean,
            std,
        }
    }

    pub fn from_config(config: &PreprocessConfig) -> Self {
        Self::new(
            Resize::ShorterSide(config.resize_shorter),
            Some(config.crop_size),
            config.mean,
            config.std,
        )
    }

    /// Read a `preprocessor_config.json`, falling back to a 224x224 resize
    /// with mean/std 0.5 for anything it does not specify.
    pub fn from_preprocessor_config(path: &Path) -> ModelResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let raw: PreprocessorConfig = serde_json::from_str(&content).map_err(|e| {
            ModelError::config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(raw.into_transform())
    }

    /// Transform used for a pretrained directory without a preprocessor config.
    pub fn pretrained_default(image_size: u32) -> Self {
        Self::new(
            Resize::Exact {
                width: image_size,
                height: image_size,
            },
            None,
            [0.5; 3],
            [0.5; 3],
        )
    }

    pub fn resize(&self) -> Resize {
        self.resize
    }

    pub fn crop(&self) -> Option<u32> {
        self.crop
    }

    /// Geometric part of the transform.
    ///
    /// With a shorter-side resize and a crop, the crop box is mapped back to
    /// source pixels and only that region is resized, so the resized image is
    /// never larger than the crop.
    pub fn resize_and_crop(&self, image: &RgbImage) -> ModelResult<RgbImage> {
        let (width, height) = image.dimensions();
        let (size, (new_w, new_h)) = match self.resize {
            Resize::Exact { width, height } => {
                let resized = imageops::resize(image, width, height, FilterType::Triangle);
                return Ok(match self.crop {
                    Some(crop) => center_crop(&resized, crop),
                    None => resized,
                });
            }
            Resize::ShorterSide(size) if width <= height => {
                (size, (size, scaled(size, height, width)))
            }
            Resize::ShorterSide(size) => (size, (scaled(size, width, height), size)),
        };

        let Some(crop) = self.crop else {
            if new_w.max(new_h) > MAX_RESIZED_SIDE {
                return Err(ModelError::InvalidImage {
                    reason: format!(
                        "{}x{} image would resize to {}x{}, above the {} pixel limit",
                        width, height, new_w, new_h, MAX_RESIZED_SIDE
                    ),
                });
            }
            return Ok(imageops::resize(image, new_w, new_h, FilterType::Triangle));
        };

        let (cw, ch) = (crop.min(new_w), crop.min(new_h));
        let source_per_output = width.min(height) as f64 / size as f64;
        let src_w = ((cw as f64 * source_per_output).round() as u32).clamp(1, width);
        let src_h = ((ch as f64 * source_per_output).round() as u32).clamp(1, height);
        let left = ((width - src_w) as f64 / 2.0).round() as u32;
        let top = ((height - src_h) as f64 / 2.0).round() as u32;

        let region = imageops::crop_imm(image, left, top, src_w, src_h).to_image();
        Ok(imageops::resize(&region, cw, ch, FilterType::Triangle))
    }

    /// Full transform: returns a `(1, 3, H, W)` f32 tensor on `device`.
    pub fn apply(&self, image: &RgbImage, device: &Device) -> ModelResult<Tensor> {
        let prepared = self.resize_and_crop(image)?;
        let (width, height) = prepared.dimensions();
        let pixels = Tensor::from_vec(
            prepared.into_raw(),
            (height as usize, width as usize, 3),
            &Device::Cpu,
        )?
        .permute((2, 0, 1))?;

        let mean = Tensor::new(&self.mean[..], &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.std[..], &Device::Cpu)?.reshape((3, 1, 1))?;
        let normalized = (pixels.to_dtype(DType::F32)? / 255.0)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?;

        Ok(normalized.unsqueeze(0)?.to_device(device)?)
    }
}

fn center_crop(image: &RgbImage, crop: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (cw, ch) = (crop.min(width), crop.min(height));
    let left = ((width - cw) as f64 / 2.0).round() as u32;
    let top = ((height - ch) as f64 / 2.0).round() as u32;
    imageops::crop_imm(image, left, top, cw, ch).to_image()
}

/// `long * size / short`, truncated.
fn scaled(size: u32, long: u32, short: u32) -> u32 {
    ((size as u64 * long as u64) / short.max(1) as u64).max(1) as u32
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Square(u32),
    HeightWidth { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
}

#[derive(Debug, Deserialize)]
struct PreprocessorConfig {
    #[serde(default)]
    size: Option<SizeSpec>,
    #[serde(default)]
    do_center_crop: bool,
    #[serde(default)]
    crop_size: Option<SizeSpec>,
    #[serde(default = "default_true")]
    do_normalize: bool,
    #[serde(default)]
    image_mean: Option<[f32; 3]>,
    #[serde(default)]
    image_std: Option<[f32; 3]>,
}

fn default_true() -> bool {
    true
}

impl PreprocessorConfig {
    fn into_transform(self) -> ImageTransform {
        let resize = match self.size {
            Some(SizeSpec::Square(s)) => Resize::Exact {
                width: s,
                height: s,
            },
            Some(SizeSpec::HeightWidth { height, width }) => Resize::Exact { width, height },
            Some(SizeSpec::ShortestEdge { shortest_edge }) => Resize::ShorterSide(shortest_edge),
            None => Resize::Exact {
                width: 224,
                height: 224,
            },
        };
        let crop = match (self.do_center_crop, self.crop_size) {
            (true, Some(SizeSpec::Square(s))) => Some(s),
            (true, Some(SizeSpec::HeightWidth { height, width })) => Some(height.min(width)),
            (true, Some(SizeSpec::ShortestEdge { shortest_edge })) => Some(shortest_edge),
            _ => None,
        };
        let (mean, std) = if self.do_normalize {
            (
                self.image_mean.unwrap_or([0.5; 3]),
                self.image_std.unwrap_or([0.5; 3]),
            )
        } else {
            ([0.0; 3], [1.0; 3])
        };
        ImageTransform::new(resize, crop, mean, std)
    }
}

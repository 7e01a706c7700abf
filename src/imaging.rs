// Image tensors and the nearest-neighbour enlarger.
//
// Bilinear resizing visibly blurs GAN output, so display-size frames are built
// by exact block replication instead.
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MorphError, Result};

/// Value convention of an `ImageTensor`. Loss terms only ever compare two
/// tensors with the same convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelRange {
    /// [0, 1], rescaled generator output.
    Unit,
    /// [0, 255], captured photos.
    Byte,
}

/// An H x W x 3 f32 tensor tagged with its pixel range.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    tensor: Tensor,
    range: PixelRange,
}

impl ImageTensor {
    pub fn new(tensor: Tensor, range: PixelRange) -> Result<Self> {
        let (h, w, c) = tensor.dims3()?;
        if c != 3 {
            return Err(MorphError::InvalidSettings(format!(
                "image tensors need 3 channels, got {c}"
            )));
        }
        if h != w {
            return Err(MorphError::InvalidSettings(format!(
                "image tensors must be square, got {h}x{w}"
            )));
        }
        Ok(Self { tensor, range })
    }

    pub fn side(&self) -> usize {
        self.tensor.dims()[0]
    }

    pub fn range(&self) -> PixelRange {
        self.range
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    /// Rescale to [0, 1]. Unit-range images are returned as is.
    pub fn to_unit(&self) -> Result<Self> {
        match self.range {
            PixelRange::Unit => Ok(self.clone()),
            PixelRange::Byte => Ok(Self {
                tensor: self.tensor.affine(1.0 / 255.0, 0.0)?,
                range: PixelRange::Unit,
            }),
        }
    }

    pub fn from_rgb_image(img: &RgbImage, device: &Device) -> Result<Self> {
        let (w, h) = img.dimensions();
        let data: Vec<f32> = img.as_raw().iter().map(|&b| b as f32).collect();
        let tensor = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?;
        Self::new(tensor, PixelRange::Byte)
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let scale = match self.range {
            PixelRange::Unit => 255.0,
            PixelRange::Byte => 1.0,
        };
        let side = self.side() as u32;
        let bytes: Vec<u8> = self
            .tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| (v * scale).round().clamp(0.0, 255.0) as u8)
            .collect();
        RgbImage::from_raw(side, side, bytes).ok_or_else(|| {
            MorphError::InvalidSettings("pixel buffer does not match image side".to_string())
        })
    }

    /// Decode a photo and bring it to `side` x `side` in byte range.
    pub fn load_target(path: impl AsRef<Path>, side: usize, device: &Device) -> Result<Self> {
        let mut img = image::open(path.as_ref())?.to_rgb8();
        if img.width() as usize != side || img.height() as usize != side {
            img = image::imageops::resize(&img, side as u32, side as u32, FilterType::Triangle);
        }
        Self::from_rgb_image(&img, device)
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        self.to_rgb_image()?.save(path.as_ref())?;
        Ok(())
    }
}

/// Block-replicate an (H, W, C) tensor by an integer factor along both
/// spatial axes. Built from broadcasts and reshapes so it stays inside the
/// autograd graph during projection.
pub fn enlarge(image: &Tensor, factor: usize) -> Result<Tensor> {
    if factor == 0 {
        return Err(MorphError::InvalidSettings(
            "enlarge factor must be at least 1".to_string(),
        ));
    }
    if factor == 1 {
        return Ok(image.clone());
    }
    let (h, w, c) = image.dims3()?;
    // Repeat every pixel along the width...
    let wide = image
        .unsqueeze(2)?
        .broadcast_as((h, w, factor, c))?
        .contiguous()?
        .reshape((h, w * factor, c))?;
    // ...then every row along the height.
    let tall = wide
        .unsqueeze(1)?
        .broadcast_as((h, factor, w * factor, c))?
        .contiguous()?
        .reshape((h * factor, w * factor, c))?;
    Ok(tall)
}

/// Nearest-neighbour upsampling for (N, C, H, W) feature maps.
pub fn repeat_spatial(x: &Tensor, factor: usize) -> candle_core::Result<Tensor> {
    if factor == 1 {
        return Ok(x.clone());
    }
    let (n, c, h, w) = x.dims4()?;
    let wide = x
        .unsqueeze(4)?
        .broadcast_as((n, c, h, w, factor))?
        .contiguous()?
        .reshape((n, c, h, w * factor))?;
    wide.unsqueeze(3)?
        .broadcast_as((n, c, h, factor, w * factor))?
        .contiguous()?
        .reshape((n, c, h * factor, w * factor))
}

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{CallistoError, Result};

/// A single image frame with one or more channel planes.
/// Pixel values are f32 in [0.0, 1.0], row-major, shape = (height, width).
#[derive(Clone, Debug)]
pub struct Frame {
    /// One plane per layer (1 for mono/raw mosaic, 3 for color).
    pub planes: Vec<Array2<f32>>,
    /// Original bit depth before conversion (8 or 16)
    pub original_bit_depth: u8,
    /// Optional per-frame metadata
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(planes: Vec<Array2<f32>>, bit_depth: u8) -> Self {
        Self {
            planes,
            original_bit_depth: bit_depth,
            metadata: FrameMetadata::default(),
        }
    }

    pub fn width(&self) -> usize {
        self.planes.first().map_or(0, |p| p.ncols())
    }

    pub fn height(&self) -> usize {
        self.planes.first().map_or(0, |p| p.nrows())
    }

    pub fn layer_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, layer: usize) -> Result<&Array2<f32>> {
        self.planes
            .get(layer)
            .ok_or(CallistoError::LayerOutOfRange {
                layer,
                layers: self.planes.len(),
            })
    }

    /// Extract a copy of `region` from one plane.
    pub fn crop(&self, layer: usize, region: &Region) -> Result<Array2<f32>> {
        let plane = self.plane(layer)?;
        let valid = region.validated(plane.ncols() as u32, plane.nrows() as u32)?;
        let (x, y) = (valid.x as usize, valid.y as usize);
        let (w, h) = (valid.width as usize, valid.height as usize);
        Ok(plane.slice(s![y..y + h, x..x + w]).to_owned())
    }
}

#[derive(Clone, Debug, Default)]
pub struct FrameMetadata {
    pub frame_index: usize,
    pub timestamp_us: Option<u64>,
}

/// A rectangular pixel window in image coordinates, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Check the region against source dimensions.
    pub fn validated(&self, src_w: u32, src_h: u32) -> Result<Region> {
        if self.width == 0
            || self.height == 0
            || self.x.saturating_add(self.width) > src_w
            || self.y.saturating_add(self.height) > src_h
        {
            return Err(CallistoError::RegionOutOfBounds {
                x: self.x,
                y: self.y,
                width: self.width,
                height: self.height,
                frame_width: src_w,
                frame_height: src_h,
            });
        }
        Ok(*self)
    }
}

/// Color/Bayer mode of the source data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColorMode {
    Mono,
    BayerRGGB,
    BayerGRBG,
    BayerGBRG,
    BayerBGGR,
    RGB,
    BGR,
}

impl ColorMode {
    pub fn is_bayer(&self) -> bool {
        matches!(
            self,
            ColorMode::BayerRGGB | ColorMode::BayerGRBG | ColorMode::BayerGBRG | ColorMode::BayerBGGR
        )
    }
}

/// Index entry for one frame of a sequence: which file (or in-container
/// number) it is, whether it is selected for processing, and when it was
/// captured if the source records that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameEntry {
    pub filenum: i32,
    pub included: bool,
    pub timestamp_us: Option<u64>,
}

impl FrameEntry {
    pub fn new(filenum: i32) -> Self {
        Self {
            filenum,
            included: true,
            timestamp_us: None,
        }
    }
}

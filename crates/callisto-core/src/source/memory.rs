use std::sync::Arc;

use ndarray::Array2;

use crate::error::{CallistoError, Result};
use crate::frame::{Frame, Region};

/// A sequence composed from frames already resident in memory.
///
/// Reads hand out clones of the shared `Arc`s, never pixel copies, so
/// callers must not assume exclusive mutation rights. A composite backing a
/// single editable image sets `preserve_on_close` so closing the sequence
/// leaves the owner's frames (and their edit history) untouched.
pub struct MemorySource {
    frames: Vec<Arc<Frame>>,
    width: u32,
    height: u32,
    layers: usize,
    bit_depth: u8,
    pub preserve_on_close: bool,
}

impl MemorySource {
    pub fn new(frames: Vec<Arc<Frame>>, preserve_on_close: bool) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| CallistoError::Inconsistent("empty frame list".into()))?;
        let width = first.width() as u32;
        let height = first.height() as u32;
        let layers = first.layer_count();
        let bit_depth = first.original_bit_depth;

        for (i, frame) in frames.iter().enumerate() {
            if frame.width() as u32 != width
                || frame.height() as u32 != height
                || frame.layer_count() != layers
            {
                return Err(CallistoError::Inconsistent(format!(
                    "frame {i} is {}x{}x{}, composite is {}x{}x{}",
                    frame.width(),
                    frame.height(),
                    frame.layer_count(),
                    width,
                    height,
                    layers
                )));
            }
        }

        Ok(Self {
            frames,
            width,
            height,
            layers,
            bit_depth,
            preserve_on_close,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn layer_count(&self) -> usize {
        self.layers
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn read_frame(&self, index: usize) -> Result<Arc<Frame>> {
        self.frames
            .get(index)
            .cloned()
            .ok_or(CallistoError::FrameIndexOutOfRange {
                index,
                total: self.frames.len(),
            })
    }

    pub fn read_region(&self, layer: usize, index: usize, region: &Region) -> Result<Array2<f32>> {
        let frame = self.read_frame(index)?;
        frame.crop(layer, region)
    }
}

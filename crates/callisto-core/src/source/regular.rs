use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use ndarray::Array2;

use crate::error::{CallistoError, Result};
use crate::frame::{Frame, FrameMetadata, Region};

/// One image file per frame, named `{basename}{zero-padded filenum}.{ext}`.
///
/// Decoding goes through the `image` crate; since its decoders expose no
/// windowed path, `read_region` decodes the frame and crops.
pub struct RegularSource {
    directory: PathBuf,
    basename: String,
    ext: String,
    fixed_len: usize,
    filenums: Vec<i32>,
    width: u32,
    height: u32,
    layers: usize,
    bit_depth: u8,
}

impl RegularSource {
    /// Open a file-per-frame sequence; probes the first frame for
    /// dimensions, layer count and bit depth.
    pub fn open(
        directory: &Path,
        basename: &str,
        ext: &str,
        fixed_len: usize,
        filenums: Vec<i32>,
    ) -> Result<Self> {
        let mut source = Self {
            directory: directory.to_path_buf(),
            basename: basename.to_string(),
            ext: ext.to_string(),
            fixed_len: fixed_len.max(1),
            filenums,
            width: 0,
            height: 0,
            layers: 0,
            bit_depth: 0,
        };
        let first = *source
            .filenums
            .first()
            .ok_or_else(|| CallistoError::Inconsistent("empty frame list".into()))?;
        let path = source.frame_path(first);
        if !path.exists() {
            return Err(CallistoError::NotFound(path));
        }
        let (planes, depth) = decode_planes(image::open(&path)?);
        source.width = planes[0].ncols() as u32;
        source.height = planes[0].nrows() as u32;
        source.layers = planes.len();
        source.bit_depth = depth;
        Ok(source)
    }

    pub fn frame_count(&self) -> usize {
        self.filenums.len()
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

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn extension(&self) -> &str {
        &self.ext
    }

    /// Path of the file holding `filenum`.
    pub fn frame_path(&self, filenum: i32) -> PathBuf {
        self.directory.join(format!(
            "{}{:0width$}.{}",
            self.basename,
            filenum,
            self.ext,
            width = self.fixed_len
        ))
    }

    fn filenum(&self, index: usize) -> Result<i32> {
        self.filenums
            .get(index)
            .copied()
            .ok_or(CallistoError::FrameIndexOutOfRange {
                index,
                total: self.filenums.len(),
            })
    }

    pub fn read_frame(&self, index: usize) -> Result<Arc<Frame>> {
        let filenum = self.filenum(index)?;
        let path = self.frame_path(filenum);
        if !path.exists() {
            return Err(CallistoError::NotFound(path));
        }
        let (planes, depth) = decode_planes(image::open(&path)?);
        if planes[0].ncols() as u32 != self.width || planes[0].nrows() as u32 != self.height {
            return Err(CallistoError::Inconsistent(format!(
                "{} is {}x{}, sequence is {}x{}",
                path.display(),
                planes[0].ncols(),
                planes[0].nrows(),
                self.width,
                self.height
            )));
        }
        if planes.len() != self.layers {
            return Err(CallistoError::Inconsistent(format!(
                "{} has {} layers, sequence has {}",
                path.display(),
                planes.len(),
                self.layers
            )));
        }

        let mut frame = Frame::new(planes, depth);
        frame.metadata = FrameMetadata {
            frame_index: index,
            timestamp_us: None,
        };
        Ok(Arc::new(frame))
    }

    pub fn read_region(&self, layer: usize, index: usize, region: &Region) -> Result<Array2<f32>> {
        let frame = self.read_frame(index)?;
        frame.crop(layer, region)
    }
}

/// Convert a decoded image into f32 planes in [0.0, 1.0].
/// Grayscale stays single-plane; everything else goes through RGB16.
fn decode_planes(img: DynamicImage) -> (Vec<Array2<f32>>, u8) {
    match img {
        DynamicImage::ImageLuma8(gray) => {
            let (w, h) = gray.dimensions();
            let plane = Array2::from_shape_fn((h as usize, w as usize), |(r, c)| {
                gray.get_pixel(c as u32, r as u32).0[0] as f32 / 255.0
            });
            (vec![plane], 8)
        }
        DynamicImage::ImageLuma16(gray) => {
            let (w, h) = gray.dimensions();
            let plane = Array2::from_shape_fn((h as usize, w as usize), |(r, c)| {
                gray.get_pixel(c as u32, r as u32).0[0] as f32 / 65535.0
            });
            (vec![plane], 16)
        }
        other => {
            let rgb = other.to_rgb16();
            let (w, h) = rgb.dimensions();
            let planes = (0..3)
                .map(|ch| {
                    Array2::from_shape_fn((h as usize, w as usize), |(r, c)| {
                        rgb.get_pixel(c as u32, r as u32).0[ch] as f32 / 65535.0
                    })
                })
                .collect();
            (planes, 16)
        }
    }
}

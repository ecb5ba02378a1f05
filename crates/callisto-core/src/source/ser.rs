use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use ndarray::Array2;

use crate::cfa::demosaic_bilinear;
use crate::error::{CallistoError, Result};
use crate::frame::{ColorMode, Frame, FrameMetadata, Region};

pub const SER_HEADER_SIZE: usize = 178;
pub const SER_MAGIC: &[u8; 14] = b"LUCAM-RECORDER";

/// SER file header (178 bytes).
#[derive(Clone, Debug)]
pub struct SerHeader {
    pub color_id: i32,
    pub little_endian: bool,
    pub width: u32,
    pub height: u32,
    pub pixel_depth: u32,
    pub frame_count: u32,
    pub observer: String,
    pub instrument: String,
    pub telescope: String,
    pub date_time: u64,
    pub date_time_utc: u64,
}

impl SerHeader {
    /// Bytes per pixel plane (1 for 8-bit, 2 for 9-16 bit).
    pub fn bytes_per_pixel_plane(&self) -> usize {
        if self.pixel_depth <= 8 {
            1
        } else {
            2
        }
    }

    /// Number of planes per pixel (1 for mono/bayer, 3 for RGB/BGR).
    pub fn planes_per_pixel(&self) -> usize {
        match self.color_id {
            100 | 101 => 3,
            _ => 1,
        }
    }

    /// Total bytes per frame.
    pub fn frame_byte_size(&self) -> usize {
        let pixels = (self.width as usize)
            .checked_mul(self.height as usize)
            .expect("Image dimensions too large");
        let bytes_per_pixel = self.bytes_per_pixel_plane() * self.planes_per_pixel();
        pixels
            .checked_mul(bytes_per_pixel)
            .expect("Frame size calculation overflow")
    }

    pub fn color_mode(&self) -> ColorMode {
        match self.color_id {
            0 => ColorMode::Mono,
            8 => ColorMode::BayerRGGB,
            9 => ColorMode::BayerGRBG,
            10 => ColorMode::BayerGBRG,
            11 => ColorMode::BayerBGGR,
            100 => ColorMode::RGB,
            101 => ColorMode::BGR,
            _ => ColorMode::Mono,
        }
    }
}

/// Memory-mapped SER container.
///
/// A Bayer-mosaiced container is exposed either as a single raw layer
/// (demosaic off) or as three demosaiced color layers (demosaic on); the
/// sequence layer above records which domain its caches belong to.
pub struct SerContainer {
    mmap: Mmap,
    pub header: SerHeader,
    demosaic: bool,
}

impl SerContainer {
    /// Open a SER file and parse its header.
    pub fn open(path: &Path, demosaic: bool) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < SER_HEADER_SIZE {
            return Err(CallistoError::InvalidSer(
                "File too small for SER header".into(),
            ));
        }

        if &mmap[0..14] != SER_MAGIC {
            return Err(CallistoError::InvalidSer(
                "Missing LUCAM-RECORDER magic".into(),
            ));
        }

        let header = parse_header(&mmap[..SER_HEADER_SIZE])?;

        let expected_data_size =
            SER_HEADER_SIZE + header.frame_byte_size() * header.frame_count as usize;
        if mmap.len() < expected_data_size {
            return Err(CallistoError::InvalidSer(format!(
                "File truncated: expected at least {} bytes, got {}",
                expected_data_size,
                mmap.len()
            )));
        }

        Ok(Self {
            mmap,
            header,
            demosaic,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.header.frame_count as usize
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.header.width, self.header.height)
    }

    pub fn bit_depth(&self) -> u8 {
        self.header.pixel_depth as u8
    }

    pub fn is_cfa(&self) -> bool {
        self.header.color_mode().is_bayer()
    }

    /// Whether Bayer data is currently exposed as demosaiced color layers.
    pub fn demosaic_enabled(&self) -> bool {
        self.demosaic && self.is_cfa()
    }

    /// Switch between raw-mosaic and demosaiced exposure of a CFA container.
    /// Has no effect on mono or true-color containers.
    pub fn set_demosaic(&mut self, enable: bool) {
        self.demosaic = enable;
    }

    /// Layers exposed to callers: 1 for mono or raw mosaic, 3 for color.
    pub fn layer_count(&self) -> usize {
        match self.header.color_mode() {
            ColorMode::Mono => 1,
            ColorMode::RGB | ColorMode::BGR => 3,
            _ => {
                if self.demosaic {
                    3
                } else {
                    1
                }
            }
        }
    }

    /// Get the raw bytes for a single frame (zero-copy from mmap).
    pub fn frame_raw(&self, index: usize) -> Result<&[u8]> {
        let count = self.frame_count();
        if index >= count {
            return Err(CallistoError::FrameIndexOutOfRange {
                index,
                total: count,
            });
        }
        let offset = SER_HEADER_SIZE + index * self.header.frame_byte_size();
        let end = offset + self.header.frame_byte_size();
        Ok(&self.mmap[offset..end])
    }

    /// Read a full frame, converting to f32 planes in [0.0, 1.0].
    pub fn read_frame(&self, index: usize) -> Result<Arc<Frame>> {
        let raw = self.frame_raw(index)?;
        let (w, h) = (self.header.width, self.header.height);
        let full = Region::new(0, 0, w, h);
        let mode = self.header.color_mode();

        let planes = match mode {
            ColorMode::RGB | ColorMode::BGR => {
                let order: [usize; 3] = if mode == ColorMode::RGB {
                    [0, 1, 2]
                } else {
                    [2, 1, 0]
                };
                order
                    .iter()
                    .map(|&p| self.decode_window(raw, p, &full))
                    .collect()
            }
            _ => {
                let mosaic = self.decode_window(raw, 0, &full);
                if self.demosaic_enabled() {
                    match demosaic_bilinear(&mosaic, &mode) {
                        Some(rgb) => rgb.into_iter().collect(),
                        None => vec![mosaic],
                    }
                } else {
                    vec![mosaic]
                }
            }
        };

        let mut frame = Frame::new(planes, self.effective_bit_depth());
        frame.metadata = FrameMetadata {
            frame_index: index,
            timestamp_us: self.timestamp(index),
        };
        Ok(Arc::new(frame))
    }

    /// Read a pixel window of one layer.
    ///
    /// Mono, raw-mosaic and interleaved color data are read as row windows
    /// straight from the map; demosaiced CFA layers need the neighbourhood,
    /// so they fall back to a full decode followed by a crop.
    pub fn read_region(&self, layer: usize, index: usize, region: &Region) -> Result<Array2<f32>> {
        let layers = self.layer_count();
        if layer >= layers {
            return Err(CallistoError::LayerOutOfRange { layer, layers });
        }
        let valid = region.validated(self.header.width, self.header.height)?;

        let mode = self.header.color_mode();
        match mode {
            ColorMode::RGB | ColorMode::BGR => {
                let plane = if mode == ColorMode::BGR { 2 - layer } else { layer };
                let raw = self.frame_raw(index)?;
                Ok(self.decode_window(raw, plane, &valid))
            }
            _ if !self.demosaic_enabled() => {
                let raw = self.frame_raw(index)?;
                Ok(self.decode_window(raw, 0, &valid))
            }
            _ => {
                let frame = self.read_frame(index)?;
                frame.crop(layer, &valid)
            }
        }
    }

    /// Decode one plane of `region` from a frame's raw bytes.
    fn decode_window(&self, raw: &[u8], plane_index: usize, region: &Region) -> Array2<f32> {
        let frame_w = self.header.width as usize;
        let bps = self.header.bytes_per_pixel_plane();
        let planes = self.header.planes_per_pixel();
        let max_val = ((1u32 << self.header.pixel_depth) - 1) as f32;
        let le = self.header.little_endian;

        let (x0, y0) = (region.x as usize, region.y as usize);
        let (w, h) = (region.width as usize, region.height as usize);
        let mut data = Array2::<f32>::zeros((h, w));

        for row in 0..h {
            let src_row = y0 + row;
            for col in 0..w {
                let pixel = src_row * frame_w + x0 + col;
                let idx = pixel * planes * bps + plane_index * bps;
                let val = if bps == 1 {
                    raw[idx] as f32
                } else {
                    let pair = [raw[idx], raw[idx + 1]];
                    if le {
                        u16::from_le_bytes(pair) as f32
                    } else {
                        u16::from_be_bytes(pair) as f32
                    }
                };
                data[[row, col]] = val / max_val;
            }
        }

        data
    }

    /// Read a per-frame timestamp from the optional trailer.
    pub fn timestamp(&self, index: usize) -> Option<u64> {
        let trailer_offset =
            SER_HEADER_SIZE + self.header.frame_byte_size() * self.header.frame_count as usize;
        let ts_offset = trailer_offset + index * 8;
        if ts_offset + 8 <= self.mmap.len() {
            let bytes = &self.mmap[ts_offset..ts_offset + 8];
            Some(u64::from_le_bytes(bytes.try_into().ok()?))
        } else {
            None
        }
    }

    /// Bit depth after conversion to planes (pixel depth capped at 16).
    fn effective_bit_depth(&self) -> u8 {
        self.header.pixel_depth.min(16) as u8
    }
}

fn parse_header(buf: &[u8]) -> Result<SerHeader> {
    let mut cursor = std::io::Cursor::new(&buf[14..]); // skip magic

    let _lu_id = cursor.read_i32::<LittleEndian>()?;
    let color_id = cursor.read_i32::<LittleEndian>()?;
    let le_flag = cursor.read_i32::<LittleEndian>()?;
    let width = cursor.read_i32::<LittleEndian>()? as u32;
    let height = cursor.read_i32::<LittleEndian>()? as u32;
    let pixel_depth = cursor.read_i32::<LittleEndian>()? as u32;
    let frame_count = cursor.read_i32::<LittleEndian>()? as u32;

    let observer = read_fixed_string(&buf[42..82]);
    let instrument = read_fixed_string(&buf[82..122]);
    let telescope = read_fixed_string(&buf[122..162]);

    let mut cursor = std::io::Cursor::new(&buf[162..]);
    let date_time = cursor.read_u64::<LittleEndian>()?;
    let date_time_utc = cursor.read_u64::<LittleEndian>()?;

    if width == 0 || height == 0 {
        return Err(CallistoError::InvalidSer(format!(
            "invalid dimensions {width}x{height}"
        )));
    }
    if pixel_depth == 0 || pixel_depth > 16 {
        return Err(CallistoError::InvalidSer(format!(
            "unsupported pixel depth {pixel_depth}"
        )));
    }

    // SER spec: LittleEndian field = 0 means big-endian pixel data,
    // but many writers (including FireCapture) use 0 for little-endian.
    // Follow the established convention: treat 0 as little-endian.
    let little_endian = le_flag != 1;

    Ok(SerHeader {
        color_id,
        little_endian,
        width,
        height,
        pixel_depth,
        frame_count,
        observer,
        instrument,
        telescope,
        date_time,
        date_time_utc,
    })
}

fn read_fixed_string(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

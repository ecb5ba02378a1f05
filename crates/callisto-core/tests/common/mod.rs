use std::path::Path;

use callisto_core::source::ser::SER_HEADER_SIZE;

/// Build a SER file header with configurable bit depth and color mode.
///
/// `color_id`: 0=MONO, 8=BAYER_RGGB, 9=BAYER_GRBG, 10=BAYER_GBRG,
///             11=BAYER_BGGR, 100=RGB, 101=BGR
pub fn build_ser_header(
    width: u32,
    height: u32,
    bit_depth: u32,
    num_frames: usize,
    color_id: i32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SER_HEADER_SIZE);

    // Magic (14 bytes)
    buf.extend_from_slice(b"LUCAM-RECORDER");
    // LuID (4 bytes)
    buf.extend_from_slice(&0i32.to_le_bytes());
    // ColorID (4 bytes)
    buf.extend_from_slice(&color_id.to_le_bytes());
    // LittleEndian = 0 (little-endian by convention)
    buf.extend_from_slice(&0i32.to_le_bytes());
    // Width
    buf.extend_from_slice(&(width as i32).to_le_bytes());
    // Height
    buf.extend_from_slice(&(height as i32).to_le_bytes());
    // PixelDepth
    buf.extend_from_slice(&(bit_depth as i32).to_le_bytes());
    // FrameCount
    buf.extend_from_slice(&(num_frames as i32).to_le_bytes());
    // Observer (40 bytes)
    let mut observer = [0u8; 40];
    observer[..4].copy_from_slice(b"Test");
    buf.extend_from_slice(&observer);
    // Instrument (40 bytes)
    buf.extend_from_slice(&[0u8; 40]);
    // Telescope (40 bytes)
    buf.extend_from_slice(&[0u8; 40]);
    // DateTime (8 bytes)
    buf.extend_from_slice(&0u64.to_le_bytes());
    // DateTimeUTC (8 bytes)
    buf.extend_from_slice(&0u64.to_le_bytes());

    assert_eq!(buf.len(), SER_HEADER_SIZE);
    buf
}

/// Build a complete synthetic 8-bit SER file with the given frame data.
pub fn build_ser_with_frames(
    width: u32,
    height: u32,
    color_id: i32,
    frames: &[Vec<u8>],
) -> Vec<u8> {
    let mut buf = build_ser_header(width, height, 8, frames.len(), color_id);
    for frame in frames {
        buf.extend_from_slice(frame);
    }
    buf
}

/// Append a timestamp trailer (one u64-le per frame).
#[allow(dead_code)]
pub fn append_timestamps(buf: &mut Vec<u8>, timestamps: &[u64]) {
    for &ts in timestamps {
        buf.extend_from_slice(&ts.to_le_bytes());
    }
}

/// Write a synthetic mono SER file into `dir` and return its path.
pub fn write_ser_file(
    dir: &Path,
    name: &str,
    width: u32,
    height: u32,
    color_id: i32,
    frames: &[Vec<u8>],
) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, build_ser_with_frames(width, height, color_id, frames)).unwrap();
    path
}

/// Write a w x h 8-bit grayscale image file; pixel (r,c) = base + r*w + c.
#[allow(dead_code)]
pub fn write_gray_image(path: &Path, width: u32, height: u32, base: u8) {
    let img = image::GrayImage::from_fn(width, height, |x, y| {
        image::Luma([base.wrapping_add((y * width + x) as u8)])
    });
    img.save(path).unwrap();
}

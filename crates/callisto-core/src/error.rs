use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallistoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image format error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Frame index {index} out of range (total: {total})")]
    FrameIndexOutOfRange { index: usize, total: usize },

    #[error("Layer {layer} out of range (layers: {layers})")]
    LayerOutOfRange { layer: usize, layers: usize },

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid SER file: {0}")]
    InvalidSer(String),

    #[error("Invalid sequence file, line {line}: {reason}")]
    SeqFormat { line: usize, reason: String },

    #[error("Invalid film index: {0}")]
    InvalidFilmIndex(String),

    #[error("Region ({x},{y} {width}x{height}) exceeds frame dimensions {frame_width}x{frame_height}")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("Allocation failed: {0}")]
    OutOfMemory(String),

    #[error("Inconsistent frame: {0}")]
    Inconsistent(String),

    #[error("Sequence is not loaded")]
    NotLoaded,
}

pub type Result<T> = std::result::Result<T, CallistoError>;

//! Polymorphic frame and region readers over the four backing stores.

pub mod film;
pub mod memory;
pub mod regular;
pub mod ser;

use std::sync::Arc;

use ndarray::Array2;

use crate::error::Result;
use crate::frame::{Frame, Region};

pub use film::{FilmDecoder, FilmIndex, FilmSource};
pub use memory::MemorySource;
pub use regular::RegularSource;
pub use ser::{SerContainer, SerHeader};

/// Tag identifying the backing-store variant, persisted in the sequence
/// sidecar for the container kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Regular,
    Container,
    Film,
    Memory,
}

/// A frame store: one-file-per-frame images, a single SER-like container,
/// a compressed film, or already-resident frames.
pub enum FrameSource {
    Regular(RegularSource),
    Container(SerContainer),
    Film(FilmSource),
    Memory(MemorySource),
}

impl FrameSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            FrameSource::Regular(_) => SourceKind::Regular,
            FrameSource::Container(_) => SourceKind::Container,
            FrameSource::Film(_) => SourceKind::Film,
            FrameSource::Memory(_) => SourceKind::Memory,
        }
    }

    pub fn frame_count(&self) -> usize {
        match self {
            FrameSource::Regular(s) => s.frame_count(),
            FrameSource::Container(s) => s.frame_count(),
            FrameSource::Film(s) => s.frame_count(),
            FrameSource::Memory(s) => s.frame_count(),
        }
    }

    pub fn layer_count(&self) -> usize {
        match self {
            FrameSource::Regular(s) => s.layer_count(),
            FrameSource::Container(s) => s.layer_count(),
            FrameSource::Film(s) => s.layer_count(),
            FrameSource::Memory(s) => s.layer_count(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            FrameSource::Regular(s) => s.dimensions(),
            FrameSource::Container(s) => s.dimensions(),
            FrameSource::Film(s) => s.dimensions(),
            FrameSource::Memory(s) => s.dimensions(),
        }
    }

    pub fn bit_depth(&self) -> u8 {
        match self {
            FrameSource::Regular(s) => s.bit_depth(),
            FrameSource::Container(s) => s.bit_depth(),
            FrameSource::Film(s) => s.bit_depth(),
            FrameSource::Memory(s) => s.bit_depth(),
        }
    }

    pub fn read_frame(&self, index: usize) -> Result<Arc<Frame>> {
        match self {
            FrameSource::Regular(s) => s.read_frame(index),
            FrameSource::Container(s) => s.read_frame(index),
            FrameSource::Film(s) => s.read_frame(index),
            FrameSource::Memory(s) => s.read_frame(index),
        }
    }

    pub fn read_region(&self, layer: usize, index: usize, region: &Region) -> Result<Array2<f32>> {
        match self {
            FrameSource::Regular(s) => s.read_region(layer, index, region),
            FrameSource::Container(s) => s.read_region(layer, index, region),
            FrameSource::Film(s) => s.read_region(layer, index, region),
            FrameSource::Memory(s) => s.read_region(layer, index, region),
        }
    }

    /// Whether this store benefits from the per-frame lock table: only
    /// file-per-frame sources reuse open decoder handles across reads.
    pub fn needs_frame_locks(&self) -> bool {
        matches!(self, FrameSource::Regular(_))
    }

    /// Whether a CFA mosaic is currently exposed raw (single layer).
    pub fn cfa_opened_mono(&self) -> bool {
        match self {
            FrameSource::Container(s) => s.is_cfa() && !s.demosaic_enabled(),
            _ => false,
        }
    }

    /// Release decoder handles. Dropping the source afterwards releases the
    /// mapping/file descriptors themselves.
    pub fn close(&mut self) {
        if let FrameSource::Film(s) = self {
            s.close();
        }
    }
}

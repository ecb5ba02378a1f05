use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array2;
use tracing::{debug, warn};

use crate::consts::{FILM_INDEX_EXT, FILM_INDEX_MAGIC, FILM_INDEX_VERSION};
use crate::error::{CallistoError, Result};
use crate::frame::{Frame, Region};

/// Codec backend for a seekable compressed video container.
///
/// Implemented by an external decode library binding. Only full-frame
/// decode is available; callers crop after decoding. Random access relies
/// on a frame index (frame number to byte offset) that is expensive to
/// build, which is why `FilmSource` persists it next to the source file.
pub trait FilmDecoder: Send {
    fn frame_count(&self) -> usize;
    fn dimensions(&self) -> (u32, u32);
    fn layer_count(&self) -> usize;
    fn bit_depth(&self) -> u8;
    /// Scan the container and return one byte offset per frame.
    fn build_index(&mut self) -> Result<Vec<u64>>;
    /// Adopt a previously persisted index, skipping the scan.
    fn set_index(&mut self, offsets: &[u64]);
    fn read_frame(&mut self, index: usize) -> Result<Frame>;
    fn close(&mut self) {}
}

/// Persisted film frame index: magic, version, source file length (staleness
/// check), then one u64-le byte offset per frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilmIndex {
    pub source_len: u64,
    pub offsets: Vec<u64>,
}

impl FilmIndex {
    /// Sidecar path: the source path with `.fidx` appended.
    pub fn index_path(source: &Path) -> PathBuf {
        let mut os = source.as_os_str().to_os_string();
        os.push(".");
        os.push(FILM_INDEX_EXT);
        PathBuf::from(os)
    }

    pub fn load(path: &Path) -> Result<FilmIndex> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut magic)?;
        if &magic != FILM_INDEX_MAGIC {
            return Err(CallistoError::InvalidFilmIndex("bad magic".into()));
        }
        let version = reader.read_u16::<LittleEndian>()?;
        if version > FILM_INDEX_VERSION {
            return Err(CallistoError::InvalidFilmIndex(format!(
                "unsupported version {version}"
            )));
        }
        let source_len = reader.read_u64::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()? as usize;
        let mut offsets = Vec::new();
        offsets
            .try_reserve_exact(count)
            .map_err(|e| CallistoError::OutOfMemory(e.to_string()))?;
        for _ in 0..count {
            offsets.push(reader.read_u64::<LittleEndian>()?);
        }
        Ok(FilmIndex {
            source_len,
            offsets,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        std::io::Write::write_all(&mut writer, FILM_INDEX_MAGIC)?;
        writer.write_u16::<LittleEndian>(FILM_INDEX_VERSION)?;
        writer.write_u64::<LittleEndian>(self.source_len)?;
        writer.write_u32::<LittleEndian>(self.offsets.len() as u32)?;
        for &offset in &self.offsets {
            writer.write_u64::<LittleEndian>(offset)?;
        }
        std::io::Write::flush(&mut writer)?;
        Ok(())
    }
}

/// A video container behind a non-reentrant decoder. The decoder sits in a
/// mutex so concurrent readers serialize on the single decode handle.
pub struct FilmSource {
    path: PathBuf,
    decoder: Mutex<Box<dyn FilmDecoder>>,
    frame_count: usize,
    width: u32,
    height: u32,
    layers: usize,
    bit_depth: u8,
}

impl FilmSource {
    /// Open a film container, reusing the persisted frame index when it is
    /// present and matches the current source file, rebuilding it otherwise.
    pub fn open(path: &Path, mut decoder: Box<dyn FilmDecoder>) -> Result<Self> {
        let source_len = std::fs::metadata(path)?.len();
        let index_path = FilmIndex::index_path(path);

        let reused = match FilmIndex::load(&index_path) {
            Ok(index)
                if index.source_len == source_len
                    && index.offsets.len() == decoder.frame_count() =>
            {
                decoder.set_index(&index.offsets);
                debug!(path = %index_path.display(), "Reusing film frame index");
                true
            }
            Ok(_) => {
                debug!(path = %index_path.display(), "Stale film frame index, rebuilding");
                false
            }
            Err(_) => false,
        };

        if !reused {
            let offsets = decoder.build_index()?;
            decoder.set_index(&offsets);
            let index = FilmIndex {
                source_len,
                offsets,
            };
            if let Err(err) = index.save(&index_path) {
                warn!(path = %index_path.display(), %err, "Could not persist film frame index");
            }
        }

        let (width, height) = decoder.dimensions();
        Ok(Self {
            path: path.to_path_buf(),
            frame_count: decoder.frame_count(),
            width,
            height,
            layers: decoder.layer_count(),
            bit_depth: decoder.bit_depth(),
            decoder: Mutex::new(decoder),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
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
        if index >= self.frame_count {
            return Err(CallistoError::FrameIndexOutOfRange {
                index,
                total: self.frame_count,
            });
        }
        let mut decoder = self
            .decoder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut frame = decoder.read_frame(index)?;
        if frame.width() as u32 != self.width || frame.height() as u32 != self.height {
            return Err(CallistoError::Inconsistent(format!(
                "frame {index} is {}x{}, container is {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        frame.metadata.frame_index = index;
        Ok(Arc::new(frame))
    }

    /// Full decode then crop; film containers have no partial fast path.
    pub fn read_region(&self, layer: usize, index: usize, region: &Region) -> Result<Array2<f32>> {
        let frame = self.read_frame(index)?;
        frame.crop(layer, region)
    }

    pub fn close(&mut self) {
        self.decoder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .close();
    }
}

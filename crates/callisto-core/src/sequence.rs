//! The sequence composition root: a uniform, randomly addressable view over
//! a set of frames plus the cached per-frame metadata, persisted in a
//! sidecar index.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::cache::{PhotometryTable, RegRecord, RegistrationStore, StatisticsCache};
use crate::consts::STATS_BATCH_SIZE;
use crate::error::{CallistoError, Result};
use crate::frame::{Frame, FrameEntry, Region};
use crate::guard::{FrameLock, FrameLocks};
use crate::psf::{PsfFitter, PsfMeasurement};
use crate::seqfile::{read_seqfile, write_seqfile, ContainerKind, SeqIndex};
use crate::source::{FilmDecoder, FilmSource, FrameSource, MemorySource, RegularSource, SerContainer, SourceKind};
use crate::stats::{compute_statistics, StatsRecord};

/// Opens a film container with an external codec backend.
pub type FilmOpener = fn(&Path) -> Result<Box<dyn FilmDecoder>>;

/// Settings threaded into sequence loading; these replace any notion of a
/// process-global "current" configuration.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    /// Expose CFA containers as three demosaiced layers. This live setting
    /// decides which sidecar domain (raw `*` rows vs numeric rows) becomes
    /// primary on load.
    pub demosaic: bool,
    /// Extension used for one-file-per-frame sequences.
    pub image_ext: String,
    /// Codec backend for film containers, when available.
    pub film_opener: Option<FilmOpener>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            demosaic: true,
            image_ext: crate::consts::DEFAULT_IMAGE_EXT.to_string(),
            film_opener: None,
        }
    }
}

/// A loaded sequence of frames and its metadata caches.
pub struct Sequence {
    pub name: String,
    pub begin: i32,
    pub fixed_len: usize,
    entries: Vec<FrameEntry>,
    reference: Option<usize>,
    layer_count: usize,
    width: u32,
    height: u32,
    bit_depth: u8,
    source: Option<FrameSource>,
    reg: RegistrationStore,
    reg_bkp: RegistrationStore,
    stats: StatisticsCache,
    stats_bkp: StatisticsCache,
    photometry: PhotometryTable,
    pub upscale: f32,
    dirty: bool,
    /// True when a CFA container is currently exposed as its raw mosaic:
    /// the primary caches then hold raw-domain data and are written with
    /// the `*` tag.
    pub cfa_opened_mono: bool,
    seqfile_path: Option<PathBuf>,
    locks: FrameLocks,
}

impl Sequence {
    /// Assemble a sequence around an opened source. Used by the directory
    /// scan and by tests; `Sequence::load` is the sidecar path.
    pub fn from_source(
        name: impl Into<String>,
        begin: i32,
        fixed_len: usize,
        entries: Vec<FrameEntry>,
        source: FrameSource,
        seqfile_path: Option<PathBuf>,
    ) -> Result<Self> {
        let count = entries.len();
        if count == 0 {
            return Err(CallistoError::Inconsistent("empty sequence".into()));
        }
        if source.frame_count() < count {
            return Err(CallistoError::Inconsistent(format!(
                "source holds {} frames, index lists {}",
                source.frame_count(),
                count
            )));
        }
        let layer_count = source.layer_count();
        let (width, height) = source.dimensions();
        let cfa_opened_mono = source.cfa_opened_mono();
        let (bkp_layers, bit_depth) = (backup_layer_count(&source), source.bit_depth());

        Ok(Self {
            name: name.into(),
            begin,
            fixed_len: fixed_len.max(1),
            reference: None,
            layer_count,
            width,
            height,
            bit_depth,
            reg: RegistrationStore::new(layer_count, count),
            reg_bkp: RegistrationStore::new(bkp_layers, count),
            stats: StatisticsCache::new(layer_count, count),
            stats_bkp: StatisticsCache::new(bkp_layers, count),
            photometry: PhotometryTable::new(count),
            upscale: 1.0,
            dirty: true,
            cfa_opened_mono,
            seqfile_path,
            locks: FrameLocks::new(count),
            source: Some(source),
            entries,
        })
    }

    /// Build an in-memory composite from already-resident frames. It has no
    /// on-disk form; `preserve_on_close` keeps the shared frames addressable
    /// after `close` (the editable-image facet).
    pub fn from_frames(
        name: impl Into<String>,
        frames: Vec<Arc<Frame>>,
        preserve_on_close: bool,
    ) -> Result<Self> {
        let count = frames.len();
        let entries = (0..count).map(|i| FrameEntry::new(i as i32)).collect();
        let source = MemorySource::new(frames, preserve_on_close)?;
        let mut seq = Self::from_source(name, 0, 1, entries, FrameSource::Memory(source), None)?;
        seq.dirty = false;
        Ok(seq)
    }

    /// Load a sequence from its sidecar index, reopening the backing store
    /// and routing the cached arrays into the primary or backup (CFA)
    /// domain according to the live demosaic setting.
    pub fn load(seqfile_path: &Path, opts: &LoadOptions) -> Result<Self> {
        let index = read_seqfile(seqfile_path)?;
        let directory = seqfile_path.parent().unwrap_or_else(|| Path::new("."));

        let source = match index.container {
            ContainerKind::Ser => {
                let ser_path = seqfile_path.with_extension(crate::consts::SER_EXTENSION);
                if !ser_path.exists() {
                    return Err(CallistoError::NotFound(ser_path));
                }
                FrameSource::Container(SerContainer::open(&ser_path, opts.demosaic)?)
            }
            ContainerKind::Film => {
                let film_path = find_film_source(seqfile_path)?;
                let opener = opts.film_opener.ok_or_else(|| {
                    CallistoError::Inconsistent(format!(
                        "no film decoder registered for {}",
                        film_path.display()
                    ))
                })?;
                FrameSource::Film(FilmSource::open(&film_path, opener(&film_path)?)?)
            }
            ContainerKind::None => {
                let filenums = index.entries.iter().map(|e| e.filenum).collect();
                FrameSource::Regular(RegularSource::open(
                    directory,
                    &index.name,
                    &opts.image_ext,
                    index.fixed_len,
                    filenums,
                )?)
            }
        };

        if source.frame_count() < index.count {
            return Err(CallistoError::Inconsistent(format!(
                "source holds {} frames, sidecar lists {}",
                source.frame_count(),
                index.count
            )));
        }

        let count = index.count;
        let layer_count = source.layer_count();
        let cfa_opened_mono = source.cfa_opened_mono();
        let bkp_layers = backup_layer_count(&source);
        let (width, height) = source.dimensions();
        let bit_depth = source.bit_depth();

        // Route the two sidecar domains. The `*` rows are raw-mosaic data:
        // primary while the container is opened raw, backup otherwise.
        let SeqIndex {
            name,
            begin,
            fixed_len,
            reference,
            upscale,
            entries,
            reg_layers,
            reg_cfa,
            stats_layers,
            stats_cfa,
            ..
        } = index;

        let cfa_reg = vec![reg_cfa];
        let cfa_stats = vec![stats_cfa];
        let (reg, reg_bkp, stats, stats_bkp) = if cfa_opened_mono {
            (
                RegistrationStore::from_layers(count, cfa_reg),
                RegistrationStore::from_layers(count, sized(reg_layers, bkp_layers)),
                StatisticsCache::from_layers(count, cfa_stats),
                StatisticsCache::from_layers(count, sized(stats_layers, bkp_layers)),
            )
        } else {
            (
                RegistrationStore::from_layers(count, sized(reg_layers, layer_count)),
                RegistrationStore::from_layers(count, cfa_reg),
                StatisticsCache::from_layers(count, sized(stats_layers, layer_count)),
                StatisticsCache::from_layers(count, cfa_stats),
            )
        };

        info!(
            name = %name,
            frames = count,
            layers = layer_count,
            "Sequence loaded"
        );

        Ok(Self {
            name,
            begin,
            fixed_len: fixed_len.max(1),
            reference,
            layer_count,
            width,
            height,
            bit_depth,
            reg,
            reg_bkp,
            stats,
            stats_bkp,
            photometry: PhotometryTable::new(count),
            upscale,
            dirty: false,
            cfa_opened_mono,
            seqfile_path: Some(seqfile_path.to_path_buf()),
            locks: FrameLocks::new(count),
            source: Some(source),
            entries,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_loaded(&self) -> bool {
        self.source.is_some()
    }

    pub fn frame_count(&self) -> usize {
        self.entries.len()
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn entries(&self) -> &[FrameEntry] {
        &self.entries
    }

    pub fn selected_count(&self) -> usize {
        self.entries.iter().filter(|e| e.included).count()
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        self.source.as_ref().map(|s| s.kind())
    }

    pub fn seqfile_path(&self) -> Option<&Path> {
        self.seqfile_path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn source(&self) -> Result<&FrameSource> {
        self.source.as_ref().ok_or(CallistoError::NotLoaded)
    }

    // ------------------------------------------------------------------
    // Frame access
    // ------------------------------------------------------------------

    pub fn read_frame(&self, index: usize) -> Result<Arc<Frame>> {
        let total = self.entries.len();
        if index >= total {
            return Err(CallistoError::FrameIndexOutOfRange { index, total });
        }
        self.source()?.read_frame(index)
    }

    pub fn read_region(&self, layer: usize, index: usize, region: &Region) -> Result<Array2<f32>> {
        let total = self.entries.len();
        if index >= total {
            return Err(CallistoError::FrameIndexOutOfRange { index, total });
        }
        self.source()?.read_region(layer, index, region)
    }

    /// Bracket repeated partial reads of one frame. Returns `None` for
    /// stores whose read model needs no per-frame serialization.
    pub fn open_for_reuse(&self, index: usize) -> Result<Option<FrameLock<'_>>> {
        if self.source()?.needs_frame_locks() {
            Ok(Some(self.locks.open_for_reuse(index)?))
        } else {
            Ok(None)
        }
    }

    // ------------------------------------------------------------------
    // Inclusion and reference
    // ------------------------------------------------------------------

    pub fn set_included(&mut self, index: usize, included: bool) -> Result<()> {
        let total = self.entries.len();
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(CallistoError::FrameIndexOutOfRange { index, total })?;
        if entry.included != included {
            entry.included = included;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_reference(&mut self, index: Option<usize>) -> Result<()> {
        if let Some(i) = index {
            let total = self.entries.len();
            if i >= total {
                return Err(CallistoError::FrameIndexOutOfRange { index: i, total });
            }
        }
        if self.reference != index {
            self.reference = index;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn explicit_reference(&self) -> Option<usize> {
        self.reference
    }

    /// The reference frame: the explicit one if set, otherwise the best
    /// frame by registration metric (minimum FWHM where measured, maximum
    /// quality otherwise) over included frames, otherwise the first
    /// included frame, otherwise frame 0.
    pub fn reference_index(&self) -> usize {
        if let Some(reference) = self.reference {
            return reference;
        }
        let included: Vec<bool> = self.entries.iter().map(|e| e.included).collect();
        if let Some(best) = self.reg.best_frame(&included) {
            return best;
        }
        self.entries.iter().position(|e| e.included).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn registration(&self, layer: usize) -> Option<&[RegRecord]> {
        self.reg.layer(layer)
    }

    pub fn registration_backup(&self, layer: usize) -> Option<&[RegRecord]> {
        self.reg_bkp.layer(layer)
    }

    pub fn check_or_allocate_reg(&mut self, layer: usize) -> Result<()> {
        self.reg.check_or_allocate(layer)
    }

    pub fn set_shift(
        &mut self,
        layer: usize,
        frame: usize,
        dx: f32,
        dy: f32,
        top_down: bool,
    ) -> Result<()> {
        self.reg.set_shift(layer, frame, dx, dy, top_down)?;
        self.dirty = true;
        Ok(())
    }

    pub fn set_reg_record(&mut self, layer: usize, frame: usize, record: RegRecord) -> Result<()> {
        self.reg.set_record(layer, frame, record)?;
        self.dirty = true;
        Ok(())
    }

    /// Attach a fitted star measurement to a frame's registration record.
    /// The same `Arc` may also be stored in a photometry slot.
    pub fn set_reg_psf(
        &mut self,
        layer: usize,
        frame: usize,
        psf: Arc<PsfMeasurement>,
    ) -> Result<()> {
        self.reg.set_psf(layer, frame, psf)?;
        self.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Cached statistics for one frame of one layer, computing them on
    /// first access.
    pub fn statistics(&mut self, layer: usize, index: usize) -> Result<Arc<StatsRecord>> {
        if let Some(cached) = self.stats.get(layer, index) {
            return Ok(cached);
        }
        let frame = self.read_frame(index)?;
        let plane = frame.plane(layer)?;
        let record = Arc::new(compute_statistics(plane, None, self.bit_depth)?);
        self.stats.insert(layer, index, Arc::clone(&record))?;
        self.dirty = true;
        Ok(record)
    }

    pub fn cached_statistics(&self, layer: usize, index: usize) -> Option<Arc<StatsRecord>> {
        self.stats.get(layer, index)
    }

    /// Compute and cache statistics for every included frame of `layer`
    /// that has none yet. Frames are decoded in bounded batches and scored
    /// on the worker pool; results are folded into the cache only after
    /// each batch joins. The cancel flag is polled between batches; a
    /// cancelled run keeps whatever was already produced.
    ///
    /// Returns the number of frames computed.
    pub fn compute_statistics_batch(
        &mut self,
        layer: usize,
        cancel: &AtomicBool,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Result<usize> {
        let pending: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, e)| e.included && self.stats.get(layer, *i).is_none())
            .map(|(i, _)| i)
            .collect();
        let todo = pending.len();
        let mut done = 0usize;

        for batch in pending.chunks(STATS_BATCH_SIZE) {
            if cancel.load(Ordering::Relaxed) {
                info!(done, todo, "Statistics computation cancelled");
                break;
            }

            let source = self.source()?;
            let frames: Vec<(usize, Arc<Frame>)> = batch
                .iter()
                .map(|&i| Ok((i, source.read_frame(i)?)))
                .collect::<Result<_>>()?;

            let bit_depth = self.bit_depth;
            let computed: Vec<(usize, StatsRecord)> = frames
                .par_iter()
                .map(|(i, frame)| {
                    let plane = frame.plane(layer)?;
                    Ok((*i, compute_statistics(plane, None, bit_depth)?))
                })
                .collect::<Result<_>>()?;

            for (i, record) in computed {
                self.stats.insert(layer, i, Arc::new(record))?;
            }
            done += batch.len();
            if let Some(cb) = progress.as_deref_mut() {
                cb(done, todo);
            }
        }

        if done > 0 {
            self.dirty = true;
        }
        Ok(done)
    }

    // ------------------------------------------------------------------
    // Photometry
    // ------------------------------------------------------------------

    pub fn photometry(&self) -> &PhotometryTable {
        &self.photometry
    }

    pub fn add_photometry_set(&mut self, name: impl Into<String>) -> usize {
        self.photometry.push(name)
    }

    pub fn set_photometry_measurement(
        &mut self,
        slot: usize,
        frame: usize,
        m: Arc<PsfMeasurement>,
    ) -> Result<()> {
        let set = self
            .photometry
            .get_mut(slot)
            .ok_or_else(|| CallistoError::Inconsistent(format!("photometry slot {slot} unused")))?;
        set.set(frame, m)
    }

    /// Fit a star inside `region` of one frame and record the measurement
    /// in the frame's registration record — and, when a slot is given, in
    /// the photometry table. Both ends hold the same `Arc`.
    pub fn measure_star(
        &mut self,
        layer: usize,
        frame: usize,
        region: &Region,
        fitter: &dyn PsfFitter,
        photometry_slot: Option<usize>,
    ) -> Result<Arc<PsfMeasurement>> {
        let data = self.read_frame(frame)?;
        let plane = data.plane(layer)?;
        let measurement = Arc::new(fitter.fit(plane, region)?);
        self.reg.set_psf(layer, frame, Arc::clone(&measurement))?;
        if let Some(slot) = photometry_slot {
            self.set_photometry_measurement(slot, frame, Arc::clone(&measurement))?;
        }
        self.dirty = true;
        Ok(measurement)
    }

    // ------------------------------------------------------------------
    // CFA domain
    // ------------------------------------------------------------------

    /// Toggle demosaiced exposure of a CFA container. The primary and
    /// backup cache domains swap so neither representation is discarded.
    /// No-op for non-CFA sources.
    pub fn set_demosaic(&mut self, enable: bool) -> Result<()> {
        let Some(FrameSource::Container(ser)) = self.source.as_mut() else {
            return Ok(());
        };
        if !ser.is_cfa() || ser.demosaic_enabled() == enable {
            return Ok(());
        }
        ser.set_demosaic(enable);
        std::mem::swap(&mut self.reg, &mut self.reg_bkp);
        std::mem::swap(&mut self.stats, &mut self.stats_bkp);
        self.layer_count = ser.layer_count();
        self.cfa_opened_mono = !enable;
        self.dirty = true;
        info!(
            name = %self.name,
            demosaic = enable,
            "CFA domain switched; previous measurements kept as backup"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Persistence and lifecycle
    // ------------------------------------------------------------------

    /// Snapshot the sequence into sidecar terms: the currently primary CFA
    /// domain goes to the `*` rows when the container is opened raw.
    pub fn to_index(&self) -> SeqIndex {
        let count = self.entries.len();
        let container = match self.source_kind() {
            Some(SourceKind::Container) => ContainerKind::Ser,
            Some(SourceKind::Film) => ContainerKind::Film,
            _ => ContainerKind::None,
        };

        let clone_reg = |store: &RegistrationStore| -> Vec<Option<Vec<RegRecord>>> {
            (0..store.layer_count())
                .map(|l| store.layer(l).map(|r| r.to_vec()))
                .collect()
        };
        let clone_stats = |cache: &StatisticsCache| -> Vec<Option<Vec<Option<Arc<StatsRecord>>>>> {
            (0..cache.layer_count())
                .map(|l| {
                    if !cache.has_data(l) {
                        return None;
                    }
                    let mut entries = vec![None; count];
                    for (i, record) in cache.layer_entries(l) {
                        entries[i] = Some(Arc::clone(record));
                    }
                    Some(entries)
                })
                .collect()
        };

        // Numeric rows always carry the demosaiced-domain arrays, `*` rows
        // the raw-mosaic ones; which of the two is primary right now
        // depends on how the container is opened.
        let (reg_layers, reg_cfa, stats_layers, stats_cfa, file_layers) = if self.cfa_opened_mono {
            (
                clone_reg(&self.reg_bkp),
                self.reg.layer(0).map(|r| r.to_vec()),
                clone_stats(&self.stats_bkp),
                clone_stats(&self.stats).into_iter().next().flatten(),
                self.reg_bkp.layer_count(),
            )
        } else {
            (
                clone_reg(&self.reg),
                self.reg_bkp.layer(0).map(|r| r.to_vec()),
                clone_stats(&self.stats),
                clone_stats(&self.stats_bkp).into_iter().next().flatten(),
                self.layer_count,
            )
        };

        SeqIndex {
            name: self.name.clone(),
            begin: self.begin,
            count,
            fixed_len: self.fixed_len,
            reference: self.reference,
            version: crate::consts::SEQFILE_VERSION,
            layer_count: file_layers.max(1),
            upscale: self.upscale,
            container,
            entries: self.entries.clone(),
            reg_layers,
            reg_cfa,
            stats_layers,
            stats_cfa,
        }
    }

    /// Write the sidecar if anything changed. In-memory composites have no
    /// sidecar and flush trivially.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.seqfile_path.clone() else {
            return Ok(());
        };
        write_seqfile(&path, &self.to_index())?;
        self.dirty = false;
        info!(path = %path.display(), "Sequence index written");
        Ok(())
    }

    /// Flush, release the backing store and drop all cache memory. An
    /// in-memory composite flagged `preserve_on_close` keeps its shared
    /// frames addressable (the editable image's history lives in them).
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;

        let preserve = match self.source.as_ref() {
            Some(FrameSource::Memory(m)) => m.preserve_on_close,
            _ => false,
        };

        self.reg.clear();
        self.reg_bkp.clear();
        self.stats.clear();
        self.stats_bkp.clear();
        self.photometry.clear();

        if preserve {
            return Ok(());
        }

        if let Some(mut source) = self.source.take() {
            source.close();
        }
        self.entries.clear();
        self.reference = None;
        self.layer_count = 0;
        self.width = 0;
        self.height = 0;
        self.dirty = false;
        Ok(())
    }
}

/// Layer count of the non-primary CFA domain: 3 demosaiced layers behind a
/// raw-opened mosaic, 1 raw layer behind demosaiced color, nothing for
/// stores without a second domain.
fn backup_layer_count(source: &FrameSource) -> usize {
    match source {
        FrameSource::Container(ser) if ser.is_cfa() => {
            if ser.demosaic_enabled() {
                1
            } else {
                3
            }
        }
        _ => 0,
    }
}

/// Pad (or trim) parsed layer arrays to the live layer count.
fn sized<T>(mut layers: Vec<Option<T>>, target: usize) -> Vec<Option<T>> {
    if layers.len() != target {
        if layers.iter().skip(target).any(|l| l.is_some()) {
            warn!(
                parsed = layers.len(),
                live = target,
                "Sidecar layer count differs from the opened source; extra layers dropped"
            );
        }
        layers.resize_with(target, || None);
    }
    layers
}

/// Locate the film container a sidecar points at, by trying the known
/// extensions next to it.
fn find_film_source(seqfile_path: &Path) -> Result<PathBuf> {
    for ext in crate::consts::FILM_EXTENSIONS {
        let candidate = seqfile_path.with_extension(ext);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(CallistoError::NotFound(
        seqfile_path.with_extension(crate::consts::FILM_EXTENSIONS[0]),
    ))
}

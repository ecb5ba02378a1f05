use std::sync::Arc;

use crate::consts::{QUALITY_UNSET, ROUNDNESS_UNSET};
use crate::error::{CallistoError, Result};
use crate::psf::PsfMeasurement;

/// Per-frame registration data for one layer: shift relative to the
/// reference frame plus the quality measures used to pick and weight
/// frames.
#[derive(Clone, Debug)]
pub struct RegRecord {
    pub shift_x: f32,
    pub shift_y: f32,
    /// Mean FWHM of the measured star, 0 when not measured.
    pub fwhm: f32,
    pub roundness: f32,
    pub quality: f64,
    /// The fitted measurement backing fwhm/roundness. Shared with
    /// photometry slot 0 when both track the same star; the refcount
    /// releases it exactly once.
    pub psf: Option<Arc<PsfMeasurement>>,
}

impl Default for RegRecord {
    fn default() -> Self {
        Self {
            shift_x: 0.0,
            shift_y: 0.0,
            fwhm: 0.0,
            roundness: ROUNDNESS_UNSET,
            quality: QUALITY_UNSET,
            psf: None,
        }
    }
}

impl RegRecord {
    /// Whether any producer has written this record.
    pub fn is_set(&self) -> bool {
        self.fwhm > 0.0
            || self.quality != QUALITY_UNSET
            || self.shift_x != 0.0
            || self.shift_y != 0.0
    }
}

/// Per-layer registration arrays, allocated lazily on first write.
pub struct RegistrationStore {
    frame_count: usize,
    layers: Vec<Option<Vec<RegRecord>>>,
}

impl RegistrationStore {
    pub fn new(layer_count: usize, frame_count: usize) -> Self {
        Self {
            frame_count,
            layers: (0..layer_count).map(|_| None).collect(),
        }
    }

    /// Rebuild a store from parsed layer arrays (sidecar load path).
    pub fn from_layers(frame_count: usize, layers: Vec<Option<Vec<RegRecord>>>) -> Self {
        Self {
            frame_count,
            layers,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Allocate the per-frame array of `layer` if it does not exist yet.
    /// Idempotent; a failed allocation leaves the store untouched.
    pub fn check_or_allocate(&mut self, layer: usize) -> Result<()> {
        let layers = self.layers.len();
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or(CallistoError::LayerOutOfRange { layer, layers })?;
        if slot.is_some() {
            return Ok(());
        }
        let mut records = Vec::new();
        records
            .try_reserve_exact(self.frame_count)
            .map_err(|e| CallistoError::OutOfMemory(e.to_string()))?;
        records.resize_with(self.frame_count, RegRecord::default);
        *slot = Some(records);
        Ok(())
    }

    pub fn has_data(&self, layer: usize) -> bool {
        matches!(self.layers.get(layer), Some(Some(_)))
    }

    pub fn layer(&self, layer: usize) -> Option<&[RegRecord]> {
        self.layers.get(layer)?.as_deref()
    }

    pub fn record(&self, layer: usize, frame: usize) -> Option<&RegRecord> {
        self.layer(layer)?.get(frame)
    }

    fn record_mut(&mut self, layer: usize, frame: usize) -> Result<&mut RegRecord> {
        self.check_or_allocate(layer)?;
        let total = self.frame_count;
        self.layers[layer]
            .as_mut()
            .and_then(|records| records.get_mut(frame))
            .ok_or(CallistoError::FrameIndexOutOfRange {
                index: frame,
                total,
            })
    }

    /// Store a frame's shift, normalizing the vertical sign to the on-disk
    /// bottom-up convention. Sources that address rows top-down pass
    /// `top_down = true` and get their dy negated.
    pub fn set_shift(
        &mut self,
        layer: usize,
        frame: usize,
        dx: f32,
        dy: f32,
        top_down: bool,
    ) -> Result<()> {
        let record = self.record_mut(layer, frame)?;
        record.shift_x = dx;
        record.shift_y = if top_down { -dy } else { dy };
        Ok(())
    }

    pub fn set_record(&mut self, layer: usize, frame: usize, value: RegRecord) -> Result<()> {
        *self.record_mut(layer, frame)? = value;
        Ok(())
    }

    /// Attach a fitted measurement, deriving fwhm/roundness from it. The
    /// same `Arc` may simultaneously sit in photometry slot 0.
    pub fn set_psf(
        &mut self,
        layer: usize,
        frame: usize,
        psf: Arc<PsfMeasurement>,
    ) -> Result<()> {
        let record = self.record_mut(layer, frame)?;
        record.fwhm = psf.fwhm();
        record.roundness = psf.roundness;
        record.psf = Some(psf);
        Ok(())
    }

    /// Best frame across all layers with registration data: minimum FWHM
    /// when the layer carries FWHM measurements, maximum quality otherwise.
    /// Only included frames compete. Returns `None` when no layer has data.
    pub fn best_frame(&self, included: &[bool]) -> Option<usize> {
        let mut best = None;
        for layer in 0..self.layers.len() {
            let Some(records) = self.layer(layer) else {
                continue;
            };
            let use_fwhm = records.iter().any(|r| r.fwhm > 0.0);
            let mut best_val = if use_fwhm { f64::MAX } else { f64::MIN };
            for (frame, record) in records.iter().enumerate() {
                if !included.get(frame).copied().unwrap_or(false) {
                    continue;
                }
                if use_fwhm {
                    if record.fwhm > 0.0 && (record.fwhm as f64) < best_val {
                        best_val = record.fwhm as f64;
                        best = Some(frame);
                    }
                } else if record.quality > best_val {
                    best_val = record.quality;
                    best = Some(frame);
                }
            }
        }
        best
    }

    pub fn clear(&mut self) {
        for slot in &mut self.layers {
            *slot = None;
        }
    }

    /// Consume the store, yielding its layer arrays (sidecar write path
    /// and CFA domain swaps).
    pub fn into_layers(self) -> Vec<Option<Vec<RegRecord>>> {
        self.layers
    }
}

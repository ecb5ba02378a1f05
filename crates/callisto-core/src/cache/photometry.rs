use std::sync::Arc;

use tracing::debug;

use crate::consts::PHOTOMETRY_SLOTS;
use crate::error::{CallistoError, Result};
use crate::psf::PsfMeasurement;

/// One star followed across the whole sequence: a name and one optional
/// measurement per frame.
pub struct PhotometrySet {
    pub name: String,
    records: Vec<Option<Arc<PsfMeasurement>>>,
}

impl PhotometrySet {
    fn new(name: String, frame_count: usize) -> Self {
        Self {
            name,
            records: vec![None; frame_count],
        }
    }

    pub fn get(&self, frame: usize) -> Option<&Arc<PsfMeasurement>> {
        self.records.get(frame)?.as_ref()
    }

    pub fn set(&mut self, frame: usize, m: Arc<PsfMeasurement>) -> Result<()> {
        let total = self.records.len();
        let slot = self
            .records
            .get_mut(frame)
            .ok_or(CallistoError::FrameIndexOutOfRange {
                index: frame,
                total,
            })?;
        *slot = Some(m);
        Ok(())
    }

    /// Number of frames with a measurement.
    pub fn measured_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }
}

/// Bounded list of photometry sets, oldest first. Inserting into a full
/// table evicts slot 0; measurements also referenced by a registration
/// record stay alive through their refcount, so the eviction never
/// invalidates a registration entry.
pub struct PhotometryTable {
    frame_count: usize,
    sets: Vec<PhotometrySet>,
}

impl PhotometryTable {
    pub fn new(frame_count: usize) -> Self {
        Self {
            frame_count,
            sets: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&PhotometrySet> {
        self.sets.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PhotometrySet> {
        self.sets.get_mut(slot)
    }

    pub fn sets(&self) -> &[PhotometrySet] {
        &self.sets
    }

    /// Append a new named set, evicting the oldest when the table is full.
    /// Returns the slot of the new set.
    pub fn push(&mut self, name: impl Into<String>) -> usize {
        if self.sets.len() == PHOTOMETRY_SLOTS {
            let evicted = self.sets.remove(0);
            debug!(name = %evicted.name, "Photometry table full, dropping oldest set");
        }
        self.sets
            .push(PhotometrySet::new(name.into(), self.frame_count));
        self.sets.len() - 1
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement() -> Arc<PsfMeasurement> {
        Arc::new(PsfMeasurement {
            amplitude: 1.0,
            background: 0.1,
            x: 5.0,
            y: 5.0,
            fwhm_x: 2.0,
            fwhm_y: 2.2,
            roundness: 0.9,
            magnitude: -3.0,
        })
    }

    #[test]
    fn push_evicts_oldest_when_full() {
        let mut table = PhotometryTable::new(3);
        for i in 0..PHOTOMETRY_SLOTS {
            table.push(format!("star{i}"));
        }
        assert_eq!(table.len(), PHOTOMETRY_SLOTS);

        table.push("newcomer");
        assert_eq!(table.len(), PHOTOMETRY_SLOTS);
        assert_eq!(table.get(0).unwrap().name, "star1");
        assert_eq!(
            table.get(PHOTOMETRY_SLOTS - 1).unwrap().name,
            "newcomer"
        );
    }

    #[test]
    fn aliased_measurement_survives_eviction() {
        let mut table = PhotometryTable::new(2);
        let shared = measurement();

        let slot = table.push("target");
        table
            .get_mut(slot)
            .unwrap()
            .set(0, Arc::clone(&shared))
            .unwrap();
        assert_eq!(Arc::strong_count(&shared), 2);

        // Fill the table past capacity; "target" gets evicted.
        for i in 0..PHOTOMETRY_SLOTS {
            table.push(format!("filler{i}"));
        }
        assert_eq!(Arc::strong_count(&shared), 1);
        assert!((shared.fwhm() - 2.1).abs() < 1e-6);
    }

    #[test]
    fn set_rejects_bad_frame() {
        let mut table = PhotometryTable::new(2);
        let slot = table.push("star");
        assert!(table.get_mut(slot).unwrap().set(2, measurement()).is_err());
    }
}

use std::sync::Arc;

use crate::error::{CallistoError, Result};
use crate::stats::StatsRecord;

/// Per-layer, per-frame statistics cache. Entries are `Arc`s so a record
/// can be handed to callers without copying and survives a cache clear for
/// as long as someone holds it.
pub struct StatisticsCache {
    frame_count: usize,
    layers: Vec<Option<Vec<Option<Arc<StatsRecord>>>>>,
}

impl StatisticsCache {
    pub fn new(layer_count: usize, frame_count: usize) -> Self {
        Self {
            frame_count,
            layers: (0..layer_count).map(|_| None).collect(),
        }
    }

    /// Rebuild a cache from parsed layer arrays (sidecar load path).
    pub fn from_layers(
        frame_count: usize,
        layers: Vec<Option<Vec<Option<Arc<StatsRecord>>>>>,
    ) -> Self {
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
    /// Idempotent; a failed allocation leaves the cache untouched.
    pub fn check_or_allocate(&mut self, layer: usize) -> Result<()> {
        let layers = self.layers.len();
        let slot = self
            .layers
            .get_mut(layer)
            .ok_or(CallistoError::LayerOutOfRange { layer, layers })?;
        if slot.is_some() {
            return Ok(());
        }
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(self.frame_count)
            .map_err(|e| CallistoError::OutOfMemory(e.to_string()))?;
        entries.resize(self.frame_count, None);
        *slot = Some(entries);
        Ok(())
    }

    pub fn has_data(&self, layer: usize) -> bool {
        matches!(self.layers.get(layer), Some(Some(_)))
    }

    pub fn get(&self, layer: usize, frame: usize) -> Option<Arc<StatsRecord>> {
        self.layers.get(layer)?.as_ref()?.get(frame)?.clone()
    }

    pub fn insert(
        &mut self,
        layer: usize,
        frame: usize,
        record: Arc<StatsRecord>,
    ) -> Result<()> {
        self.check_or_allocate(layer)?;
        let total = self.frame_count;
        let slot = self.layers[layer]
            .as_mut()
            .and_then(|entries| entries.get_mut(frame))
            .ok_or(CallistoError::FrameIndexOutOfRange {
                index: frame,
                total,
            })?;
        *slot = Some(record);
        Ok(())
    }

    /// All cached entries of one layer, with their frame indices.
    pub fn layer_entries(
        &self,
        layer: usize,
    ) -> impl Iterator<Item = (usize, &Arc<StatsRecord>)> + '_ {
        self.layers
            .get(layer)
            .and_then(|slot| slot.as_ref())
            .into_iter()
            .flat_map(|entries| {
                entries
                    .iter()
                    .enumerate()
                    .filter_map(|(i, e)| e.as_ref().map(|r| (i, r)))
            })
    }

    pub fn clear(&mut self) {
        for slot in &mut self.layers {
            *slot = None;
        }
    }

    /// Consume the cache, yielding its layer arrays (CFA domain swaps).
    pub fn into_layers(self) -> Vec<Option<Vec<Option<Arc<StatsRecord>>>>> {
        self.layers
    }
}

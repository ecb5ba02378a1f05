//! Per-layer, per-frame metadata caches: registration, statistics,
//! photometry.

pub mod photometry;
pub mod registration;
pub mod statistics;

pub use photometry::{PhotometrySet, PhotometryTable};
pub use registration::{RegRecord, RegistrationStore};
pub use statistics::StatisticsCache;

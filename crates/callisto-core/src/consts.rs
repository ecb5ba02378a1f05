/// Current sequence sidecar file format version.
///
/// Version history:
/// - 1: registration rows carry shift/fwhm/quality only
/// - 2: registration rows gain a roundness field
/// - 3: statistics rows, upscale factor, per-frame timestamps
pub const SEQFILE_VERSION: u32 = 3;

/// File extension of the persisted sequence index.
pub const SEQFILE_EXT: &str = "seq";

/// File extension of the persisted film frame index.
pub const FILM_INDEX_EXT: &str = "fidx";

/// Magic bytes at the start of a film frame index file.
pub const FILM_INDEX_MAGIC: &[u8; 4] = b"CFIX";

/// Film frame index binary format version.
pub const FILM_INDEX_VERSION: u16 = 1;

/// Maximum number of photometry measurement sets kept per sequence.
/// Inserting beyond this evicts the oldest set.
pub const PHOTOMETRY_SLOTS: usize = 7;

/// Roundness value meaning "not measured". Registration rows read from
/// pre-version-2 sequence files default to this.
pub const ROUNDNESS_UNSET: f32 = -1.0;

/// Quality value meaning "not measured".
pub const QUALITY_UNSET: f64 = -1.0;

/// Number of frames decoded simultaneously during batch statistics
/// computation. Bounds resident memory while keeping the worker pool fed.
pub const STATS_BATCH_SIZE: usize = 8;

/// Sigma multiplier for the iterated clipping used by the background
/// noise estimator.
pub const NOISE_CLIP_SIGMA: f64 = 3.0;

/// Maximum clipping iterations for the background noise estimator.
pub const NOISE_CLIP_MAX_ITER: usize = 5;

/// MAD multiplier bounding the biweight midvariance tuning window.
pub const BWMV_TUNING: f64 = 9.0;

/// Container file extension recognized by the directory scan.
pub const SER_EXTENSION: &str = "ser";

/// Film container extensions recognized by the directory scan.
pub const FILM_EXTENSIONS: &[&str] = &["avi", "mp4", "mov", "mkv"];

/// Default image extension for one-file-per-frame sequences.
pub const DEFAULT_IMAGE_EXT: &str = "tif";

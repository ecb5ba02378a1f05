//! Star-shape (PSF) measurements.
//!
//! A `PsfMeasurement` is the fitted model of one star: centroid, width along
//! both axes, roundness and magnitude. Measurements are handed around as
//! `Arc<PsfMeasurement>` because the same fit can be referenced by a
//! registration record and by photometry slot 0 simultaneously; the
//! refcount guarantees it is released exactly once.

use ndarray::Array2;

use crate::error::{CallistoError, Result};
use crate::frame::Region;

/// Gaussian sigma to full-width-at-half-maximum.
const FWHM_PER_SIGMA: f64 = 2.354_820_045;

/// One fitted star measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct PsfMeasurement {
    pub amplitude: f32,
    pub background: f32,
    /// Centroid in frame coordinates.
    pub x: f64,
    pub y: f64,
    pub fwhm_x: f32,
    pub fwhm_y: f32,
    /// Minor/major FWHM ratio in (0, 1], 1 = perfectly round.
    pub roundness: f32,
    pub magnitude: f32,
}

impl PsfMeasurement {
    /// Mean FWHM over both axes.
    pub fn fwhm(&self) -> f32 {
        0.5 * (self.fwhm_x + self.fwhm_y)
    }
}

/// A fitting engine producing `PsfMeasurement`s from a pixel window.
/// Real fitters (Gaussian, Moffat) are external collaborators; `MomentFit`
/// below is the built-in baseline.
pub trait PsfFitter: Send + Sync {
    fn fit(&self, plane: &Array2<f32>, region: &Region) -> Result<PsfMeasurement>;
}

/// Moment-based fit: background from the window border, centroid and
/// second moments from background-subtracted intensities.
#[derive(Clone, Copy, Debug, Default)]
pub struct MomentFit;

impl PsfFitter for MomentFit {
    fn fit(&self, plane: &Array2<f32>, region: &Region) -> Result<PsfMeasurement> {
        let valid = region.validated(plane.ncols() as u32, plane.nrows() as u32)?;
        let (x0, y0) = (valid.x as usize, valid.y as usize);
        let (w, h) = (valid.width as usize, valid.height as usize);
        if w < 3 || h < 3 {
            return Err(CallistoError::Inconsistent(format!(
                "PSF window {w}x{h} too small"
            )));
        }

        let window = plane.slice(ndarray::s![y0..y0 + h, x0..x0 + w]);

        // Background: mean of the window border.
        let mut bg_sum = 0.0f64;
        let mut bg_n = 0usize;
        for row in 0..h {
            for col in 0..w {
                if row == 0 || row == h - 1 || col == 0 || col == w - 1 {
                    bg_sum += window[[row, col]] as f64;
                    bg_n += 1;
                }
            }
        }
        let background = (bg_sum / bg_n as f64) as f32;

        // Intensity-weighted first and second moments above background.
        let mut sum_w = 0.0f64;
        let mut sum_r = 0.0f64;
        let mut sum_c = 0.0f64;
        let mut peak = 0.0f32;
        for row in 0..h {
            for col in 0..w {
                let v = window[[row, col]] - background;
                if v > 0.0 {
                    let weight = v as f64;
                    sum_w += weight;
                    sum_r += row as f64 * weight;
                    sum_c += col as f64 * weight;
                    if v > peak {
                        peak = v;
                    }
                }
            }
        }
        if sum_w <= 0.0 {
            return Err(CallistoError::Inconsistent(
                "no signal above background in PSF window".into(),
            ));
        }
        let cy = sum_r / sum_w;
        let cx = sum_c / sum_w;

        let mut var_r = 0.0f64;
        let mut var_c = 0.0f64;
        for row in 0..h {
            for col in 0..w {
                let v = window[[row, col]] - background;
                if v > 0.0 {
                    let weight = v as f64;
                    var_r += (row as f64 - cy) * (row as f64 - cy) * weight;
                    var_c += (col as f64 - cx) * (col as f64 - cx) * weight;
                }
            }
        }
        var_r /= sum_w;
        var_c /= sum_w;

        let fwhm_x = (FWHM_PER_SIGMA * var_c.sqrt()) as f32;
        let fwhm_y = (FWHM_PER_SIGMA * var_r.sqrt()) as f32;
        let (lo, hi) = if fwhm_x < fwhm_y {
            (fwhm_x, fwhm_y)
        } else {
            (fwhm_y, fwhm_x)
        };
        let roundness = if hi > 0.0 { lo / hi } else { 1.0 };

        // Instrumental magnitude from total background-subtracted flux.
        let magnitude = (-2.5 * sum_w.log10()) as f32;

        Ok(PsfMeasurement {
            amplitude: peak,
            background,
            x: x0 as f64 + cx,
            y: y0 as f64 + cy,
            fwhm_x,
            fwhm_y,
            roundness,
            magnitude,
        })
    }
}

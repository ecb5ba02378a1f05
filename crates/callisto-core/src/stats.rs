use ndarray::Array2;

use crate::consts::{BWMV_TUNING, NOISE_CLIP_MAX_ITER, NOISE_CLIP_SIGMA};
use crate::error::Result;
use crate::frame::Region;

/// Per-frame, per-layer pixel statistics. Computed on demand, cached by
/// the sequence, persisted in the sidecar index.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsRecord {
    /// Total pixels in the measured window.
    pub total: usize,
    /// Pixels strictly above zero (nulls excluded from the estimators).
    pub good_pixels: usize,
    pub mean: f64,
    pub median: f64,
    pub sigma: f64,
    pub avg_dev: f64,
    pub mad: f64,
    pub sqrt_bwmv: f64,
    pub location: f64,
    pub scale: f64,
    pub min: f64,
    pub max: f64,
    /// Full-scale value of the source bit depth, used for normalization.
    pub norm_value: f64,
    pub bg_noise: f64,
}

impl StatsRecord {
    /// Record for a window with no usable pixels.
    fn empty(total: usize, norm_value: f64) -> Self {
        Self {
            total,
            good_pixels: 0,
            mean: 0.0,
            median: 0.0,
            sigma: 0.0,
            avg_dev: 0.0,
            mad: 0.0,
            sqrt_bwmv: 0.0,
            location: 0.0,
            scale: 0.0,
            min: 0.0,
            max: 0.0,
            norm_value,
            bg_noise: 0.0,
        }
    }
}

/// Compute the full statistics set for one plane, optionally restricted to a
/// sub-rectangle.
///
/// Estimators follow the usual robust-statistics chain: median and MAD by
/// selection, biweight midvariance inside the `BWMV_TUNING`·MAD window,
/// location = median, scale = sqrt(BWMV) (sigma when MAD degenerates),
/// background noise by iterated k-sigma clipping around the median.
pub fn compute_statistics(
    plane: &Array2<f32>,
    region: Option<&Region>,
    bit_depth: u8,
) -> Result<StatsRecord> {
    let norm_value = ((1u32 << bit_depth.min(16)) - 1) as f64;

    let values: Vec<f64> = match region {
        Some(r) => {
            let valid = r.validated(plane.ncols() as u32, plane.nrows() as u32)?;
            let (x, y) = (valid.x as usize, valid.y as usize);
            let (w, h) = (valid.width as usize, valid.height as usize);
            plane
                .slice(ndarray::s![y..y + h, x..x + w])
                .iter()
                .map(|&v| v as f64)
                .collect()
        }
        None => plane.iter().map(|&v| v as f64).collect(),
    };

    let total = values.len();
    let mut good: Vec<f64> = values.into_iter().filter(|&v| v > 0.0).collect();
    if good.is_empty() {
        return Ok(StatsRecord::empty(total, norm_value));
    }

    let n = good.len() as f64;
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut sum = 0.0;
    for &v in &good {
        sum += v;
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    let mean = sum / n;

    let sigma = if good.len() > 1 {
        let ss: f64 = good.iter().map(|&v| (v - mean) * (v - mean)).sum();
        (ss / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    let median = median_in_place(&mut good);
    let avg_dev = good.iter().map(|&v| (v - median).abs()).sum::<f64>() / n;

    let mut abs_dev: Vec<f64> = good.iter().map(|&v| (v - median).abs()).collect();
    let mad = median_in_place(&mut abs_dev);

    let sqrt_bwmv = biweight_midvariance(&good, median, mad).sqrt();
    let scale = if mad > 0.0 { sqrt_bwmv } else { sigma };

    let bg_noise = background_noise(&good, median, sigma);

    Ok(StatsRecord {
        total,
        good_pixels: good.len(),
        mean,
        median,
        sigma,
        avg_dev,
        mad,
        sqrt_bwmv,
        location: median,
        scale,
        min,
        max,
        norm_value,
        bg_noise,
    })
}

/// Median by selection. Reorders `values`.
fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let upper = *m;
    if values.len() % 2 == 1 {
        upper
    } else {
        let (_, lo, _) = values[..mid].select_nth_unstable_by(mid - 1, |a, b| a.total_cmp(b));
        (upper + *lo) * 0.5
    }
}

/// Biweight midvariance with the standard tuning window of
/// `BWMV_TUNING` MADs around the median.
fn biweight_midvariance(values: &[f64], median: f64, mad: f64) -> f64 {
    if mad <= 0.0 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mut num = 0.0;
    let mut den = 0.0;
    for &v in values {
        let u = (v - median) / (BWMV_TUNING * mad);
        if u.abs() < 1.0 {
            let u2 = u * u;
            let one = 1.0 - u2;
            num += (v - median) * (v - median) * one.powi(4);
            den += one * (1.0 - 5.0 * u2);
        }
    }
    if den == 0.0 {
        return 0.0;
    }
    n * num / (den * den)
}

/// Background noise by iterated k-sigma clipping: keep pixels within
/// `NOISE_CLIP_SIGMA`·sigma of the median and re-estimate until stable.
fn background_noise(values: &[f64], median: f64, sigma: f64) -> f64 {
    let mut center = median;
    let mut spread = sigma;
    let mut kept: Vec<f64> = values.to_vec();

    for _ in 0..NOISE_CLIP_MAX_ITER {
        if spread <= 0.0 {
            break;
        }
        let limit = NOISE_CLIP_SIGMA * spread;
        let next: Vec<f64> = kept
            .iter()
            .copied()
            .filter(|v| (v - center).abs() <= limit)
            .collect();
        if next.len() == kept.len() || next.len() < 2 {
            break;
        }
        kept = next;
        let n = kept.len() as f64;
        let mean = kept.iter().sum::<f64>() / n;
        let ss: f64 = kept.iter().map(|&v| (v - mean) * (v - mean)).sum();
        let new_spread = (ss / (n - 1.0)).sqrt();
        center = mean;
        if (new_spread - spread).abs() < 1e-12 {
            spread = new_spread;
            break;
        }
        spread = new_spread;
    }

    spread
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn constant_plane() {
        let plane = Array2::from_elem((4, 4), 0.5f32);
        let s = compute_statistics(&plane, None, 16).unwrap();
        assert_eq!(s.total, 16);
        assert_eq!(s.good_pixels, 16);
        assert!((s.mean - 0.5).abs() < 1e-6);
        assert!((s.median - 0.5).abs() < 1e-6);
        assert!(s.sigma.abs() < 1e-12);
        assert!(s.mad.abs() < 1e-12);
        assert!((s.norm_value - 65535.0).abs() < 1e-9);
    }

    #[test]
    fn zeros_are_excluded() {
        let plane = array![[0.0f32, 0.0], [0.25, 0.75]];
        let s = compute_statistics(&plane, None, 8).unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.good_pixels, 2);
        assert!((s.mean - 0.5).abs() < 1e-6);
        assert!((s.min - 0.25).abs() < 1e-6);
        assert!((s.max - 0.75).abs() < 1e-6);
    }

    #[test]
    fn all_zero_plane_yields_empty_record() {
        let plane = Array2::zeros((3, 3));
        let s = compute_statistics(&plane, None, 8).unwrap();
        assert_eq!(s.good_pixels, 0);
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.bg_noise, 0.0);
    }

    #[test]
    fn region_restricts_the_window() {
        let mut plane = Array2::from_elem((4, 4), 1.0f32);
        plane[[0, 0]] = 0.1;
        let r = Region::new(1, 1, 2, 2);
        let s = compute_statistics(&plane, Some(&r), 8).unwrap();
        assert_eq!(s.total, 4);
        assert!((s.mean - 1.0).abs() < 1e-6);
    }

    #[test]
    fn median_even_count() {
        let mut v = vec![4.0, 1.0, 3.0, 2.0];
        assert!((median_in_place(&mut v) - 2.5).abs() < 1e-12);
    }
}

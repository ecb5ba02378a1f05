use ndarray::Array2;

use crate::frame::ColorMode;

/// Which color sits at position (0,0) in the 2x2 Bayer cell.
#[derive(Clone, Copy)]
#[allow(clippy::upper_case_acronyms)]
enum BayerPhase {
    RGGB,
    GRBG,
    GBRG,
    BGGR,
}

impl BayerPhase {
    fn from_color_mode(mode: &ColorMode) -> Option<Self> {
        match mode {
            ColorMode::BayerRGGB => Some(Self::RGGB),
            ColorMode::BayerGRBG => Some(Self::GRBG),
            ColorMode::BayerGBRG => Some(Self::GBRG),
            ColorMode::BayerBGGR => Some(Self::BGGR),
            _ => None,
        }
    }

    /// Returns `(row_parity, col_parity)` of the red pixel within the 2x2 cell.
    fn red_position(self) -> (usize, usize) {
        match self {
            Self::RGGB => (0, 0),
            Self::GRBG => (0, 1),
            Self::GBRG => (1, 0),
            Self::BGGR => (1, 1),
        }
    }
}

/// Bilinear demosaic of a raw Bayer mosaic into R, G, B planes.
///
/// Returns `None` if `mode` is not a Bayer pattern.
pub fn demosaic_bilinear(raw: &Array2<f32>, mode: &ColorMode) -> Option<[Array2<f32>; 3]> {
    let phase = BayerPhase::from_color_mode(mode)?;
    let (h, w) = raw.dim();
    let (r_row, r_col) = phase.red_position();

    let mut red = Array2::<f32>::zeros((h, w));
    let mut green = Array2::<f32>::zeros((h, w));
    let mut blue = Array2::<f32>::zeros((h, w));

    for row in 0..h {
        let ri = row as isize;
        let is_red_row = (row % 2) == r_row;
        for col in 0..w {
            let ci = col as isize;
            let is_red_col = (col % 2) == r_col;

            match (is_red_row, is_red_col) {
                // Red pixel position
                (true, true) => {
                    red[[row, col]] = raw[[row, col]];
                    green[[row, col]] = avg_cross(raw, ri, ci);
                    blue[[row, col]] = avg_diagonal(raw, ri, ci);
                }
                // Green on red row
                (true, false) => {
                    red[[row, col]] = avg_horizontal(raw, ri, ci);
                    green[[row, col]] = raw[[row, col]];
                    blue[[row, col]] = avg_vertical(raw, ri, ci);
                }
                // Green on blue row
                (false, true) => {
                    red[[row, col]] = avg_vertical(raw, ri, ci);
                    green[[row, col]] = raw[[row, col]];
                    blue[[row, col]] = avg_horizontal(raw, ri, ci);
                }
                // Blue pixel position
                (false, false) => {
                    red[[row, col]] = avg_diagonal(raw, ri, ci);
                    green[[row, col]] = avg_cross(raw, ri, ci);
                    blue[[row, col]] = raw[[row, col]];
                }
            }
        }
    }

    Some([red, green, blue])
}

/// Clamped indexing into the raw mosaic.
#[inline]
fn px(raw: &Array2<f32>, row: isize, col: isize) -> f32 {
    let (h, w) = raw.dim();
    let r = row.clamp(0, h as isize - 1) as usize;
    let c = col.clamp(0, w as isize - 1) as usize;
    raw[[r, c]]
}

/// Average of 4 cross (cardinal) neighbours.
#[inline]
fn avg_cross(raw: &Array2<f32>, r: isize, c: isize) -> f32 {
    (px(raw, r - 1, c) + px(raw, r + 1, c) + px(raw, r, c - 1) + px(raw, r, c + 1)) * 0.25
}

/// Average of 4 diagonal neighbours.
#[inline]
fn avg_diagonal(raw: &Array2<f32>, r: isize, c: isize) -> f32 {
    (px(raw, r - 1, c - 1)
        + px(raw, r - 1, c + 1)
        + px(raw, r + 1, c - 1)
        + px(raw, r + 1, c + 1))
        * 0.25
}

/// Average of left and right neighbours.
#[inline]
fn avg_horizontal(raw: &Array2<f32>, r: isize, c: isize) -> f32 {
    (px(raw, r, c - 1) + px(raw, r, c + 1)) * 0.5
}

/// Average of top and bottom neighbours.
#[inline]
fn avg_vertical(raw: &Array2<f32>, r: isize, c: isize) -> f32 {
    (px(raw, r - 1, c) + px(raw, r + 1, c)) * 0.5
}

// color_adjust.rs — Brightness equalization across camera overlaps.
//
// Cameras in a rig auto-expose independently, so the same wall can be a few
// percent brighter in one camera than its neighbour. Flow estimation and
// blending both suffer from that, so before anything else each camera gets a
// multiplicative gain, applied in linear light:
//
//   1. measure the mean brightness of the overlap band on each side of
//      every adjacent pair (camera i's right edge vs camera i+1's left edge);
//   2. ratio_i = mean_i / mean_{i+1}, rejected (→ 1.0) outside [0.3, 2.0];
//   3. smooth each ratio against the previous frame's;
//   4. if any ratio strays from 1.0 by more than the threshold, chain the
//      ratios into per-camera gains, normalize them to a reference camera
//      and apply.
//
// Each camera is converted once to a 16-bit `LinearImage` through a lookup
// table. Band means are read from it and the gain is applied to it, then
// written back through the inverse table, so the per-pixel work is two table
// reads and one multiply.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::image::{ColorImage, LinearImage};

/// Ratios outside this range are measurement failures, not exposure changes.
pub const RATIO_RANGE: (f32, f32) = (0.3, 2.0);
/// Ratio changes below this are taken as-is; larger ones are halved.
pub const RATIO_SMOOTH_STEP: f32 = 0.01;

const GAMMA: f32 = 2.2;
const GRID_STEP_X: usize = 2;
const GRID_STEP_Y: usize = 4;

/// 8-bit gamma ↔ 16-bit linear lookup tables.
pub struct GammaLut {
    to_linear: Vec<u16>,
    to_gamma: Vec<u8>,
}

impl GammaLut {
    /// Bytes held by the two tables.
    pub const BYTES: usize = 256 * 2 + 65536;

    pub fn new() -> Self {
        let to_linear = (0..256)
            .map(|i| ((i as f32 / 255.0).powf(GAMMA) * 65535.0).round() as u16)
            .collect();
        let to_gamma = (0..65536)
            .map(|i| ((i as f32 / 65535.0).powf(1.0 / GAMMA) * 255.0).round() as u8)
            .collect();
        GammaLut { to_linear, to_gamma }
    }

    #[inline]
    pub fn linear(&self, v: u8) -> u16 {
        self.to_linear[v as usize]
    }

    #[inline]
    pub fn gamma(&self, v: u16) -> u8 {
        self.to_gamma[v as usize]
    }

    /// RGB to linear light; alpha is widened unchanged.
    pub fn to_linear_image(&self, img: &ColorImage) -> LinearImage {
        img.map(|p| [self.linear(p[0]), self.linear(p[1]), self.linear(p[2]), p[3] as u16])
    }
}

impl Default for GammaLut {
    fn default() -> Self {
        Self::new()
    }
}

/// How a band's brightness is averaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MeanColorMode {
    /// Rec. 709 luma weights.
    #[default]
    Luma,
    /// Plain mean of R, G and B.
    Flat,
}

impl MeanColorMode {
    fn weights(self) -> [f32; 3] {
        match self {
            MeanColorMode::Luma => [0.2126, 0.7152, 0.0722],
            MeanColorMode::Flat => [1.0 / 3.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorAdjustOptions {
    /// Camera whose brightness is kept. `None` normalizes to the
    /// second-brightest gain instead.
    pub standard: Option<usize>,
    /// Angular width of the overlap between neighbours.
    pub overlap_degrees: f32,
    /// Adjust only if some ratio differs from 1.0 by more than this.
    pub threshold: f32,
    pub mean_mode: MeanColorMode,
    /// Ignore `standard` and use the second-brightest reference.
    pub force_hdr: bool,
}

impl Default for ColorAdjustOptions {
    fn default() -> Self {
        ColorAdjustOptions {
            standard: Some(0),
            overlap_degrees: 20.0,
            threshold: 0.02,
            mean_mode: MeanColorMode::Luma,
            force_hdr: false,
        }
    }
}

/// Cross-frame state of the colour pre-adjustment.
#[derive(Debug, Clone, Default)]
pub struct ColorAdjuster {
    ratios: Vec<f32>,
}

impl ColorAdjuster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ratios measured on the last call, one per adjacent pair (the last pair
    /// wraps around to camera 0).
    pub fn last_ratios(&self) -> &[f32] {
        &self.ratios
    }

    /// Forget the previous frame's ratios.
    pub fn reset(&mut self) {
        self.ratios.clear();
    }

    /// Equalize `images` in place. Returns whether any gain was applied.
    ///
    /// # Panics
    /// Panics if the images are empty or differ in size, or if `standard` is
    /// out of range.
    pub fn pre_adjust(&mut self, lut: &GammaLut, images: &mut [ColorImage], opts: &ColorAdjustOptions) -> bool {
        let n = images.len();
        if n < 2 {
            return false;
        }
        let (w, h) = images[0].size();
        assert!(
            images.iter().all(|img| img.size() == (w, h)),
            "colour adjustment needs equally sized images",
        );
        assert!(w > 0 && h > 0, "colour adjustment needs non-empty images, got {w}×{h}");
        if let Some(s) = opts.standard {
            assert!(s < n, "standard camera {s} out of range ({n} cameras)");
        }

        let band = band_width(w, n, opts.overlap_degrees);
        let weights = opts.mean_mode.weights();
        let linear: Vec<LinearImage> = images.iter().map(|img| lut.to_linear_image(img)).collect();
        let means: Vec<(Option<f32>, Option<f32>)> = linear
            .iter()
            .map(|img| (band_mean(img, w - band, w, weights), band_mean(img, 0, band, weights)))
            .collect();

        let fresh: Vec<f32> = (0..n)
            .map(|i| {
                let right_of_i = means[i].0;
                let left_of_next = means[(i + 1) % n].1;
                match (right_of_i, left_of_next) {
                    (Some(a), Some(b)) if b > 0.0 => clamp_ratio(a / b),
                    _ => 1.0,
                }
            })
            .collect();

        let smoothed: Vec<f32> = if self.ratios.len() == n {
            fresh
                .iter()
                .zip(&self.ratios)
                .map(|(&r, &prev)| if (r - prev).abs() > RATIO_SMOOTH_STEP { 0.5 * (r + prev) } else { r })
                .collect()
        } else {
            fresh
        };
        self.ratios = smoothed;

        debug!(ratios = ?self.ratios, band, "colour ratios");
        if !self.ratios.iter().any(|r| (r - 1.0).abs() > opts.threshold) {
            return false;
        }

        let gains = self.gains(opts);
        for ((img, lin), &gain) in images.iter_mut().zip(&linear).zip(&gains) {
            apply_gain(lut, img, lin, gain);
        }
        true
    }

    /// Per-camera gains from the chained ratios.
    fn gains(&self, opts: &ColorAdjustOptions) -> Vec<f32> {
        let n = self.ratios.len();
        let mut gains = Vec::with_capacity(n);
        gains.push(1.0f32);
        for i in 0..n - 1 {
            gains.push(gains[i] * self.ratios[i]);
        }

        let reference = match opts.standard {
            Some(s) if !opts.force_hdr => gains[s],
            _ => {
                let mut sorted = gains.clone();
                sorted.sort_by(|a, b| b.total_cmp(a));
                sorted[1.min(n - 1)]
            }
        };
        if reference > 0.0 {
            gains.iter_mut().for_each(|g| *g /= reference);
        }
        gains
    }
}

/// Overlap band width in pixels for `n` cameras of width `w`.
pub fn band_width(w: usize, n: usize, overlap_degrees: f32) -> usize {
    let per_camera = 360.0 / n as f32 + overlap_degrees;
    let band = (w as f32 * overlap_degrees / per_camera).round() as usize;
    band.clamp(1, w)
}

fn clamp_ratio(r: f32) -> f32 {
    if r.is_finite() && (RATIO_RANGE.0..=RATIO_RANGE.1).contains(&r) {
        r
    } else {
        1.0
    }
}

/// Grid-sampled mean linear brightness of columns `x0..x1`, skipping the
/// top and bottom eighth and fully transparent pixels.
fn band_mean(img: &LinearImage, x0: usize, x1: usize, weights: [f32; 3]) -> Option<f32> {
    let h = img.height();
    let skip = h / 8;
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for y in (skip..h - skip).step_by(GRID_STEP_Y) {
        for x in (x0..x1).step_by(GRID_STEP_X) {
            let p = img.get(x, y);
            if p[3] == 0 {
                continue;
            }
            let v = weights[0] * p[0] as f32 + weights[1] * p[1] as f32 + weights[2] * p[2] as f32;
            sum += v as f64;
            count += 1;
        }
    }
    (count > 0).then(|| (sum / count as f64) as f32)
}

/// Scale `linear` by `gain` and write it back into `img` in gamma space.
/// A unit gain leaves `img` bit-identical.
fn apply_gain(lut: &GammaLut, img: &mut ColorImage, linear: &LinearImage, gain: f32) {
    if gain == 1.0 {
        return;
    }
    for (p, l) in img.as_mut_slice().iter_mut().zip(linear.as_slice()) {
        for c in 0..3 {
            let lin = (l[c] as f32 * gain).round().clamp(0.0, 65535.0) as u16;
            p[c] = lut.gamma(lin);
        }
    }
}

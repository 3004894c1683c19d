// postprocess.rs — Panorama assembly stages after chunks are rendered.
//
//   remove_chunk_lines   soften the visible seam between adjacent chunks
//   hstack               chunks → one equirectangular strip
//   sharpen              unsharp mask (RGB only)
//   TemporalSmoother     suppress frame-to-frame shimmer in static areas
//   wrap_offset          rotate the panorama horizontally
//
// `assemble` runs them in this order; `Panorama::assemble` calls it with
// the eye's own smoother.

use serde::{Deserialize, Serialize};

use crate::convert::rgb_abs_diff;
use crate::convolution::gaussian_blur;
use crate::image::{ColorImage, Pixel};

/// Options for the assembly stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssembleOptions {
    pub remove_chunk_lines: bool,
    /// Unsharp-mask strength; 0 disables sharpening.
    pub sharpen_amount: f32,
    /// Temporal smoothing threshold; 0 disables it.
    pub temporal_threshold: f32,
    /// Horizontal rotation in pixels, positive to the right.
    pub wrap_offset: isize,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            remove_chunk_lines: true,
            sharpen_amount: 0.25,
            temporal_threshold: 0.0,
            wrap_offset: 0,
        }
    }
}

#[inline]
fn average(a: [u8; 4], b: [u8; 4]) -> [u8; 4] {
    let (la, lb) = (a.to_lanes(), b.to_lanes());
    <[u8; 4]>::from_lanes([
        0.5 * (la[0] + lb[0]),
        0.5 * (la[1] + lb[1]),
        0.5 * (la[2] + lb[2]),
        0.5 * (la[3] + lb[3]),
    ])
}

/// Average the last column of each chunk with the first column of the next
/// (the last chunk wraps to the first) and write the result to both.
///
/// # Panics
/// Panics if the chunks differ in height or any chunk is empty.
pub fn remove_chunk_lines(chunks: &mut [ColorImage]) {
    let n = chunks.len();
    if n == 0 {
        return;
    }
    let h = chunks[0].height();
    assert!(
        chunks.iter().all(|c| c.height() == h && !c.is_empty()),
        "chunks must be non-empty and share one height",
    );

    let seams: Vec<Vec<[u8; 4]>> = (0..n)
        .map(|i| {
            let left = &chunks[i];
            let right = &chunks[(i + 1) % n];
            let lx = left.width() - 1;
            (0..h).map(|y| average(left.get(lx, y), right.get(0, y))).collect()
        })
        .collect();

    for (i, seam) in seams.into_iter().enumerate() {
        let lx = chunks[i].width() - 1;
        for (y, &v) in seam.iter().enumerate() {
            chunks[i].set(lx, y, v);
            chunks[(i + 1) % n].set(0, y, v);
        }
    }
}

/// Concatenate equally tall chunks from left to right.
///
/// # Panics
/// Panics if `chunks` is empty or heights differ.
pub fn hstack(chunks: &[ColorImage]) -> ColorImage {
    assert!(!chunks.is_empty(), "hstack needs at least one chunk");
    let h = chunks[0].height();
    assert!(chunks.iter().all(|c| c.height() == h), "hstack chunks must share one height");

    let total: usize = chunks.iter().map(|c| c.width()).sum();
    let mut out = ColorImage::new(total, h);
    for y in 0..h {
        let row = out.row_mut(y);
        let mut x0 = 0;
        for c in chunks {
            row[x0..x0 + c.width()].copy_from_slice(c.row(y));
            x0 += c.width();
        }
    }
    out
}

/// Unsharp mask against a 3×3 Gaussian. Alpha is copied through.
pub fn sharpen(image: &ColorImage, amount: f32) -> ColorImage {
    if amount == 0.0 || image.is_empty() {
        return image.clone();
    }
    let blurred = gaussian_blur(image, 1, 1.0);
    image.zip_map(&blurred, |p, b| {
        let (lp, lb) = (p.to_lanes(), b.to_lanes());
        <[u8; 4]>::from_lanes([
            lp[0] + amount * (lp[0] - lb[0]),
            lp[1] + amount * (lp[1] - lb[1]),
            lp[2] + amount * (lp[2] - lb[2]),
            lp[3],
        ])
    })
}

/// Holds the previous output frame and pulls near-identical pixels of the
/// next frame toward it.
#[derive(Debug, Default)]
pub struct TemporalSmoother {
    previous: Option<ColorImage>,
}

impl TemporalSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smooth `image` in place and remember the result for the next call.
    ///
    /// A pixel whose normalized difference `d` to the previous frame is below
    /// `threshold` becomes `prev + (cur - prev) · d / threshold`. A size
    /// change drops the history.
    pub fn apply(&mut self, image: &mut ColorImage, threshold: f32) {
        if threshold > 0.0 {
            if let Some(prev) = self.previous.as_ref().filter(|p| p.same_size(image)) {
                for (c, &p) in image.as_mut_slice().iter_mut().zip(prev.as_slice()) {
                    let d = rgb_abs_diff(*c, p);
                    if d < threshold {
                        let k = d / threshold;
                        let (lc, lp) = (c.to_lanes(), p.to_lanes());
                        *c = <[u8; 4]>::from_lanes([
                            lp[0] + (lc[0] - lp[0]) * k,
                            lp[1] + (lc[1] - lp[1]) * k,
                            lp[2] + (lc[2] - lp[2]) * k,
                            lc[3],
                        ]);
                    }
                }
            }
        }
        self.previous = Some(image.clone());
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn has_history(&self) -> bool {
        self.previous.is_some()
    }
}

/// Circular horizontal shift: pixel x moves to `(x + offset) mod width`.
pub fn wrap_offset(image: &ColorImage, offset: isize) -> ColorImage {
    let w = image.width() as isize;
    if w == 0 || offset.rem_euclid(w) == 0 {
        return image.clone();
    }
    ColorImage::from_fn(image.width(), image.height(), |x, y| {
        let sx = (x as isize - offset).rem_euclid(w) as usize;
        image.get(sx, y)
    })
}

/// Run every assembly stage on one eye's chunks, in order.
pub fn assemble(mut chunks: Vec<ColorImage>, opts: &AssembleOptions, smoother: &mut TemporalSmoother) -> ColorImage {
    if opts.remove_chunk_lines {
        remove_chunk_lines(&mut chunks);
    }
    let strip = hstack(&chunks);
    drop(chunks);
    let mut out = sharpen(&strip, opts.sharpen_amount);
    drop(strip);
    smoother.apply(&mut out, opts.temporal_threshold);
    wrap_offset(&out, opts.wrap_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    fn solid(w: usize, h: usize, v: u8) -> ColorImage {
        Image::filled(w, h, [v, v, v, 255])
    }

    #[test]
    fn test_hstack_layout() {
        let out = hstack(&[solid(2, 3, 10), solid(3, 3, 20)]);
        assert_eq!(out.size(), (5, 3));
        assert_eq!(out.get(1, 2)[0], 10);
        assert_eq!(out.get(2, 0)[0], 20);
    }

    #[test]
    #[should_panic(expected = "share one height")]
    fn test_hstack_height_mismatch() {
        hstack(&[solid(2, 3, 0), solid(2, 4, 0)]);
    }

    #[test]
    fn test_remove_chunk_lines_averages_seams() {
        let mut chunks = vec![solid(3, 2, 100), solid(3, 2, 200)];
        remove_chunk_lines(&mut chunks);
        assert_eq!(chunks[0].get(2, 0)[0], 150);
        assert_eq!(chunks[1].get(0, 0)[0], 150);
        // Wrap seam: chunk 1's right edge and chunk 0's left edge.
        assert_eq!(chunks[1].get(2, 1)[0], 150);
        assert_eq!(chunks[0].get(0, 1)[0], 150);
        // Interior untouched.
        assert_eq!(chunks[0].get(1, 0)[0], 100);
    }

    #[test]
    fn test_sharpen_flat_is_noop_and_keeps_alpha() {
        let img = Image::filled(5, 5, [80u8, 90, 100, 17]);
        assert_eq!(sharpen(&img, 1.0), img);
    }

    #[test]
    fn test_sharpen_boosts_edge() {
        let img = Image::from_fn(6, 3, |x, _| if x < 3 { [50u8, 50, 50, 255] } else { [150, 150, 150, 255] });
        let out = sharpen(&img, 1.0);
        assert!(out.get(2, 1)[0] < 50);
        assert!(out.get(3, 1)[0] > 150);
    }

    #[test]
    fn test_temporal_smoother_holds_static_pixels() {
        let mut s = TemporalSmoother::new();
        let mut first = solid(4, 4, 100);
        s.apply(&mut first, 0.1);
        assert!(s.has_history());
        let mut second = solid(4, 4, 102);
        s.apply(&mut second, 0.1);
        // d = 2/255 ≈ 0.008, k ≈ 0.08: stays very close to 100.
        assert_eq!(second.get(0, 0)[0], 100);
        let mut moved = solid(4, 4, 200);
        s.apply(&mut moved, 0.1);
        assert_eq!(moved.get(0, 0)[0], 200);
        s.reset();
        assert!(!s.has_history());
    }

    #[test]
    fn test_assemble_runs_every_stage() {
        let mut smoother = TemporalSmoother::new();
        let opts = AssembleOptions { wrap_offset: 2, ..AssembleOptions::default() };
        let out = assemble(vec![solid(3, 2, 40), solid(3, 2, 40)], &opts, &mut smoother);
        assert_eq!(out.size(), (6, 2));
        assert_eq!(out.get(0, 0), [40, 40, 40, 255]);
        assert!(smoother.has_history());
    }

    #[test]
    fn test_wrap_offset() {
        let img = Image::from_fn(4, 1, |x, _| [x as u8, 0, 0, 255]);
        let right = wrap_offset(&img, 1);
        assert_eq!(right.get(0, 0)[0], 3);
        assert_eq!(right.get(1, 0)[0], 0);
        let left = wrap_offset(&img, -1);
        assert_eq!(left.get(0, 0)[0], 1);
        assert_eq!(left.get(3, 0)[0], 0);
        assert_eq!(wrap_offset(&img, 4), img);
    }
}

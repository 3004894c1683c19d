// pyramid.rs — Geometric-ratio image pyramid.
//
// The flow engine works coarse to fine over a pyramid whose levels shrink by
// a constant ratio (≈0.9) rather than by 2×. Small steps keep the upscaled
// flow from the previous level close to the answer at the next one, so the
// sweep solver only has to refine by a pixel or so per level.
//
// Geometry lives in `level_sizes` so the budget planner can compute the
// exact footprint of a pyramid without building one.
//
// NEW RUST CONCEPTS:
// - `Vec<Image<T>>` — the Pyramid owns its levels. Dropping the pyramid
//   frees every level (RAII), which is what releases per-frame buffers.

use crate::image::{FlowField, Image, Pixel};
use crate::remap::{rescale_flow, resize};

/// Level dimensions, finest first.
///
/// Level `i` is `round(width * ratio^i) × round(height * ratio^i)`. Building
/// stops before a level whose width or height would be `<= min_size`, or once
/// `max_levels` levels exist. Level 0 (the input size) is always present.
///
/// # Panics
/// Panics if `ratio` is not in (0, 1) or `max_levels` is zero.
pub fn level_sizes(
    width: usize,
    height: usize,
    ratio: f32,
    min_size: usize,
    max_levels: usize,
) -> Vec<(usize, usize)> {
    assert!(ratio > 0.0 && ratio < 1.0, "pyramid ratio must be in (0, 1), got {ratio}");
    assert!(max_levels >= 1, "pyramid must have at least 1 level");

    let mut sizes = vec![(width, height)];
    let mut scale = 1.0f64;
    while sizes.len() < max_levels {
        scale *= ratio as f64;
        let w = (width as f64 * scale).round() as usize;
        let h = (height as f64 * scale).round() as usize;
        if w <= min_size || h <= min_size {
            break;
        }
        sizes.push((w, h));
    }
    sizes
}

/// An image pyramid. `levels[0]` is the finest level.
pub struct Pyramid<T: Pixel> {
    pub levels: Vec<Image<T>>,
}

impl<T: Pixel> Pyramid<T> {
    /// Build a pyramid by resizing each level from the one above it.
    ///
    /// `sizes[0]` must equal the source size.
    pub fn build(src: &Image<T>, sizes: &[(usize, usize)]) -> Self {
        assert!(!sizes.is_empty(), "pyramid must have at least 1 level");
        assert_eq!(src.size(), sizes[0], "level 0 must match the source size");

        let mut levels = Vec::with_capacity(sizes.len());
        let mut prev = src.clone();
        for &(w, h) in &sizes[1..] {
            let next = resize(&prev, w, h);
            levels.push(std::mem::replace(&mut prev, next));
        }
        levels.push(prev);
        Pyramid { levels }
    }

    /// Number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Get a reference to a specific level.
    pub fn level(&self, level: usize) -> &Image<T> {
        &self.levels[level]
    }

    /// The coarsest level.
    pub fn coarsest(&self) -> &Image<T> {
        &self.levels[self.levels.len() - 1]
    }
}

impl Pyramid<[f32; 2]> {
    /// Build a flow pyramid: each level is resized and its vectors scaled by
    /// the level's size ratio.
    pub fn build_flow(flow: &FlowField, sizes: &[(usize, usize)]) -> Self {
        assert!(!sizes.is_empty(), "pyramid must have at least 1 level");
        assert_eq!(flow.size(), sizes[0], "level 0 must match the flow size");

        let levels = sizes
            .iter()
            .map(|&(w, h)| rescale_flow(flow, w, h))
            .collect();
        Pyramid { levels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_sizes_ratio() {
        let sizes = level_sizes(100, 60, 0.9, 24, 1000);
        assert_eq!(sizes[0], (100, 60));
        assert_eq!(sizes[1], (90, 54));
        assert_eq!(sizes[2], (81, 49));
        let last = *sizes.last().unwrap();
        assert!(last.0 > 24 && last.1 > 24);
    }

    #[test]
    fn test_level_sizes_stops_before_min() {
        // 30 * 0.9 = 27, 27 * 0.9 ≈ 24.3 → 24 is at the limit, so stop.
        let sizes = level_sizes(30, 30, 0.9, 24, 1000);
        assert_eq!(sizes, vec![(30, 30), (27, 27)]);
    }

    #[test]
    fn test_level_sizes_tiny_image_single_level() {
        assert_eq!(level_sizes(2, 2, 0.9, 24, 1000), vec![(2, 2)]);
    }

    #[test]
    fn test_level_sizes_cap() {
        assert_eq!(level_sizes(1000, 1000, 0.9, 24, 3).len(), 3);
    }

    #[test]
    fn test_pyramid_constant_image() {
        let img = Image::filled(64, 48, 0.25f32);
        let sizes = level_sizes(64, 48, 0.9, 24, 1000);
        let pyr = Pyramid::build(&img, &sizes);
        assert_eq!(pyr.num_levels(), sizes.len());
        for (lvl, level) in pyr.levels.iter().enumerate() {
            assert_eq!(level.size(), sizes[lvl]);
            assert!(level.pixels().all(|(_, _, v)| (v - 0.25).abs() < 1e-6));
        }
    }

    #[test]
    fn test_flow_pyramid_scales_vectors() {
        let flow = Image::filled(50, 40, [5.0f32, 4.0]);
        let sizes = vec![(50, 40), (25, 20)];
        let pyr = Pyramid::build_flow(&flow, &sizes);
        let v = pyr.coarsest().get(3, 3);
        assert!((v[0] - 2.5).abs() < 1e-5);
        assert!((v[1] - 2.0).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn test_zero_levels_panics() {
        level_sizes(10, 10, 0.9, 24, 0);
    }
}

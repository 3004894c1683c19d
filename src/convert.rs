// convert.rs — Pixel conversions between colour, intensity and mask images.
//
// The flow engine never looks at colour directly. It works on:
//   RGBA u8  → grey f32 in [0, 1]  (BT.601 luma)
//   RGBA u8  → alpha f32 in [0, 1] (trust mask)
// and the colour adjuster needs the per-pixel mean of the RGB channels.
//
// All conversions are pure: they allocate a new image and leave the source
// untouched, so a shared `Arc<ColorImage>` can be read by several kernels.

use crate::image::{AlphaMask, ColorImage, GreyImage, Image, Pixel};

/// BT.601 luma weights used for flow intensity.
pub const LUMA_601: [f32; 3] = [0.299, 0.587, 0.114];

/// Grey intensity in [0, 1] from an RGBA image. Alpha is ignored.
pub fn rgba_to_grey(src: &ColorImage) -> GreyImage {
    src.map(|p| {
        (LUMA_601[0] * p[0] as f32 + LUMA_601[1] * p[1] as f32 + LUMA_601[2] * p[2] as f32)
            / 255.0
    })
}

/// Alpha channel as a trust mask in [0, 1].
pub fn rgba_alpha(src: &ColorImage) -> AlphaMask {
    src.map(|p| p[3] as f32 / 255.0)
}

/// Mean of the absolute RGB channel differences, normalized to [0, 1].
///
/// This is the per-pixel "how different are these two frames" measure used
/// by motion detection and temporal smoothing.
///
/// # Panics
/// Panics if the images differ in size.
pub fn channel_abs_diff(a: &ColorImage, b: &ColorImage) -> GreyImage {
    a.zip_map(b, |pa, pb| rgb_abs_diff(pa, pb))
}

/// Normalized mean RGB distance of two pixels.
#[inline]
pub fn rgb_abs_diff(a: [u8; 4], b: [u8; 4]) -> f32 {
    let d = (a[0] as i32 - b[0] as i32).abs()
        + (a[1] as i32 - b[1] as i32).abs()
        + (a[2] as i32 - b[2] as i32).abs();
    d as f32 / (3.0 * 255.0)
}

/// Generic conversion between any two pixel types via their f32 lanes.
pub fn convert_image<S: Pixel, D: Pixel>(src: &Image<S>) -> Image<D> {
    src.map(|p| D::from_lanes(p.to_lanes()))
}

/// Pack a grey [0, 1] image and an alpha mask back into RGBA u8.
///
/// Used by tests and benches to build synthetic inputs.
pub fn grey_alpha_to_rgba(grey: &GreyImage, alpha: &AlphaMask) -> ColorImage {
    grey.zip_map(alpha, |g, a| {
        let v = g * 255.0;
        <[u8; 4]>::from_lanes([v, v, v, a * 255.0])
    })
}

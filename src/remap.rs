// remap.rs — Resize and remap: the geometric half of the image capability.
//
//   resize(src, w, h)                  bilinear, pixel-centre aligned
//   rescale_flow(flow, w, h)           resize + scale vectors by size ratio
//   remap(src, map, interp, border)    dst(p) = src(map(p))
//
// Pixel-centre alignment: destination pixel x samples the source at
// (x + 0.5) * src_w / dst_w - 0.5. Resizing to the same size is therefore
// the identity, and a resize down then up keeps the image centred.

use crate::image::{sample_bicubic, sample_bilinear, Border, FlowField, Image, Pixel};

/// Sub-pixel interpolation used by `remap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Bilinear,
    Bicubic,
}

/// Resize `src` to exactly `width × height` with bilinear interpolation.
///
/// # Panics
/// Panics if the source is empty or a target dimension is zero.
pub fn resize<T: Pixel>(src: &Image<T>, width: usize, height: usize) -> Image<T> {
    assert!(!src.is_empty(), "cannot resize an empty image");
    assert!(width > 0 && height > 0, "resize target must be non-empty ({width}×{height})");

    if src.size() == (width, height) {
        return src.clone();
    }

    let sx = src.width() as f32 / width as f32;
    let sy = src.height() as f32 / height as f32;
    Image::from_fn(width, height, |x, y| {
        let fx = (x as f32 + 0.5) * sx - 0.5;
        let fy = (y as f32 + 0.5) * sy - 0.5;
        T::from_lanes(sample_bilinear(src, fx, fy, Border::Replicate))
    })
}

/// Scaled size `round(w * factor) × round(h * factor)`, never below 1×1.
pub fn scaled_size(width: usize, height: usize, factor: f32) -> (usize, usize) {
    (
        ((width as f32 * factor).round() as usize).max(1),
        ((height as f32 * factor).round() as usize).max(1),
    )
}

/// Resize a flow field and scale its vectors by the per-axis size ratio,
/// so displacements stay expressed in destination pixels.
pub fn rescale_flow(flow: &FlowField, width: usize, height: usize) -> FlowField {
    let rx = width as f32 / flow.width() as f32;
    let ry = height as f32 / flow.height() as f32;
    let mut out = resize(flow, width, height);
    out.as_mut_slice().iter_mut().for_each(|v| {
        v[0] *= rx;
        v[1] *= ry;
    });
    out
}

/// Generic remap: `dst(x, y) = src(map(x, y).x, map(x, y).y)`.
///
/// The map may carry extra lanes (a warp table's `t`); only lanes 0 and 1
/// are read. The output has the map's size.
pub fn remap<T: Pixel, M: Pixel>(
    src: &Image<T>,
    map: &Image<M>,
    interpolation: Interpolation,
    border: Border,
) -> Image<T> {
    assert!(M::CHANNELS >= 2, "remap coordinates need at least two lanes");
    map.map(|m| {
        let l = m.to_lanes();
        let s = match interpolation {
            Interpolation::Bilinear => sample_bilinear(src, l[0], l[1], border),
            Interpolation::Bicubic => sample_bicubic(src, l[0], l[1], border),
        };
        T::from_lanes(s)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_same_size_is_identity() {
        let img = Image::from_fn(5, 3, |x, y| (x + 10 * y) as f32);
        assert_eq!(resize(&img, 5, 3), img);
    }

    #[test]
    fn test_resize_exact_target_size() {
        let img: Image<f32> = Image::new(37, 21);
        let out = resize(&img, 19, 11);
        assert_eq!(out.size(), (19, 11));
    }

    #[test]
    fn test_half_resize_averages_blocks() {
        // 4×1 → 2×1: each output pixel samples between two inputs.
        let img = Image::from_vec(4, 1, vec![0.0f32, 2.0, 4.0, 6.0]);
        let out = resize(&img, 2, 1);
        assert!((out.get(0, 0) - 1.0).abs() < 1e-6);
        assert!((out.get(1, 0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_size_never_zero() {
        assert_eq!(scaled_size(4, 4, 0.5), (2, 2));
        assert_eq!(scaled_size(1, 1, 0.5), (1, 1));
        assert_eq!(scaled_size(5, 3, 0.5), (3, 2));
    }

    #[test]
    fn test_rescale_flow_doubles_vectors() {
        let flow = Image::filled(4, 2, [1.0f32, -0.5]);
        let up = rescale_flow(&flow, 8, 4);
        assert_eq!(up.size(), (8, 4));
        for (_, _, v) in up.pixels() {
            assert!((v[0] - 2.0).abs() < 1e-6);
            assert!((v[1] + 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_remap_identity_map() {
        let img = Image::from_fn(4, 4, |x, y| [(x * 30) as u8, (y * 30) as u8, 0, 255]);
        let map = Image::from_fn(4, 4, |x, y| [x as f32, y as f32]);
        let out = remap(&img, &map, Interpolation::Bicubic, Border::Transparent);
        assert_eq!(out, img);
    }

    #[test]
    fn test_remap_outside_is_transparent() {
        let img = Image::filled(4, 4, [255u8, 255, 255, 255]);
        let map = Image::filled(2, 2, [-10.0f32, 0.0, 0.5]);
        let out = remap(&img, &map, Interpolation::Bilinear, Border::Transparent);
        assert!(out.pixels().all(|(_, _, p)| p == [0, 0, 0, 0]));
    }
}

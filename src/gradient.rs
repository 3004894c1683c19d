// gradient.rs — Normalized Sobel derivatives of intensity images.
//
// Sobel kernels are separable:
//   Sobel_x: row [-1, 0, 1], col [1, 2, 1]
//   Sobel_y: row [ 1, 2, 1], col [-1, 0, 1]
//
// The flow solver wants derivatives in "intensity per pixel", so both
// kernels are scaled by 1/8: a ramp f(x) = x yields Ix = 1 in the interior.
// Border handling (replicate) comes from convolution.rs.

use crate::convolution::convolve_separable;
use crate::image::GreyImage;

const DERIV: [f32; 3] = [-0.5, 0.0, 0.5];
const SMOOTH: [f32; 3] = [0.25, 0.5, 0.25];

/// Horizontal gradient. Positive where intensity increases to the right.
pub fn sobel_x(src: &GreyImage) -> GreyImage {
    convolve_separable(src, &DERIV, &SMOOTH)
}

/// Vertical gradient. Positive where intensity increases downward.
pub fn sobel_y(src: &GreyImage) -> GreyImage {
    convolve_separable(src, &SMOOTH, &DERIV)
}

/// Both gradients, combined into one two-lane image `(Ix, Iy)`.
///
/// The sweep solver reads both at the same location, so packing them keeps
/// a single bilinear lookup per pixel.
pub fn sobel_xy(src: &GreyImage) -> crate::image::Image<[f32; 2]> {
    let ix = sobel_x(src);
    let iy = sobel_y(src);
    ix.zip_map(&iy, |gx, gy| [gx, gy])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    #[test]
    fn test_linear_ramp_unit_gradient() {
        let img = Image::from_fn(20, 10, |x, _| x as f32);
        let ix = sobel_x(&img);
        let iy = sobel_y(&img);
        for y in 1..9 {
            for x in 1..19 {
                assert!((ix.get(x, y) - 1.0).abs() < 1e-5, "Ix at ({x},{y}) = {}", ix.get(x, y));
                assert!(iy.get(x, y).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_vertical_edge_response() {
        let img = Image::from_fn(10, 20, |_, y| if y >= 10 { 1.0f32 } else { 0.0 });
        let g = sobel_xy(&img);
        assert!(g.get(5, 10)[1] > 0.2);
        assert!(g.get(5, 3)[1].abs() < 1e-6);
        assert!(g.get(5, 10)[0].abs() < 1e-6);
    }

    #[test]
    fn test_constant_image_zero_gradient() {
        let img = Image::filled(6, 6, 0.5f32);
        let g = sobel_xy(&img);
        assert!(g.pixels().all(|(_, _, v)| v == [0.0, 0.0]));
    }
}

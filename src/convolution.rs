// convolution.rs — Separable 1D convolution, generic over pixel lanes.
//
// Every blur in the stitching pipeline goes through here: intensity
// pre-blur, gradient blur, flow blur (regularization target), the final
// flow stabilizer and the sharpen pass. One implementation serves all
// pixel types because kernels work on the four f32 lanes of a pixel.
//
// A 2D convolution with a separable kernel K = k_col * k_row^T decomposes
// into two 1D passes, reducing cost from O(k²) to O(2k) per pixel.
//
// BORDER HANDLING: Clamp (replicate edge pixels).
//
// The intermediate between the two passes is kept as `Image<[f32; 4]>`, so
// integer pixel types are rounded only once, at the end.

use crate::image::{Image, Pixel};

type Lanes = Image<[f32; 4]>;

fn check_kernel(kernel: &[f32]) {
    assert!(!kernel.is_empty(), "kernel must not be empty");
    assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
}

#[inline]
fn accumulate(acc: &mut [f32; 4], v: [f32; 4], k: f32) {
    acc[0] += v[0] * k;
    acc[1] += v[1] * k;
    acc[2] += v[2] * k;
    acc[3] += v[3] * k;
}

fn rows_lanes<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Lanes {
    check_kernel(kernel);
    let (w, h) = src.size();
    let half = kernel.len() / 2;
    let mut dst = Lanes::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            if x >= half && x + half < w {
                // SAFETY: x - half >= 0 and x + half < w.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        accumulate(&mut acc, src.get_unchecked(x + ki - half, y).to_lanes(), kv);
                    }
                }
            } else {
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sx = x as isize + ki as isize - half as isize;
                    accumulate(&mut acc, src.get_clamped(sx, y as isize).to_lanes(), kv);
                }
            }
            // SAFETY: (x, y) iterates over dst's own bounds.
            unsafe { dst.set_unchecked(x, y, acc) };
        }
    }
    dst
}

fn cols_lanes<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Lanes {
    check_kernel(kernel);
    let (w, h) = src.size();
    let half = kernel.len() / 2;
    let mut dst = Lanes::new(w, h);

    for y in 0..h {
        let interior = y >= half && y + half < h;
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            if interior {
                // SAFETY: y - half >= 0 and y + half < h.
                unsafe {
                    for (ki, &kv) in kernel.iter().enumerate() {
                        accumulate(&mut acc, src.get_unchecked(x, y + ki - half).to_lanes(), kv);
                    }
                }
            } else {
                for (ki, &kv) in kernel.iter().enumerate() {
                    let sy = y as isize + ki as isize - half as isize;
                    accumulate(&mut acc, src.get_clamped(x as isize, sy).to_lanes(), kv);
                }
            }
            unsafe { dst.set_unchecked(x, y, acc) };
        }
    }
    dst
}

/// Convolve each row of `src` with a centered 1D kernel (horizontal pass).
///
/// # Panics
/// Panics if the kernel is empty or has even length.
pub fn convolve_rows<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<T> {
    rows_lanes(src, kernel).map(T::from_lanes)
}

/// Convolve each column of `src` with a centered 1D kernel (vertical pass).
pub fn convolve_cols<T: Pixel>(src: &Image<T>, kernel: &[f32]) -> Image<T> {
    cols_lanes(src, kernel).map(T::from_lanes)
}

/// Full separable 2D convolution: horizontal pass then vertical pass.
///
/// # Panics
/// Panics if either kernel is empty or has even length.
pub fn convolve_separable<T: Pixel>(
    src: &Image<T>,
    kernel_row: &[f32],
    kernel_col: &[f32],
) -> Image<T> {
    let intermediate = rows_lanes(src, kernel_row);
    cols_lanes(&intermediate, kernel_col).map(T::from_lanes)
}

/// Generate a 1D Gaussian kernel with the given half-size and sigma.
///
/// Returns a kernel of length `2 * half_size + 1`, normalized so the
/// coefficients sum to 1.0.
///
/// # Examples
/// ```
/// let k = panoflow::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..2 * half_size + 1)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|v| *v /= sum);
    kernel
}

/// Isotropic Gaussian blur with a `(2 * half_size + 1)²` window.
///
/// `half_size == 0` returns a copy.
pub fn gaussian_blur<T: Pixel>(src: &Image<T>, half_size: usize, sigma: f32) -> Image<T> {
    if half_size == 0 || src.is_empty() {
        return src.clone();
    }
    let k = gaussian_kernel_1d(half_size, sigma);
    convolve_separable(src, &k, &k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_kernel_properties() {
        let k = gaussian_kernel_1d(2, 1.0);
        assert_eq!(k.len(), 5);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((k[0] - k[4]).abs() < 1e-6);
        assert!(k[2] > k[1] && k[1] > k[0]);
    }

    #[test]
    fn test_identity_kernel_rgba() {
        let img = Image::from_fn(4, 3, |x, y| [(x * 50) as u8, (y * 70) as u8, 9, 255]);
        let kernel = [0.0, 0.0, 1.0, 0.0, 0.0];
        let out = convolve_separable(&img, &kernel, &kernel);
        assert_eq!(out, img);
    }

    #[test]
    fn test_constant_flow_unchanged() {
        let flow = Image::filled(7, 5, [1.5f32, -2.0]);
        let out = gaussian_blur(&flow, 2, 1.0);
        for (x, y, v) in out.pixels() {
            assert!((v[0] - 1.5).abs() < 1e-5, "dx changed at ({x},{y})");
            assert!((v[1] + 2.0).abs() < 1e-5, "dy changed at ({x},{y})");
        }
    }

    #[test]
    fn test_blur_reduces_variance() {
        let img = Image::from_fn(8, 8, |x, y| if (x + y) % 2 == 0 { 255.0f32 } else { 0.0 });
        let blurred = gaussian_blur(&img, 2, 1.0);

        let var = |img: &Image<f32>| {
            let n = (img.width() * img.height()) as f32;
            let mean: f32 = img.pixels().map(|(_, _, v)| v).sum::<f32>() / n;
            img.pixels().map(|(_, _, v)| (v - mean) * (v - mean)).sum::<f32>() / n
        };
        assert!(var(&blurred) < var(&img), "variance should decrease after blur");
    }

    #[test]
    fn test_clamp_border() {
        // At x=0 the left tap replicates pixel 0: 0.25*10 + 0.5*10 + 0.25*20.
        let img = Image::from_vec(3, 1, vec![10.0f32, 20.0, 30.0]);
        let out = convolve_rows(&img, &[0.25, 0.5, 0.25]);
        assert!((out.get(0, 0) - 12.5).abs() < 1e-6);
    }

    #[test]
    fn test_single_pixel() {
        let img = Image::from_vec(1, 1, vec![42.0f32]);
        let out = gaussian_blur(&img, 2, 1.0);
        assert!((out.get(0, 0) - 42.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_half_size_is_copy() {
        let img = Image::from_vec(2, 1, vec![1.0f32, 2.0]);
        assert_eq!(gaussian_blur(&img, 0, 1.0), img);
    }

    #[test]
    #[should_panic(expected = "odd")]
    fn test_even_kernel_panics() {
        let img = Image::from_vec(4, 4, vec![0.0f32; 16]);
        convolve_rows(&img, &[0.5, 0.5]);
    }
}

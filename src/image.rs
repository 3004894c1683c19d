// image.rs — Runtime-sized image container, generic over pixel type.
//
// Every buffer the stitching pipeline touches is an `Image<T>`:
//
// ┌──────────────────┬──────────────┬───────────────────────────────────┐
// │  alias           │  pixel       │  role                             │
// ├──────────────────┼──────────────┼───────────────────────────────────┤
// │  ColorImage      │  [u8; 4]     │  camera input, panorama chunk     │
// │  GreyImage       │  f32         │  intensity in [0, 1], gradients   │
// │  AlphaMask       │  f32         │  coverage / trust in [0, 1]       │
// │  FlowField       │  [f32; 2]    │  displacement A → B, in pixels    │
// │  WarpTable       │  [f32; 3]    │  lazy warp (x, y, t)              │
// │  LinearImage     │  [u16; 4]    │  anti-gamma colour, 16-bit        │
// └──────────────────┴──────────────┴───────────────────────────────────┘
//
// Kernels are written once against the `Pixel` trait and work on any of
// these. A pixel exposes up to four f32 "lanes"; single-channel types use
// lane 0 only. Lanes are raw values (a u8 of 200 is lane value 200.0).
//
// Sharing: camera images and previous-frame caches are handed between
// threads as `Arc<ColorImage>` (cheap clone, shared backing storage). A
// task that needs to mutate takes its own owned copy.
//
// Accounting: an image allocated while a `BufferPool` is in scope on the
// current thread (see `BufferPool::scope`) holds a lease for its bytes
// until it is dropped. Outside any scope images are untracked.

use std::fmt;

use crate::budget::{lease_in_scope, BufferLease};

// ---------------------------------------------------------------------------
// Pixel Trait
// ---------------------------------------------------------------------------

/// Trait for types that can serve as pixel values in an Image.
///
/// `Send + Sync + 'static` let images move into worker threads.
pub trait Pixel: Copy + Default + PartialEq + Send + Sync + 'static {
    /// Number of meaningful lanes (1..=4).
    const CHANNELS: usize;

    /// Expand to four f32 lanes. Unused lanes are 0.
    fn to_lanes(self) -> [f32; 4];

    /// Build a pixel from four f32 lanes, clamping/rounding integer types.
    fn from_lanes(lanes: [f32; 4]) -> Self;
}

impl Pixel for u8 {
    const CHANNELS: usize = 1;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        [self as f32, 0.0, 0.0, 0.0]
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        l[0].clamp(0.0, 255.0).round() as u8
    }
}

impl Pixel for f32 {
    const CHANNELS: usize = 1;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        [self, 0.0, 0.0, 0.0]
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        l[0]
    }
}

impl Pixel for [u8; 4] {
    const CHANNELS: usize = 4;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        [self[0] as f32, self[1] as f32, self[2] as f32, self[3] as f32]
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        [
            l[0].clamp(0.0, 255.0).round() as u8,
            l[1].clamp(0.0, 255.0).round() as u8,
            l[2].clamp(0.0, 255.0).round() as u8,
            l[3].clamp(0.0, 255.0).round() as u8,
        ]
    }
}

impl Pixel for [u16; 4] {
    const CHANNELS: usize = 4;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        [self[0] as f32, self[1] as f32, self[2] as f32, self[3] as f32]
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        [
            l[0].clamp(0.0, 65535.0).round() as u16,
            l[1].clamp(0.0, 65535.0).round() as u16,
            l[2].clamp(0.0, 65535.0).round() as u16,
            l[3].clamp(0.0, 65535.0).round() as u16,
        ]
    }
}

impl Pixel for [f32; 2] {
    const CHANNELS: usize = 2;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        [self[0], self[1], 0.0, 0.0]
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        [l[0], l[1]]
    }
}

impl Pixel for [f32; 3] {
    const CHANNELS: usize = 3;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        [self[0], self[1], self[2], 0.0]
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        [l[0], l[1], l[2]]
    }
}

impl Pixel for [f32; 4] {
    const CHANNELS: usize = 4;

    #[inline]
    fn to_lanes(self) -> [f32; 4] {
        self
    }

    #[inline]
    fn from_lanes(l: [f32; 4]) -> Self {
        l
    }
}

/// 8-bit RGBA colour image (straight, non-premultiplied alpha).
pub type ColorImage = Image<[u8; 4]>;
/// Single-channel float image (intensity, gradient, motion).
pub type GreyImage = Image<f32>;
/// Per-pixel trust in [0, 1].
pub type AlphaMask = Image<f32>;
/// Per-pixel displacement (dx, dy) from image A to image B.
pub type FlowField = Image<[f32; 2]>;
/// Per-destination-pixel (source x, source y, blend time t).
pub type WarpTable = Image<[f32; 3]>;
/// 16-bit linear (anti-gamma) RGBA.
pub type LinearImage = Image<[u16; 4]>;

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions, generic over pixel type `T`.
///
/// Row-major and tightly packed: pixel (x, y) lives at `y * width + x`.
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
    lease: Option<BufferLease>,
}

// Manual Clone: this is a deep copy of the pixel buffer, leased anew. Share
// with `Arc<Image<T>>` when a cheap handle is wanted.
impl<T: Pixel> Clone for Image<T> {
    fn clone(&self) -> Self {
        Image::from_parts(self.data.clone(), self.width, self.height)
    }
}

impl<T: Pixel> Default for Image<T> {
    /// The empty 0×0 image. Used for "no previous frame" slots.
    fn default() -> Self {
        Image { data: Vec::new(), width: 0, height: 0, lease: None }
    }
}

impl<T: Pixel> PartialEq for Image<T> {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height && self.data == other.data
    }
}

impl<T: Pixel> Image<T> {
    // Every constructor ends here.
    fn from_parts(data: Vec<T>, width: usize, height: usize) -> Self {
        let bytes = (data.len() * std::mem::size_of::<T>()) as u64;
        Image { data, width, height, lease: lease_in_scope(bytes) }
    }

    /// Create a zero-initialized image with the given dimensions.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, T::default())
    }

    /// Create an image with every pixel set to `value`.
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image::from_parts(vec![value; width * height], width, height)
    }

    /// Create an image from an existing pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image::from_parts(data, width, height)
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image::from_parts(data, width, height)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`.
    #[inline]
    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// True for the 0×0 image (or any image with a zero dimension).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True when both images have identical dimensions.
    #[inline]
    pub fn same_size<U: Pixel>(&self, other: &Image<U>) -> bool {
        self.width == other.width() && self.height == other.height()
    }

    /// Bytes occupied by the pixel buffer.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }

    /// Get the pixel value at (x, y). x is column, y is row.
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// Get pixel value without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, x: usize, y: usize) -> T {
        debug_assert!(x < self.width && y < self.height,
            "get_unchecked({x},{y}) out of bounds for {}x{}", self.width, self.height);
        *self.data.get_unchecked(y * self.width + x)
    }

    /// Set pixel value without bounds checking.
    ///
    /// # Safety
    /// Caller must guarantee x < width and y < height.
    #[inline(always)]
    pub unsafe fn set_unchecked(&mut self, x: usize, y: usize, value: T) {
        debug_assert!(x < self.width && y < self.height);
        *self.data.get_unchecked_mut(y * self.width + x) = value;
    }

    /// Set the pixel at (x, y).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        self.data[idx] = value;
    }

    /// Clamped read: coordinates outside the image are replaced by the
    /// nearest edge pixel.
    #[inline]
    pub fn get_clamped(&self, x: isize, y: isize) -> T {
        let cx = x.clamp(0, self.width as isize - 1) as usize;
        let cy = y.clamp(0, self.height as isize - 1) as usize;
        self.data[cy * self.width + cx]
    }

    /// Borrow a single row as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Mutable borrow of a single row.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &mut self.data[start..start + self.width]
    }

    /// Iterate over all pixels as `(x, y, value)` tuples.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        let w = self.width.max(1);
        self.data.iter().enumerate().map(move |(i, &v)| (i % w, i / w, v))
    }

    /// Apply `f` to every pixel, producing a new image of another pixel type.
    pub fn map<U: Pixel>(&self, mut f: impl FnMut(T) -> U) -> Image<U> {
        Image::from_parts(self.data.iter().map(|&v| f(v)).collect(), self.width, self.height)
    }

    /// Combine two equally-sized images pixel by pixel.
    ///
    /// # Panics
    /// Panics if the images differ in size.
    pub fn zip_map<U: Pixel, V: Pixel>(
        &self,
        other: &Image<U>,
        mut f: impl FnMut(T, U) -> V,
    ) -> Image<V> {
        assert!(
            self.same_size(other),
            "zip_map size mismatch: {}×{} vs {}×{}",
            self.width, self.height, other.width(), other.height(),
        );
        let data = self.data.iter().zip(other.as_slice()).map(|(&a, &b)| f(a, b)).collect();
        Image::from_parts(data, self.width, self.height)
    }

    /// Access the underlying data as a flat slice.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable access to the underlying data.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Whether this buffer is counted against a `BufferPool`.
    pub fn is_tracked(&self) -> bool {
        self.lease.is_some()
    }

    /// Stop counting this buffer against its pool. For buffers whose bytes
    /// another lease already covers, such as previous-frame caches.
    pub fn detached(mut self) -> Self {
        self.lease = None;
        self
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

// Debug formatting — useful for small images in tests.
impl<T: Pixel + fmt::Debug> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{} }}",
            std::any::type_name::<T>(),
            self.width,
            self.height,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(8) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 8 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Pixel> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.width + x]
    }
}

impl<T: Pixel> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.width + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Sub-pixel sampling
// ---------------------------------------------------------------------------

/// What a sample reads when a tap falls outside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Border {
    /// Replicate the nearest edge pixel.
    Replicate,
    /// Read zero in every lane (fully transparent for colour images).
    Transparent,
}

#[inline]
fn fetch<T: Pixel>(img: &Image<T>, x: isize, y: isize, border: Border) -> [f32; 4] {
    match border {
        Border::Replicate => img.get_clamped(x, y).to_lanes(),
        Border::Transparent => {
            if x < 0 || y < 0 || x >= img.width() as isize || y >= img.height() as isize {
                [0.0; 4]
            } else {
                // SAFETY: bounds checked just above.
                unsafe { img.get_unchecked(x as usize, y as usize).to_lanes() }
            }
        }
    }
}

#[inline]
fn madd(acc: &mut [f32; 4], v: [f32; 4], w: f32) {
    for c in 0..4 {
        acc[c] += v[c] * w;
    }
}

/// Bilinear interpolation at floating-point coordinates, all lanes.
///
/// # Panics
/// Panics if the image is empty.
pub fn sample_bilinear<T: Pixel>(img: &Image<T>, x: f32, y: f32, border: Border) -> [f32; 4] {
    assert!(!img.is_empty(), "cannot interpolate on an empty image");

    let x0f = x.floor();
    let y0f = y.floor();
    let fx = x - x0f;
    let fy = y - y0f;
    let x0 = x0f as isize;
    let y0 = y0f as isize;

    let mut acc = [0.0f32; 4];
    madd(&mut acc, fetch(img, x0, y0, border), (1.0 - fx) * (1.0 - fy));
    madd(&mut acc, fetch(img, x0 + 1, y0, border), fx * (1.0 - fy));
    madd(&mut acc, fetch(img, x0, y0 + 1, border), (1.0 - fx) * fy);
    madd(&mut acc, fetch(img, x0 + 1, y0 + 1, border), fx * fy);
    acc
}

/// Bilinear interpolation on a single-channel f32 image with edge clamping.
#[inline]
pub fn interpolate_bilinear(img: &Image<f32>, x: f32, y: f32) -> f32 {
    sample_bilinear(img, x, y, Border::Replicate)[0]
}

/// Cubic convolution weights for fractional offset `t` (a = -0.75).
///
/// At `t == 0` the weights are exactly `[0, 1, 0, 0]`, so sampling at
/// integer coordinates reproduces the source pixel bit-for-bit.
#[inline]
pub(crate) fn cubic_weights(t: f32) -> [f32; 4] {
    const A: f32 = -0.75;
    let w0 = ((A * (t + 1.0) - 5.0 * A) * (t + 1.0) + 8.0 * A) * (t + 1.0) - 4.0 * A;
    let w1 = ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0;
    let u = 1.0 - t;
    let w2 = ((A + 2.0) * u - (A + 3.0)) * u * u + 1.0;
    let w3 = 1.0 - w0 - w1 - w2;
    [w0, w1, w2, w3]
}

/// Bicubic interpolation at floating-point coordinates, all lanes.
pub fn sample_bicubic<T: Pixel>(img: &Image<T>, x: f32, y: f32, border: Border) -> [f32; 4] {
    assert!(!img.is_empty(), "cannot interpolate on an empty image");

    let x0f = x.floor();
    let y0f = y.floor();
    let wx = cubic_weights(x - x0f);
    let wy = cubic_weights(y - y0f);
    let x0 = x0f as isize;
    let y0 = y0f as isize;

    let mut acc = [0.0f32; 4];
    for (j, &wyj) in wy.iter().enumerate() {
        if wyj == 0.0 {
            continue;
        }
        let sy = y0 - 1 + j as isize;
        let mut row = [0.0f32; 4];
        for (i, &wxi) in wx.iter().enumerate() {
            if wxi == 0.0 {
                continue;
            }
            madd(&mut row, fetch(img, x0 - 1 + i as isize, sy, border), wxi);
        }
        madd(&mut acc, row, wyj);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_zero_initialized() {
        let img: Image<u8> = Image::new(10, 5);
        assert_eq!(img.size(), (10, 5));
        for (_, _, v) in img.pixels() {
            assert_eq!(v, 0u8);
        }
    }

    #[test]
    fn test_default_is_empty() {
        let img: FlowField = Image::default();
        assert!(img.is_empty());
        assert_eq!(img.byte_size(), 0);
    }

    #[test]
    fn test_from_vec_layout() {
        let data: Vec<u8> = (0..12).collect();
        let img = Image::from_vec(4, 3, data);
        assert_eq!(img.get(0, 0), 0);
        assert_eq!(img.get(3, 0), 3);
        assert_eq!(img.get(0, 1), 4);
        assert_eq!(img.get(3, 2), 11);
        assert_eq!(img.row(1), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_byte_size_multichannel() {
        let flow: FlowField = Image::new(4, 4);
        assert_eq!(flow.byte_size(), 4 * 4 * 8);
        let warp: WarpTable = Image::new(2, 3);
        assert_eq!(warp.byte_size(), 2 * 3 * 12);
    }

    #[test]
    fn test_images_lease_while_pool_in_scope() {
        let pool = crate::budget::BufferPool::new();
        let before: FlowField = Image::new(4, 4);
        assert!(!before.is_tracked());
        {
            let _scope = pool.scope();
            let a: FlowField = Image::new(4, 4);
            let b = a.clone();
            assert!(a.is_tracked() && b.is_tracked());
            assert_eq!(pool.live(), 2 * 4 * 4 * 8);
            let b = b.detached();
            assert_eq!(pool.live(), 4 * 4 * 8);
            drop((a, b));
        }
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.reserved(), 2 * 4 * 4 * 8);
        let after: FlowField = Image::new(4, 4);
        assert!(!after.is_tracked());
    }

    #[test]
    fn test_rgba_lanes_clamp() {
        let p = <[u8; 4]>::from_lanes([-3.0, 127.6, 300.0, 255.0]);
        assert_eq!(p, [0, 128, 255, 255]);
    }

    #[test]
    fn test_pixels_iterator_order() {
        let img = Image::from_vec(3, 2, (0u8..6).collect());
        let px: Vec<_> = img.pixels().collect();
        assert_eq!(px[0], (0, 0, 0));
        assert_eq!(px[2], (2, 0, 2));
        assert_eq!(px[3], (0, 1, 3));
    }

    #[test]
    fn test_bilinear_midpoint() {
        let img = Image::from_vec(2, 2, vec![0.0f32, 10.0, 20.0, 30.0]);
        assert!((interpolate_bilinear(&img, 0.5, 0.5) - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_boundary_clamp() {
        let img = Image::from_vec(2, 2, vec![1.0f32, 2.0, 3.0, 4.0]);
        assert!((interpolate_bilinear(&img, 5.0, 5.0) - 4.0).abs() < 1e-6);
        assert!((interpolate_bilinear(&img, -1.0, -1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_transparent_border_reads_zero() {
        let img = Image::filled(2, 2, [200u8, 100, 50, 255]);
        let outside = sample_bilinear(&img, -5.0, 0.0, Border::Transparent);
        assert_eq!(outside, [0.0; 4]);
        let cubic = sample_bicubic(&img, 10.0, 10.0, Border::Transparent);
        assert_eq!(cubic, [0.0; 4]);
    }

    #[test]
    fn test_cubic_weights_partition_of_unity() {
        for i in 0..10 {
            let t = i as f32 / 10.0;
            let w = cubic_weights(t);
            assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert_eq!(cubic_weights(0.0), [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bicubic_integer_coordinates_exact() {
        let img = Image::from_fn(5, 4, |x, y| [(x * 40) as u8, (y * 60) as u8, 7, 255]);
        for y in 0..4 {
            for x in 0..5 {
                let s = sample_bicubic(&img, x as f32, y as f32, Border::Transparent);
                assert_eq!(<[u8; 4]>::from_lanes(s), img.get(x, y), "at ({x},{y})");
            }
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds() {
        let img: Image<u8> = Image::new(4, 4);
        img.get(4, 0);
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_zip_map_size_mismatch() {
        let a: Image<f32> = Image::new(2, 2);
        let b: Image<f32> = Image::new(3, 2);
        let _ = a.zip_map(&b, |x, y| x + y);
    }
}

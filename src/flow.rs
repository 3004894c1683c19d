// flow.rs — Dense optical flow between two overlapping camera images.
//
// Given RGBA images A and B, estimate F such that A(p) ≈ B(p + F(p)).
//
// Pipeline (each stage is one named kernel launch on the caller's queue):
//
//   flow_downscale            A, B (and previous frame) resized by 0.5
//   flow_temporal_smooth      current frame pulled toward the previous one
//   flow_motion               |B - B_prev| per pixel
//   flow_pre_blur             grey intensity + alpha, small Gaussian
//   flow_pyramid              ratio-0.9 pyramids of everything above
//   ┌ for each level, coarsest → finest ───────────────────────────────┐
//   │ flow_hint_search        (coarsest only) directed rectangle search │
//   │ flow_gradient           blurred Sobel gradients of A and B        │
//   │ flow_blur               regularization target                     │
//   │ flow_sweep ×2           left→right, top→bottom                    │
//   │ flow_median                                                      │
//   │ flow_sweep ×2(+2)       right→left, bottom→top (+ diagonals)      │
//   │ flow_median                                                      │
//   │ flow_temporal_regularize (previous frame only)                    │
//   │ flow_fill_low_alpha                                              │
//   │ flow_upscale            to the next level                         │
//   └──────────────────────────────────────────────────────────────────┘
//   flow_upscale, flow_final_blur   back to input size
//
// SWEEP SOLVER
// ------------
// A sweep visits every pixel in a fixed order. At each trusted pixel it
// compares the current vector with the vector of the neighbour visited just
// before it (propagation), keeps the one with the lower energy, then takes
// one damped Gauss–Newton step from there and keeps it if the energy drops.
// Updates happen in place, so a good vector can travel across the whole
// image in one sweep.
//
//   E(p, f) = (A(p) - B(p+f))²
//           + w_g · |∇A(p) - ∇B(p+f)|²
//           + λ · |f - f̄(p)|²              f̄ = blurred flow (target)
//           + w_v · f_y²
//
// Linearizing B(p+f+δ) ≈ B(p+f) + ∇B·δ, the step solves
//
//   (∇B ∇Bᵀ + diag(λ, λ + w_v)) δ = ∇B · d - λ (f - f̄) - (0, w_v f_y)
//
// with d = A(p) - B(p+f). The step is capped at one pixel.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::FlowParams;
use crate::convert::{channel_abs_diff, rgb_abs_diff, rgba_alpha, rgba_to_grey};
use crate::convolution::gaussian_blur;
use crate::gradient::sobel_xy;
use crate::image::{
    interpolate_bilinear, sample_bilinear, AlphaMask, Border, ColorImage, FlowField, GreyImage,
    Image, Pixel,
};
use crate::median::median_filter_flow;
use crate::pyramid::{level_sizes, Pyramid};
use crate::remap::{rescale_flow, resize, scaled_size};
use crate::runtime::CommandQueue;

/// Expected direction of the A → B displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionHint {
    Right,
    Down,
    Left,
    Up,
    #[default]
    Unknown,
}

/// The previous frame of the same camera pair.
#[derive(Clone, Copy)]
pub struct PreviousFrame<'a> {
    pub flow: &'a FlowField,
    pub image_a: &'a ColorImage,
    pub image_b: &'a ColorImage,
}

/// Temporal thresholds, both in normalized [0, 1] colour distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalThresholds {
    /// Motion above this leaves the fresh estimate untouched.
    pub motion: f32,
    /// Frame differences below this are smoothed toward the previous frame.
    pub smooth: f32,
}

/// Multi-resolution sweep-based optical flow.
#[derive(Debug, Clone)]
pub struct OpticalFlowEngine {
    params: FlowParams,
}

type GradientImage = Image<[f32; 2]>;

impl OpticalFlowEngine {
    pub fn new(params: FlowParams) -> Self {
        OpticalFlowEngine { params }
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }

    /// Pyramid geometry used for an input of `width × height`.
    pub fn level_sizes(&self, width: usize, height: usize) -> Vec<(usize, usize)> {
        let (dw, dh) = scaled_size(width, height, self.params.downscale);
        level_sizes(dw, dh, self.params.pyramid_ratio, self.params.min_level_size, self.params.max_levels)
    }

    /// Flow from `image_a` to `image_b`, same size as the inputs.
    ///
    /// `previous` enables temporal regularization. A previous frame with an
    /// empty flow is treated as absent.
    ///
    /// # Panics
    /// Panics if an input is empty, if A and B differ in size, or if a
    /// supplied previous flow or previous image differs in size from the
    /// current images.
    pub fn compute_flow(
        &self,
        queue: &mut CommandQueue,
        image_a: &ColorImage,
        image_b: &ColorImage,
        previous: Option<PreviousFrame<'_>>,
        hint: DirectionHint,
        thresholds: TemporalThresholds,
    ) -> FlowField {
        assert!(!image_a.is_empty() && !image_b.is_empty(), "flow inputs must be non-empty");
        assert!(
            image_a.same_size(image_b),
            "flow inputs differ in size: {}×{} vs {}×{}",
            image_a.width(), image_a.height(), image_b.width(), image_b.height(),
        );

        let p = &self.params;
        let (w, h) = image_a.size();
        let (dw, dh) = scaled_size(w, h, p.downscale);
        let global = [dw, dh];

        let mut a = queue.launch("flow_downscale", global, || resize(image_a, dw, dh));
        let mut b = queue.launch("flow_downscale", global, || resize(image_b, dw, dh));

        let previous = previous.filter(|prev| !prev.flow.is_empty());
        let temporal = match previous {
            Some(prev) => {
                assert!(
                    prev.flow.same_size(image_a),
                    "previous flow {}×{} must match the current image {}×{}",
                    prev.flow.width(), prev.flow.height(), w, h,
                );
                assert!(
                    prev.image_a.same_size(image_a) && prev.image_b.same_size(image_b),
                    "previous images must match the current image size {w}×{h}",
                );
                let prev_flow = queue.launch("flow_downscale", global, || rescale_flow(prev.flow, dw, dh));
                let prev_a = queue.launch("flow_downscale", global, || resize(prev.image_a, dw, dh));
                let prev_b = queue.launch("flow_downscale", global, || resize(prev.image_b, dw, dh));
                queue.launch("flow_temporal_smooth", global, || {
                    smooth_toward(&mut a, &prev_a, thresholds.smooth);
                    smooth_toward(&mut b, &prev_b, thresholds.smooth);
                });
                let motion = queue.launch("flow_motion", global, || channel_abs_diff(&b, &prev_b));
                Some((prev_flow, motion))
            }
            None => None,
        };

        let (grey_a, grey_b, alpha_a, alpha_b) = queue.launch("flow_pre_blur", global, || {
            (
                gaussian_blur(&rgba_to_grey(&a), 1, p.pre_blur_sigma),
                gaussian_blur(&rgba_to_grey(&b), 1, p.pre_blur_sigma),
                rgba_alpha(&a),
                rgba_alpha(&b),
            )
        });
        drop((a, b));

        let sizes = level_sizes(dw, dh, p.pyramid_ratio, p.min_level_size, p.max_levels);
        let num_levels = sizes.len();
        let (pyr_a, pyr_b, pyr_alpha_a, pyr_alpha_b) = queue.launch("flow_pyramid", global, || {
            (
                Pyramid::build(&grey_a, &sizes),
                Pyramid::build(&grey_b, &sizes),
                Pyramid::build(&alpha_a, &sizes),
                Pyramid::build(&alpha_b, &sizes),
            )
        });
        let temporal = temporal.map(|(prev_flow, motion)| {
            queue.launch("flow_pyramid", global, || {
                (Pyramid::build_flow(&prev_flow, &sizes), Pyramid::build(&motion, &sizes))
            })
        });

        trace!(levels = num_levels, width = dw, height = dh, temporal = temporal.is_some(), "flow pyramid");

        let mut flow = FlowField::default();
        for level in (0..num_levels).rev() {
            let (lw, lh) = sizes[level];
            let g = [lw, lh];
            let ia = pyr_a.level(level);
            let ib = pyr_b.level(level);
            let alpha_a = pyr_alpha_a.level(level);
            let alpha_b = pyr_alpha_b.level(level);

            let mut f = if flow.is_empty() {
                match hint {
                    DirectionHint::Unknown => FlowField::new(lw, lh),
                    _ => queue.launch("flow_hint_search", g, || {
                        hint_search(ia, ib, alpha_a, alpha_b, hint, p)
                    }),
                }
            } else {
                std::mem::take(&mut flow)
            };

            let (grad_a, grad_b) = queue.launch("flow_gradient", g, || {
                (
                    blurred_gradient(ia, p.gradient_blur_sigma),
                    blurred_gradient(ib, p.gradient_blur_sigma),
                )
            });
            let target = queue.launch("flow_blur", g, || {
                gaussian_blur(&f, p.flow_blur_radius, p.flow_blur_sigma)
            });

            let solver = LevelSolver {
                ia,
                ib,
                alpha_a,
                alpha_b,
                grad_a: &grad_a,
                grad_b: &grad_b,
                target: &target,
                smoothness: p.smoothing.at(level, num_levels),
                gradient_weight: p.gradient_weight,
                vertical_weight: p.vertical_weight,
                alpha_threshold: p.update_alpha_threshold,
            };

            for dir in [Sweep::LeftToRight, Sweep::TopToBottom] {
                queue.launch("flow_sweep", g, || solver.sweep(&mut f, dir));
            }
            f = queue.launch("flow_median", g, || median_filter_flow(&f, p.median_width));
            for dir in [Sweep::RightToLeft, Sweep::BottomToTop] {
                queue.launch("flow_sweep", g, || solver.sweep(&mut f, dir));
            }
            if lw * lh <= p.diagonal_sweep_max_area {
                for dir in [Sweep::DiagonalDown, Sweep::DiagonalUp] {
                    queue.launch("flow_sweep", g, || solver.sweep(&mut f, dir));
                }
            }
            f = queue.launch("flow_median", g, || median_filter_flow(&f, p.median_width));

            if let Some((prev_flow, motion)) = &temporal {
                queue.launch("flow_temporal_regularize", g, || {
                    temporal_blend(&mut f, prev_flow.level(level), motion.level(level), thresholds.motion)
                });
            }

            queue.launch("flow_fill_low_alpha", g, || {
                fill_low_alpha(&mut f, alpha_a, p.flow_blur_radius, p.flow_blur_sigma)
            });

            flow = if level > 0 {
                let (nw, nh) = sizes[level - 1];
                queue.launch("flow_upscale", [nw, nh], || rescale_flow(&f, nw, nh))
            } else {
                f
            };
        }

        let full = queue.launch("flow_upscale", [w, h], || rescale_flow(&flow, w, h));
        queue.launch("flow_final_blur", [w, h], || {
            gaussian_blur(&full, p.final_blur_radius, p.final_blur_sigma)
        })
    }
}

/// Pull `cur` toward `prev` where the two differ by less than `threshold`.
///
/// The blend weight grows linearly with the difference, so identical pixels
/// take the previous value and pixels at the threshold keep their own.
fn smooth_toward(cur: &mut ColorImage, prev: &ColorImage, threshold: f32) {
    if threshold <= 0.0 {
        return;
    }
    for (c, &p) in cur.as_mut_slice().iter_mut().zip(prev.as_slice()) {
        let d = rgb_abs_diff(*c, p);
        if d < threshold {
            let k = d / threshold;
            let cl = c.to_lanes();
            let pl = p.to_lanes();
            let mut out = [0.0f32; 4];
            for i in 0..4 {
                out[i] = pl[i] + (cl[i] - pl[i]) * k;
            }
            *c = <[u8; 4]>::from_lanes(out);
        }
    }
}

fn blurred_gradient(img: &GreyImage, sigma: f32) -> GradientImage {
    gaussian_blur(&sobel_xy(img), 1, sigma)
}

/// Blend toward the previous frame's flow. Weight 1 where there was no
/// motion, falling to 0 at `threshold`.
fn temporal_blend(flow: &mut FlowField, prev: &FlowField, motion: &GreyImage, threshold: f32) {
    for ((f, &pf), &m) in flow.as_mut_slice().iter_mut().zip(prev.as_slice()).zip(motion.as_slice()) {
        let w = if threshold > 0.0 { (1.0 - m / threshold).clamp(0.0, 1.0) } else { 0.0 };
        f[0] = f[0] * (1.0 - w) + pf[0] * w;
        f[1] = f[1] * (1.0 - w) + pf[1] * w;
    }
}

/// Replace flow in low-coverage areas by its local average.
fn fill_low_alpha(flow: &mut FlowField, alpha: &AlphaMask, radius: usize, sigma: f32) {
    let blurred = gaussian_blur(flow, radius, sigma);
    for ((f, &b), &a) in flow.as_mut_slice().iter_mut().zip(blurred.as_slice()).zip(alpha.as_slice()) {
        let a = a.clamp(0.0, 1.0);
        f[0] = b[0] * (1.0 - a) + f[0] * a;
        f[1] = b[1] * (1.0 - a) + f[1] * a;
    }
}

/// Mean of `img` over pixels whose `alpha` exceeds `threshold`.
fn trusted_mean(img: &GreyImage, alpha: &AlphaMask, threshold: f32) -> Option<f32> {
    let (sum, n) = img
        .as_slice()
        .iter()
        .zip(alpha.as_slice())
        .filter(|&(_, &a)| a > threshold)
        .fold((0.0f64, 0usize), |(s, n), (&v, _)| (s + v as f64, n + 1));
    (n > 0).then(|| (sum / n as f64) as f32)
}

/// Integer displacement search inside a rectangle stretched along the hint.
///
/// Each trusted pixel of A picks the offset whose 3×3 patch best matches B
/// after B is scaled by the global brightness ratio mean(A) / mean(B).
/// Ties go to the shorter offset, so flat regions stay at zero.
fn hint_search(
    ia: &GreyImage,
    ib: &GreyImage,
    alpha_a: &AlphaMask,
    alpha_b: &AlphaMask,
    hint: DirectionHint,
    p: &FlowParams,
) -> FlowField {
    let (w, h) = ia.size();
    let thr = p.update_alpha_threshold;
    let ratio = match (trusted_mean(ia, alpha_a, thr), trusted_mean(ib, alpha_b, thr)) {
        (Some(ma), Some(mb)) if mb > 1e-6 => ma / mb,
        _ => 1.0,
    };

    let reach_x = (w as f32 * p.hint_search_fraction).ceil() as isize;
    let reach_y = (h as f32 * p.hint_search_fraction).ceil() as isize;
    let cross = p.hint_search_cross as isize;
    let (xs, ys) = match hint {
        DirectionHint::Right => ((0, reach_x), (-cross, cross)),
        DirectionHint::Left => ((-reach_x, 0), (-cross, cross)),
        DirectionHint::Down => ((-cross, cross), (0, reach_y)),
        DirectionHint::Up => ((-cross, cross), (-reach_y, 0)),
        DirectionHint::Unknown => return FlowField::new(w, h),
    };

    let patch_cost = |x: isize, y: isize, qx: isize, qy: isize| -> f32 {
        let mut cost = 0.0;
        for oy in -1..=1 {
            for ox in -1..=1 {
                let d = ia.get_clamped(x + ox, y + oy) - ratio * ib.get_clamped(qx + ox, qy + oy);
                cost += d * d;
            }
        }
        cost
    };

    FlowField::from_fn(w, h, |x, y| {
        if alpha_a.get(x, y) <= thr {
            return [0.0, 0.0];
        }
        let (x, y) = (x as isize, y as isize);
        let mut best = (0isize, 0isize);
        let mut best_cost = f32::INFINITY;
        for dy in ys.0..=ys.1 {
            for dx in xs.0..=xs.1 {
                let (qx, qy) = (x + dx, y + dy);
                if qx < 0 || qy < 0 || qx >= w as isize || qy >= h as isize {
                    continue;
                }
                if alpha_b.get(qx as usize, qy as usize) <= thr {
                    continue;
                }
                let cost = patch_cost(x, y, qx, qy);
                let shorter = dx.abs() + dy.abs() < best.0.abs() + best.1.abs();
                if cost < best_cost || (cost == best_cost && shorter) {
                    best = (dx, dy);
                    best_cost = cost;
                }
            }
        }
        [best.0 as f32, best.1 as f32]
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    LeftToRight,
    TopToBottom,
    RightToLeft,
    BottomToTop,
    DiagonalDown,
    DiagonalUp,
}

/// Everything one pyramid level's sweeps read.
struct LevelSolver<'a> {
    ia: &'a GreyImage,
    ib: &'a GreyImage,
    alpha_a: &'a AlphaMask,
    alpha_b: &'a AlphaMask,
    grad_a: &'a GradientImage,
    grad_b: &'a GradientImage,
    target: &'a FlowField,
    smoothness: f32,
    gradient_weight: f32,
    vertical_weight: f32,
    alpha_threshold: f32,
}

impl LevelSolver<'_> {
    fn sweep(&self, flow: &mut FlowField, dir: Sweep) {
        let (w, h) = flow.size();
        match dir {
            Sweep::LeftToRight => {
                for y in 0..h {
                    for x in 0..w {
                        self.update(flow, x, y, (x > 0).then(|| (x - 1, y)));
                    }
                }
            }
            Sweep::TopToBottom => {
                for y in 0..h {
                    for x in 0..w {
                        self.update(flow, x, y, (y > 0).then(|| (x, y - 1)));
                    }
                }
            }
            Sweep::RightToLeft => {
                for y in 0..h {
                    for x in (0..w).rev() {
                        self.update(flow, x, y, (x + 1 < w).then(|| (x + 1, y)));
                    }
                }
            }
            Sweep::BottomToTop => {
                for y in (0..h).rev() {
                    for x in 0..w {
                        self.update(flow, x, y, (y + 1 < h).then(|| (x, y + 1)));
                    }
                }
            }
            Sweep::DiagonalDown => {
                for y in 0..h {
                    for x in 0..w {
                        self.update(flow, x, y, (x > 0 && y > 0).then(|| (x - 1, y - 1)));
                    }
                }
            }
            Sweep::DiagonalUp => {
                for y in (0..h).rev() {
                    for x in (0..w).rev() {
                        self.update(flow, x, y, (x + 1 < w && y + 1 < h).then(|| (x + 1, y + 1)));
                    }
                }
            }
        }
    }

    #[inline]
    fn trusted_target(&self, x: usize, y: usize, v: [f32; 2]) -> bool {
        let a = sample_bilinear(self.alpha_b, x as f32 + v[0], y as f32 + v[1], Border::Transparent);
        a[0] > self.alpha_threshold
    }

    fn energy(&self, x: usize, y: usize, v: [f32; 2]) -> f32 {
        let qx = x as f32 + v[0];
        let qy = y as f32 + v[1];
        let d = self.ia.get(x, y) - interpolate_bilinear(self.ib, qx, qy);
        let ga = self.grad_a.get(x, y);
        let gb = sample_bilinear(self.grad_b, qx, qy, Border::Replicate);
        let (gx, gy) = (ga[0] - gb[0], ga[1] - gb[1]);
        let t = self.target.get(x, y);
        let (rx, ry) = (v[0] - t[0], v[1] - t[1]);
        d * d
            + self.gradient_weight * (gx * gx + gy * gy)
            + self.smoothness * (rx * rx + ry * ry)
            + self.vertical_weight * v[1] * v[1]
    }

    /// One damped Gauss–Newton step from `f`, or `None` if the system is
    /// singular or the step is zero.
    fn gauss_newton(&self, x: usize, y: usize, f: [f32; 2]) -> Option<[f32; 2]> {
        let qx = x as f32 + f[0];
        let qy = y as f32 + f[1];
        let d = self.ia.get(x, y) - interpolate_bilinear(self.ib, qx, qy);
        let g = sample_bilinear(self.grad_b, qx, qy, Border::Replicate);
        let t = self.target.get(x, y);
        let lambda = self.smoothness;

        let a11 = g[0] * g[0] + lambda;
        let a12 = g[0] * g[1];
        let a22 = g[1] * g[1] + lambda + self.vertical_weight;
        let b1 = g[0] * d - lambda * (f[0] - t[0]);
        let b2 = g[1] * d - lambda * (f[1] - t[1]) - self.vertical_weight * f[1];

        let det = a11 * a22 - a12 * a12;
        if det.abs() < 1e-12 {
            return None;
        }
        let mut dx = (a22 * b1 - a12 * b2) / det;
        let mut dy = (a11 * b2 - a12 * b1) / det;
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        let mag = (dx * dx + dy * dy).sqrt();
        if mag > 1.0 {
            dx /= mag;
            dy /= mag;
        }
        Some([f[0] + dx, f[1] + dy])
    }

    fn update(&self, flow: &mut FlowField, x: usize, y: usize, neighbor: Option<(usize, usize)>) {
        if self.alpha_a.get(x, y) <= self.alpha_threshold {
            return;
        }
        let mut best = flow.get(x, y);
        if !self.trusted_target(x, y, best) {
            return;
        }
        let mut best_energy = self.energy(x, y, best);

        if let Some((nx, ny)) = neighbor {
            let cand = flow.get(nx, ny);
            if cand != best && self.trusted_target(x, y, cand) {
                let e = self.energy(x, y, cand);
                if e < best_energy {
                    best = cand;
                    best_energy = e;
                }
            }
        }

        if let Some(next) = self.gauss_newton(x, y, best) {
            if self.trusted_target(x, y, next) && self.energy(x, y, next) < best_energy {
                best = next;
            }
        }
        flow.set(x, y, best);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(w: usize, h: usize, shift: f32) -> ColorImage {
        Image::from_fn(w, h, |x, y| {
            let fx = x as f32 - shift;
            let v = 128.0 + 60.0 * (fx * 0.35).sin() + 50.0 * (y as f32 * 0.27 + fx * 0.11).cos();
            [v as u8, v as u8, v as u8, 255]
        })
    }

    fn no_temporal() -> TemporalThresholds {
        TemporalThresholds { motion: 0.05, smooth: 0.0 }
    }

    #[test]
    fn test_identical_images_zero_flow() {
        let engine = OpticalFlowEngine::new(FlowParams::default());
        let img = textured(40, 32, 0.0);
        let mut q = CommandQueue::new();
        let flow = engine.compute_flow(&mut q, &img, &img, None, DirectionHint::Unknown, no_temporal());
        assert_eq!(flow.size(), (40, 32));
        assert!(flow.pixels().all(|(_, _, v)| v == [0.0, 0.0]));
    }

    #[test]
    fn test_odd_sizes_round_trip() {
        let engine = OpticalFlowEngine::new(FlowParams::default());
        let a = textured(37, 23, 0.0);
        let b = textured(37, 23, 1.0);
        let mut q = CommandQueue::new();
        let flow = engine.compute_flow(&mut q, &a, &b, None, DirectionHint::Right, no_temporal());
        assert_eq!(flow.size(), (37, 23));
    }

    #[test]
    fn test_recovers_horizontal_shift() {
        // B(x) = A(x - 4): the content moves right, so F ≈ (+4, 0).
        let engine = OpticalFlowEngine::new(FlowParams::default());
        let a = textured(96, 64, 0.0);
        let b = textured(96, 64, 4.0);
        let mut q = CommandQueue::new();
        let flow = engine.compute_flow(&mut q, &a, &b, None, DirectionHint::Right, no_temporal());

        let mut sum = 0.0;
        let mut n = 0;
        for y in 16..48 {
            for x in 16..72 {
                sum += flow.get(x, y)[0];
                n += 1;
            }
        }
        let mean = sum / n as f32;
        assert!((mean - 4.0).abs() < 1.5, "mean horizontal flow {mean}, expected ≈ 4");
    }

    #[test]
    fn test_hint_search_prefers_zero_on_flat() {
        let p = FlowParams::default();
        let flat = Image::filled(30, 30, 0.5f32);
        let alpha = Image::filled(30, 30, 1.0f32);
        let f = hint_search(&flat, &flat, &alpha, &alpha, DirectionHint::Left, &p);
        assert!(f.pixels().all(|(_, _, v)| v == [0.0, 0.0]));
    }

    #[test]
    fn test_hint_search_respects_direction() {
        // A bright column at x=10 in A, at x=14 in B. A RIGHT search finds +4,
        // a LEFT search cannot.
        let p = FlowParams::default();
        let a = Image::from_fn(30, 30, |x, _| if x == 10 { 1.0f32 } else { 0.0 });
        let b = Image::from_fn(30, 30, |x, _| if x == 14 { 1.0f32 } else { 0.0 });
        let alpha = Image::filled(30, 30, 1.0f32);
        let right = hint_search(&a, &b, &alpha, &alpha, DirectionHint::Right, &p);
        assert_eq!(right.get(10, 15), [4.0, 0.0]);
        let left = hint_search(&a, &b, &alpha, &alpha, DirectionHint::Left, &p);
        assert!(left.get(10, 15)[0] <= 0.0);
    }

    #[test]
    fn test_temporal_blend_weights() {
        let mut f = Image::filled(2, 1, [0.0f32, 0.0]);
        let prev = Image::filled(2, 1, [2.0f32, 2.0]);
        let motion = Image::from_vec(2, 1, vec![0.0f32, 1.0]);
        temporal_blend(&mut f, &prev, &motion, 0.5);
        assert_eq!(f.get(0, 0), [2.0, 2.0]);
        assert_eq!(f.get(1, 0), [0.0, 0.0]);
    }

    #[test]
    fn test_fill_low_alpha_keeps_trusted() {
        let mut f = Image::from_fn(5, 5, |x, _| [x as f32, 0.0]);
        let before = f.clone();
        let alpha = Image::filled(5, 5, 1.0f32);
        fill_low_alpha(&mut f, &alpha, 2, 1.5);
        assert_eq!(f, before);
    }

    #[test]
    fn test_smooth_toward_identical_is_noop() {
        let prev = textured(8, 8, 0.0);
        let mut cur = prev.clone();
        smooth_toward(&mut cur, &prev, 0.1);
        assert_eq!(cur, prev);
    }

    #[test]
    fn test_no_previous_skips_temporal_kernels() {
        let engine = OpticalFlowEngine::new(FlowParams::default());
        let img = textured(32, 32, 0.0);
        let mut q = CommandQueue::new();
        engine.compute_flow(&mut q, &img, &img, None, DirectionHint::Unknown, no_temporal());
        assert_eq!(q.stats().count("flow_temporal_regularize"), 0);
        assert_eq!(q.stats().count("flow_motion"), 0);
        assert_eq!(q.stats().count("flow_final_blur"), 1);
    }

    #[test]
    fn test_diagonal_sweeps_only_on_small_levels() {
        let a = textured(32, 32, 0.0);
        let b = textured(32, 32, 1.0);
        let sweeps = |max_area: usize| {
            let engine = OpticalFlowEngine::new(FlowParams {
                downscale: 1.0,
                max_levels: 2,
                diagonal_sweep_max_area: max_area,
                ..FlowParams::default()
            });
            let sizes = engine.level_sizes(32, 32);
            let mut q = CommandQueue::new();
            engine.compute_flow(&mut q, &a, &b, None, DirectionHint::Unknown, no_temporal());
            (sizes, q.stats().count("flow_sweep"))
        };

        let (sizes, all_small) = sweeps(usize::MAX);
        assert_eq!(sizes.len(), 2);
        assert_eq!(all_small, 2 * 6);
        assert_eq!(sweeps(0).1, 2 * 4);

        // Exactly the coarse level is at the limit: diagonals there only.
        let (cw, ch) = sizes[1];
        assert!(cw * ch < 32 * 32);
        assert_eq!(sweeps(cw * ch).1, 6 + 4);
        assert_eq!(sweeps(cw * ch - 1).1, 4 + 4);
    }

    #[test]
    #[should_panic(expected = "previous flow")]
    fn test_mismatched_previous_flow_panics() {
        let engine = OpticalFlowEngine::new(FlowParams::default());
        let img = textured(16, 16, 0.0);
        let bad_flow: FlowField = Image::new(8, 8);
        let prev = PreviousFrame { flow: &bad_flow, image_a: &img, image_b: &img };
        let mut q = CommandQueue::new();
        engine.compute_flow(&mut q, &img, &img, Some(prev), DirectionHint::Unknown, no_temporal());
    }
}

// novel_view.rs — Flow-guided synthesis of intermediate viewpoints.
//
// A chunk of the panorama is the stretch between two physical cameras L
// and R. Column c of the chunk is a virtual camera at time t ∈ [0, 1]
// (t = 0 sits on L, t = 1 on R). The lazy warp table says, per chunk pixel,
// where to look in the overlap images and at which t.
//
// Per side:
//   L: p = w.xy + F_{R→L}(w.xy) · t          opacity (1 - t)
//   R: p = w.xy + F_{L→R}(w.xy) · (1 - t)    opacity t
//
// Each side is sampled with bicubic interpolation and a transparent border.
// The two sides are then blended with weights that fall off with each
// side's flow magnitude: a side that needs a large displacement to reach
// this view is less trustworthy than one that barely moves.

use std::sync::Arc;

use crate::config::NovelViewParams;
use crate::convert::convert_image;
use crate::image::{
    sample_bilinear, AlphaMask, Border, ColorImage, FlowField, GreyImage, Image, Pixel, WarpTable,
};
use crate::remap::{remap, Interpolation};
use crate::runtime::CommandQueue;

/// Build a lazy warp table of `chunk_width × height` over an overlap that is
/// `overlap_width` pixels wide, shifted horizontally by `offset`.
///
/// Column `c` samples x = (c + 0.5) · overlap_width / chunk_width - 0.5 + offset
/// at t = (c + 0.5) / chunk_width. Row `r` samples y = r.
pub fn build_lazy_warp(chunk_width: usize, height: usize, overlap_width: usize, offset: f32) -> WarpTable {
    assert!(chunk_width > 0 && height > 0, "warp table must be non-empty");
    let step = overlap_width as f32 / chunk_width as f32;
    WarpTable::from_fn(chunk_width, height, |c, r| {
        let centre = c as f32 + 0.5;
        [centre * step - 0.5 + offset, r as f32, centre / chunk_width as f32]
    })
}

/// Warp tables for both eyes, offset symmetrically by the vergence.
pub fn build_stereo_warps(
    chunk_width: usize,
    height: usize,
    overlap_width: usize,
    vergence: f32,
) -> (Arc<WarpTable>, Arc<WarpTable>) {
    let half = vergence * 0.5;
    (
        Arc::new(build_lazy_warp(chunk_width, height, overlap_width, half)),
        Arc::new(build_lazy_warp(chunk_width, height, overlap_width, -half)),
    )
}

/// One side's contribution to a novel view.
pub struct SideView {
    /// Sampled colour, lanes in [0, 255].
    pub color: Image<[f32; 4]>,
    /// Opacity scaled by the side's distance in t.
    pub alpha: AlphaMask,
    /// Length of the flow vector used to reach each pixel.
    pub magnitude: GreyImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Blends left and right camera images into novel views.
#[derive(Debug, Clone, Default)]
pub struct NovelViewSynthesizer {
    params: NovelViewParams,
}

impl NovelViewSynthesizer {
    pub fn new(params: NovelViewParams) -> Self {
        NovelViewSynthesizer { params }
    }

    /// Render one chunk. The output has the warp table's size.
    ///
    /// # Panics
    /// Panics if the images and flows are not all the same size.
    pub fn combine(
        &self,
        queue: &mut CommandQueue,
        warp: &WarpTable,
        image_l: &ColorImage,
        image_r: &ColorImage,
        flow_l_to_r: &FlowField,
        flow_r_to_l: &FlowField,
    ) -> ColorImage {
        assert!(
            image_l.same_size(image_r) && image_l.same_size(flow_l_to_r) && image_l.same_size(flow_r_to_l),
            "novel view inputs must share one size (L {}×{}, R {}×{}, flows {}×{} / {}×{})",
            image_l.width(), image_l.height(), image_r.width(), image_r.height(),
            flow_l_to_r.width(), flow_l_to_r.height(), flow_r_to_l.width(), flow_r_to_l.height(),
        );
        let g = [warp.width(), warp.height()];
        let left = queue.launch("novel_view_side", g, || side_view(warp, image_l, flow_r_to_l, Side::Left));
        let right = queue.launch("novel_view_side", g, || side_view(warp, image_r, flow_l_to_r, Side::Right));
        let width = image_l.width() as f32;
        queue.launch("novel_view_blend", g, || self.blend(&left, &right, width))
    }

    /// Render a left-eye and a right-eye chunk from the same flows.
    #[allow(clippy::too_many_arguments)]
    pub fn combine_stereo(
        &self,
        queue: &mut CommandQueue,
        warp_left: &WarpTable,
        warp_right: &WarpTable,
        image_l: &ColorImage,
        image_r: &ColorImage,
        flow_l_to_r: &FlowField,
        flow_r_to_l: &FlowField,
    ) -> (ColorImage, ColorImage) {
        let left_eye = self.combine(queue, warp_left, image_l, image_r, flow_l_to_r, flow_r_to_l);
        let right_eye = self.combine(queue, warp_right, image_l, image_r, flow_l_to_r, flow_r_to_l);
        (left_eye, right_eye)
    }

    fn blend(&self, left: &SideView, right: &SideView, width: f32) -> ColorImage {
        let k = self.params.magnitude_falloff / width.max(1.0);
        ColorImage::from_fn(left.color.width(), left.color.height(), |x, y| {
            let al = left.alpha.get(x, y);
            let ar = right.alpha.get(x, y);
            let wl = al * (-k * left.magnitude.get(x, y)).exp();
            let wr = ar * (-k * right.magnitude.get(x, y)).exp();
            let (wl, wr) = if wl + wr > 1e-12 {
                (wl, wr)
            } else if al + ar > 0.0 {
                (al, ar)
            } else {
                return [0, 0, 0, 0];
            };
            let cl = left.color.get(x, y);
            let cr = right.color.get(x, y);
            let sum = wl + wr;
            let mut out = [0.0f32; 4];
            for c in 0..3 {
                out[c] = (cl[c] * wl + cr[c] * wr) / sum;
            }
            out[3] = (al + ar).clamp(0.0, 1.0) * 255.0;
            <[u8; 4]>::from_lanes(out)
        })
    }
}

fn side_view(warp: &WarpTable, image: &ColorImage, flow: &FlowField, side: Side) -> SideView {
    let (w, h) = warp.size();
    let mut coords = Image::<[f32; 2]>::new(w, h);
    let mut opacity = AlphaMask::new(w, h);
    let mut magnitude = GreyImage::new(w, h);

    for (x, y, [wx, wy, t]) in warp.pixels() {
        let f = sample_bilinear(flow, wx, wy, Border::Replicate);
        let (travel, o) = match side {
            Side::Left => (t, 1.0 - t),
            Side::Right => (1.0 - t, t),
        };
        coords.set(x, y, [wx + f[0] * travel, wy + f[1] * travel]);
        opacity.set(x, y, o.clamp(0.0, 1.0));
        magnitude.set(x, y, (f[0] * f[0] + f[1] * f[1]).sqrt());
    }

    // Sample in float so the blend sees unrounded colour.
    let source: Image<[f32; 4]> = convert_image(image);
    let color = remap(&source, &coords, Interpolation::Bicubic, Border::Transparent);
    let alpha = color.zip_map(&opacity, |c, o| (c[3] / 255.0).clamp(0.0, 1.0) * o);
    SideView { color, alpha, magnitude }
}

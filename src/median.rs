// median.rs — Median filter for flow fields.
//
// Each component (dx, dy) is filtered independently over a square window
// with replicated borders. This removes isolated outlier vectors left by
// sweep propagation without blurring motion boundaries.

use crate::image::FlowField;

/// Per-component median over a `width × width` window.
///
/// # Panics
/// Panics if `width` is even or zero.
pub fn median_filter_flow(flow: &FlowField, width: usize) -> FlowField {
    assert!(width % 2 == 1, "median window must be odd (got {width})");
    if width == 1 || flow.is_empty() {
        return flow.clone();
    }

    let half = (width / 2) as isize;
    let mid = width * width / 2;
    let mut xs = Vec::with_capacity(width * width);
    let mut ys = Vec::with_capacity(width * width);

    FlowField::from_fn(flow.width(), flow.height(), |x, y| {
        xs.clear();
        ys.clear();
        for dy in -half..=half {
            for dx in -half..=half {
                let v = flow.get_clamped(x as isize + dx, y as isize + dy);
                xs.push(v[0]);
                ys.push(v[1]);
            }
        }
        let mx = *xs.select_nth_unstable_by(mid, f32::total_cmp).1;
        let my = *ys.select_nth_unstable_by(mid, f32::total_cmp).1;
        [mx, my]
    })
}

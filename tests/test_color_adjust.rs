// tests/test_color_adjust.rs — Brightness equalization across cameras.

use panoflow::color_adjust::{ColorAdjustOptions, ColorAdjuster, GammaLut, MeanColorMode, RATIO_RANGE};
use panoflow::image::{ColorImage, Image};

fn camera(w: usize, h: usize, level: u8, pattern: usize) -> ColorImage {
    Image::from_fn(w, h, |x, y| {
        let wobble = ((x * 7 + y * 3 + pattern * 11) % 23) as u8;
        let v = level.saturating_add(wobble);
        [v, v, v.saturating_sub(5), 255]
    })
}

fn mean_grey(img: &ColorImage) -> f32 {
    let sum: f32 = img.pixels().map(|(_, _, p)| p[0] as f32).sum();
    sum / (img.width() * img.height()) as f32
}

#[test]
fn ratios_stay_in_range() {
    let lut = GammaLut::new();
    let mut adjuster = ColorAdjuster::new();
    let opts = ColorAdjustOptions::default();
    // Includes extreme pairs (near-black next to bright) that must be
    // neutralized rather than passed through.
    for levels in [[10u8, 200, 120, 90], [2, 250, 3, 240], [100, 100, 100, 100], [30, 60, 120, 240]] {
        let mut images: Vec<ColorImage> =
            levels.iter().enumerate().map(|(i, &l)| camera(48, 32, l, i)).collect();
        adjuster.pre_adjust(&lut, &mut images, &opts);
        assert_eq!(adjuster.last_ratios().len(), 4);
        for &r in adjuster.last_ratios() {
            assert!((RATIO_RANGE.0..=RATIO_RANGE.1).contains(&r), "ratio {r} out of range");
        }
    }
}

#[test]
fn adjustment_pulls_cameras_together() {
    let lut = GammaLut::new();
    let mut adjuster = ColorAdjuster::new();
    let mut images = vec![camera(48, 32, 120, 0), camera(48, 32, 95, 1), camera(48, 32, 120, 2)];
    let spread_before = mean_grey(&images[0]) - mean_grey(&images[1]);
    let applied = adjuster.pre_adjust(&lut, &mut images, &ColorAdjustOptions::default());
    assert!(applied);
    let spread_after = (mean_grey(&images[0]) - mean_grey(&images[1])).abs();
    assert!(spread_after < spread_before * 0.5, "{spread_before} → {spread_after}");
}

#[test]
fn standard_camera_is_untouched() {
    let lut = GammaLut::new();
    let mut adjuster = ColorAdjuster::new();
    let original = camera(48, 32, 140, 1);
    let mut images = vec![camera(48, 32, 100, 0), original.clone(), camera(48, 32, 90, 2)];
    let opts = ColorAdjustOptions { standard: Some(1), ..ColorAdjustOptions::default() };
    assert!(adjuster.pre_adjust(&lut, &mut images, &opts));
    assert_eq!(images[1], original);
}

#[test]
fn flat_mean_mode_also_detects_imbalance() {
    let lut = GammaLut::new();
    let mut adjuster = ColorAdjuster::new();
    let mut images = vec![camera(48, 32, 150, 0), camera(48, 32, 100, 1)];
    let opts = ColorAdjustOptions { mean_mode: MeanColorMode::Flat, ..ColorAdjustOptions::default() };
    assert!(adjuster.pre_adjust(&lut, &mut images, &opts));
    adjuster.reset();
    assert!(adjuster.last_ratios().is_empty());
}

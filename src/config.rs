// config.rs — Configuration snapshot for a stitching pipeline.
//
// `InitParams` is built once by the caller, validated, and then owned by the
// pipeline for its whole lifetime. Every struct here has a `Default` with
// working values and derives serde, so a caller can load a partial JSON/TOML
// document and get defaults for everything it leaves out.

use serde::{Deserialize, Serialize};

use crate::error::InitError;

/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// Mono renders one chunk per camera pair; stereo renders a left-eye and a
/// right-eye chunk from two warp tables offset by `vergence` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderModeKind {
    #[default]
    Mono,
    Stereo { vergence: f32 },
}

/// Smoothness weight of the flow solver, in three segments over the pyramid.
///
/// The pyramid is split into thirds counted from the coarsest level: the
/// coarsest third uses `coarse`, the middle third `middle`, the finest third
/// `fine`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingSchedule {
    pub coarse: f32,
    pub middle: f32,
    pub fine: f32,
}

impl Default for SmoothingSchedule {
    fn default() -> Self {
        SmoothingSchedule { coarse: 0.004, middle: 0.002, fine: 0.001 }
    }
}

impl SmoothingSchedule {
    /// Coefficient for `level` (0 = finest) of a pyramid with `num_levels`.
    pub fn at(&self, level: usize, num_levels: usize) -> f32 {
        assert!(level < num_levels, "level {level} out of range ({num_levels} levels)");
        let from_coarse = num_levels - 1 - level;
        match from_coarse * 3 / num_levels {
            0 => self.coarse,
            1 => self.middle,
            _ => self.fine,
        }
    }

    fn is_valid(&self) -> bool {
        [self.coarse, self.middle, self.fine].iter().all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Numerical constants of the optical-flow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    /// Input images are resized by this factor before anything else.
    pub downscale: f32,
    /// Size ratio between consecutive pyramid levels.
    pub pyramid_ratio: f32,
    /// No pyramid level may have a side at or below this.
    pub min_level_size: usize,
    pub max_levels: usize,
    /// Flow is only updated where both alpha masks exceed this.
    pub update_alpha_threshold: f32,
    /// Median window width (odd).
    pub median_width: usize,
    pub pre_blur_sigma: f32,
    pub gradient_blur_sigma: f32,
    /// Blur radius / sigma for the regularization target.
    pub flow_blur_radius: usize,
    pub flow_blur_sigma: f32,
    pub final_blur_radius: usize,
    pub final_blur_sigma: f32,
    /// Weight of the gradient-constancy term in the sweep energy.
    pub gradient_weight: f32,
    /// Penalty on vertical displacement.
    pub vertical_weight: f32,
    pub smoothing: SmoothingSchedule,
    /// Hint search reach along the hinted axis, as a fraction of the level size.
    pub hint_search_fraction: f32,
    /// Hint search reach across the hinted axis, in pixels.
    pub hint_search_cross: usize,
    /// Diagonal sweeps run when a level has at most this many pixels.
    pub diagonal_sweep_max_area: usize,
}

impl Default for FlowParams {
    fn default() -> Self {
        FlowParams {
            downscale: 0.5,
            pyramid_ratio: 0.9,
            min_level_size: 24,
            max_levels: 1000,
            update_alpha_threshold: 0.9,
            median_width: 5,
            pre_blur_sigma: 1.0,
            gradient_blur_sigma: 1.0,
            flow_blur_radius: 2,
            flow_blur_sigma: 1.5,
            final_blur_radius: 1,
            final_blur_sigma: 1.0,
            gradient_weight: 0.5,
            vertical_weight: 0.0,
            smoothing: SmoothingSchedule::default(),
            hint_search_fraction: 0.25,
            hint_search_cross: 1,
            diagonal_sweep_max_area: 64 * 64,
        }
    }
}

impl FlowParams {
    pub fn validate(&self) -> Result<(), InitError> {
        let bad = |msg: &str| Err(InitError::InvalidParams(msg.to_string()));
        if !(self.downscale > 0.0 && self.downscale <= 1.0) {
            return bad("flow.downscale must be in (0, 1]");
        }
        if !(self.pyramid_ratio > 0.0 && self.pyramid_ratio < 1.0) {
            return bad("flow.pyramid_ratio must be in (0, 1)");
        }
        if self.max_levels == 0 {
            return bad("flow.max_levels must be at least 1");
        }
        if self.median_width % 2 == 0 {
            return bad("flow.median_width must be odd");
        }
        if !self.smoothing.is_valid() {
            return bad("flow.smoothing coefficients must be finite and non-negative");
        }
        let positive = [
            self.pre_blur_sigma,
            self.gradient_blur_sigma,
            self.flow_blur_sigma,
            self.final_blur_sigma,
        ];
        if positive.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return bad("flow blur sigmas must be positive");
        }
        let non_negative = [
            self.update_alpha_threshold,
            self.gradient_weight,
            self.vertical_weight,
            self.hint_search_fraction,
        ];
        if non_negative.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
            return bad("flow weights and thresholds must be finite and non-negative");
        }
        Ok(())
    }
}

/// Novel-view blending constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovelViewParams {
    /// How fast a side's weight falls off with its flow magnitude
    /// (relative to image width).
    pub magnitude_falloff: f32,
}

impl Default for NovelViewParams {
    fn default() -> Self {
        NovelViewParams { magnitude_falloff: 10.0 }
    }
}

/// Immutable configuration of a stitching pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitParams {
    pub mode: RenderModeKind,
    pub camera_count: usize,
    /// Width of one panorama chunk (novel views per camera pair).
    pub novel_view_count: usize,
    /// Per-camera source image width.
    pub source_width: usize,
    /// Optical-flow working resolution (overlap region of one pair).
    pub flow_width: usize,
    pub flow_height: usize,
    /// Default motion threshold for frames rendered without an explicit one.
    pub motion_threshold: f32,
    /// Frame-to-frame differences below this are smoothed away before flow.
    pub smooth_threshold: f32,
    /// Devices reporting less memory than this are rejected.
    pub min_device_memory: u64,
    /// Candidate worker counts; the largest that fits the budget is used.
    pub thread_options: Vec<usize>,
    /// Optional cap on the worker count. `Some(0)` renders on the caller's thread.
    pub max_worker_threads: Option<usize>,
    pub flow: FlowParams,
    pub novel_view: NovelViewParams,
}

impl Default for InitParams {
    fn default() -> Self {
        InitParams {
            mode: RenderModeKind::Mono,
            camera_count: 8,
            novel_view_count: 256,
            source_width: 1920,
            flow_width: 480,
            flow_height: 960,
            motion_threshold: 0.05,
            smooth_threshold: 0.02,
            min_device_memory: 4 * GIB,
            thread_options: vec![1, 2, 4],
            max_worker_threads: None,
            flow: FlowParams::default(),
            novel_view: NovelViewParams::default(),
        }
    }
}

impl InitParams {
    /// Check every field range. Called before any device work.
    pub fn validate(&self) -> Result<(), InitError> {
        let bad = |msg: &str| Err(InitError::InvalidParams(msg.to_string()));
        if self.camera_count == 0 {
            return bad("camera_count must be at least 1");
        }
        if self.novel_view_count == 0 {
            return bad("novel_view_count must be at least 1");
        }
        if self.source_width == 0 || self.flow_width == 0 || self.flow_height == 0 {
            return bad("image sizes must be non-zero");
        }
        if self.flow_width > self.source_width {
            return bad("flow_width cannot exceed source_width");
        }
        if !(self.motion_threshold.is_finite() && self.motion_threshold >= 0.0) {
            return bad("motion_threshold must be finite and non-negative");
        }
        if !(self.smooth_threshold.is_finite() && self.smooth_threshold >= 0.0) {
            return bad("smooth_threshold must be finite and non-negative");
        }
        if let RenderModeKind::Stereo { vergence } = self.mode {
            if !vergence.is_finite() {
                return bad("stereo vergence must be finite");
            }
        }
        if self.thread_options.is_empty() || self.thread_options.contains(&0) {
            return bad("thread_options must be non-empty and contain no zero");
        }
        if !(self.novel_view.magnitude_falloff.is_finite() && self.novel_view.magnitude_falloff >= 0.0) {
            return bad("novel_view.magnitude_falloff must be finite and non-negative");
        }
        self.flow.validate()
    }

    /// Warp tables per camera: one for mono, two for stereo.
    pub fn tables_per_camera(&self) -> usize {
        match self.mode {
            RenderModeKind::Mono => 1,
            RenderModeKind::Stereo { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert_eq!(InitParams::default().validate(), Ok(()));
        assert_eq!(InitParams::default().min_device_memory, 4 * GIB);
        assert_eq!(InitParams::default().thread_options, vec![1, 2, 4]);
    }

    #[test]
    fn test_zero_cameras_rejected() {
        let p = InitParams { camera_count: 0, ..Default::default() };
        assert!(matches!(p.validate(), Err(InitError::InvalidParams(_))));
    }

    #[test]
    fn test_even_median_rejected() {
        let mut p = InitParams::default();
        p.flow.median_width = 4;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let p = InitParams { motion_threshold: f32::NAN, ..Default::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_zero_thread_option_rejected() {
        let p = InitParams { thread_options: vec![1, 0], ..Default::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_schedule_thirds() {
        let s = SmoothingSchedule { coarse: 3.0, middle: 2.0, fine: 1.0 };
        // 9 levels: 8..=6 coarse, 5..=3 middle, 2..=0 fine.
        assert_eq!(s.at(8, 9), 3.0);
        assert_eq!(s.at(6, 9), 3.0);
        assert_eq!(s.at(5, 9), 2.0);
        assert_eq!(s.at(3, 9), 2.0);
        assert_eq!(s.at(2, 9), 1.0);
        assert_eq!(s.at(0, 9), 1.0);
        // A single level counts as coarse.
        assert_eq!(s.at(0, 1), 3.0);
    }

    #[test]
    fn test_tables_per_camera() {
        let mono = InitParams::default();
        let stereo = InitParams { mode: RenderModeKind::Stereo { vergence: 4.0 }, ..Default::default() };
        assert_eq!(mono.tables_per_camera(), 1);
        assert_eq!(stereo.tables_per_camera(), 2);
    }
}

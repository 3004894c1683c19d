// panorama.rs — The stitching pipeline as one owned object.
//
// Lifecycle:
//
//   Panorama::initialize(params)        select device, plan budget, start workers
//     ├─ pre_color_adjust_by_gamma()    optional, per frame, before rendering
//     ├─ render_mono() / render_stereo()  per frame
//     ├─ assemble()                     chunks → panorama strip
//     ├─ clear_previous_frames()        after a seek or scene cut
//   release() / drop                    join workers, free long-lived buffers
//
// Initialization is the only fallible step. It fails before any worker
// starts when the device is missing, reports no memory size, is below the
// memory policy, or is too small for a single render thread, so the caller
// can fall back to a CPU path. Nothing here is global: two `Panorama`s in
// one process are independent.
//
// Every buffer a frame allocates (in the workers, in colour adjustment and
// in assembly) is leased from the pipeline's `BufferPool`, whose limit is
// the planned total.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::budget::{lease_common, plan_thread_count, BudgetPlan, BufferLease, BufferPool};
use crate::color_adjust::{ColorAdjustOptions, ColorAdjuster, GammaLut};
use crate::config::InitParams;
use crate::error::InitError;
use crate::gpu::{select_device, DeviceReport};
use crate::image::ColorImage;
use crate::postprocess::{assemble, AssembleOptions, TemporalSmoother};
use crate::render::{Chunk, FrameStats, RenderContext};

/// A running stitching pipeline.
pub struct Panorama {
    params: InitParams,
    device: DeviceReport,
    plan: BudgetPlan,
    render: RenderContext,
    gamma: GammaLut,
    adjuster: ColorAdjuster,
    /// One per eye.
    smoothers: Vec<TemporalSmoother>,
    pool: BufferPool,
    // Dropped after `render` so the accounting outlives the workers.
    _common: Vec<BufferLease>,
}

impl Panorama {
    /// Whether a hardware adapter is present.
    pub fn device_available() -> bool {
        select_device().is_ok()
    }

    /// Select a device and bring the pipeline up on it.
    pub fn initialize(params: InitParams) -> Result<Self, InitError> {
        params.validate()?;
        let device = select_device()?;
        Self::initialize_on(params, device)
    }

    /// Bring the pipeline up against an already chosen device.
    ///
    /// # Errors
    /// - `InvalidParams` for out-of-range configuration;
    /// - `UnknownDeviceMemory` when the report carries no memory size;
    /// - `DeviceTooSmall` below `params.min_device_memory`;
    /// - `InsufficientMemory` when not even one worker fits;
    /// - `WorkerSpawn` if the OS refuses a thread.
    ///
    /// No worker thread is running when an error is returned.
    pub fn initialize_on(params: InitParams, device: DeviceReport) -> Result<Self, InitError> {
        params.validate()?;
        let Some(global_mem_size) = device.global_mem_size else {
            warn!(device = %device, "device memory size unknown, refusing to budget");
            return Err(InitError::UnknownDeviceMemory { device: device.name });
        };
        if global_mem_size < params.min_device_memory {
            warn!(
                device = %device,
                required = params.min_device_memory,
                "device below the minimum memory policy"
            );
            return Err(InitError::DeviceTooSmall {
                available: global_mem_size,
                required: params.min_device_memory,
            });
        }

        let pool = BufferPool::new();
        let plan = plan_thread_count(&pool, &params, global_mem_size)?;
        let threads = match params.max_worker_threads {
            Some(cap) => plan.thread_count.min(cap),
            None => plan.thread_count,
        };
        pool.set_limit(plan.total());
        let common = lease_common(&pool, &params);
        pool.reset_peak();
        let render = RenderContext::with_buffers(&params, threads, pool.clone())?;

        info!(
            device = %device,
            threads,
            cameras = params.camera_count,
            stereo = render.mode().is_stereo(),
            "panorama pipeline ready"
        );
        let eyes = params.tables_per_camera();
        Ok(Panorama {
            device,
            plan,
            render,
            gamma: GammaLut::new(),
            adjuster: ColorAdjuster::new(),
            smoothers: (0..eyes).map(|_| TemporalSmoother::new()).collect(),
            pool,
            _common: common,
            params,
        })
    }

    pub fn params(&self) -> &InitParams {
        &self.params
    }

    pub fn device(&self) -> &DeviceReport {
        &self.device
    }

    pub fn plan(&self) -> &BudgetPlan {
        &self.plan
    }

    /// Workers actually running (0 means synchronous rendering).
    pub fn thread_count(&self) -> usize {
        self.render.thread_count()
    }

    /// Bytes currently accounted on the device.
    pub fn live_bytes(&self) -> u64 {
        self.pool.live()
    }

    /// Highest `live_bytes` since initialization.
    pub fn peak_bytes(&self) -> u64 {
        self.pool.reserved()
    }

    pub fn last_frame_stats(&self) -> &FrameStats {
        self.render.last_frame_stats()
    }

    pub fn render_context(&self) -> &RenderContext {
        &self.render
    }

    /// Render one mono chunk per camera pair.
    ///
    /// `motion_threshold` falls back to the configured default.
    ///
    /// # Panics
    /// Panics on a stereo pipeline, or on the preconditions of
    /// [`RenderContext::render_chunks`].
    pub fn render_mono(
        &mut self,
        images_l: &[Arc<ColorImage>],
        images_r: &[Arc<ColorImage>],
        motion_threshold: Option<f32>,
    ) -> Vec<ColorImage> {
        assert!(!self.render.mode().is_stereo(), "render_mono called on a stereo pipeline");
        let threshold = motion_threshold.unwrap_or(self.params.motion_threshold);
        self.render
            .render_chunks(images_l, images_r, threshold)
            .into_iter()
            .map(|chunk| match chunk {
                Chunk::Mono(img) => img,
                Chunk::Stereo { .. } => panic!("stereo chunk from a mono pipeline"),
            })
            .collect()
    }

    /// Render left-eye and right-eye chunks per camera pair.
    ///
    /// # Panics
    /// Panics on a mono pipeline, or on the preconditions of
    /// [`RenderContext::render_chunks`].
    pub fn render_stereo(
        &mut self,
        images_l: &[Arc<ColorImage>],
        images_r: &[Arc<ColorImage>],
        motion_threshold: Option<f32>,
    ) -> (Vec<ColorImage>, Vec<ColorImage>) {
        assert!(self.render.mode().is_stereo(), "render_stereo called on a mono pipeline");
        let threshold = motion_threshold.unwrap_or(self.params.motion_threshold);
        self.render
            .render_chunks(images_l, images_r, threshold)
            .into_iter()
            .map(|chunk| match chunk {
                Chunk::Stereo { left, right } => (left, right),
                Chunk::Mono(_) => panic!("mono chunk from a stereo pipeline"),
            })
            .unzip()
    }

    /// Drop every camera's previous frame and the assembly history.
    pub fn clear_previous_frames(&mut self) {
        self.render.reset_previous();
        self.smoothers.iter_mut().for_each(TemporalSmoother::reset);
        self.adjuster.reset();
    }

    /// Equalize camera brightness in place. Returns whether gains were applied.
    pub fn pre_color_adjust_by_gamma(&mut self, images: &mut [ColorImage], opts: &ColorAdjustOptions) -> bool {
        let _scope = self.pool.scope();
        self.adjuster.pre_adjust(&self.gamma, images, opts)
    }

    /// Ratios from the most recent colour adjustment.
    pub fn color_ratios(&self) -> &[f32] {
        self.adjuster.last_ratios()
    }

    /// Stitch one eye's chunks into a panorama strip.
    ///
    /// `eye` is 0 for mono or the left eye, 1 for the right eye.
    ///
    /// # Panics
    /// Panics if `eye` is out of range for the mode or `chunks` is empty.
    pub fn assemble(&mut self, eye: usize, chunks: Vec<ColorImage>, opts: &AssembleOptions) -> ColorImage {
        assert!(eye < self.smoothers.len(), "eye {eye} out of range");
        let _scope = self.pool.scope();
        let out = assemble(chunks, opts, &mut self.smoothers[eye]);
        debug!(eye, width = out.width(), height = out.height(), "panorama assembled");
        out
    }

    /// Stop the workers and free every long-lived buffer.
    pub fn release(self) {
        info!(device = %self.device, "releasing panorama pipeline");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RenderModeKind, GIB};
    use crate::image::Image;

    fn params() -> InitParams {
        InitParams {
            camera_count: 3,
            novel_view_count: 8,
            source_width: 48,
            flow_width: 16,
            flow_height: 12,
            max_worker_threads: Some(2),
            ..Default::default()
        }
    }

    fn frame(n: usize) -> (Vec<Arc<ColorImage>>, Vec<Arc<ColorImage>>) {
        (0..n)
            .map(|i| {
                let img = Arc::new(Image::from_fn(16, 12, |x, y| [(x * 10 + i) as u8, (y * 15) as u8, 60, 255]));
                (Arc::clone(&img), img)
            })
            .unzip()
    }

    #[test]
    fn test_initialize_on_caps_threads() {
        let pano = Panorama::initialize_on(params(), DeviceReport::simulated(8 * GIB)).unwrap();
        assert_eq!(pano.plan().thread_count, 4);
        assert_eq!(pano.thread_count(), 2);
        assert!(pano.live_bytes() > 0);
        pano.release();
    }

    #[test]
    fn test_device_below_policy() {
        let err = Panorama::initialize_on(params(), DeviceReport::simulated(GIB)).err();
        assert_eq!(err, Some(InitError::DeviceTooSmall { available: GIB, required: 4 * GIB }));
    }

    #[test]
    fn test_unknown_memory_is_not_budgeted() {
        let unknown = DeviceReport { global_mem_size: None, ..DeviceReport::simulated(8 * GIB) };
        let err = Panorama::initialize_on(params(), unknown.clone()).err();
        assert_eq!(err, Some(InitError::UnknownDeviceMemory { device: "simulated".to_string() }));
        let pano = Panorama::initialize_on(params(), unknown.with_memory(8 * GIB)).unwrap();
        assert_eq!(pano.plan().global_mem_size, 8 * GIB);
    }

    #[test]
    fn test_frames_stay_within_plan() {
        let mut pano = Panorama::initialize_on(params(), DeviceReport::simulated(8 * GIB)).unwrap();
        let common = pano.live_bytes();
        assert_eq!(common, pano.plan().common_size);
        assert_eq!(pano.peak_bytes(), common);

        let (l, r) = frame(3);
        for _ in 0..3 {
            let chunks = pano.render_mono(&l, &r, None);
            assert!(chunks.iter().all(|c| c.is_tracked()));
            drop(pano.assemble(0, chunks, &AssembleOptions::default()));
        }
        assert!(pano.peak_bytes() > common);
        assert!(pano.peak_bytes() <= pano.plan().total(), "{} > {}", pano.peak_bytes(), pano.plan().total());
        // Only the smoother's history outlives a frame.
        assert_eq!(pano.live_bytes(), common + 24 * 12 * 4);
        pano.clear_previous_frames();
        assert_eq!(pano.live_bytes(), common);
    }

    #[test]
    fn test_mono_frame_and_assembly() {
        let mut pano = Panorama::initialize_on(params(), DeviceReport::simulated(8 * GIB)).unwrap();
        let (l, r) = frame(3);
        let chunks = pano.render_mono(&l, &r, None);
        assert_eq!(chunks.len(), 3);
        let strip = pano.assemble(0, chunks, &AssembleOptions::default());
        assert_eq!(strip.size(), (24, 12));
    }

    #[test]
    #[should_panic(expected = "render_stereo called on a mono pipeline")]
    fn test_stereo_on_mono_panics() {
        let mut pano = Panorama::initialize_on(params(), DeviceReport::simulated(8 * GIB)).unwrap();
        let (l, r) = frame(3);
        pano.render_stereo(&l, &r, None);
    }

    #[test]
    fn test_stereo_frame() {
        let p = InitParams { mode: RenderModeKind::Stereo { vergence: 1.0 }, ..params() };
        let mut pano = Panorama::initialize_on(p, DeviceReport::simulated(8 * GIB)).unwrap();
        let (l, r) = frame(3);
        let (left, right) = pano.render_stereo(&l, &r, Some(0.1));
        assert_eq!(left.len(), 3);
        assert_eq!(right.len(), 3);
        let strip = pano.assemble(1, right, &AssembleOptions::default());
        assert_eq!(strip.size(), (24, 12));
    }
}

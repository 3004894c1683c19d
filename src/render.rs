// render.rs — Per-frame scheduling of camera pairs over a worker pool.
//
// One frame is `camera_count` independent tasks. Task `i` computes flow in
// both directions between the overlap images of cameras i and i+1, then
// synthesizes that pair's panorama chunk(s).
//
//   caller ──RenderTask──▶ [tasks channel] ──▶ worker 0..N ──▶ [results channel]
//          ◀──────────────────── RenderResult (by index) ◀──────────────┘
//
// FRAME BARRIER:
// `render_chunks` sends every task and then receives exactly as many
// results before returning. The previous-frame state of camera i is moved
// INTO task i and comes back in its result, so no two threads ever hold
// the same camera's state and no lock is needed.
//
// SHUTDOWN:
// Dropping the task sender closes the channel; each worker's `recv()` then
// fails and the loop ends. In-flight tasks finish first.
//
// ACCOUNTING:
// Each worker installs the context's `BufferPool` for its thread, so every
// image a task allocates is leased while it lives. Flows kept as the next
// frame's history are detached: the long-lived cache leases cover them.
//
// FAILURE:
// A panic inside a worker is not recoverable mid-frame. The worker logs the
// camera index and aborts the process rather than leave the caller blocked
// on a result that will never arrive.
//
// NEW RUST CONCEPTS:
// - `crossbeam_channel::Receiver` is Clone (multi-consumer), so every
//   worker holds its own handle to the one task queue.
// - `std::panic::catch_unwind` + `AssertUnwindSafe` — intercept a panic at
//   the worker boundary so it can be logged before aborting.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::budget::{peak_during, BufferPool};
use crate::config::{InitParams, RenderModeKind};
use crate::error::InitError;
use crate::flow::{DirectionHint, OpticalFlowEngine, PreviousFrame, TemporalThresholds};
use crate::image::{ColorImage, FlowField, WarpTable};
use crate::novel_view::{build_lazy_warp, build_stereo_warps, NovelViewSynthesizer};
use crate::runtime::{CommandQueue, DispatchStats};

// ============================================================
// Render mode
// ============================================================

/// Warp tables per camera, resolved once from the configured mode.
///
/// Every camera shares one table per eye; the `Vec`s hold `Arc` clones so
/// a per-camera table can be swapped in without changing the layout.
#[derive(Debug, Clone)]
pub enum RenderMode {
    Mono { warps: Vec<Arc<WarpTable>> },
    Stereo { left: Vec<Arc<WarpTable>>, right: Vec<Arc<WarpTable>> },
}

impl RenderMode {
    /// Build the lazy warp tables for `params`.
    pub fn build(params: &InitParams) -> Self {
        let n = params.camera_count;
        let (chunk_w, h, overlap_w) = (params.novel_view_count, params.flow_height, params.flow_width);
        match params.mode {
            RenderModeKind::Mono => {
                let warp = Arc::new(build_lazy_warp(chunk_w, h, overlap_w, 0.0));
                RenderMode::Mono { warps: vec![warp; n] }
            }
            RenderModeKind::Stereo { vergence } => {
                let (l, r) = build_stereo_warps(chunk_w, h, overlap_w, vergence);
                RenderMode::Stereo { left: vec![l; n], right: vec![r; n] }
            }
        }
    }

    pub fn is_stereo(&self) -> bool {
        matches!(self, RenderMode::Stereo { .. })
    }

    pub fn camera_count(&self) -> usize {
        match self {
            RenderMode::Mono { warps } => warps.len(),
            RenderMode::Stereo { left, .. } => left.len(),
        }
    }
}

/// One camera pair's rendered output.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Mono(ColorImage),
    Stereo { left: ColorImage, right: ColorImage },
}

impl Chunk {
    /// The mono chunk, or the left eye of a stereo chunk.
    pub fn primary(&self) -> &ColorImage {
        match self {
            Chunk::Mono(img) => img,
            Chunk::Stereo { left, .. } => left,
        }
    }
}

// ============================================================
// Per-camera state and tasks
// ============================================================

/// Previous frame of one camera pair. Empty until its first frame.
#[derive(Debug, Clone, Default)]
pub struct PerCameraState {
    pub prev_l: Option<Arc<ColorImage>>,
    pub prev_r: Option<Arc<ColorImage>>,
    pub flow_l_to_r: Option<FlowField>,
    pub flow_r_to_l: Option<FlowField>,
}

impl PerCameraState {
    pub fn is_empty(&self) -> bool {
        self.flow_l_to_r.is_none() && self.flow_r_to_l.is_none()
    }

    fn previous_l_to_r(&self) -> Option<PreviousFrame<'_>> {
        match (&self.flow_l_to_r, &self.prev_l, &self.prev_r) {
            (Some(flow), Some(a), Some(b)) => Some(PreviousFrame { flow, image_a: a, image_b: b }),
            _ => None,
        }
    }

    fn previous_r_to_l(&self) -> Option<PreviousFrame<'_>> {
        match (&self.flow_r_to_l, &self.prev_r, &self.prev_l) {
            (Some(flow), Some(a), Some(b)) => Some(PreviousFrame { flow, image_a: a, image_b: b }),
            _ => None,
        }
    }
}

struct RenderTask {
    index: usize,
    image_l: Arc<ColorImage>,
    image_r: Arc<ColorImage>,
    state: PerCameraState,
    motion_threshold: f32,
}

struct RenderResult {
    index: usize,
    chunk: Chunk,
    state: PerCameraState,
    stats: DispatchStats,
}

/// Everything a worker needs besides its task; shared read-only.
struct Pipeline {
    engine: OpticalFlowEngine,
    synthesizer: NovelViewSynthesizer,
    mode: RenderMode,
    smooth_threshold: f32,
}

impl Pipeline {
    fn new(params: &InitParams) -> Self {
        Pipeline {
            engine: OpticalFlowEngine::new(params.flow.clone()),
            synthesizer: NovelViewSynthesizer::new(params.novel_view.clone()),
            mode: RenderMode::build(params),
            smooth_threshold: params.smooth_threshold,
        }
    }

    fn render_pair(&self, queue: &mut CommandQueue, task: RenderTask) -> RenderResult {
        let RenderTask { index, image_l, image_r, state, motion_threshold } = task;
        let thresholds = TemporalThresholds { motion: motion_threshold, smooth: self.smooth_threshold };

        let flow_l_to_r = self.engine.compute_flow(
            queue, &image_l, &image_r, state.previous_l_to_r(), DirectionHint::Left, thresholds,
        );
        let flow_r_to_l = self.engine.compute_flow(
            queue, &image_r, &image_l, state.previous_r_to_l(), DirectionHint::Right, thresholds,
        );

        let chunk = match &self.mode {
            RenderMode::Mono { warps } => Chunk::Mono(self.synthesizer.combine(
                queue, &warps[index], &image_l, &image_r, &flow_l_to_r, &flow_r_to_l,
            )),
            RenderMode::Stereo { left, right } => {
                let (left, right) = self.synthesizer.combine_stereo(
                    queue, &left[index], &right[index], &image_l, &image_r, &flow_l_to_r, &flow_r_to_l,
                );
                Chunk::Stereo { left, right }
            }
        };

        let state = PerCameraState {
            prev_l: Some(image_l),
            prev_r: Some(image_r),
            flow_l_to_r: Some(flow_l_to_r.detached()),
            flow_r_to_l: Some(flow_r_to_l.detached()),
        };
        // The next frame for this index must not race this frame's kernels.
        queue.finish();
        RenderResult { index, chunk, state, stats: queue.take_stats() }
    }
}

// ============================================================
// Worker pool
// ============================================================

struct WorkerPool {
    task_tx: Sender<RenderTask>,
    result_rx: Receiver<RenderResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(
        pipeline: &Arc<Pipeline>,
        buffers: &BufferPool,
        threads: usize,
        capacity: usize,
    ) -> Result<Self, InitError> {
        let (task_tx, task_rx) = bounded::<RenderTask>(capacity);
        let (result_tx, result_rx) = bounded::<RenderResult>(capacity);

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let pipeline = Arc::clone(pipeline);
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let buffers = buffers.clone();
            let spawned = thread::Builder::new()
                .name(format!("panoflow-render-{id}"))
                .spawn(move || {
                    let _scope = buffers.scope();
                    worker_loop(id, &pipeline, task_rx, result_tx)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = id, error = %e, "failed to spawn render worker");
                    WorkerPool { task_tx, result_rx, handles }.shutdown();
                    return Err(InitError::WorkerSpawn(e.to_string()));
                }
            }
        }
        info!(threads, "render workers started");
        Ok(WorkerPool { task_tx, result_rx, handles })
    }

    fn shutdown(self) {
        let WorkerPool { task_tx, result_rx, handles } = self;
        drop(task_tx);
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                warn!("render worker exited with a panic");
            }
        }
        drop(result_rx);
        debug!(threads = count, "render workers joined");
    }
}

fn worker_loop(id: usize, pipeline: &Pipeline, tasks: Receiver<RenderTask>, results: Sender<RenderResult>) {
    let mut queue = CommandQueue::new();
    while let Ok(task) = tasks.recv() {
        let index = task.index;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline.render_pair(&mut queue, task)));
        match outcome {
            Ok(result) => {
                if results.send(result).is_err() {
                    break;
                }
            }
            Err(_) => {
                error!(worker = id, camera = index, "render worker failed mid-frame, aborting");
                std::process::abort();
            }
        }
    }
}

// ============================================================
// RenderContext
// ============================================================

/// Dispatch counts and wall time of the most recent frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub dispatch: DispatchStats,
    pub duration: Duration,
    pub cameras: usize,
}

/// Owns the worker pool, the warp tables and every camera's previous frame.
///
/// `render_chunks` is a frame barrier. Calls must not overlap; `&mut self`
/// enforces that.
pub struct RenderContext {
    pipeline: Arc<Pipeline>,
    states: Vec<PerCameraState>,
    pool: Option<WorkerPool>,
    buffers: BufferPool,
    /// Used only when there are no workers.
    local_queue: CommandQueue,
    flow_size: (usize, usize),
    last_frame: FrameStats,
}

impl RenderContext {
    /// Build warp tables and start `thread_count` workers. Zero workers
    /// renders every camera pair on the caller's thread.
    pub fn new(params: &InitParams, thread_count: usize) -> Result<Self, InitError> {
        Self::with_buffers(params, thread_count, BufferPool::new())
    }

    /// Like [`RenderContext::new`], leasing every frame buffer from `buffers`.
    pub fn with_buffers(params: &InitParams, thread_count: usize, buffers: BufferPool) -> Result<Self, InitError> {
        params.validate()?;
        let pipeline = Arc::new(Pipeline::new(params));
        let pool = if thread_count > 0 {
            Some(WorkerPool::start(&pipeline, &buffers, thread_count, params.camera_count)?)
        } else {
            info!("no render workers, rendering on the caller's thread");
            None
        };
        Ok(RenderContext {
            pipeline,
            states: vec![PerCameraState::default(); params.camera_count],
            pool,
            buffers,
            local_queue: CommandQueue::new(),
            flow_size: (params.flow_width, params.flow_height),
            last_frame: FrameStats::default(),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.handles.len())
    }

    pub fn camera_count(&self) -> usize {
        self.states.len()
    }

    pub fn mode(&self) -> &RenderMode {
        &self.pipeline.mode
    }

    /// The pool frame buffers are leased from.
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Previous-frame state of camera pair `index`.
    pub fn state(&self, index: usize) -> &PerCameraState {
        &self.states[index]
    }

    /// Render one chunk per camera pair. `images_l[i]` and `images_r[i]` are
    /// the overlap images of pair i at the flow working resolution.
    ///
    /// Returns after every pair has been rendered, with chunks in camera
    /// order regardless of which worker finished first.
    ///
    /// # Panics
    /// Panics if the slice lengths differ from the camera count or an image
    /// is not `flow_width × flow_height`.
    pub fn render_chunks(
        &mut self,
        images_l: &[Arc<ColorImage>],
        images_r: &[Arc<ColorImage>],
        motion_threshold: f32,
    ) -> Vec<Chunk> {
        let n = self.states.len();
        assert!(
            images_l.len() == n && images_r.len() == n,
            "expected {n} image pairs, got {} left and {} right",
            images_l.len(),
            images_r.len(),
        );
        let (fw, fh) = self.flow_size;
        for (i, (l, r)) in images_l.iter().zip(images_r).enumerate() {
            assert!(
                l.size() == (fw, fh) && r.size() == (fw, fh),
                "camera pair {i} images must be {fw}×{fh}, got {}×{} and {}×{}",
                l.width(), l.height(), r.width(), r.height(),
            );
        }

        let start = Instant::now();
        let mut dispatch = DispatchStats::default();
        let mut slots: Vec<Option<Chunk>> = vec![None; n];

        let tasks: Vec<RenderTask> = (0..n)
            .map(|index| RenderTask {
                index,
                image_l: Arc::clone(&images_l[index]),
                image_r: Arc::clone(&images_r[index]),
                state: std::mem::take(&mut self.states[index]),
                motion_threshold,
            })
            .collect();

        match &self.pool {
            None => {
                let _scope = self.buffers.scope();
                for task in tasks {
                    let result = self.pipeline.render_pair(&mut self.local_queue, task);
                    dispatch.merge(&result.stats);
                    self.states[result.index] = result.state;
                    slots[result.index] = Some(result.chunk);
                }
            }
            Some(pool) => {
                for task in tasks {
                    if pool.task_tx.send(task).is_err() {
                        panic!("render workers disconnected before the frame was queued");
                    }
                }
                for _ in 0..n {
                    let Ok(result) = pool.result_rx.recv() else {
                        panic!("render workers disconnected mid-frame");
                    };
                    assert!(slots[result.index].is_none(), "duplicate result for camera pair {}", result.index);
                    dispatch.merge(&result.stats);
                    self.states[result.index] = result.state;
                    slots[result.index] = Some(result.chunk);
                }
            }
        }

        let chunks: Vec<Chunk> = slots.into_iter().flatten().collect();
        assert_eq!(chunks.len(), n, "frame finished with missing chunks");

        let duration = start.elapsed();
        debug!(cameras = n, launches = dispatch.total_launches(), ?duration, "frame rendered");
        self.last_frame = FrameStats { dispatch, duration, cameras: n };
        chunks
    }

    /// Forget every camera's previous frame, e.g. after a seek or scene cut.
    pub fn reset_previous(&mut self) {
        self.states.fill_with(PerCameraState::default);
        debug!(cameras = self.states.len(), "previous frames cleared");
    }

    pub fn last_frame_stats(&self) -> &FrameStats {
        &self.last_frame
    }
}

/// Render one camera pair for two consecutive frames on synthetic input of
/// the configured size, and return the peak bytes it leased on `pool`.
///
/// The second frame takes the temporal path, so both flow variants are
/// covered. Warp tables are built before measuring; they are long-lived.
pub(crate) fn rehearse_chunk(params: &InitParams, pool: &BufferPool) -> u64 {
    let pipeline = Pipeline::new(params);
    let mut queue = CommandQueue::new();
    let (w, h) = (params.flow_width, params.flow_height);
    peak_during(pool, || {
        let image_l = Arc::new(ColorImage::filled(w, h, [120, 120, 120, 255]));
        let image_r = Arc::new(ColorImage::filled(w, h, [136, 136, 136, 255]));
        let mut state = PerCameraState::default();
        for _ in 0..2 {
            let task = RenderTask {
                index: 0,
                image_l: Arc::clone(&image_l),
                image_r: Arc::clone(&image_r),
                state: std::mem::take(&mut state),
                motion_threshold: params.motion_threshold,
            };
            state = pipeline.render_pair(&mut queue, task).state;
        }
    })
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

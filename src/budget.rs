// budget.rs — Device memory accounting and worker-count planning.
//
// Every pair of cameras processed concurrently needs its own set of flow
// pyramids and novel-view intermediates. Before any worker starts, the
// planner checks the device can hold
//
//     common + threads · chunk + reserved
//
//   common    gamma LUTs, warp tables, previous-frame caches (long-lived)
//   chunk     one camera pair's transient buffers (both flow directions)
//   reserved  peak extra memory of colour adjustment and panorama assembly
//
// `common` is leased explicitly. `chunk` and `reserved` are measured: the
// planner runs the real pipeline once on synthetic frames of the configured
// size with the pool in scope, so every `Image` it allocates is leased, and
// reads back the peak.
//
// The pool only counts bytes. Leases are RAII: dropping one gives its bytes
// back, and the pool remembers the peak it has seen.
//
// NEW RUST CONCEPTS:
// - `thread_local!` holds the pool in scope on the current thread, so image
//   constructors can lease without a pool argument threaded through every
//   kernel.
// - `PhantomData<*const ()>` makes `PoolScope` `!Send`: the guard must be
//   dropped on the thread that installed it.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::color_adjust::{ColorAdjustOptions, ColorAdjuster, GammaLut};
use crate::config::InitParams;
use crate::error::InitError;
use crate::image::ColorImage;
use crate::postprocess::{assemble, AssembleOptions, TemporalSmoother};
use crate::render::rehearse_chunk;

// ---------------------------------------------------------------------------
// BufferPool
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PoolInner {
    live: AtomicU64,
    peak: AtomicU64,
    limit: AtomicU64,
}

/// Shared byte accountant for device buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Bytes held until dropped.
#[derive(Debug)]
pub struct BufferLease {
    pool: Arc<PoolInner>,
    bytes: u64,
}

impl BufferLease {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.live.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

thread_local! {
    static IN_SCOPE: RefCell<Option<BufferPool>> = const { RefCell::new(None) };
}

/// Installs a pool for the current thread until dropped.
///
/// Scopes nest; dropping one restores the pool that was in scope before.
pub struct PoolScope {
    previous: Option<BufferPool>,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for PoolScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        IN_SCOPE.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Lease `bytes` from the pool in scope on this thread, if any.
pub(crate) fn lease_in_scope(bytes: u64) -> Option<BufferLease> {
    if bytes == 0 {
        return None;
    }
    IN_SCOPE.with(|slot| slot.borrow().as_ref().map(|pool| pool.lease(bytes)))
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a buffer of `bytes`.
    pub fn lease(&self, bytes: u64) -> BufferLease {
        let live = self.inner.live.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.inner.peak.fetch_max(live, Ordering::AcqRel);
        let limit = self.limit();
        // Warn once per crossing, not once per buffer.
        if limit > 0 && live > limit && live - bytes <= limit {
            warn!(live, limit, "buffer pool over its reservation limit");
        }
        BufferLease { pool: Arc::clone(&self.inner), bytes }
    }

    /// Lease every image allocated on this thread until the guard drops.
    pub fn scope(&self) -> PoolScope {
        let previous = IN_SCOPE.with(|slot| slot.replace(Some(self.clone())));
        PoolScope { previous, _thread_bound: PhantomData }
    }

    /// Bytes currently leased.
    pub fn live(&self) -> u64 {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Highest `live()` since the last `reset_peak`.
    pub fn reserved(&self) -> u64 {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// Restart peak tracking from the current live size.
    pub fn reset_peak(&self) {
        self.inner.peak.store(self.live(), Ordering::Release);
    }

    /// Reservation limit in bytes; 0 means unlimited.
    pub fn limit(&self) -> u64 {
        self.inner.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, bytes: u64) {
        self.inner.limit.store(bytes, Ordering::Release);
    }
}

/// Run `f` with `pool` in scope and return the peak bytes it leased on top
/// of what was live before. Restarts the pool's peak tracking.
///
/// Everything `f` allocates must be dropped before it returns.
pub(crate) fn peak_during(pool: &BufferPool, f: impl FnOnce()) -> u64 {
    let _scope = pool.scope();
    let before = pool.live();
    pool.reset_peak();
    f();
    pool.reserved().saturating_sub(before)
}

// ---------------------------------------------------------------------------
// Long-lived buffers
// ---------------------------------------------------------------------------

const RGBA: u64 = 4;
const FLOW: u64 = 8;
const WARP: u64 = 12;

fn area(w: usize, h: usize) -> u64 {
    w as u64 * h as u64
}

/// Long-lived per-pipeline buffers.
pub fn common_footprint(params: &InitParams) -> u64 {
    let n = params.camera_count as u64;
    let warp = params.tables_per_camera() as u64 * area(params.novel_view_count, params.flow_height) * WARP;
    let cache = area(params.flow_width, params.flow_height) * (2 * RGBA + 2 * FLOW);
    GammaLut::BYTES as u64 + n * (warp + cache)
}

/// Long-lived buffers of a running pipeline, as individual leases.
pub fn lease_common(pool: &BufferPool, params: &InitParams) -> Vec<BufferLease> {
    let mut leases = vec![pool.lease(GammaLut::BYTES as u64)];
    let warp = area(params.novel_view_count, params.flow_height) * WARP;
    let image = area(params.flow_width, params.flow_height) * RGBA;
    let flow = area(params.flow_width, params.flow_height) * FLOW;
    for _ in 0..params.camera_count {
        for _ in 0..params.tables_per_camera() {
            leases.push(pool.lease(warp));
        }
        leases.extend([pool.lease(image), pool.lease(image), pool.lease(flow), pool.lease(flow)]);
    }
    leases
}

// ---------------------------------------------------------------------------
// Measured footprints
// ---------------------------------------------------------------------------

/// Source images with uneven exposure, so the colour pass applies gains.
fn exposure_bracket(params: &InitParams) -> Vec<ColorImage> {
    (0..params.camera_count)
        .map(|i| {
            let v = 96 + 8 * (i % 4) as u8;
            ColorImage::filled(params.source_width, params.flow_height, [v, v, v, 255])
        })
        .collect()
}

/// Peak bytes of one frame's colour adjustment and panorama assembly.
///
/// Assembles two frames so each eye's temporal smoother holds history, with
/// every eye's chunks alive at once as `render_stereo` returns them.
fn rehearse_assembly(pool: &BufferPool, params: &InitParams) -> u64 {
    let lut = GammaLut::new();
    let eyes = params.tables_per_camera();
    let opts = AssembleOptions { wrap_offset: 1, ..AssembleOptions::default() };
    peak_during(pool, || {
        let mut sources = exposure_bracket(params);
        ColorAdjuster::new().pre_adjust(&lut, &mut sources, &ColorAdjustOptions::default());
        drop(sources);

        let mut smoothers: Vec<TemporalSmoother> = (0..eyes).map(|_| TemporalSmoother::new()).collect();
        for _ in 0..2 {
            let frame: Vec<Vec<ColorImage>> = (0..eyes)
                .map(|_| {
                    (0..params.camera_count)
                        .map(|_| ColorImage::new(params.novel_view_count, params.flow_height))
                        .collect()
                })
                .collect();
            for (chunks, smoother) in frame.into_iter().zip(&mut smoothers) {
                drop(assemble(chunks, &opts, smoother));
            }
        }
    })
}

/// Byte sizes the plan is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub common_size: u64,
    pub chunk_size: u64,
    pub reserved_size: u64,
}

/// Lease the long-lived buffers, then run one camera pair and one
/// assembly pass under `pool` and record what they reach.
///
/// Everything is released before returning.
pub fn measure_footprint(pool: &BufferPool, params: &InitParams) -> Footprint {
    let base = pool.live();
    let common = lease_common(pool, params);
    let common_size = pool.live() - base;

    let chunk_size = rehearse_chunk(params, pool);
    // Held while assembly is measured, as a running worker would hold it.
    let chunk = pool.lease(chunk_size);
    let reserved_size = rehearse_assembly(pool, params);

    drop(chunk);
    drop(common);
    debug!(common_size, chunk_size, reserved_size, "budget footprint");
    Footprint { common_size, chunk_size, reserved_size }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Outcome of budget planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPlan {
    pub common_size: u64,
    pub chunk_size: u64,
    pub reserved_size: u64,
    pub thread_count: usize,
    pub global_mem_size: u64,
}

impl BudgetPlan {
    /// Bytes the plan commits with `thread_count` workers.
    pub fn total(&self) -> u64 {
        self.common_size + self.thread_count as u64 * self.chunk_size + self.reserved_size
    }
}

impl Footprint {
    /// Bytes committed with `threads` workers.
    pub fn with_threads(&self, threads: usize) -> u64 {
        self.common_size + threads as u64 * self.chunk_size + self.reserved_size
    }

    /// Pick the largest of `thread_options` that fits in `global_mem_size`.
    ///
    /// # Errors
    /// `InsufficientMemory` when not even the smallest option fits.
    pub fn plan(&self, thread_options: &[usize], global_mem_size: u64) -> Result<BudgetPlan, InitError> {
        let mut options = thread_options.to_vec();
        options.sort_unstable();
        let fits = |threads: usize| self.with_threads(threads) <= global_mem_size;

        let Some(thread_count) = options.iter().rev().copied().find(|&t| fits(t)) else {
            let smallest = options.first().copied().unwrap_or(1);
            let required = self.with_threads(smallest);
            warn!(required, available = global_mem_size, threads = smallest, "no render thread option fits");
            return Err(InitError::InsufficientMemory { required, available: global_mem_size });
        };

        info!(thread_count, global_mem_size, "render thread budget");
        Ok(BudgetPlan {
            common_size: self.common_size,
            chunk_size: self.chunk_size,
            reserved_size: self.reserved_size,
            thread_count,
            global_mem_size,
        })
    }
}

/// Decide how many render workers fit in `global_mem_size` bytes.
///
/// Measures the working set on `pool` (see [`measure_footprint`]) and
/// releases everything before returning.
pub fn plan_thread_count(
    pool: &BufferPool,
    params: &InitParams,
    global_mem_size: u64,
) -> Result<BudgetPlan, InitError> {
    params.validate()?;
    measure_footprint(pool, params).plan(&params.thread_options, global_mem_size)
}

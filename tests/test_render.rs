// tests/test_render.rs — RenderContext scheduling and the Panorama lifecycle.
//
// Run with logs:
//   RUST_LOG=panoflow=debug cargo test --test test_render -- --nocapture

use std::sync::Arc;

use panoflow::config::{InitParams, RenderModeKind, GIB};
use panoflow::error::InitError;
use panoflow::gpu::DeviceReport;
use panoflow::image::{ColorImage, Image};
use panoflow::panorama::Panorama;
use panoflow::postprocess::AssembleOptions;
use panoflow::render::{Chunk, RenderContext};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params(cameras: usize) -> InitParams {
    InitParams {
        camera_count: cameras,
        novel_view_count: 10,
        source_width: 60,
        flow_width: 20,
        flow_height: 14,
        ..Default::default()
    }
}

/// Each camera pair gets its own flat colour so chunks identify their index.
fn labelled_frame(cameras: usize) -> (Vec<Arc<ColorImage>>, Vec<Arc<ColorImage>>) {
    (0..cameras)
        .map(|i| {
            let v = (20 + i * 25) as u8;
            let img = Arc::new(Image::filled(20, 14, [v, v, v, 255]));
            (Arc::clone(&img), img)
        })
        .unzip()
}

// ===== Frame barrier =====

#[test]
fn results_land_at_their_index() {
    init_logging();
    let cameras = 8;
    let (l, r) = labelled_frame(cameras);
    let mut ctx = RenderContext::new(&params(cameras), 4).unwrap();
    for _ in 0..3 {
        let chunks = ctx.render_chunks(&l, &r, 0.05);
        assert_eq!(chunks.len(), cameras);
        for (i, chunk) in chunks.iter().enumerate() {
            let v = (20 + i * 25) as u8;
            let centre = chunk.primary().get(5, 7);
            assert_eq!(centre, [v, v, v, 255], "chunk {i} came from the wrong pair");
        }
        assert_eq!(ctx.last_frame_stats().cameras, cameras);
        // One device drain per camera pair.
        assert_eq!(ctx.last_frame_stats().dispatch.finishes(), cameras as u64);
    }
}

#[test]
fn every_index_keeps_its_own_history() {
    let cameras = 5;
    let (l, r) = labelled_frame(cameras);
    let mut ctx = RenderContext::new(&params(cameras), 2).unwrap();
    ctx.render_chunks(&l, &r, 0.05);
    for i in 0..cameras {
        let state = ctx.state(i);
        assert!(Arc::ptr_eq(state.prev_l.as_ref().unwrap(), &l[i]));
        assert!(state.flow_r_to_l.is_some());
    }
}

#[test]
fn synchronous_mode_renders_the_same_chunks() {
    let (l, r) = labelled_frame(3);
    let mut sync = RenderContext::new(&params(3), 0).unwrap();
    let mut pooled = RenderContext::new(&params(3), 2).unwrap();
    assert_eq!(sync.render_chunks(&l, &r, 0.05), pooled.render_chunks(&l, &r, 0.05));
}

// ===== Clearing previous frames =====

#[test]
fn clear_previous_frames_skips_temporal_regularization() {
    let mut pano = Panorama::initialize_on(params(3), DeviceReport::simulated(8 * GIB)).unwrap();
    let (l, r) = labelled_frame(3);

    pano.render_mono(&l, &r, None);
    pano.render_mono(&l, &r, None);
    assert!(pano.last_frame_stats().dispatch.count("flow_temporal_regularize") > 0);

    pano.clear_previous_frames();
    for i in 0..3 {
        assert!(pano.render_context().state(i).is_empty());
    }
    pano.render_mono(&l, &r, None);
    let stats = &pano.last_frame_stats().dispatch;
    assert_eq!(stats.count("flow_temporal_regularize"), 0);
    assert_eq!(stats.count("flow_motion"), 0);
}

// ===== Initialization =====

#[test]
fn too_little_memory_fails_without_workers() {
    let p = InitParams { min_device_memory: 0, ..params(4) };
    let common = panoflow::budget::common_footprint(&p);
    let err = Panorama::initialize_on(p, DeviceReport::simulated(common - 1)).err();
    assert!(matches!(err, Some(InitError::InsufficientMemory { .. })), "{err:?}");
}

#[test]
fn invalid_params_are_rejected_before_planning() {
    let p = InitParams { novel_view_count: 0, ..params(2) };
    let err = Panorama::initialize_on(p, DeviceReport::simulated(8 * GIB)).err();
    assert!(matches!(err, Some(InitError::InvalidParams(_))));
}

#[test]
fn zero_worker_cap_renders_synchronously() {
    let p = InitParams { max_worker_threads: Some(0), ..params(2) };
    let mut pano = Panorama::initialize_on(p, DeviceReport::simulated(8 * GIB)).unwrap();
    assert_eq!(pano.thread_count(), 0);
    let (l, r) = labelled_frame(2);
    assert_eq!(pano.render_mono(&l, &r, Some(0.1)).len(), 2);
}

// ===== End to end =====

#[test]
fn stereo_frame_to_panorama() {
    init_logging();
    let p = InitParams { mode: RenderModeKind::Stereo { vergence: 1.5 }, ..params(4) };
    let mut pano = Panorama::initialize_on(p, DeviceReport::simulated(8 * GIB)).unwrap();
    let (l, r) = labelled_frame(4);
    let (left, right) = pano.render_stereo(&l, &r, None);
    let opts = AssembleOptions { wrap_offset: 3, temporal_threshold: 0.05, ..AssembleOptions::default() };
    let left = pano.assemble(0, left, &opts);
    let right = pano.assemble(1, right, &opts);
    assert_eq!(left.size(), (40, 14));
    assert_eq!(right.size(), (40, 14));
    pano.release();
}

#[test]
fn chunk_primary_is_left_eye() {
    let left = Image::filled(2, 2, [1u8, 1, 1, 1]);
    let right = Image::filled(2, 2, [2u8, 2, 2, 2]);
    let chunk = Chunk::Stereo { left: left.clone(), right };
    assert_eq!(chunk.primary(), &left);
}

// panoflow: flow-guided multi-camera panorama stitching
//
// Per camera pair: dense optical flow in both directions, then novel views
// synthesized along the overlap. Pairs are spread over a worker pool sized
// from the device memory budget.

// Image containers and per-pixel building blocks.
pub mod image;
pub mod convert;
pub mod convolution;
pub mod gradient;
pub mod median;
pub mod remap;
pub mod pyramid;

// Kernel runtime and configuration.
pub mod runtime;
pub mod config;
pub mod error;

// Image-to-image stages.
pub mod flow;          // OpticalFlowEngine
pub mod novel_view;    // NovelViewSynthesizer
pub mod color_adjust;  // ColorAdjuster
pub mod postprocess;   // chunk assembly

// Orchestration.
pub mod budget;        // BufferBudgetPlanner
pub mod render;        // RenderContext
pub mod panorama;
pub mod gpu;

pub use budget::{plan_thread_count, BudgetPlan, BufferPool};
pub use color_adjust::{ColorAdjustOptions, ColorAdjuster, GammaLut};
pub use config::{FlowParams, InitParams, NovelViewParams, RenderModeKind, SmoothingSchedule};
pub use error::InitError;
pub use flow::{DirectionHint, OpticalFlowEngine, PreviousFrame, TemporalThresholds};
pub use gpu::DeviceReport;
pub use image::{ColorImage, FlowField, Image, WarpTable};
pub use novel_view::NovelViewSynthesizer;
pub use panorama::Panorama;
pub use postprocess::AssembleOptions;
pub use render::{Chunk, RenderContext, RenderMode};
pub use runtime::{CommandQueue, DispatchStats};

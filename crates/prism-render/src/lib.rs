//! Frame orchestration for the Prism ray-tracing renderer.
//!
//! This crate provides:
//! - A pass graph that orders frame passes by the resources they read and write
//! - Acceleration structure builds, ray tracing and compute kernels, and the
//!   raster composition pass
//! - Render targets, camera uniforms and per-swapchain-image framebuffers
//! - [`FrameRenderer`], which records a frame and hands back its submissions

pub mod camera;
pub mod error;
pub mod framebuffers;
pub mod graph;
pub mod pass;
pub mod passes;
pub mod renderer;
pub mod resources;
pub mod scene;

pub use camera::{Camera, CameraUniforms};
pub use error::{RenderError, Result};
pub use framebuffers::{FramebufferArena, FRAMEBUFFER_CACHE_SIZE};
pub use graph::{Edge, FramePlan, PassDecl, PassFlags, PassGraph, PlannedSubmission, ResourceId};
pub use pass::{FramePass, PassContext, SwapchainFrame};
pub use passes::{
    clearing_passes, standard_passes, standard_targets, BlasBuildPass, CompositionPass, FnPass,
    Kernel, KernelPass, PassBindings, StandardShaders, TlasBuildPass,
};
pub use renderer::{FrameRenderer, FrameTimes, GuiOverlay, RendererConfig};
pub use resources::{FrameResources, RenderTarget, TargetDesc};
pub use scene::{FrameState, Mesh, MeshInstance};

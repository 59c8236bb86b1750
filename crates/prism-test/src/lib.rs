//! Test harness for the Prism renderer.
//!
//! Provides a headless device, off-screen destination images and readback.
//! Tests that need a Vulkan device are ignored by default; run them with
//! `cargo test -p prism-test -- --ignored`.

pub mod frames;
pub mod harness;

pub use frames::{render_and_wait, triangle_scene, OffscreenTarget, TestScene};
pub use harness::HeadlessDevice;

use prism_gpu::GpuError;
use prism_render::RenderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("No Vulkan adapter available")]
    NoAdapter,
    #[error("Readback failed: {0}")]
    Readback(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

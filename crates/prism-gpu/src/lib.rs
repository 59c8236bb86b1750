//! Vulkan device layer for the Prism ray-tracing renderer.
//!
//! This crate provides:
//! - Instance creation, adapter enumeration and logical device setup
//! - Adapter, output and display-mode selection
//! - Buffers, images, views, samplers, descriptors, pipelines, render passes
//!   and acceleration structures, allocated through gpu-allocator
//! - CPU-kind and GPU-kind synchronization primitives
//! - Command recording and batched queue submission
//! - Blocking upload of initial image data

pub mod acceleration;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod display;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod ray_tracing;
pub mod render_pass;
pub mod submit;
pub mod sync;
pub mod upload;
pub mod views;

pub use acceleration::{AccelerationStructure, Blas, Tlas, TlasInstance, TriangleGeometry};
pub use capabilities::{AdapterInfo, DeviceLimits, GpuVendor, RayTracingCapabilities};
pub use command::{BufferBarrier, CommandBuffer, CommandPool, ImageBarrier, RecordingState};
pub use context::{
    teardown_order, DeviceConfig, DeviceContext, FeatureSet, QueueFamilies, TeardownStep,
};
pub use descriptors::{
    BufferBinding, DescriptorAllocator, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorWrite, ImageBinding,
};
pub use device::RawDevice;
pub use display::{DisplayInfo, DisplayMode, DisplaySource, StaticDisplays, WindowParams};
pub use error::{GpuError, Result};
pub use gpu_allocator::MemoryLocation;
pub use memory::{Buffer, BufferDesc, Image, ImageDesc};
pub use pipeline::{
    ComputePipeline, Pipeline, PipelineLayout, RasterPipeline, RasterPipelineDesc, ShaderModule,
};
pub use ray_tracing::{HitGroup, RayTracingPipeline, RayTracingPipelineDesc};
pub use render_pass::{AttachmentDesc, Framebuffer, RenderPass, RenderPassDesc};
pub use submit::{Queue, SubmitInfo};
pub use sync::{SyncKind, SyncPrimitive};
pub use views::{ImageView, Sampler, SamplerDesc};

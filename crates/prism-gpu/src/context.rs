//! Device context: instance, adapter selection, logical device, queue,
//! command pool, and the resource factory built on top of them.

use crate::acceleration::{Blas, Tlas, TlasInstance, TriangleGeometry};
use crate::capabilities::{AdapterInfo, DeviceLimits};
use crate::command::{CommandBuffer, CommandPool};
use crate::descriptors::{
    update_descriptor_set, DescriptorAllocator, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorWrite,
};
use crate::device::{RawDevice, RawInstance, RayTracingLoaders};
use crate::display::{DisplayInfo, DisplayMode, DisplaySelection, DisplaySource, WindowParams};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, enumerate_adapters, DEBUG_UTILS_EXTENSION, VALIDATION_LAYER};
use crate::memory::{Buffer, BufferDesc, GpuAllocator, Image, ImageDesc};
use crate::pipeline::{
    ComputePipeline, PipelineLayout, RasterPipeline, RasterPipelineDesc, ShaderModule,
};
use crate::ray_tracing::{RayTracingPipeline, RayTracingPipelineDesc};
use crate::render_pass::{Framebuffer, RenderPass, RenderPassDesc};
use crate::submit::{Queue, SubmitInfo};
use crate::sync::{wait_and_reset, SyncKind, SyncPrimitive};
use crate::upload::upload_image;
use crate::views::{ImageView, Sampler, SamplerDesc};
use ash::vk;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::cell::OnceCell;
use std::ffi::CString;
use std::sync::Arc;

/// Device extensions added when ray tracing is requested.
pub const RAY_TRACING_EXTENSIONS: [&str; 3] = [
    "VK_KHR_acceleration_structure",
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_deferred_host_operations",
];

/// Required capabilities for [`DeviceContext::initialize`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    app_name: String,
    validation: bool,
    ray_tracing: bool,
    instance_layers: Vec<String>,
    instance_extensions: Vec<String>,
    device_extensions: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            validation: cfg!(debug_assertions),
            ray_tracing: true,
            instance_layers: Vec::new(),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable the Khronos validation layer.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    /// Require the acceleration structure and ray tracing pipeline extensions.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.ray_tracing = enable;
        self
    }

    pub fn require_instance_layer(mut self, name: impl Into<String>) -> Self {
        self.instance_layers.push(name.into());
        self
    }

    pub fn require_instance_extension(mut self, name: impl Into<String>) -> Self {
        self.instance_extensions.push(name.into());
        self
    }

    pub fn require_device_extension(mut self, name: impl Into<String>) -> Self {
        self.device_extensions.push(name.into());
        self
    }

    /// Every instance layer that must be present.
    pub fn instance_layers(&self) -> Vec<String> {
        let mut layers = Vec::new();
        if self.validation {
            layers.push(VALIDATION_LAYER.to_string());
        }
        layers.extend(self.instance_layers.iter().cloned());
        dedup(layers)
    }

    /// Every instance extension that must be present.
    pub fn instance_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        if self.validation {
            extensions.push(DEBUG_UTILS_EXTENSION.to_string());
        }
        #[cfg(target_os = "macos")]
        extensions.push("VK_KHR_portability_enumeration".to_string());
        extensions.extend(self.instance_extensions.iter().cloned());
        dedup(extensions)
    }

    /// Every device extension that must be present on the selected adapter.
    pub fn device_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        if self.ray_tracing {
            extensions.extend(RAY_TRACING_EXTENSIONS.iter().map(|s| s.to_string()));
        }
        extensions.extend(self.device_extensions.iter().cloned());
        dedup(extensions)
    }
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Queue family indices used by the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    /// A transfer-only family when one exists, otherwise `graphics`.
    pub transfer: u32,
}

impl QueueFamilies {
    /// Distinct families, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.transfer == self.graphics {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.transfer]
        }
    }
}

/// Pick the graphics family and, separately, a transfer family.
pub fn select_queue_families(families: &[vk::QueueFamilyProperties]) -> Result<QueueFamilies> {
    let graphics = families
        .iter()
        .enumerate()
        .filter(|(_, f)| f.queue_count > 0)
        .find(|(_, f)| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|(i, _)| i as u32)
        .ok_or(GpuError::NoSuitableQueueFamily)?;

    let transfer = families
        .iter()
        .enumerate()
        .filter(|(_, f)| f.queue_count > 0)
        .find(|(_, f)| {
            f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map_or(graphics, |(i, _)| i as u32);

    Ok(QueueFamilies { graphics, transfer })
}

/// Device features enabled at logical device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSet {
    /// Descriptor indexing with partially-bound and update-unused-while-pending bindings.
    pub descriptor_indexing: bool,
    pub scalar_block_layout: bool,
    pub buffer_device_address: bool,
    pub ray_tracing: bool,
}

impl FeatureSet {
    /// Full set on 64-bit targets, reduced set elsewhere.
    pub fn for_target(ray_tracing: bool) -> Self {
        let wide = cfg!(target_pointer_width = "64");
        Self {
            descriptor_indexing: wide,
            scalar_block_layout: wide,
            buffer_device_address: true,
            ray_tracing,
        }
    }
}

struct LogicalDevice {
    // Field order is drop order: dependents before the device
    main_command_buffer: OnceCell<CommandBuffer>,
    command_pool: Arc<CommandPool>,
    queue: Queue,
    families: QueueFamilies,
    raw: Arc<RawDevice>,
}

/// One step of device teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Allocator,
    MainCommandBuffer,
    CommandPool,
    Device,
}

/// Order of teardown given how many allocations are still alive.
///
/// The allocator goes first. While allocations are alive it cannot, and is
/// released by the device itself right before the device is destroyed.
pub fn teardown_order(live_allocations: usize) -> Vec<TeardownStep> {
    let mut steps = Vec::with_capacity(4);
    if live_allocations == 0 {
        steps.push(TeardownStep::Allocator);
    }
    steps.extend([
        TeardownStep::MainCommandBuffer,
        TeardownStep::CommandPool,
        TeardownStep::Device,
    ]);
    steps
}

/// Owns the instance, the adapter list, and (once selected) the logical device.
pub struct DeviceContext {
    config: DeviceConfig,
    adapters: Vec<(vk::PhysicalDevice, AdapterInfo)>,
    current_adapter: usize,
    displays: DisplaySelection,
    device: Option<LogicalDevice>,
    instance: Arc<RawInstance>,
}

impl DeviceContext {
    /// Load Vulkan, create the instance with the configured layers and
    /// extensions, and enumerate adapters.
    ///
    /// Fails if any required layer or extension is unsupported.
    pub fn initialize(config: &DeviceConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| {
            tracing::error!(%err, "Failed to load the Vulkan loader");
            GpuError::Loading(err.to_string())
        })?;

        let layers = config.instance_layers();
        let extensions = config.instance_extensions();
        let instance = unsafe { create_instance(&entry, &config.app_name, &layers, &extensions) }?;
        let instance = Arc::new(RawInstance { entry, instance });
        tracing::info!(
            layers = layers.len(),
            extensions = extensions.len(),
            validation = config.validation,
            "Vulkan instance created"
        );

        let adapters = unsafe { enumerate_adapters(&instance.instance) }?;
        if adapters.is_empty() {
            tracing::warn!("No Vulkan adapters found");
        }
        for (id, (_, info)) in adapters.iter().enumerate() {
            tracing::info!(id, "Adapter: {}", info.summary());
        }

        Ok(Self {
            config: config.clone(),
            adapters,
            current_adapter: 0,
            displays: DisplaySelection::default(),
            device: None,
            instance,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn adapter_info(&self, id: usize) -> Result<&AdapterInfo> {
        self.adapters
            .get(id)
            .map(|(_, info)| info)
            .ok_or_else(|| GpuError::out_of_range("adapter", id, self.adapters.len()))
    }

    pub fn current_adapter(&self) -> usize {
        self.current_adapter
    }

    pub fn set_current_adapter(&mut self, id: usize) -> Result<()> {
        if id >= self.adapters.len() {
            return Err(GpuError::out_of_range("adapter", id, self.adapters.len()));
        }
        self.current_adapter = id;
        Ok(())
    }

    /// Replace the output list with a snapshot of `source`.
    pub fn set_display_source(&mut self, source: &dyn DisplaySource) {
        self.displays = DisplaySelection::from_source(source);
    }

    pub fn output_count(&self) -> usize {
        self.displays.output_count()
    }

    pub fn output_info(&self, id: usize) -> Result<&DisplayInfo> {
        self.displays.output_info(id)
    }

    pub fn current_output(&self) -> usize {
        self.displays.current_output()
    }

    pub fn set_current_output(&mut self, id: usize) -> Result<()> {
        self.displays.set_current_output(id)
    }

    pub fn display_mode_count(&self, output: usize) -> Result<usize> {
        self.displays.display_mode_count(output)
    }

    pub fn display_mode_info(&self, id: usize) -> Result<DisplayMode> {
        self.displays.display_mode_info(id)
    }

    pub fn current_display_mode(&self) -> usize {
        self.displays.current_display_mode()
    }

    pub fn set_current_display_mode(&mut self, id: usize) -> Result<()> {
        self.displays.set_current_display_mode(id)
    }

    /// Window parameters for the current display mode, or the default size
    /// when no output is known.
    pub fn window_params(&self) -> WindowParams {
        self.displays.window_params().unwrap_or_default()
    }

    /// Select an adapter and create the logical device, queue, command pool
    /// and memory allocator for it.
    pub fn select_and_init_device(&mut self, adapter_id: usize) -> Result<()> {
        if self.device.is_some() {
            return Err(GpuError::InvalidState(
                "a logical device already exists; shut it down first".into(),
            ));
        }
        let (physical_device, info) = self
            .adapters
            .get(adapter_id)
            .cloned()
            .ok_or_else(|| GpuError::out_of_range("adapter", adapter_id, self.adapters.len()))?;

        let required = self.config.device_extensions();
        let missing = info.missing_extensions(required.iter().map(String::as_str));
        if !missing.is_empty() {
            for name in &missing {
                tracing::error!(
                    extension = %name,
                    adapter = %info.device_name,
                    "Required device extension is not supported"
                );
            }
            return Err(GpuError::MissingExtensions(missing));
        }

        let families = select_queue_families(&info.queue_families).inspect_err(|_| {
            tracing::error!(adapter = %info.device_name, "No graphics-capable queue family");
        })?;
        let features = FeatureSet::for_target(self.config.ray_tracing);
        let instance = &self.instance.instance;
        let device =
            unsafe { create_logical_device(instance, physical_device, families, features, &required) }?;
        tracing::info!(
            adapter = %info.device_name,
            graphics_family = families.graphics,
            transfer_family = families.transfer,
            "Logical device created"
        );

        let allocator = match unsafe {
            GpuAllocator::new(instance, &device, physical_device, features.buffer_device_address)
        } {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };
        let ray_tracing = features.ray_tracing.then(|| RayTracingLoaders {
            acceleration_structure: ash::khr::acceleration_structure::Device::new(instance, &device),
            ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device::new(instance, &device),
        });

        let raw = Arc::new(RawDevice {
            device,
            physical_device,
            adapter: info,
            allocator: Mutex::new(allocator),
            ray_tracing,
            instance: Arc::clone(&self.instance),
        });
        let queue = Queue::new(&raw, families.graphics);
        let command_pool = Arc::new(CommandPool::new(&raw, families.graphics)?);

        self.current_adapter = adapter_id;
        self.device = Some(LogicalDevice {
            main_command_buffer: OnceCell::new(),
            command_pool,
            queue,
            families,
            raw,
        });
        tracing::info!(adapter_id, "Device initialized");
        Ok(())
    }

    pub fn is_device_initialized(&self) -> bool {
        self.device.is_some()
    }

    fn device(&self) -> Result<&LogicalDevice> {
        self.device.as_ref().ok_or(GpuError::NotInitialized)
    }

    /// Shared device handle that every resource keeps alive.
    pub fn raw(&self) -> Result<&Arc<RawDevice>> {
        Ok(&self.device()?.raw)
    }

    pub fn queue(&self) -> Result<&Queue> {
        Ok(&self.device()?.queue)
    }

    pub fn queue_families(&self) -> Result<QueueFamilies> {
        Ok(self.device()?.families)
    }

    pub fn command_pool(&self) -> Result<&Arc<CommandPool>> {
        Ok(&self.device()?.command_pool)
    }

    /// Limits of the current adapter.
    pub fn limits(&self) -> Result<&DeviceLimits> {
        Ok(&self.adapter_info(self.current_adapter)?.limits)
    }

    /// Wait for the device, then tear it down in [`teardown_order`] and
    /// return the steps that ran. Safe to call more than once and after a
    /// failed initialization, which both run no steps.
    pub fn shutdown(&mut self) -> Vec<TeardownStep> {
        let Some(device) = self.device.take() else {
            return Vec::new();
        };
        if let Err(err) = unsafe { device.raw.device.device_wait_idle() } {
            tracing::warn!(%err, "vkDeviceWaitIdle failed during shutdown");
        }
        let LogicalDevice {
            main_command_buffer,
            command_pool,
            queue,
            families: _,
            raw,
        } = device;

        let live = raw.allocator().live_allocations();
        if live > 0 {
            tracing::warn!(
                allocations = live,
                "GPU memory still in use; the allocator is released with the device"
            );
        }
        let steps = teardown_order(live);
        let mut main_command_buffer = Some(main_command_buffer);
        let mut command_pool = Some(command_pool);
        let mut queue = Some(queue);
        let mut raw = Some(raw);
        for step in &steps {
            match step {
                TeardownStep::Allocator => {
                    if let Some(raw) = &raw {
                        raw.allocator().shutdown();
                    }
                }
                TeardownStep::MainCommandBuffer => drop(main_command_buffer.take()),
                TeardownStep::CommandPool => drop(command_pool.take()),
                TeardownStep::Device => {
                    drop(queue.take());
                    if let Some(raw) = raw.take() {
                        if Arc::strong_count(&raw) > 1 {
                            tracing::warn!(
                                holders = Arc::strong_count(&raw) - 1,
                                "Resources still alive at shutdown; the device is destroyed when they drop"
                            );
                        }
                    }
                }
            }
        }
        tracing::info!(?steps, "Device shut down");
        steps
    }

    // Command recording and submission

    /// The cached main command buffer, created on first use.
    pub fn main_command_buffer(&self) -> Result<&CommandBuffer> {
        let device = self.device()?;
        if let Some(cmd) = device.main_command_buffer.get() {
            return Ok(cmd);
        }
        let cmd = CommandBuffer::new(&device.command_pool, true)?;
        Ok(device.main_command_buffer.get_or_init(|| cmd))
    }

    /// A fresh primary command buffer with its own completion primitive.
    pub fn create_command_buffer(&self) -> Result<CommandBuffer> {
        CommandBuffer::new(&self.device()?.command_pool, true)
    }

    pub fn create_sync_primitive(&self, kind: SyncKind) -> Result<SyncPrimitive> {
        SyncPrimitive::new(self.raw()?, kind)
    }

    /// Block until every CPU-kind primitive is signaled, then reset them.
    pub fn wait(&self, primitives: &[&SyncPrimitive]) -> Result<()> {
        wait_and_reset(self.raw()?, primitives)
    }

    /// Block until all submitted GPU work has completed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_gpu(&self) -> Result<()> {
        self.raw()?.wait_idle()
    }

    /// Submit one command buffer with at most one wait and one signal.
    ///
    /// The buffer's own completion primitive, if any, is signaled as well.
    pub fn execute_command_buffer(
        &self,
        cmd: &CommandBuffer,
        wait_for: Option<&SyncPrimitive>,
        signal: Option<&SyncPrimitive>,
    ) -> Result<()> {
        let mut info = SubmitInfo::new(cmd);
        if let Some(wait) = wait_for {
            info = info.wait(wait);
        }
        if let Some(signal) = signal {
            info = info.signal(signal);
        }
        self.device()?.queue.submit(&[info])
    }

    /// Submit a batch in order; the last buffer's completion primitive
    /// signals the whole batch.
    pub fn dispatch_to_gpu(&self, submissions: &[SubmitInfo<'_>]) -> Result<()> {
        self.device()?.queue.submit(submissions)
    }

    // Resource factory

    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        Buffer::new(self.raw()?, desc)
    }

    pub fn create_image(&self, desc: &ImageDesc<'_>) -> Result<Image> {
        Image::new(self.raw()?, desc)
    }

    /// Create an image and fill it with per-mip data, blocking until the
    /// upload has finished. The image ends in shader read-only layout, except
    /// when every mip is empty: nothing is uploaded and it stays undefined.
    ///
    /// A non-empty mip shorter than its level is an `InvalidResource` error.
    pub fn create_image_with_data(&self, desc: &ImageDesc<'_>, mips: &[&[u8]]) -> Result<Image> {
        let device = self.device()?;
        let mut desc = desc.clone();
        desc.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        let image = Image::new(&device.raw, &desc)?;
        let cmd = CommandBuffer::new(&device.command_pool, true)?;
        upload_image(&device.raw, &device.queue, &cmd, &image, mips)?;
        Ok(image)
    }

    pub fn create_image_view(&self, image: &Image) -> Result<ImageView> {
        ImageView::new(image)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler> {
        Sampler::new(self.raw()?, desc)
    }

    pub fn create_descriptor_set_layout(
        &self,
        builder: &DescriptorSetLayoutBuilder,
    ) -> Result<DescriptorSetLayout> {
        builder.build(self.raw()?)
    }

    pub fn create_descriptor_allocator(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorAllocator> {
        DescriptorAllocator::new(self.raw()?, max_sets, pool_sizes)
    }

    pub fn update_descriptor_set(&self, write: &DescriptorWrite<'_>) -> Result<()> {
        update_descriptor_set(self.raw()?, write);
        Ok(())
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[&DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Arc<PipelineLayout>> {
        PipelineLayout::new(self.raw()?, set_layouts, push_constant_ranges).map(Arc::new)
    }

    pub fn create_shader_module(&self, spirv: &[u32]) -> Result<ShaderModule> {
        ShaderModule::new(self.raw()?, spirv)
    }

    pub fn create_raster_pipeline(
        &self,
        layout: Arc<PipelineLayout>,
        render_pass: &RenderPass,
        desc: &RasterPipelineDesc<'_>,
    ) -> Result<RasterPipeline> {
        RasterPipeline::new(self.raw()?, layout, render_pass, desc)
    }

    pub fn create_compute_pipeline(
        &self,
        layout: Arc<PipelineLayout>,
        shader: &ShaderModule,
    ) -> Result<ComputePipeline> {
        ComputePipeline::new(self.raw()?, layout, shader)
    }

    pub fn create_ray_tracing_pipeline(
        &self,
        layout: Arc<PipelineLayout>,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> Result<RayTracingPipeline> {
        RayTracingPipeline::new(self.raw()?, layout, desc)
    }

    pub fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPass> {
        RenderPass::new(self.raw()?, desc)
    }

    pub fn create_framebuffer(
        &self,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Framebuffer> {
        Framebuffer::new(self.raw()?, render_pass, attachments, extent)
    }

    pub fn create_blas(&self, geometries: &[TriangleGeometry<'_>]) -> Result<Blas> {
        Blas::new(self.raw()?, geometries)
    }

    pub fn create_tlas(&self, instances: &[TlasInstance]) -> Result<Tlas> {
        Tlas::new(self.raw()?, instances)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Create the logical device with the queue families and feature set.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    features: FeatureSet,
    extensions: &[String],
) -> Result<ash::Device> {
    let queue_priority = [1.0_f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priority)
        })
        .collect();

    let extension_names = extensions
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| GpuError::InvalidResource(format!("name contains NUL: {name:?}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let extension_ptrs: Vec<_> = extension_names.iter().map(|e| e.as_ptr()).collect();

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(features.buffer_device_address)
        .scalar_block_layout(features.scalar_block_layout)
        .descriptor_indexing(features.descriptor_indexing)
        .runtime_descriptor_array(features.descriptor_indexing)
        .descriptor_binding_partially_bound(features.descriptor_indexing)
        .descriptor_binding_update_unused_while_pending(features.descriptor_indexing)
        .shader_sampled_image_array_non_uniform_indexing(features.descriptor_indexing);
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let mut features2 =
        vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);
    if features.ray_tracing {
        features2 = features2
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_pipeline_features);
    }

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_ptrs)
        .push_next(&mut features2);

    instance
        .create_device(physical_device, &create_info, None)
        .map_err(|err| {
            tracing::error!(%err, "vkCreateDevice failed");
            GpuError::from(err)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_transfer_only_family() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let selected = select_queue_families(&families).unwrap();
        assert_eq!(selected, QueueFamilies { graphics: 0, transfer: 2 });
        assert_eq!(selected.unique(), vec![0, 2]);
    }

    #[test]
    fn transfer_shares_graphics_without_dedicated_family() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 4),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
        ];
        let selected = select_queue_families(&families).unwrap();
        assert_eq!(selected, QueueFamilies { graphics: 1, transfer: 1 });
        assert_eq!(selected.unique(), vec![1]);
    }

    #[test]
    fn no_graphics_family_fails() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 4),
            family(vk::QueueFlags::GRAPHICS, 0),
        ];
        assert!(matches!(
            select_queue_families(&families),
            Err(GpuError::NoSuitableQueueFamily)
        ));
        assert!(select_queue_families(&[]).is_err());
    }

    #[test]
    fn validation_adds_layer_and_debug_utils() {
        let config = DeviceConfig::new()
            .validation(true)
            .require_instance_layer(VALIDATION_LAYER)
            .require_instance_extension("VK_FAKE_nonexistent_extension");
        assert_eq!(config.instance_layers(), vec![VALIDATION_LAYER.to_string()]);
        let extensions = config.instance_extensions();
        assert_eq!(extensions[0], DEBUG_UTILS_EXTENSION);
        assert!(extensions.contains(&"VK_FAKE_nonexistent_extension".to_string()));

        let config = DeviceConfig::new().validation(false);
        assert!(config.instance_layers().is_empty());
        assert!(!config.instance_extensions().contains(&DEBUG_UTILS_EXTENSION.to_string()));
    }

    #[test]
    fn ray_tracing_extensions_follow_toggle() {
        let on = DeviceConfig::new().ray_tracing(true).device_extensions();
        assert!(RAY_TRACING_EXTENSIONS.iter().all(|e| on.contains(&e.to_string())));

        let off = DeviceConfig::new()
            .ray_tracing(false)
            .require_device_extension("VK_KHR_swapchain")
            .device_extensions();
        assert_eq!(off, vec!["VK_KHR_swapchain".to_string()]);
    }

    #[test]
    fn feature_set_depends_on_pointer_width() {
        let features = FeatureSet::for_target(false);
        assert!(features.buffer_device_address);
        assert!(!features.ray_tracing);
        #[cfg(target_pointer_width = "64")]
        assert!(features.descriptor_indexing && features.scalar_block_layout);
        #[cfg(not(target_pointer_width = "64"))]
        assert!(!features.descriptor_indexing && !features.scalar_block_layout);
    }

    #[test]
    fn allocator_torn_down_first_when_memory_is_free() {
        assert_eq!(
            teardown_order(0),
            vec![
                TeardownStep::Allocator,
                TeardownStep::MainCommandBuffer,
                TeardownStep::CommandPool,
                TeardownStep::Device,
            ]
        );
    }

    #[test]
    fn allocator_left_to_device_while_memory_is_live() {
        assert_eq!(
            teardown_order(3),
            vec![
                TeardownStep::MainCommandBuffer,
                TeardownStep::CommandPool,
                TeardownStep::Device,
            ]
        );
    }
}

//! GPU memory management and the buffer/image resources backed by it.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// GPU memory allocator wrapper.
///
/// Owned by the device and reached through `RawDevice::allocator`, which
/// serializes every allocation request.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    live: usize,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create memory allocator");
            GpuError::AllocationFailed(e.to_string())
        })?;

        Ok(Self {
            allocator: Some(allocator),
            live: 0,
        })
    }

    /// Allocate memory for the given requirements.
    pub fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let allocation = self
            .allocator
            .as_mut()
            .ok_or(GpuError::NotInitialized)?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        self.live += 1;
        Ok(allocation)
    }

    /// Return an allocation to the allocator.
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator
            .as_mut()
            .ok_or(GpuError::NotInitialized)?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        self.live = self.live.saturating_sub(1);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.allocator.is_some()
    }

    /// Allocations handed out and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn release(raw: &RawDevice, allocation: Option<Allocation>, what: &str) {
    if let Some(allocation) = allocation {
        if let Err(err) = raw.allocator().free(allocation) {
            tracing::warn!(%err, "Failed to free {what} allocation");
        }
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl<'a> BufferDesc<'a> {
    /// Host-visible transfer source, used for staging uploads.
    pub fn staging(name: &'a str, size: u64) -> Self {
        Self {
            name,
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        }
    }

    /// Host-visible uniform buffer, rewritten every frame.
    pub fn uniform(name: &'a str, size: u64) -> Self {
        Self {
            name,
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::CpuToGpu,
        }
    }

    /// Device-local buffer.
    pub fn gpu_only(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name,
            size,
            usage,
            location: MemoryLocation::GpuOnly,
        }
    }

    /// Host-visible transfer destination, used for readback.
    pub fn readback(name: &'a str, size: u64) -> Self {
        Self {
            name,
            size,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuToCpu,
        }
    }
}

/// A GPU buffer with its allocation.
pub struct Buffer {
    raw: Arc<RawDevice>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Create and bind a buffer. A zero size is rejected.
    pub fn new(raw: &Arc<RawDevice>, desc: &BufferDesc<'_>) -> Result<Self> {
        if desc.size == 0 {
            tracing::error!(name = desc.name, "Refusing to create zero-sized buffer");
            return Err(GpuError::InvalidResource(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { raw.device.create_buffer(&buffer_info, None) }.map_err(|err| {
            tracing::error!(%err, name = desc.name, "vkCreateBuffer failed");
            GpuError::from(err)
        })?;

        let requirements = unsafe { raw.device.get_buffer_memory_requirements(buffer) };
        let allocation = match raw
            .allocator()
            .allocate(desc.name, requirements, desc.location, true)
        {
            Ok(allocation) => allocation,
            Err(err) => {
                tracing::error!(%err, name = desc.name, "Buffer allocation failed");
                unsafe { raw.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let this = Self {
            raw: Arc::clone(raw),
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
        };
        let allocation = this.allocation.as_ref().ok_or(GpuError::NotInitialized)?;
        unsafe {
            raw.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(|err| {
            tracing::error!(%err, name = desc.name, "vkBindBufferMemory failed");
            GpuError::from(err)
        })?;

        Ok(this)
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Get the device address of this buffer.
    ///
    /// The buffer must have been created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { self.raw.device.get_buffer_device_address(&info) }
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "range {offset}..{end} exceeds buffer size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.mapped_ptr()?;
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Write plain-old-data values at the given offset (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read `len` bytes starting at `offset` (must be host-visible).
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let ptr = self.mapped_ptr()?;
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        release(&self.raw, self.allocation.take(), "buffer");
        unsafe {
            self.raw.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Image creation parameters.
#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
}

impl<'a> ImageDesc<'a> {
    /// A single-mip 2D image.
    pub fn new_2d(
        name: &'a str,
        format: vk::Format,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            name,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            usage,
        }
    }

    pub fn mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }
}

/// A GPU image with its allocation.
pub struct Image {
    raw: Arc<RawDevice>,
    image: vk::Image,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
}

impl Image {
    /// Create and bind a device-local 2D image.
    pub fn new(raw: &Arc<RawDevice>, desc: &ImageDesc<'_>) -> Result<Self> {
        let extent = desc.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || desc.mip_levels == 0 {
            tracing::error!(name = desc.name, ?extent, "Refusing to create empty image");
            return Err(GpuError::InvalidResource(format!(
                "image '{}' has an empty extent or no mip levels",
                desc.name
            )));
        }

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { raw.device.create_image(&create_info, None) }.map_err(|err| {
            tracing::error!(%err, name = desc.name, "vkCreateImage failed");
            GpuError::from(err)
        })?;

        let requirements = unsafe { raw.device.get_image_memory_requirements(image) };
        let allocation =
            match raw
                .allocator()
                .allocate(desc.name, requirements, MemoryLocation::GpuOnly, false)
            {
                Ok(allocation) => allocation,
                Err(err) => {
                    tracing::error!(%err, name = desc.name, "Image allocation failed");
                    unsafe { raw.device.destroy_image(image, None) };
                    return Err(err);
                }
            };

        let this = Self {
            raw: Arc::clone(raw),
            image,
            allocation: Some(allocation),
            format: desc.format,
            extent,
            mip_levels: desc.mip_levels,
        };
        let allocation = this.allocation.as_ref().ok_or(GpuError::NotInitialized)?;
        unsafe {
            raw.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(|err| {
            tracing::error!(%err, name = desc.name, "vkBindImageMemory failed");
            GpuError::from(err)
        })?;

        Ok(this)
    }

    /// Native handle accessor.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Extent of a mip level, clamped to one texel.
    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extent.width >> level).max(1),
            height: (self.extent.height >> level).max(1),
            depth: (self.extent.depth >> level).max(1),
        }
    }

    pub(crate) fn raw(&self) -> &Arc<RawDevice> {
        &self.raw
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        release(&self.raw, self.allocation.take(), "image");
        unsafe {
            self.raw.device.destroy_image(self.image, None);
        }
    }
}

//! Shared owners of the instance and logical device.
//!
//! Every resource keeps an `Arc<RawDevice>`, so a device can never be
//! destroyed while something created from it is still alive.

use crate::capabilities::{AdapterInfo, DeviceLimits};
use crate::error::{GpuError, Result};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Owns the loader entry and the instance.
pub struct RawInstance {
    // Entry must be kept alive for the lifetime of the instance
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
}

impl RawInstance {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for RawInstance {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_instance(None);
        }
        tracing::debug!("Vulkan instance destroyed");
    }
}

/// Extension function tables loaded for the logical device.
pub struct RayTracingLoaders {
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    pub ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
}

/// The logical device, its allocator and extension loaders.
pub struct RawDevice {
    pub(crate) device: ash::Device,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) adapter: AdapterInfo,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) ray_tracing: Option<RayTracingLoaders>,
    // Dropped after the device
    pub(crate) instance: Arc<RawInstance>,
}

impl RawDevice {
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn instance(&self) -> &Arc<RawInstance> {
        &self.instance
    }

    pub fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.adapter.limits
    }

    /// Lock the shared allocator.
    pub fn allocator(&self) -> MutexGuard<'_, GpuAllocator> {
        self.allocator.lock()
    }

    /// Block until all submitted GPU work has completed.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|err| {
            tracing::error!(%err, "vkDeviceWaitIdle failed");
            GpuError::from(err)
        })
    }

    /// Ray tracing loaders, or an error if the device was created without them.
    pub fn ray_tracing(&self) -> Result<&RayTracingLoaders> {
        self.ray_tracing.as_ref().ok_or_else(|| {
            GpuError::InvalidState("device was created without ray tracing extensions".into())
        })
    }
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // Allocator memory must be released before the device goes away
            self.allocator.get_mut().shutdown();
            self.device.destroy_device(None);
        }
        tracing::debug!("Logical device destroyed");
    }
}

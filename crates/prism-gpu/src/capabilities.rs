//! Adapter capability snapshots.

use ash::vk;
use hashbrown::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device limits relevant to resource creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_image_dimension_2d: u32,
    pub max_push_constants_size: u32,
    pub max_bound_descriptor_sets: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
}

impl DeviceLimits {
    fn from_vk(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_push_constants_size: limits.max_push_constants_size,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
        }
    }
}

/// Hardware ray tracing properties.
///
/// All zero when the adapter does not expose `VK_KHR_ray_tracing_pipeline`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingCapabilities {
    /// Whether the adapter can run ray tracing pipelines at all.
    pub fn is_supported(&self) -> bool {
        self.shader_group_handle_size > 0 && self.max_ray_recursion_depth > 0
    }
}

/// Immutable snapshot of one physical adapter, indexed by adapter id.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Physical device type
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub limits: DeviceLimits,
    pub ray_tracing: RayTracingCapabilities,
    /// Queue family properties, in family index order.
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Supported device extension names.
    pub available_extensions: HashSet<String>,
}

impl AdapterInfo {
    /// Query the snapshot from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid, and the instance must
    /// have been created for API version 1.1 or newer.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let has_ray_tracing = available_extensions
            .contains(ash::khr::ray_tracing_pipeline::NAME.to_str().unwrap_or_default());

        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if has_ray_tracing {
            properties2 = properties2
                .push_next(&mut rt_properties)
                .push_next(&mut as_properties);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let ray_tracing = if has_ray_tracing {
            RayTracingCapabilities {
                shader_group_handle_size: rt_properties.shader_group_handle_size,
                shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
                shader_group_base_alignment: rt_properties.shader_group_base_alignment,
                max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
                max_geometry_count: as_properties.max_geometry_count,
                max_instance_count: as_properties.max_instance_count,
                min_scratch_offset_alignment: as_properties
                    .min_acceleration_structure_scratch_offset_alignment,
            }
        } else {
            RayTracingCapabilities::default()
        };

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            limits: DeviceLimits::from_vk(&properties.limits),
            ray_tracing,
            queue_families,
            available_extensions,
        }
    }

    /// Names from `required` that this adapter does not expose.
    pub fn missing_extensions<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        required
            .into_iter()
            .filter(|name| !self.available_extensions.contains(*name))
            .map(String::from)
            .collect()
    }

    /// Get a human-readable summary of the adapter.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.is_supported() { "yes" } else { "no" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(extensions: &[&str]) -> AdapterInfo {
        AdapterInfo {
            vendor: GpuVendor::Amd,
            device_name: "Test GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 250),
            driver_version: 1,
            device_local_memory_mb: 8192,
            limits: DeviceLimits::default(),
            ray_tracing: RayTracingCapabilities::default(),
            queue_families: Vec::new(),
            available_extensions: extensions.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn missing_extensions_preserves_request_order() {
        let info = adapter(&["VK_KHR_swapchain"]);
        let missing = info.missing_extensions([
            "VK_KHR_acceleration_structure",
            "VK_KHR_swapchain",
            "VK_KHR_ray_tracing_pipeline",
        ]);
        assert_eq!(
            missing,
            vec!["VK_KHR_acceleration_structure", "VK_KHR_ray_tracing_pipeline"]
        );
    }

    #[test]
    fn ray_tracing_unsupported_by_default() {
        assert!(!RayTracingCapabilities::default().is_supported());
        let info = adapter(&[]);
        assert!(info.summary().contains("ray tracing: no"));
        assert!(info.summary().contains("Vulkan 1.3.250"));
    }
}

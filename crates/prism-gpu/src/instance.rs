//! Vulkan instance creation and adapter enumeration.

use crate::capabilities::AdapterInfo;
use crate::error::{GpuError, Result};
use ash::vk;
use hashbrown::HashSet;
use std::ffi::{c_char, CStr, CString};

/// Khronos validation layer name.
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Debug utils extension name, required alongside validation.
pub const DEBUG_UTILS_EXTENSION: &str = "VK_EXT_debug_utils";

/// Names from `required` that are absent from `supported`, in request order.
pub fn missing_names<'a, I, S>(required: I, supported: &HashSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = &'a S>,
    S: AsRef<str> + ?Sized + 'a,
{
    let mut seen = HashSet::new();
    required
        .into_iter()
        .map(AsRef::as_ref)
        .filter(|name| !supported.contains(*name) && seen.insert(*name))
        .map(String::from)
        .collect()
}

fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| GpuError::InvalidResource(format!("name contains NUL: {name:?}")))
        })
        .collect()
}

/// Create a Vulkan instance with exactly the required layers and extensions.
///
/// Every requested name is a hard precondition: if any layer or extension is
/// unsupported, each missing name is logged and creation fails without
/// touching the driver further.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    layers: &[String],
    extensions: &[String],
) -> Result<ash::Instance> {
    let available_layers: HashSet<String> = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .filter_map(|props| {
            CStr::from_ptr(props.layer_name.as_ptr())
                .to_str()
                .ok()
                .map(String::from)
        })
        .collect();
    let missing_layers = missing_names(layers, &available_layers);
    if !missing_layers.is_empty() {
        for name in &missing_layers {
            tracing::error!(layer = %name, "Required instance layer is not supported");
        }
        return Err(GpuError::MissingLayers(missing_layers));
    }

    let available_extensions: HashSet<String> = entry
        .enumerate_instance_extension_properties(None)?
        .iter()
        .filter_map(|props| {
            CStr::from_ptr(props.extension_name.as_ptr())
                .to_str()
                .ok()
                .map(String::from)
        })
        .collect();
    let missing_extensions = missing_names(extensions, &available_extensions);
    if !missing_extensions.is_empty() {
        for name in &missing_extensions {
            tracing::error!(extension = %name, "Required instance extension is not supported");
        }
        return Err(GpuError::MissingExtensions(missing_extensions));
    }

    let app_name = CString::new(app_name).unwrap_or_else(|_| c"prism".to_owned());
    let engine_name = c"Prism";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let layer_names = to_cstrings(layers)?;
    let extension_names = to_cstrings(extensions)?;
    let layer_ptrs: Vec<*const c_char> = layer_names.iter().map(|l| l.as_ptr()).collect();
    let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|e| e.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layer_ptrs)
        .flags(create_flags);

    entry.create_instance(&create_info, None).map_err(|err| {
        tracing::error!(%err, "vkCreateInstance failed");
        GpuError::Vulkan(err)
    })
}

/// Enumerate every physical adapter in driver order.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn enumerate_adapters(
    instance: &ash::Instance,
) -> Result<Vec<(vk::PhysicalDevice, AdapterInfo)>> {
    let devices = instance.enumerate_physical_devices()?;
    Ok(devices
        .into_iter()
        .map(|device| (device, AdapterInfo::query(instance, device)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn nothing_missing_when_all_supported() {
        let have = supported(&["VK_KHR_surface", "VK_EXT_debug_utils"]);
        let want = vec!["VK_EXT_debug_utils".to_string()];
        assert!(missing_names(&want, &have).is_empty());
    }

    #[test]
    fn reports_exact_missing_name() {
        let have = supported(&["VK_KHR_surface"]);
        let want = ["VK_KHR_surface", "VK_FAKE_nonexistent_extension"];
        assert_eq!(
            missing_names(want.iter().copied(), &have),
            vec!["VK_FAKE_nonexistent_extension"]
        );
    }

    #[test]
    fn duplicates_reported_once() {
        let have = supported(&[]);
        let want = [VALIDATION_LAYER, VALIDATION_LAYER];
        assert_eq!(missing_names(want.iter().copied(), &have), vec![VALIDATION_LAYER]);
    }
}

//! Vulkan instance creation and physical device selection.

use crate::capabilities::RAY_TRACING_EXTENSIONS;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::collections::HashSet;
use std::ffi::{CStr, CString};

/// Required instance extensions.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// Missing validation layers are skipped with a warning rather than failing.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Prism")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let requested = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = entry
        .enumerate_instance_layer_properties()
        .call("vkEnumerateInstanceLayerProperties")?;
    let layers: Vec<&CStr> = requested
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
            if !found {
                tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
            }
            found
        })
        .collect();

    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    entry
        .create_instance(&create_info, None)
        .call("vkCreateInstance")
}

/// Select the best physical device.
///
/// With `require_ray_tracing`, devices missing the ray-tracing extensions are
/// rejected outright.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    require_ray_tracing: bool,
) -> Result<vk::PhysicalDevice> {
    let devices = instance
        .enumerate_physical_devices()
        .call("vkEnumeratePhysicalDevices")?;

    devices
        .into_iter()
        .map(|device| (score_physical_device(instance, device, require_ray_tracing), device))
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Non-positive means unusable.
unsafe fn score_physical_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    require_ray_tracing: bool,
) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let extensions: HashSet<CString> = instance
        .enumerate_device_extension_properties(device)
        .unwrap_or_default()
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .map(CStr::to_owned)
        .collect();
    let has_ray_tracing = RAY_TRACING_EXTENSIONS
        .iter()
        .all(|ext| extensions.contains(*ext));

    score_device(
        properties.device_type,
        vram_gb(instance, device),
        has_ray_tracing,
        require_ray_tracing,
    )
}

unsafe fn vram_gb(instance: &ash::Instance, device: vk::PhysicalDevice) -> u64 {
    let memory = instance.get_physical_device_memory_properties(device);
    memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024 * 1024))
        .sum()
}

fn score_device(
    device_type: vk::PhysicalDeviceType,
    vram_gb: u64,
    has_ray_tracing: bool,
    require_ray_tracing: bool,
) -> i32 {
    if require_ray_tracing && !has_ray_tracing {
        return 0;
    }

    let mut score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 1,
    };
    score += vram_gb.min(256) as i32;
    if has_ray_tracing {
        score += 500;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_beats_integrated() {
        let discrete = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 8, false, false);
        let integrated = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 8, false, false);
        assert!(discrete > integrated);
    }

    #[test]
    fn ray_tracing_requirement_rejects_devices() {
        assert_eq!(
            score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 24, false, true),
            0
        );
        assert!(score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 2, true, true) > 0);
    }

    #[test]
    fn ray_tracing_is_preferred() {
        let rt = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 4, true, false);
        let plain = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 4, false, false);
        assert!(rt > plain);
    }
}

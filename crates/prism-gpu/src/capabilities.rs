//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// Device extensions hardware ray tracing needs.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

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

/// Ray-tracing limits that shape shader-table and scratch layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Size of one shader identifier in bytes.
    pub shader_group_handle_size: u32,
    /// Required alignment of each shader record.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each table region's base address.
    pub shader_group_base_alignment: u32,
    pub max_shader_group_stride: u32,
    pub max_ray_recursion_depth: u32,
    pub max_ray_hit_attribute_size: u32,
    /// Scratch buffer device addresses must be multiples of this.
    pub min_scratch_offset_alignment: u32,
    pub max_instance_count: u64,
    pub max_geometry_count: u64,
}

impl RayTracingCapabilities {
    /// Alignment that keeps every record at `i * stride` valid as a region base.
    pub fn record_alignment(&self) -> u32 {
        self.shader_group_handle_alignment
            .max(self.shader_group_base_alignment)
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Dynamic rendering support (VK 1.3 core)
    pub supports_dynamic_rendering: bool,
    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Timeline semaphore support (VK 1.2 core)
    pub supports_timeline_semaphore: bool,
    /// Buffer device address support
    pub supports_buffer_device_address: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Required alignment of dynamic uniform buffer offsets.
    pub min_uniform_buffer_offset_alignment: u64,

    /// Present when the acceleration-structure and ray-tracing-pipeline
    /// extensions and features are all available.
    pub ray_tracing: Option<RayTracingCapabilities>,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 =
            vk::api_version_major(api_version) >= 1 && vk::api_version_minor(api_version) >= 3;

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 =
            vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);
        instance.get_physical_device_features2(physical_device, &mut features2);
        let supports_timeline_semaphore = vulkan_1_2_features.timeline_semaphore == vk::TRUE;
        let supports_buffer_device_address = vulkan_1_2_features.buffer_device_address == vk::TRUE;

        let ray_tracing = if has_ray_tracing_extensions(&available_extensions) {
            query_ray_tracing(instance, physical_device)
        } else {
            None
        };

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: has_vulkan_1_3,
            supports_synchronization2: has_vulkan_1_3,
            supports_timeline_semaphore,
            supports_buffer_device_address,

            device_local_memory_mb,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            ray_tracing,
            available_extensions,
        }
    }

    /// Check if the GPU meets the requirements of the raster path.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        // Frame pacing runs on a timeline semaphore
        self.supports_timeline_semaphore && self.supports_buffer_device_address
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.is_some() { "yes" } else { "no" },
        )
    }
}

fn has_ray_tracing_extensions(available: &HashSet<String>) -> bool {
    RAY_TRACING_EXTENSIONS
        .iter()
        .all(|ext| ext.to_str().is_ok_and(|name| available.contains(name)))
}

/// # Safety
/// The instance and physical device must be valid.
unsafe fn query_ray_tracing(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<RayTracingCapabilities> {
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut as_features)
        .push_next(&mut rt_features);
    instance.get_physical_device_features2(physical_device, &mut features2);

    if as_features.acceleration_structure != vk::TRUE
        || rt_features.ray_tracing_pipeline != vk::TRUE
    {
        return None;
    }

    let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut rt_properties)
        .push_next(&mut as_properties);
    instance.get_physical_device_properties2(physical_device, &mut properties2);

    Some(RayTracingCapabilities {
        shader_group_handle_size: rt_properties.shader_group_handle_size,
        shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
        shader_group_base_alignment: rt_properties.shader_group_base_alignment,
        max_shader_group_stride: rt_properties.max_shader_group_stride,
        max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
        max_ray_hit_attribute_size: rt_properties.max_ray_hit_attribute_size,
        min_scratch_offset_alignment: as_properties
            .min_acceleration_structure_scratch_offset_alignment,
        max_instance_count: as_properties.max_instance_count,
        max_geometry_count: as_properties.max_geometry_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn record_alignment_takes_the_stricter_limit() {
        let caps = RayTracingCapabilities {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_shader_group_stride: 4096,
            max_ray_recursion_depth: 31,
            max_ray_hit_attribute_size: 32,
            min_scratch_offset_alignment: 128,
            max_instance_count: 1 << 24,
            max_geometry_count: 1 << 24,
        };
        assert_eq!(caps.record_alignment(), 64);
    }

    #[test]
    fn ray_tracing_extension_check() {
        let mut available: HashSet<String> = RAY_TRACING_EXTENSIONS
            .iter()
            .map(|e| e.to_string_lossy().into_owned())
            .collect();
        assert!(has_ray_tracing_extensions(&available));
        available.remove("VK_KHR_ray_tracing_pipeline");
        assert!(!has_ray_tracing_extensions(&available));
    }
}

//! Ray-tracing extension loaders bundled with the device limits.

use ash::vk;
use prism_gpu::{GpuContext, RayTracingCapabilities};

use crate::error::{Result, RtError};

/// Device handle plus the two ray-tracing extension loaders.
///
/// Created once per path initialization; every builder in this crate takes
/// it by reference.
pub struct RtDevice {
    device: ash::Device,
    as_loader: ash::khr::acceleration_structure::Device,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    limits: RayTracingCapabilities,
}

impl RtDevice {
    /// Fails with [`RtError::Unsupported`] unless the context enabled ray tracing.
    pub fn new(ctx: &GpuContext) -> Result<Self> {
        let limits = *ctx.ray_tracing().ok_or(RtError::Unsupported)?;
        let device = ctx.device().clone();
        let as_loader = ash::khr::acceleration_structure::Device::new(ctx.instance(), &device);
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(ctx.instance(), &device);

        tracing::debug!(
            handle_size = limits.shader_group_handle_size,
            record_alignment = limits.record_alignment(),
            scratch_alignment = limits.min_scratch_offset_alignment,
            "Ray-tracing device ready"
        );

        Ok(Self {
            device,
            as_loader,
            rt_loader,
            limits,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn as_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.as_loader
    }

    pub fn rt_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.rt_loader
    }

    pub fn limits(&self) -> &RayTracingCapabilities {
        &self.limits
    }

    /// Device address of an acceleration structure.
    ///
    /// # Safety
    /// The handle must be a live acceleration structure created on this device.
    pub unsafe fn acceleration_structure_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        self.as_loader.get_acceleration_structure_device_address(&info)
    }
}

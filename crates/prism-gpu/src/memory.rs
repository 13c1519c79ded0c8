//! GPU memory management.
//!
//! Every buffer the renderer creates goes through [`GpuAllocator`]. The
//! [`BufferKind`] helper fixes usage flags and memory location for the
//! handful of roles buffers play, so call sites never spell out flag sets.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use prism_core::align_up;
use std::sync::Arc;

/// What a buffer is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Host-visible staging data.
    Upload,
    /// Vertex or index data read by raster draws and acceleration-structure builds.
    GeometryInput,
    /// Backing storage of a built acceleration structure.
    AccelerationStructureStorage,
    /// Transient memory for an acceleration-structure build or update.
    Scratch,
    /// Host-written instance descriptors for a top-level build.
    InstanceDescriptors,
    /// Shader binding table records.
    ShaderBindingTable,
    /// Per-frame uniform constants.
    Uniform,
}

impl BufferKind {
    /// Usage flags for this kind. All kinds carry `SHADER_DEVICE_ADDRESS`.
    pub fn usage(self) -> vk::BufferUsageFlags {
        let usage = match self {
            Self::Upload => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::GeometryInput => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            }
            Self::AccelerationStructureStorage => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            }
            Self::Scratch => vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::InstanceDescriptors => {
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            }
            Self::ShaderBindingTable => vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        };
        usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    }

    /// Memory location for this kind.
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::AccelerationStructureStorage | Self::Scratch => MemoryLocation::GpuOnly,
            Self::Upload
            | Self::GeometryInput
            | Self::InstanceDescriptors
            | Self::ShaderBindingTable
            | Self::Uniform => MemoryLocation::CpuToGpu,
        }
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    live: usize,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            live: 0,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "zero-sized buffer requested: {name}"
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .call("vkCreateBuffer")?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .call("vkBindBufferMemory")
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release(allocation)?;
            return Err(e);
        }
        self.live += 1;

        tracing::trace!(name, size, ?location, "Buffer allocated");

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Allocate a buffer with the usage and location implied by `kind`.
    pub fn create_buffer_for(
        &mut self,
        kind: BufferKind,
        size: u64,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.create_buffer(size, kind.usage(), kind.location(), name)
    }

    /// Allocate scratch memory whose device address honours `alignment`.
    ///
    /// The buffer is over-allocated by `alignment` so an aligned address always
    /// fits `size` bytes.
    pub fn create_scratch(
        &mut self,
        device: &ash::Device,
        size: u64,
        alignment: u64,
        name: &str,
    ) -> Result<ScratchBuffer> {
        let alignment = alignment.max(1);
        let buffer = self.create_buffer_for(BufferKind::Scratch, size + alignment, name)?;
        let address = align_up(buffer.device_address(device), alignment);
        Ok(ScratchBuffer {
            buffer,
            address,
            size,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.release(allocation)?;
            self.live = self.live.saturating_sub(1);
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .call("vkCreateImage")?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .call("vkBindImageMemory")
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            self.release(allocation)?;
            return Err(e);
        }
        self.live += 1;

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Free an image allocation.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.release(allocation)?;
            self.live = self.live.saturating_sub(1);
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    fn release(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Buffers and images allocated and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        self.allocator.take();
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Get the device address of this buffer.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Pointer to the mapped memory, if the buffer is host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Mapped contents, if the buffer is host-visible.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|a| a.mapped_slice())
    }

    /// Write data to the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_range(0, data)
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Write typed data to the buffer at the given offset (must be host-visible).
    pub fn write_range<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }
}

/// Scratch memory for acceleration-structure builds.
pub struct ScratchBuffer {
    pub buffer: GpuBuffer,
    /// Aligned device address handed to build commands.
    pub address: vk::DeviceAddress,
    /// Usable size starting at `address`.
    pub size: u64,
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_device_address() {
        for kind in [
            BufferKind::Upload,
            BufferKind::GeometryInput,
            BufferKind::AccelerationStructureStorage,
            BufferKind::Scratch,
            BufferKind::InstanceDescriptors,
            BufferKind::ShaderBindingTable,
            BufferKind::Uniform,
        ] {
            assert!(kind
                .usage()
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
    }

    #[test]
    fn build_memory_stays_on_device() {
        assert_eq!(BufferKind::Scratch.location(), MemoryLocation::GpuOnly);
        assert_eq!(
            BufferKind::AccelerationStructureStorage.location(),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            BufferKind::InstanceDescriptors.location(),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn geometry_is_build_input() {
        let usage = BufferKind::GeometryInput.usage();
        assert!(
            usage.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR)
        );
        assert!(
            usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER)
        );
    }
}

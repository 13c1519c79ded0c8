//! Bottom- and top-level acceleration structures.
//!
//! Builds are recorded into a caller-supplied command buffer; nothing here
//! submits or waits. Every build is followed by an acceleration-structure
//! barrier so later builds and ray dispatches see the finished result.

use ash::vk;
use bytemuck::Zeroable;
use glam::Mat4;
use prism_core::{RtVertex, Transform3x4};
use prism_gpu::{BufferKind, GpuAllocator, GpuBuffer, ScratchBuffer, VkResultExt};

use crate::device::RtDevice;
use crate::error::{Result, RtError};
use crate::geometry::MeshBuffers;
use crate::hit_groups::HitGroupLayout;

/// Buffers behind one acceleration structure.
pub struct AccelerationStructureBuffers {
    /// Build memory. Released after a BLAS build has executed; kept by the
    /// TLAS for updates.
    pub scratch: Option<ScratchBuffer>,
    /// Storage of the structure itself.
    pub result: GpuBuffer,
    /// Host-written instance descriptors, top level only.
    pub instance_descriptors: Option<GpuBuffer>,
}

impl AccelerationStructureBuffers {
    fn free(mut self, allocator: &mut GpuAllocator) -> prism_gpu::Result<()> {
        if let Some(mut scratch) = self.scratch.take() {
            allocator.free_buffer(&mut scratch.buffer)?;
        }
        if let Some(mut instances) = self.instance_descriptors.take() {
            allocator.free_buffer(&mut instances)?;
        }
        allocator.free_buffer(&mut self.result)
    }
}

/// Sizes reported by the prebuild query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR<'_>> for BuildSizes {
    fn from(sizes: vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }
}

/// How [`TopLevelAs::record_build`] treats the existing structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Full build from scratch.
    Build,
    /// Refit in place; source and destination are the same structure.
    Update,
}

/// Make acceleration-structure writes visible to later builds and ray shaders.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn record_build_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        )
        .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);

    let dependency_info =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

/// Order an in-place update after the previous dispatch and build that used
/// the same structure and scratch memory.
///
/// # Safety
/// The command buffer must be recording.
unsafe fn record_pre_update_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        )
        .src_access_mask(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        )
        .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .dst_access_mask(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        );

    let dependency_info =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

/// Reject meshes the bottom-level build cannot consume.
pub fn validate_meshes(meshes: &[&MeshBuffers]) -> Result<()> {
    if meshes.is_empty() {
        return Err(RtError::Acceleration(
            "bottom-level build needs at least one mesh".to_string(),
        ));
    }
    for (i, mesh) in meshes.iter().enumerate() {
        if mesh.vertices.stride != RtVertex::STRIDE {
            return Err(RtError::Acceleration(format!(
                "mesh {i}: vertex stride {} differs from the shared layout ({})",
                mesh.vertices.stride,
                RtVertex::STRIDE
            )));
        }
        if mesh.vertices.count == 0 || mesh.indices.count == 0 {
            return Err(RtError::Acceleration(format!("mesh {i} is empty")));
        }
        if mesh.indices.count % 3 != 0 {
            return Err(RtError::Acceleration(format!(
                "mesh {i}: index count {} is not a multiple of 3",
                mesh.indices.count
            )));
        }
    }
    Ok(())
}

fn triangle_geometry(
    device: &ash::Device,
    mesh: &MeshBuffers,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(mesh.vertices.format)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.vertices.device_address(device),
        })
        .vertex_stride(mesh.vertices.stride)
        .max_vertex(mesh.vertices.count - 1)
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.indices.device_address(device),
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
}

/// Create the acceleration structure object over freshly allocated storage.
unsafe fn create_structure(
    rt: &RtDevice,
    allocator: &mut GpuAllocator,
    ty: vk::AccelerationStructureTypeKHR,
    size: u64,
    name: &str,
) -> Result<(vk::AccelerationStructureKHR, GpuBuffer)> {
    let mut buffer =
        allocator.create_buffer_for(BufferKind::AccelerationStructureStorage, size, name)?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.buffer)
        .offset(0)
        .size(size)
        .ty(ty);

    match rt
        .as_loader()
        .create_acceleration_structure(&create_info, None)
        .call("vkCreateAccelerationStructureKHR")
    {
        Ok(handle) => Ok((handle, buffer)),
        Err(e) => {
            allocator.free_buffer(&mut buffer)?;
            Err(e.into())
        }
    }
}

/// Bottom-level acceleration structure over one or more triangle meshes.
pub struct BottomLevelAs {
    pub handle: vk::AccelerationStructureKHR,
    pub buffers: AccelerationStructureBuffers,
    pub device_address: vk::DeviceAddress,
    pub sizes: BuildSizes,
    pub geometry_count: u32,
}

impl BottomLevelAs {
    /// Prebuild size query for packing `meshes` into one structure.
    ///
    /// # Safety
    /// The mesh buffers must be live.
    pub unsafe fn query_sizes(rt: &RtDevice, meshes: &[&MeshBuffers]) -> Result<BuildSizes> {
        validate_meshes(meshes)?;
        let geometries: Vec<_> = meshes
            .iter()
            .map(|mesh| triangle_geometry(rt.device(), mesh))
            .collect();
        let primitive_counts: Vec<u32> = meshes.iter().map(|m| m.triangle_count()).collect();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        rt.as_loader().get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
            &mut build_sizes,
        );
        Ok(build_sizes.into())
    }

    /// Record a build of one structure holding every mesh in `meshes`, in order.
    ///
    /// Geometry `g` of the result is `meshes[g]`; hit records are laid out in
    /// the same order.
    ///
    /// # Safety
    /// - The command buffer must be recording.
    /// - The mesh buffers must stay alive until the build has executed.
    pub unsafe fn build(
        rt: &RtDevice,
        allocator: &mut GpuAllocator,
        cmd: vk::CommandBuffer,
        meshes: &[&MeshBuffers],
        name: &str,
    ) -> Result<Self> {
        let sizes = Self::query_sizes(rt, meshes)?;

        let mut scratch = allocator.create_scratch(
            rt.device(),
            sizes.build_scratch_size,
            u64::from(rt.limits().min_scratch_offset_alignment),
            &format!("{name}_scratch"),
        )?;
        let created = create_structure(
            rt,
            allocator,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.acceleration_structure_size,
            name,
        );
        let (handle, result) = match created {
            Ok(created) => created,
            Err(e) => {
                allocator.free_buffer(&mut scratch.buffer)?;
                return Err(e);
            }
        };

        let geometries: Vec<_> = meshes
            .iter()
            .map(|mesh| triangle_geometry(rt.device(), mesh))
            .collect();
        let ranges: Vec<_> = meshes
            .iter()
            .map(|mesh| {
                vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(mesh.triangle_count())
                    .primitive_offset(0)
                    .first_vertex(0)
                    .transform_offset(0)
            })
            .collect();

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.address,
            });

        rt.as_loader()
            .cmd_build_acceleration_structures(cmd, &[build_info], &[ranges.as_slice()]);
        record_build_barrier(rt.device(), cmd);

        let device_address = rt.acceleration_structure_address(handle);

        tracing::debug!(
            name,
            geometries = meshes.len(),
            result_size = sizes.acceleration_structure_size,
            scratch_size = sizes.build_scratch_size,
            "BLAS build recorded"
        );

        Ok(Self {
            handle,
            buffers: AccelerationStructureBuffers {
                scratch: Some(scratch),
                result,
                instance_descriptors: None,
            },
            device_address,
            sizes,
            geometry_count: meshes.len() as u32,
        })
    }

    /// Free the scratch memory. Only valid once the build has executed.
    pub fn release_scratch(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        if let Some(mut scratch) = self.buffers.scratch.take() {
            allocator.free_buffer(&mut scratch.buffer)?;
        }
        Ok(())
    }

    /// # Safety
    /// The structure must not be in use.
    pub unsafe fn destroy(self, rt: &RtDevice, allocator: &mut GpuAllocator) -> Result<()> {
        rt.as_loader().destroy_acceleration_structure(self.handle, None);
        self.buffers.free(allocator)?;
        Ok(())
    }
}

/// One scene instance handed to the top-level build.
///
/// The hit-record offset is deliberately absent; it always comes from the
/// [`HitGroupLayout`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TlasInstance {
    pub instance_id: u32,
    pub blas_address: vk::DeviceAddress,
    /// Column-major object-to-world transform.
    pub transform: Mat4,
    pub mask: u8,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl TlasInstance {
    /// Fully visible instance with back-face culling disabled.
    pub fn new(instance_id: u32, blas_address: vk::DeviceAddress, transform: Mat4) -> Self {
        Self {
            instance_id,
            blas_address,
            transform,
            mask: 0xFF,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        }
    }
}

/// Byte image of `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceDescriptor {
    /// Row-major 3x4 object-to-world transform.
    pub transform: Transform3x4,
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit-record offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

const _: () = assert!(
    std::mem::size_of::<InstanceDescriptor>()
        == std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
);

const LOW_24: u32 = 0x00FF_FFFF;

impl InstanceDescriptor {
    /// Size of one descriptor in the instance buffer.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(instance: &TlasInstance, sbt_offset: u32) -> Self {
        Self {
            transform: Transform3x4::from_mat4(instance.transform),
            custom_index_and_mask: (instance.instance_id & LOW_24)
                | (u32::from(instance.mask) << 24),
            sbt_offset_and_flags: (sbt_offset & LOW_24)
                | ((instance.flags.as_raw() & 0xFF) << 24),
            blas_address: instance.blas_address,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.custom_index_and_mask & LOW_24
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & LOW_24
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

/// Fill `dst` with one descriptor per instance, taking each hit-record offset
/// from `layout`.
pub fn write_instances(
    dst: &mut [InstanceDescriptor],
    instances: &[TlasInstance],
    layout: &HitGroupLayout,
) -> Result<()> {
    if dst.len() != instances.len() {
        return Err(RtError::Acceleration(format!(
            "{} instance slots for {} instances",
            dst.len(),
            instances.len()
        )));
    }
    if layout.instance_count() as usize != instances.len() {
        return Err(RtError::Layout(format!(
            "layout describes {} instances, got {}",
            layout.instance_count(),
            instances.len()
        )));
    }
    for (i, (slot, instance)) in dst.iter_mut().zip(instances).enumerate() {
        let offset = layout
            .instance_offset(i as u32)
            .ok_or_else(|| RtError::Layout(format!("no hit offset for instance {i}")))?;
        *slot = InstanceDescriptor::new(instance, offset);
    }
    Ok(())
}

/// Top-level acceleration structure with a fixed instance count, updated in
/// place every frame.
///
/// The instance buffer holds `frame_slots` copies of the descriptor array so
/// the host never rewrites descriptors a frame still in flight reads.
pub struct TopLevelAs {
    pub handle: vk::AccelerationStructureKHR,
    pub buffers: AccelerationStructureBuffers,
    pub device_address: vk::DeviceAddress,
    pub sizes: BuildSizes,
    instance_count: u32,
    frame_slots: u32,
    built: bool,
}

impl TopLevelAs {
    const FLAGS: vk::BuildAccelerationStructureFlagsKHR =
        vk::BuildAccelerationStructureFlagsKHR::from_raw(
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE.as_raw()
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE.as_raw(),
        );

    fn instances_geometry(
        address: vk::DeviceAddress,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address,
                    }),
            })
    }

    /// Allocate storage, scratch and instance buffers for `instance_count`
    /// instances. Nothing is built until [`Self::record_build`].
    ///
    /// # Safety
    /// `rt` must be live.
    pub unsafe fn new(
        rt: &RtDevice,
        allocator: &mut GpuAllocator,
        instance_count: u32,
        frame_slots: u32,
    ) -> Result<Self> {
        if instance_count == 0 || frame_slots == 0 {
            return Err(RtError::Acceleration(format!(
                "top-level structure needs instances and frame slots \
                 (got {instance_count}, {frame_slots})"
            )));
        }
        if u64::from(instance_count) > rt.limits().max_instance_count {
            return Err(RtError::Acceleration(format!(
                "{instance_count} instances exceed the device limit {}",
                rt.limits().max_instance_count
            )));
        }

        let geometry = Self::instances_geometry(0);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(Self::FLAGS)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        rt.as_loader().get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[instance_count],
            &mut build_sizes,
        );
        let sizes = BuildSizes::from(build_sizes);

        let mut scratch = allocator.create_scratch(
            rt.device(),
            sizes.build_scratch_size.max(sizes.update_scratch_size),
            u64::from(rt.limits().min_scratch_offset_alignment),
            "tlas_scratch",
        )?;
        let instances = allocator.create_buffer_for(
            BufferKind::InstanceDescriptors,
            InstanceDescriptor::SIZE * u64::from(instance_count) * u64::from(frame_slots),
            "tlas_instances",
        );
        let mut instance_buffer = match instances {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.free_buffer(&mut scratch.buffer)?;
                return Err(e.into());
            }
        };
        let created = create_structure(
            rt,
            allocator,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
            "tlas",
        );
        let (handle, result) = match created {
            Ok(created) => created,
            Err(e) => {
                allocator.free_buffer(&mut instance_buffer)?;
                allocator.free_buffer(&mut scratch.buffer)?;
                return Err(e);
            }
        };
        let device_address = rt.acceleration_structure_address(handle);

        tracing::debug!(
            instance_count,
            frame_slots,
            result_size = sizes.acceleration_structure_size,
            build_scratch = sizes.build_scratch_size,
            update_scratch = sizes.update_scratch_size,
            "TLAS allocated"
        );

        Ok(Self {
            handle,
            buffers: AccelerationStructureBuffers {
                scratch: Some(scratch),
                result,
                instance_descriptors: Some(instance_buffer),
            },
            device_address,
            sizes,
            instance_count,
            frame_slots,
            built: false,
        })
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn frame_slots(&self) -> u32 {
        self.frame_slots
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    fn slot_offset(&self, slot: u32) -> Result<u64> {
        if slot >= self.frame_slots {
            return Err(RtError::Acceleration(format!(
                "instance slot {slot} out of range ({} slots)",
                self.frame_slots
            )));
        }
        Ok(u64::from(slot) * u64::from(self.instance_count) * InstanceDescriptor::SIZE)
    }

    fn instance_buffer(&self) -> Result<&GpuBuffer> {
        self.buffers
            .instance_descriptors
            .as_ref()
            .ok_or_else(|| RtError::Acceleration("instance buffer released".to_string()))
    }

    /// Rewrite every instance descriptor in `slot` and record a build or an
    /// in-place update.
    ///
    /// # Safety
    /// - The command buffer must be recording.
    /// - No frame still in flight may read `slot`.
    pub unsafe fn record_build(
        &mut self,
        rt: &RtDevice,
        cmd: vk::CommandBuffer,
        instances: &[TlasInstance],
        layout: &HitGroupLayout,
        mode: BuildMode,
        slot: u32,
    ) -> Result<()> {
        if instances.len() != self.instance_count as usize {
            return Err(RtError::Acceleration(format!(
                "instance count is fixed at {}, got {}",
                self.instance_count,
                instances.len()
            )));
        }
        if mode == BuildMode::Update && !self.built {
            return Err(RtError::Acceleration(
                "update requested before the first build".to_string(),
            ));
        }

        let offset = self.slot_offset(slot)?;
        let mut descriptors = vec![InstanceDescriptor::zeroed(); instances.len()];
        write_instances(&mut descriptors, instances, layout)?;

        let instance_buffer = self.instance_buffer()?;
        instance_buffer.write_range(offset, &descriptors)?;
        let instances_address = instance_buffer.device_address(rt.device()) + offset;

        let scratch_address = self
            .buffers
            .scratch
            .as_ref()
            .map(|s| s.address)
            .ok_or_else(|| RtError::Acceleration("scratch buffer released".to_string()))?;

        if mode == BuildMode::Update {
            record_pre_update_barrier(rt.device(), cmd);
        }

        let geometry = Self::instances_geometry(instances_address);
        let (vk_mode, src) = match mode {
            BuildMode::Build => (
                vk::BuildAccelerationStructureModeKHR::BUILD,
                vk::AccelerationStructureKHR::null(),
            ),
            BuildMode::Update => (vk::BuildAccelerationStructureModeKHR::UPDATE, self.handle),
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(Self::FLAGS)
            .mode(vk_mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(self.handle)
            .geometries(std::slice::from_ref(&geometry))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.instance_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        rt.as_loader().cmd_build_acceleration_structures(
            cmd,
            &[build_info],
            &[std::slice::from_ref(&range)],
        );
        record_build_barrier(rt.device(), cmd);

        self.built = true;
        tracing::trace!(?mode, slot, "TLAS build recorded");
        Ok(())
    }

    /// Descriptors currently stored in `slot`.
    pub fn read_instances(&self, slot: u32) -> Result<Vec<InstanceDescriptor>> {
        let offset = self.slot_offset(slot)? as usize;
        let len = self.instance_count as usize * InstanceDescriptor::SIZE as usize;
        let bytes = self
            .instance_buffer()?
            .mapped_slice()
            .and_then(|mapped| mapped.get(offset..offset + len))
            .ok_or_else(|| RtError::Acceleration("instance buffer not mapped".to_string()))?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    /// # Safety
    /// The structure must not be in use.
    pub unsafe fn destroy(self, rt: &RtDevice, allocator: &mut GpuAllocator) -> Result<()> {
        rt.as_loader().destroy_acceleration_structure(self.handle, None);
        self.buffers.free(allocator)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryBuffer;
    use crate::hit_groups::RAY_TYPE_COUNT;
    use approx::assert_relative_eq;
    use glam::Vec3;
    use prism_core::math::spin_then_translate;

    fn fake_buffer() -> GpuBuffer {
        GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
        }
    }

    fn fake_mesh(stride: u64, vertices: u32, indices: u32) -> MeshBuffers {
        MeshBuffers {
            vertices: GeometryBuffer {
                buffer: fake_buffer(),
                stride,
                count: vertices,
                format: vk::Format::R32G32B32_SFLOAT,
            },
            indices: GeometryBuffer {
                buffer: fake_buffer(),
                stride: 4,
                count: indices,
                format: vk::Format::R32_UINT,
            },
        }
    }

    fn scene_instances(angle: f32) -> Vec<TlasInstance> {
        vec![
            TlasInstance::new(0, 0x1000, Mat4::IDENTITY),
            TlasInstance::new(1, 0x2000, spin_then_translate(angle, Vec3::new(-2.0, 0.0, 0.0))),
            TlasInstance::new(2, 0x2000, spin_then_translate(angle, Vec3::new(2.0, 0.0, 0.0))),
        ]
    }

    fn scene_layout() -> HitGroupLayout {
        HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &[2, 1, 1]).unwrap()
    }

    #[test]
    fn descriptor_matches_vulkan_layout() {
        assert_eq!(InstanceDescriptor::SIZE, 64);
        assert_eq!(std::mem::offset_of!(InstanceDescriptor, custom_index_and_mask), 48);
        assert_eq!(std::mem::offset_of!(InstanceDescriptor, blas_address), 56);
    }

    #[test]
    fn packed_fields_round_trip() {
        let instance = TlasInstance::new(0x12_3456, 0xDEAD_BEEF, Mat4::IDENTITY);
        let d = InstanceDescriptor::new(&instance, 6);
        assert_eq!(d.instance_id(), 0x12_3456);
        assert_eq!(d.mask(), 0xFF);
        assert_eq!(d.sbt_offset(), 6);
        assert_eq!(d.flags(), vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(d.blas_address, 0xDEAD_BEEF);
    }

    #[test]
    fn instance_offsets_come_from_the_layout() {
        let layout = scene_layout();
        let instances = scene_instances(0.0);
        let mut dst = vec![InstanceDescriptor::zeroed(); 3];
        write_instances(&mut dst, &instances, &layout).unwrap();

        let written: Vec<u32> = dst.iter().map(InstanceDescriptor::sbt_offset).collect();
        assert_eq!(written, vec![0, 4, 6]);
        layout.verify_instance_offsets(&written).unwrap();
    }

    #[test]
    fn rewrites_change_only_transforms() {
        let layout = scene_layout();
        let mut first = vec![InstanceDescriptor::zeroed(); 3];
        write_instances(&mut first, &scene_instances(0.0), &layout).unwrap();

        let mut angle = 0.0_f32;
        let mut last = first.clone();
        for _ in 0..10 {
            angle += 0.5 * (1.0 / 60.0);
            write_instances(&mut last, &scene_instances(angle), &layout).unwrap();
            assert_eq!(last.len(), 3);
        }

        for (a, b) in first.iter().zip(&last) {
            assert_eq!(a.custom_index_and_mask, b.custom_index_and_mask);
            assert_eq!(a.sbt_offset_and_flags, b.sbt_offset_and_flags);
            assert_eq!(a.blas_address, b.blas_address);
        }
        assert_eq!(first[0].transform, last[0].transform);
        assert_ne!(first[1].transform, last[1].transform);

        let expected =
            Mat4::from_translation(Vec3::new(-2.0, 0.0, 0.0)) * Mat4::from_rotation_y(angle);
        let got = last[1].transform.to_mat4();
        for (g, e) in got.to_cols_array().iter().zip(expected.to_cols_array()) {
            assert_relative_eq!(*g, e, epsilon = 1e-5);
        }
    }

    #[test]
    fn write_rejects_mismatched_counts() {
        let layout = scene_layout();
        let mut dst = vec![InstanceDescriptor::zeroed(); 2];
        assert!(write_instances(&mut dst, &scene_instances(0.0), &layout).is_err());

        let short_layout = HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &[1, 1]).unwrap();
        let mut dst = vec![InstanceDescriptor::zeroed(); 3];
        assert!(matches!(
            write_instances(&mut dst, &scene_instances(0.0), &short_layout),
            Err(RtError::Layout(_))
        ));
    }

    #[test]
    fn mesh_validation() {
        let tri = fake_mesh(RtVertex::STRIDE, 3, 3);
        let quad = fake_mesh(RtVertex::STRIDE, 4, 6);
        validate_meshes(&[&tri, &quad]).unwrap();

        assert!(validate_meshes(&[]).is_err());
        assert!(validate_meshes(&[&fake_mesh(12, 3, 3)]).is_err());
        assert!(validate_meshes(&[&fake_mesh(RtVertex::STRIDE, 3, 4)]).is_err());
        assert!(validate_meshes(&[&fake_mesh(RtVertex::STRIDE, 0, 3)]).is_err());
    }
}

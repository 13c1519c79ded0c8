//! Vertex and index buffers used as acceleration-structure build input.

use ash::vk;
use prism_core::{MeshData, RtVertex};
use prism_gpu::{BufferKind, GpuAllocator, GpuBuffer};

use crate::error::Result;

/// One GPU buffer of vertices or indices.
pub struct GeometryBuffer {
    pub buffer: GpuBuffer,
    /// Element stride in bytes.
    pub stride: u64,
    /// Element count.
    pub count: u32,
    /// `R32G32B32_SFLOAT` for vertex positions, `R32_UINT` for indices.
    pub format: vk::Format,
}

impl GeometryBuffer {
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.buffer.device_address(device)
    }
}

/// Vertex and index buffers of one mesh, written straight into mapped
/// upload memory.
pub struct MeshBuffers {
    pub vertices: GeometryBuffer,
    pub indices: GeometryBuffer,
}

impl MeshBuffers {
    /// Validate `mesh` and upload it.
    pub fn upload(allocator: &mut GpuAllocator, mesh: &MeshData, name: &str) -> Result<Self> {
        mesh.validate()?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);

        let mut vertex_buffer = allocator.create_buffer_for(
            BufferKind::GeometryInput,
            vertex_bytes.len() as u64,
            &format!("{name}_vertices"),
        )?;
        let index_buffer = match allocator.create_buffer_for(
            BufferKind::GeometryInput,
            index_bytes.len() as u64,
            &format!("{name}_indices"),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.free_buffer(&mut vertex_buffer)?;
                return Err(e.into());
            }
        };

        vertex_buffer.write_bytes(0, vertex_bytes)?;
        index_buffer.write_bytes(0, index_bytes)?;

        tracing::debug!(
            name,
            vertices = mesh.vertex_count(),
            indices = mesh.index_count(),
            "Mesh uploaded"
        );

        Ok(Self {
            vertices: GeometryBuffer {
                buffer: vertex_buffer,
                stride: RtVertex::STRIDE,
                count: mesh.vertex_count(),
                format: vk::Format::R32G32B32_SFLOAT,
            },
            indices: GeometryBuffer {
                buffer: index_buffer,
                stride: std::mem::size_of::<u32>() as u64,
                count: mesh.index_count(),
                format: vk::Format::R32_UINT,
            },
        })
    }

    pub fn triangle_count(&self) -> u32 {
        self.indices.count / 3
    }

    pub fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.vertices.buffer)?;
        allocator.free_buffer(&mut self.indices.buffer)?;
        Ok(())
    }
}

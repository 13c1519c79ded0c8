//! CPU-side mesh data for the fixed scene primitives.

use glam::Vec3;

use crate::error::{Error, Result};
use crate::math::Aabb;

/// Vertex layout shared by the raster and ray-traced paths (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RtVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl RtVertex {
    /// Vertex stride in bytes.
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;
    /// Byte offset of the normal attribute.
    pub const NORMAL_OFFSET: u32 = 12;

    pub const fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
        Self { position, normal }
    }
}

/// Indexed triangle list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<RtVertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Single upright triangle centred on the origin, facing +Z.
    pub fn triangle() -> Self {
        let n = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                RtVertex::new([0.0, 1.0, 0.0], n),
                RtVertex::new([0.866, -0.5, 0.0], n),
                RtVertex::new([-0.866, -0.5, 0.0], n),
            ],
            indices: vec![0, 1, 2],
        }
    }

    /// Horizontal quad spanning `[-width, width] x [-length, length]` at `height`.
    pub fn plane(width: f32, length: f32, height: f32) -> Self {
        let n = [0.0, 1.0, 0.0];
        Self {
            vertices: vec![
                RtVertex::new([-width, height, -length], n),
                RtVertex::new([width, height, -length], n),
                RtVertex::new([width, height, length], n),
                RtVertex::new([-width, height, length], n),
            ],
            indices: vec![1, 0, 2, 2, 0, 3],
        }
    }

    /// Box with half-extents `width`, `height`, `length` and smoothed corner normals.
    pub fn cube(width: f32, height: f32, length: f32) -> Self {
        let corners = [
            [-width, -height, -length],
            [-width, height, -length],
            [width, height, -length],
            [width, -height, -length],
            [-width, -height, length],
            [-width, height, length],
            [width, height, length],
            [width, -height, length],
        ];
        let vertices = corners
            .iter()
            .map(|&p| RtVertex::new(p, Vec3::from_array(p).normalize_or_zero().to_array()))
            .collect();

        #[rustfmt::skip]
        let indices = vec![
            0, 1, 2,  0, 2, 3,
            4, 6, 5,  4, 7, 6,
            4, 5, 1,  4, 1, 0,
            3, 2, 6,  3, 6, 7,
            1, 5, 6,  1, 6, 2,
            4, 0, 3,  4, 3, 7,
        ];

        Self { vertices, indices }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count() / 3
    }

    /// Check that this is a well-formed indexed triangle list.
    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(Error::InvalidData("mesh has no geometry".to_string()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(Error::InvalidData(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i >= self.vertex_count()) {
            return Err(Error::OutOfBounds(format!(
                "index {bad} >= vertex count {}",
                self.vertices.len()
            )));
        }
        Ok(())
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from_array(v.position)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn vertex_layout() {
        assert_eq!(RtVertex::STRIDE, 24);
        let v = RtVertex::new([1.0, 2.0, 3.0], [4.0, 5.0, 6.0]);
        let bytes = bytemuck::bytes_of(&v);
        assert_eq!(&bytes[12..16], &4.0f32.to_ne_bytes());
    }

    #[test]
    fn primitive_counts() {
        let tri = MeshData::triangle();
        assert_eq!((tri.vertex_count(), tri.index_count()), (3, 3));

        let plane = MeshData::plane(100.0, 100.0, -1.0);
        assert_eq!((plane.vertex_count(), plane.index_count()), (4, 6));
        assert_eq!(plane.triangle_count(), 2);

        let cube = MeshData::cube(0.5, 0.5, 0.5);
        assert_eq!((cube.vertex_count(), cube.index_count()), (8, 36));

        for mesh in [tri, plane, cube] {
            mesh.validate().unwrap();
        }
    }

    #[test]
    fn plane_sits_at_height() {
        let plane = MeshData::plane(100.0, 50.0, -1.0);
        let bounds = plane.bounds().unwrap();
        assert_eq!(bounds.min, Vec3::new(-100.0, -1.0, -50.0));
        assert_eq!(bounds.max, Vec3::new(100.0, -1.0, 50.0));
    }

    #[test]
    fn cube_normals_are_unit() {
        for v in MeshData::cube(0.5, 1.0, 2.0).vertices {
            assert_relative_eq!(Vec3::from_array(v.normal).length(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn validate_rejects_bad_meshes() {
        assert!(MeshData::default().validate().is_err());

        let mut mesh = MeshData::triangle();
        mesh.indices.push(0);
        assert!(matches!(mesh.validate(), Err(Error::InvalidData(_))));

        let mut mesh = MeshData::triangle();
        mesh.indices[2] = 7;
        assert!(matches!(mesh.validate(), Err(Error::OutOfBounds(_))));
    }
}

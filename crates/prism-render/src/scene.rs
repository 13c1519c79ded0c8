//! The fixed scene both paths render: three coloured triangles over a
//! ground plane.
//!
//! Two bottom-level structures back three instances:
//!
//! | instance | BLAS | geometries         | transform                     |
//! |----------|------|--------------------|-------------------------------|
//! | 0        | 0    | triangle, plane    | identity                      |
//! | 1        | 1    | triangle           | `T(-2, 0, 0) · R_y(angle)`    |
//! | 2        | 1    | triangle           | `T( 2, 0, 0) · R_y(angle)`    |

use glam::{Mat4, Vec3};
use prism_core::math::spin_then_translate;
use prism_core::MeshData;
use prism_rt::{HitGroupLayout, Result, RAY_TYPE_COUNT};

pub const INSTANCE_COUNT: usize = 3;

/// Radians per second the orbiting triangles spin.
pub const SPIN_RATE: f32 = 0.5;

pub const ORBIT_OFFSET: f32 = 2.0;

/// BLAS each instance references.
pub const INSTANCE_BLAS: [usize; INSTANCE_COUNT] = [0, 1, 1];

/// Per-vertex colours of each instance's triangle.
pub const TRIANGLE_COLORS: [[[f32; 4]; 3]; INSTANCE_COUNT] = [
    [[1.0, 0.0, 0.0, 1.0], [1.0, 1.0, 0.0, 1.0], [1.0, 0.0, 1.0, 1.0]],
    [[0.0, 1.0, 0.0, 1.0], [0.0, 1.0, 1.0, 1.0], [1.0, 1.0, 0.0, 1.0]],
    [[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 1.0, 1.0], [0.0, 1.0, 1.0, 1.0]],
];

pub const PLANE_COLOR: [f32; 4] = [0.7, 0.7, 0.3, 1.0];

const PLANE_SIZE: f32 = 100.0;
const PLANE_HEIGHT: f32 = -1.0;

/// Which mesh a raster draw uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneMesh {
    Triangle,
    Plane,
}

/// One raster draw.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawItem {
    pub mesh: SceneMesh,
    pub world: Mat4,
    pub color: [f32; 4],
}

/// Animation state and lighting of the scene.
#[derive(Clone, Debug)]
pub struct Scene {
    angle: f32,
    pub light_position: Vec3,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            angle: 0.0,
            light_position: Vec3::new(2.0, 4.0, 3.0),
        }
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the spin by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        self.angle += SPIN_RATE * dt;
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    /// World transforms of the three instances for the current angle.
    pub fn instance_transforms(&self) -> [Mat4; INSTANCE_COUNT] {
        [
            Mat4::IDENTITY,
            spin_then_translate(self.angle, Vec3::new(-ORBIT_OFFSET, 0.0, 0.0)),
            spin_then_translate(self.angle, Vec3::new(ORBIT_OFFSET, 0.0, 0.0)),
        ]
    }

    pub fn ground_plane() -> MeshData {
        MeshData::plane(PLANE_SIZE, PLANE_SIZE, PLANE_HEIGHT)
    }

    /// Geometry of each bottom-level structure, in geometry order.
    pub fn blas_meshes() -> [Vec<MeshData>; 2] {
        [
            vec![MeshData::triangle(), Self::ground_plane()],
            vec![MeshData::triangle()],
        ]
    }

    /// Hit-record layout for the instances, shared by the TLAS and the
    /// shader table.
    pub fn hit_layout() -> Result<HitGroupLayout> {
        let meshes = Self::blas_meshes();
        let counts: Vec<u32> = INSTANCE_BLAS
            .iter()
            .map(|&blas| meshes[blas].len() as u32)
            .collect();
        HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &counts)
    }

    /// Raster draws: every triangle instance plus the ground plane.
    pub fn draw_items(&self) -> Vec<DrawItem> {
        let mut items: Vec<DrawItem> = self
            .instance_transforms()
            .iter()
            .zip(TRIANGLE_COLORS)
            .map(|(&world, colors)| DrawItem {
                mesh: SceneMesh::Triangle,
                world,
                color: average_color(&colors),
            })
            .collect();
        items.push(DrawItem {
            mesh: SceneMesh::Plane,
            world: Mat4::IDENTITY,
            color: PLANE_COLOR,
        });
        items
    }
}

fn average_color(colors: &[[f32; 4]; 3]) -> [f32; 4] {
    let mut sum = [0.0; 4];
    for color in colors {
        for (s, c) in sum.iter_mut().zip(color) {
            *s += c / 3.0;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use prism_core::Transform3x4;

    #[test]
    fn layout_reserves_two_geometries_for_instance_zero() {
        let layout = Scene::hit_layout().unwrap();
        assert_eq!(layout.instance_count(), INSTANCE_COUNT as u32);
        assert_eq!(layout.instance_offset(0), Some(0));
        assert_eq!(layout.instance_offset(1), Some(4));
        assert_eq!(layout.instance_offset(2), Some(6));
        assert_eq!(layout.total_records(), 8);
    }

    #[test]
    fn meshes_are_valid() {
        for blas in Scene::blas_meshes() {
            for mesh in blas {
                mesh.validate().unwrap();
            }
        }
    }

    #[test]
    fn orbiting_instances_spin_then_translate() {
        let mut scene = Scene::new();
        for _ in 0..10 {
            scene.advance(1.0 / 60.0);
        }
        assert_relative_eq!(scene.angle(), 10.0 * SPIN_RATE / 60.0, epsilon = 1e-6);

        let [first, left, right] = scene.instance_transforms();
        assert_eq!(first, Mat4::IDENTITY);

        let expected = Mat4::from_translation(Vec3::new(-2.0, 0.0, 0.0))
            * Mat4::from_rotation_y(scene.angle());
        assert!(left.abs_diff_eq(expected, 1e-6));
        assert_relative_eq!(
            Transform3x4::from_mat4(right).translation().x,
            ORBIT_OFFSET,
            epsilon = 1e-6
        );
    }

    #[test]
    fn draws_cover_instances_and_plane() {
        let items = Scene::new().draw_items();
        assert_eq!(items.len(), INSTANCE_COUNT + 1);
        assert_eq!(
            items.iter().filter(|i| i.mesh == SceneMesh::Plane).count(),
            1
        );
        assert_relative_eq!(items[0].color[0], 2.0 / 3.0, epsilon = 1e-6);
    }
}

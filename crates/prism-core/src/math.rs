//! Math utilities and helpers.

use glam::{Mat4, Vec3};

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Row-major 3x4 affine transform, the layout acceleration-structure
/// instances expect.
///
/// glam stores matrices column-major and multiplies column vectors, so the
/// conversion transposes and drops the last row.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Transform3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Transform3x4 {
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Convert a column-major affine matrix to row-major 3x4.
    pub fn from_mat4(m: Mat4) -> Self {
        let t = m.transpose();
        Self {
            rows: [
                t.x_axis.to_array(),
                t.y_axis.to_array(),
                t.z_axis.to_array(),
            ],
        }
    }

    /// Rebuild the full 4x4 matrix (inverse of [`Self::from_mat4`]).
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&[
            self.rows[0],
            self.rows[1],
            self.rows[2],
            [0.0, 0.0, 0.0, 1.0],
        ])
        .transpose()
    }

    /// The 12 floats in memory order.
    pub fn to_array(&self) -> [f32; 12] {
        bytemuck::cast(self.rows)
    }

    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.rows[0][3], self.rows[1][3], self.rows[2][3])
    }
}

/// Rotate around Y by `angle` radians, then translate by `offset`.
///
/// This is the animation applied to the orbiting scene instances.
pub fn spin_then_translate(angle: f32, offset: Vec3) -> Mat4 {
    Mat4::from_translation(offset) * Mat4::from_rotation_y(angle)
}

/// Axis-Aligned Bounding Box.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min and max corners
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point, or `None` for an empty slice.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut aabb = Self::new(first, first);
        for p in iter {
            aabb.expand_to_include(p);
        }
        Some(aabb)
    }

    /// Get the center of the AABB
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size of the AABB
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(40, 32), 64);
        assert_eq!(align_up(0, 32), 0);
    }

    #[test]
    fn identity_round_trip() {
        assert_eq!(Transform3x4::from_mat4(Mat4::IDENTITY), Transform3x4::IDENTITY);
        assert_eq!(Transform3x4::IDENTITY.to_mat4(), Mat4::IDENTITY);
    }

    #[test]
    fn translation_lands_in_last_column() {
        let t = Transform3x4::from_mat4(Mat4::from_translation(Vec3::new(-2.0, 3.0, 4.5)));
        assert_eq!(t.rows[0][3], -2.0);
        assert_eq!(t.rows[1][3], 3.0);
        assert_eq!(t.rows[2][3], 4.5);
        assert_eq!(t.translation(), Vec3::new(-2.0, 3.0, 4.5));
    }

    #[test]
    fn rows_transform_points_like_the_matrix() {
        let m = spin_then_translate(0.7, Vec3::new(-2.0, 0.0, 0.0));
        let t = Transform3x4::from_mat4(m);
        let p = Vec3::new(0.3, -1.0, 2.0);
        let expected = m.transform_point3(p);
        let p4 = Vec4::new(p.x, p.y, p.z, 1.0);
        for (row, want) in t.rows.iter().zip(expected.to_array()) {
            let got = Vec4::from_array(*row).dot(p4);
            assert_relative_eq!(got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn spin_happens_before_translation() {
        let m = spin_then_translate(std::f32::consts::FRAC_PI_2, Vec3::new(-2.0, 0.0, 0.0));
        // +X rotated a quarter turn around Y points to -Z, then shifts left.
        let p = m.transform_point3(Vec3::X);
        assert_relative_eq!(p.x, -2.0, epsilon = 1e-5);
        assert_relative_eq!(p.z, -1.0, epsilon = 1e-5);
        assert_eq!(Transform3x4::from_mat4(m).translation(), Vec3::new(-2.0, 0.0, 0.0));
    }

    #[test]
    fn aabb_from_points() {
        assert!(Aabb::from_points([]).is_none());
        let aabb = Aabb::from_points([Vec3::new(1.0, -1.0, 0.0), Vec3::new(-1.0, 2.0, 3.0)])
            .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -1.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(aabb.center(), Vec3::new(0.0, 0.5, 1.5));
    }
}

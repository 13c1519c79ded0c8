//! Hit-group record layout shared by the TLAS and the shader table.
//!
//! A ray hitting geometry `g` of instance `i` with ray type `r` selects hit
//! record
//!
//! ```text
//! instance_offset(i) + g * ray_type_count + r
//! ```
//!
//! where `instance_offset(i)` is what the TLAS writes into the instance
//! descriptor and `ray_type_count` is the `sbtRecordStride` passed to
//! `traceRayEXT`. Both the TLAS builder and the shader-table builder read
//! offsets from [`HitGroupLayout`] and nowhere else.

use crate::error::{Result, RtError};

/// Primary (camera) rays.
pub const RAY_TYPE_PRIMARY: u32 = 0;
/// Shadow rays spawned from hit shaders.
pub const RAY_TYPE_SHADOW: u32 = 1;
/// Ray types the scene shaders trace.
pub const RAY_TYPE_COUNT: u32 = 2;

/// Largest value the 24-bit instance shader-binding-table offset can hold.
const MAX_INSTANCE_OFFSET: u32 = (1 << 24) - 1;

/// Per-instance hit-record offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitGroupLayout {
    ray_type_count: u32,
    geometry_counts: Vec<u32>,
    offsets: Vec<u32>,
    total_records: u32,
}

impl HitGroupLayout {
    pub fn new(ray_type_count: u32) -> Result<Self> {
        if ray_type_count == 0 {
            return Err(RtError::Layout("ray type count must be non-zero".to_string()));
        }
        Ok(Self {
            ray_type_count,
            geometry_counts: Vec::new(),
            offsets: Vec::new(),
            total_records: 0,
        })
    }

    /// Build a layout in one go from per-instance geometry counts.
    pub fn from_geometry_counts(ray_type_count: u32, geometry_counts: &[u32]) -> Result<Self> {
        let mut layout = Self::new(ray_type_count)?;
        for &count in geometry_counts {
            layout.add_instance(count)?;
        }
        Ok(layout)
    }

    /// Append an instance whose BLAS holds `geometry_count` geometries.
    /// Returns the new instance index.
    pub fn add_instance(&mut self, geometry_count: u32) -> Result<u32> {
        if geometry_count == 0 {
            return Err(RtError::Layout(format!(
                "instance {} has no geometry",
                self.geometry_counts.len()
            )));
        }
        let offset = self.total_records;
        if offset > MAX_INSTANCE_OFFSET {
            return Err(RtError::Layout(format!(
                "hit record offset {offset} of instance {} exceeds the 24-bit instance field",
                self.geometry_counts.len()
            )));
        }
        let records = geometry_count
            .checked_mul(self.ray_type_count)
            .and_then(|r| r.checked_add(offset))
            .ok_or_else(|| RtError::Layout("hit record count overflows u32".to_string()))?;

        self.geometry_counts.push(geometry_count);
        self.offsets.push(offset);
        self.total_records = records;
        Ok(self.geometry_counts.len() as u32 - 1)
    }

    pub fn ray_type_count(&self) -> u32 {
        self.ray_type_count
    }

    pub fn instance_count(&self) -> u32 {
        self.geometry_counts.len() as u32
    }

    pub fn geometry_count(&self, instance: u32) -> Option<u32> {
        self.geometry_counts.get(instance as usize).copied()
    }

    /// Hit-record index of the first record of `instance`; the value written
    /// into its instance descriptor.
    pub fn instance_offset(&self, instance: u32) -> Option<u32> {
        self.offsets.get(instance as usize).copied()
    }

    /// Hit-record index for one `(instance, geometry, ray type)` triple.
    pub fn record_index(&self, instance: u32, geometry: u32, ray_type: u32) -> Option<u32> {
        let geometry_count = self.geometry_count(instance)?;
        if geometry >= geometry_count || ray_type >= self.ray_type_count {
            return None;
        }
        Some(self.offsets[instance as usize] + geometry * self.ray_type_count + ray_type)
    }

    /// Total hit records, i.e. the hit-region length in records.
    pub fn total_records(&self) -> u32 {
        self.total_records
    }

    /// Every hit slot in record order.
    pub fn slots(&self) -> impl Iterator<Item = HitSlot> + '_ {
        self.geometry_counts
            .iter()
            .enumerate()
            .flat_map(move |(instance, &geometries)| {
                (0..geometries).flat_map(move |geometry| {
                    (0..self.ray_type_count).map(move |ray_type| HitSlot {
                        instance: instance as u32,
                        geometry,
                        ray_type,
                    })
                })
            })
    }

    /// Check offsets read back from instance descriptors against this layout.
    pub fn verify_instance_offsets(&self, written: &[u32]) -> Result<()> {
        if written.len() != self.offsets.len() {
            return Err(RtError::Layout(format!(
                "{} instance offsets written, layout has {} instances",
                written.len(),
                self.offsets.len()
            )));
        }
        for (instance, (&got, &want)) in written.iter().zip(&self.offsets).enumerate() {
            if got != want {
                return Err(RtError::Layout(format!(
                    "instance {instance} points at hit record {got}, layout expects {want}"
                )));
            }
        }
        Ok(())
    }
}

/// One hit record position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HitSlot {
    pub instance: u32,
    pub geometry: u32,
    pub ray_type: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_layout() -> HitGroupLayout {
        HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &[2, 1, 1]).unwrap()
    }

    #[test]
    fn offsets_are_prefix_sums() {
        let layout = scene_layout();
        assert_eq!(layout.instance_offset(0), Some(0));
        assert_eq!(layout.instance_offset(1), Some(4));
        assert_eq!(layout.instance_offset(2), Some(6));
        assert_eq!(layout.instance_offset(3), None);
        assert_eq!(layout.total_records(), 8);
    }

    #[test]
    fn single_geometry_instances_use_pairs() {
        // One geometry per instance: each instance owns one (primary, shadow) pair.
        let layout = HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &[1, 1, 1, 1]).unwrap();
        for i in 0..4 {
            assert_eq!(layout.instance_offset(i), Some(i * 2));
        }
    }

    #[test]
    fn record_index_matches_trace_ray_addressing() {
        let layout = scene_layout();
        assert_eq!(layout.record_index(0, 0, RAY_TYPE_PRIMARY), Some(0));
        assert_eq!(layout.record_index(0, 0, RAY_TYPE_SHADOW), Some(1));
        assert_eq!(layout.record_index(0, 1, RAY_TYPE_PRIMARY), Some(2));
        assert_eq!(layout.record_index(0, 1, RAY_TYPE_SHADOW), Some(3));
        assert_eq!(layout.record_index(2, 0, RAY_TYPE_SHADOW), Some(7));
        assert_eq!(layout.record_index(1, 1, RAY_TYPE_PRIMARY), None);
        assert_eq!(layout.record_index(1, 0, 2), None);
    }

    #[test]
    fn slots_cover_every_record_once_in_order() {
        let layout = scene_layout();
        let indices: Vec<u32> = layout
            .slots()
            .map(|s| layout.record_index(s.instance, s.geometry, s.ray_type).unwrap())
            .collect();
        assert_eq!(indices, (0..layout.total_records()).collect::<Vec<_>>());
    }

    #[test]
    fn primary_hit_of_each_instance_sits_at_its_offset() {
        let layout = scene_layout();
        for i in 0..layout.instance_count() {
            assert_eq!(
                layout.record_index(i, 0, RAY_TYPE_PRIMARY),
                layout.instance_offset(i)
            );
        }
    }

    #[test]
    fn verify_detects_divergent_offsets() {
        let layout = scene_layout();
        layout.verify_instance_offsets(&[0, 4, 6]).unwrap();
        // The hard-coded `i * 2` formula breaks once instance 0 carries two geometries.
        assert!(layout.verify_instance_offsets(&[0, 2, 4]).is_err());
        assert!(layout.verify_instance_offsets(&[0, 4]).is_err());
    }

    #[test]
    fn rejects_degenerate_input() {
        assert!(HitGroupLayout::new(0).is_err());
        let mut layout = HitGroupLayout::new(RAY_TYPE_COUNT).unwrap();
        assert!(layout.add_instance(0).is_err());
        assert_eq!(layout.instance_count(), 0);

        layout.add_instance(1 << 23).unwrap();
        assert!(layout.add_instance(1).is_err());
        assert_eq!(layout.instance_count(), 1);
    }
}

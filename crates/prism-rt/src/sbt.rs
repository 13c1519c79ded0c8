//! Shader binding table.
//!
//! One buffer of fixed-stride records:
//!
//! ```text
//! [ray-gen][miss 0 .. miss M-1][hit 0 .. hit H-1]
//! ```
//!
//! Every record is a group identifier followed by its local arguments, and
//! record `i` starts at `i * stride`. Hit records are indexed through the
//! [`HitGroupLayout`] the TLAS was built with.

use ash::vk;
use prism_core::align_up;
use prism_gpu::{BufferKind, GpuAllocator, GpuBuffer};

use crate::device::RtDevice;
use crate::error::{Result, RtError};
use crate::hit_groups::HitGroupLayout;
use crate::pipeline_state::{LocalParameter, RtPipeline, ShaderIdentifiers};

/// One 8-byte argument written after a shader identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalArgument {
    /// Device address of a constant buffer.
    ConstantBuffer(vk::DeviceAddress),
    /// Offset into the dispatch's descriptor set.
    DescriptorTable(u64),
}

impl LocalArgument {
    pub fn parameter(&self) -> LocalParameter {
        match self {
            Self::ConstantBuffer(_) => LocalParameter::ConstantBuffer,
            Self::DescriptorTable(_) => LocalParameter::DescriptorTable,
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        match *self {
            Self::ConstantBuffer(v) | Self::DescriptorTable(v) => v.to_le_bytes(),
        }
    }
}

/// The group a record invokes and the arguments stored with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderRecord {
    pub export: &'static str,
    pub args: Vec<LocalArgument>,
}

impl ShaderRecord {
    pub fn new(export: &'static str, args: Vec<LocalArgument>) -> Self {
        Self { export, args }
    }

    /// Record without local arguments.
    pub fn bare(export: &'static str) -> Self {
        Self::new(export, Vec::new())
    }

    pub fn trailer_size(&self) -> u32 {
        self.args.len() as u32 * LocalParameter::SIZE
    }
}

/// Byte layout of a shader table with explicit region sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderTableLayout {
    identifier_size: u32,
    trailer_size: u32,
    record_alignment: u32,
    stride: u64,
    miss_count: u32,
    hit_count: u32,
}

impl ShaderTableLayout {
    /// `record_alignment` must cover both the handle alignment and the
    /// region base alignment of the device.
    pub fn new(
        identifier_size: u32,
        trailer_size: u32,
        record_alignment: u32,
        miss_count: u32,
        hit_count: u32,
    ) -> Result<Self> {
        if identifier_size == 0 {
            return Err(RtError::ShaderTable("identifier size is zero".to_string()));
        }
        if !record_alignment.is_power_of_two() {
            return Err(RtError::ShaderTable(format!(
                "record alignment {record_alignment} is not a power of two"
            )));
        }
        let stride = align_up(
            u64::from(identifier_size) + u64::from(trailer_size),
            u64::from(record_alignment),
        );
        Ok(Self {
            identifier_size,
            trailer_size,
            record_alignment,
            stride,
            miss_count,
            hit_count,
        })
    }

    pub fn identifier_size(&self) -> u32 {
        self.identifier_size
    }

    pub fn trailer_size(&self) -> u32 {
        self.trailer_size
    }

    pub fn record_alignment(&self) -> u32 {
        self.record_alignment
    }

    /// Distance between consecutive records; the same for every region.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub fn record_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    pub fn record_offset(&self, record: u32) -> u64 {
        u64::from(record) * self.stride
    }

    pub fn miss_offset(&self) -> u64 {
        self.record_offset(1)
    }

    pub fn hit_offset(&self) -> u64 {
        self.record_offset(1 + self.miss_count)
    }

    pub fn total_size(&self) -> u64 {
        self.record_offset(self.record_count())
    }

    /// Fails when the stride exceeds `maxShaderGroupStride`.
    pub fn check_limits(&self, max_stride: u32) -> Result<()> {
        if self.stride > u64::from(max_stride) {
            return Err(RtError::ShaderTable(format!(
                "record stride {} exceeds the device maximum {max_stride}",
                self.stride
            )));
        }
        Ok(())
    }

    fn region(
        &self,
        base: vk::DeviceAddress,
        offset: u64,
        count: u32,
    ) -> vk::StridedDeviceAddressRegionKHR {
        if count == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        vk::StridedDeviceAddressRegionKHR {
            device_address: base + offset,
            stride: self.stride,
            size: u64::from(count) * self.stride,
        }
    }

    /// Ray-gen region; its size equals the stride.
    pub fn raygen_region(&self, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        self.region(base, 0, 1)
    }

    pub fn miss_region(&self, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        self.region(base, self.miss_offset(), self.miss_count)
    }

    pub fn hit_region(&self, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        self.region(base, self.hit_offset(), self.hit_count)
    }
}

/// Collects one record per table slot.
///
/// Miss records are indexed by ray type and hit records by
/// `(instance, geometry, ray type)` through the shared [`HitGroupLayout`].
pub struct ShaderTableBuilder<'a> {
    layout: &'a HitGroupLayout,
    ray_gen: Option<ShaderRecord>,
    misses: Vec<Option<ShaderRecord>>,
    hits: Vec<Option<ShaderRecord>>,
}

impl<'a> ShaderTableBuilder<'a> {
    pub fn new(layout: &'a HitGroupLayout) -> Self {
        Self {
            layout,
            ray_gen: None,
            misses: vec![None; layout.ray_type_count() as usize],
            hits: vec![None; layout.total_records() as usize],
        }
    }

    pub fn hit_layout(&self) -> &HitGroupLayout {
        self.layout
    }

    pub fn ray_gen(&mut self, record: ShaderRecord) {
        self.ray_gen = Some(record);
    }

    pub fn miss(&mut self, ray_type: u32, record: ShaderRecord) -> Result<()> {
        let slot = self.misses.get_mut(ray_type as usize).ok_or_else(|| {
            RtError::ShaderTable(format!("no miss slot for ray type {ray_type}"))
        })?;
        *slot = Some(record);
        Ok(())
    }

    pub fn hit(
        &mut self,
        instance: u32,
        geometry: u32,
        ray_type: u32,
        record: ShaderRecord,
    ) -> Result<()> {
        let index = self
            .layout
            .record_index(instance, geometry, ray_type)
            .ok_or_else(|| {
                RtError::ShaderTable(format!(
                    "no hit slot for instance {instance}, geometry {geometry}, ray type {ray_type}"
                ))
            })?;
        self.hits[index as usize] = Some(record);
        Ok(())
    }

    pub fn miss_count(&self) -> u32 {
        self.misses.len() as u32
    }

    pub fn hit_count(&self) -> u32 {
        self.hits.len() as u32
    }

    /// Largest argument trailer among the collected records.
    pub fn max_trailer_size(&self) -> u32 {
        self.ray_gen
            .iter()
            .chain(self.misses.iter().flatten())
            .chain(self.hits.iter().flatten())
            .map(ShaderRecord::trailer_size)
            .max()
            .unwrap_or(0)
    }

    /// Layout fitting every collected record.
    pub fn table_layout(
        &self,
        identifier_size: u32,
        record_alignment: u32,
    ) -> Result<ShaderTableLayout> {
        ShaderTableLayout::new(
            identifier_size,
            self.max_trailer_size(),
            record_alignment,
            self.miss_count(),
            self.hit_count(),
        )
    }

    fn records(&self) -> Result<Vec<&ShaderRecord>> {
        let ray_gen = self
            .ray_gen
            .as_ref()
            .ok_or_else(|| RtError::ShaderTable("ray-gen record missing".to_string()))?;

        let mut records = vec![ray_gen];
        for (ray_type, miss) in self.misses.iter().enumerate() {
            records.push(miss.as_ref().ok_or_else(|| {
                RtError::ShaderTable(format!("miss record for ray type {ray_type} missing"))
            })?);
        }
        for (slot, hit) in self.layout.slots().zip(&self.hits) {
            records.push(hit.as_ref().ok_or_else(|| {
                RtError::ShaderTable(format!(
                    "hit record for instance {}, geometry {}, ray type {} missing",
                    slot.instance, slot.geometry, slot.ray_type
                ))
            })?);
        }
        Ok(records)
    }

    /// Serialize all records at `i * stride`.
    pub fn encode(
        &self,
        layout: &ShaderTableLayout,
        identifiers: &ShaderIdentifiers,
    ) -> Result<Vec<u8>> {
        if layout.miss_count() != self.miss_count() || layout.hit_count() != self.hit_count() {
            return Err(RtError::ShaderTable(format!(
                "layout has {} miss and {} hit records, builder has {} and {}",
                layout.miss_count(),
                layout.hit_count(),
                self.miss_count(),
                self.hit_count()
            )));
        }
        if layout.identifier_size() != identifiers.size() {
            return Err(RtError::ShaderTable(format!(
                "layout identifier size {} differs from the pipeline's {}",
                layout.identifier_size(),
                identifiers.size()
            )));
        }

        let records = self.records()?;
        let mut bytes = vec![0u8; layout.total_size() as usize];

        for (i, record) in records.iter().enumerate() {
            let handle = identifiers.handle(record.export).ok_or_else(|| {
                RtError::ShaderTable(format!("unknown export {}", record.export))
            })?;
            let expected = identifiers.local_layout(record.export).unwrap_or(&[]);
            let given: Vec<LocalParameter> =
                record.args.iter().map(LocalArgument::parameter).collect();
            if given != expected {
                return Err(RtError::ShaderTable(format!(
                    "record {i} ({}): arguments {given:?} do not match local layout {expected:?}",
                    record.export
                )));
            }
            if record.trailer_size() > layout.trailer_size() {
                return Err(RtError::ShaderTable(format!(
                    "record {i} ({}) needs {} trailer bytes, layout has {}",
                    record.export,
                    record.trailer_size(),
                    layout.trailer_size()
                )));
            }

            let start = layout.record_offset(i as u32) as usize;
            let id_end = start + handle.len();
            bytes[start..id_end].copy_from_slice(handle);
            for (arg_index, arg) in record.args.iter().enumerate() {
                let at = id_end + arg_index * LocalParameter::SIZE as usize;
                bytes[at..at + LocalParameter::SIZE as usize].copy_from_slice(&arg.to_bytes());
            }
        }
        Ok(bytes)
    }
}

/// Uploaded shader table and the regions passed to `vkCmdTraceRaysKHR`.
pub struct ShaderTable {
    pub buffer: GpuBuffer,
    pub layout: ShaderTableLayout,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    /// Always empty.
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderTable {
    /// Encode the builder's records against `pipeline` and upload them.
    ///
    /// # Safety
    /// `rt` must be live.
    pub unsafe fn new(
        rt: &RtDevice,
        allocator: &mut GpuAllocator,
        pipeline: &RtPipeline,
        builder: &ShaderTableBuilder<'_>,
    ) -> Result<Self> {
        let limits = rt.limits();
        let alignment = limits.record_alignment();
        let layout = builder.table_layout(limits.shader_group_handle_size, alignment)?;
        layout.check_limits(limits.max_shader_group_stride)?;
        let bytes = builder.encode(&layout, pipeline.identifiers())?;

        // The region base must be aligned too; over-allocate and shift.
        let mut buffer = allocator.create_buffer_for(
            BufferKind::ShaderBindingTable,
            layout.total_size() + u64::from(alignment),
            "shader_binding_table",
        )?;
        let address = buffer.device_address(rt.device());
        let base = align_up(address, u64::from(alignment));
        if let Err(e) = buffer.write_bytes(base - address, &bytes) {
            allocator.free_buffer(&mut buffer)?;
            return Err(e.into());
        }

        tracing::debug!(
            stride = layout.stride(),
            records = layout.record_count(),
            misses = layout.miss_count(),
            hits = layout.hit_count(),
            size = layout.total_size(),
            "Shader table uploaded"
        );

        Ok(Self {
            raygen_region: layout.raygen_region(base),
            miss_region: layout.miss_region(base),
            hit_region: layout.hit_region(base),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
            buffer,
            layout,
        })
    }

    pub fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.buffer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceleration::{write_instances, InstanceDescriptor, TlasInstance};
    use crate::hit_groups::{RAY_TYPE_COUNT, RAY_TYPE_PRIMARY, RAY_TYPE_SHADOW};
    use crate::pipeline_state::exports::*;
    use bytemuck::Zeroable;
    use glam::Mat4;

    const HANDLE_SIZE: u32 = 32;
    const RECORD_ALIGNMENT: u32 = 64;

    fn handle_for(name: &str) -> Vec<u8> {
        let seed = name.bytes().fold(0u8, u8::wrapping_add);
        (0..HANDLE_SIZE as u8).map(|i| seed.wrapping_add(i)).collect()
    }

    fn scene_identifiers() -> ShaderIdentifiers {
        let mut ids = ShaderIdentifiers::new(HANDLE_SIZE);
        for (name, local) in [
            (RAY_GEN, vec![LocalParameter::DescriptorTable]),
            (MISS, vec![]),
            (SHADOW_MISS, vec![]),
            (TRI_HIT_GROUP, vec![LocalParameter::ConstantBuffer]),
            (PLANE_HIT_GROUP, vec![LocalParameter::DescriptorTable]),
            (SHADOW_HIT_GROUP, vec![]),
        ] {
            ids.insert(name, handle_for(name), local);
        }
        ids
    }

    fn color_address(instance: u32) -> u64 {
        0x1_0000 + u64::from(instance) * 256
    }

    fn scene_builder(layout: &HitGroupLayout) -> ShaderTableBuilder<'_> {
        let mut builder = ShaderTableBuilder::new(layout);
        builder.ray_gen(ShaderRecord::new(RAY_GEN, vec![LocalArgument::DescriptorTable(0)]));
        builder.miss(RAY_TYPE_PRIMARY, ShaderRecord::bare(MISS)).unwrap();
        builder.miss(RAY_TYPE_SHADOW, ShaderRecord::bare(SHADOW_MISS)).unwrap();
        for instance in 0..layout.instance_count() {
            let tri = ShaderRecord::new(
                TRI_HIT_GROUP,
                vec![LocalArgument::ConstantBuffer(color_address(instance))],
            );
            builder.hit(instance, 0, RAY_TYPE_PRIMARY, tri).unwrap();
            builder
                .hit(instance, 0, RAY_TYPE_SHADOW, ShaderRecord::bare(SHADOW_HIT_GROUP))
                .unwrap();
        }
        builder
            .hit(
                0,
                1,
                RAY_TYPE_PRIMARY,
                ShaderRecord::new(PLANE_HIT_GROUP, vec![LocalArgument::DescriptorTable(0)]),
            )
            .unwrap();
        builder
            .hit(0, 1, RAY_TYPE_SHADOW, ShaderRecord::bare(SHADOW_HIT_GROUP))
            .unwrap();
        builder
    }

    #[test]
    fn stride_rounds_identifier_plus_trailer() {
        let layout = ShaderTableLayout::new(32, 8, 64, 2, 8).unwrap();
        assert_eq!(layout.stride(), 64);
        let layout = ShaderTableLayout::new(32, 0, 32, 1, 1).unwrap();
        assert_eq!(layout.stride(), 32);
        let layout = ShaderTableLayout::new(32, 8, 32, 1, 1).unwrap();
        assert_eq!(layout.stride(), 64);
        let layout = ShaderTableLayout::new(32, 40, 64, 0, 0).unwrap();
        assert_eq!(layout.stride(), 128);
        assert!(ShaderTableLayout::new(32, 8, 48, 1, 1).is_err());
        assert!(layout.check_limits(64).is_err());
        layout.check_limits(4096).unwrap();
    }

    #[test]
    fn records_are_uniformly_spaced() {
        for (miss_count, hit_count) in [(0, 0), (1, 1), (2, 10)] {
            let expected_records = 1 + miss_count + hit_count;
            let hit_layout = HitGroupLayout::from_geometry_counts(
                1,
                &vec![1; hit_count as usize],
            )
            .unwrap();
            let mut builder = ShaderTableBuilder {
                layout: &hit_layout,
                ray_gen: None,
                misses: vec![None; miss_count as usize],
                hits: vec![None; hit_count as usize],
            };
            builder.ray_gen(ShaderRecord::new(RAY_GEN, vec![LocalArgument::DescriptorTable(7)]));
            for m in 0..miss_count {
                builder.miss(m, ShaderRecord::bare(MISS)).unwrap();
            }
            for i in 0..hit_count {
                builder.hit(i, 0, 0, ShaderRecord::bare(SHADOW_HIT_GROUP)).unwrap();
            }

            let layout = builder.table_layout(HANDLE_SIZE, RECORD_ALIGNMENT).unwrap();
            assert_eq!(layout.record_count(), expected_records);
            let bytes = builder.encode(&layout, &scene_identifiers()).unwrap();
            assert_eq!(bytes.len() as u64, u64::from(expected_records) * layout.stride());

            let offsets: Vec<u64> = (0..expected_records)
                .map(|r| layout.record_offset(r))
                .collect();
            for pair in offsets.windows(2) {
                assert_eq!(pair[1] - pair[0], layout.stride());
            }
            assert_eq!(&bytes[..HANDLE_SIZE as usize], handle_for(RAY_GEN).as_slice());
            for r in 1..expected_records {
                let at = layout.record_offset(r) as usize;
                assert_ne!(&bytes[at..at + HANDLE_SIZE as usize], &[0u8; 32][..]);
            }
        }
    }

    #[test]
    fn regions_have_explicit_sizes() {
        let layout = ShaderTableLayout::new(32, 8, 64, 2, 8).unwrap();
        let base = 0x10_0000;
        let raygen = layout.raygen_region(base);
        assert_eq!(raygen.size, raygen.stride);
        assert_eq!(raygen.device_address, base);

        let miss = layout.miss_region(base);
        assert_eq!(miss.device_address, base + 64);
        assert_eq!(miss.size, 2 * 64);

        let hit = layout.hit_region(base);
        assert_eq!(hit.device_address, base + 3 * 64);
        assert_eq!(hit.size, 8 * 64);
        assert_eq!(layout.total_size(), 11 * 64);

        let empty = ShaderTableLayout::new(32, 0, 64, 0, 0).unwrap();
        assert_eq!(empty.miss_region(base).size, 0);
        assert_eq!(empty.miss_region(base).device_address, 0);
    }

    #[test]
    fn tlas_offsets_select_each_instances_primary_record() {
        let hit_layout = HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &[2, 1, 1]).unwrap();
        let builder = scene_builder(&hit_layout);
        let ids = scene_identifiers();
        let layout = builder.table_layout(HANDLE_SIZE, RECORD_ALIGNMENT).unwrap();
        let table = builder.encode(&layout, &ids).unwrap();

        let instances: Vec<TlasInstance> = (0..3)
            .map(|i| TlasInstance::new(i, 0x1000 * u64::from(i + 1), Mat4::IDENTITY))
            .collect();
        let mut descriptors = vec![InstanceDescriptor::zeroed(); 3];
        write_instances(&mut descriptors, &instances, &hit_layout).unwrap();

        for (i, descriptor) in descriptors.iter().enumerate() {
            // Hit record = offset + geometry * stride(2) + ray type.
            let primary = descriptor.sbt_offset();
            let at = (layout.hit_offset() + layout.record_offset(primary)) as usize;
            assert_eq!(&table[at..at + HANDLE_SIZE as usize], ids.handle(TRI_HIT_GROUP).unwrap());
            let arg = &table[at + HANDLE_SIZE as usize..at + HANDLE_SIZE as usize + 8];
            assert_eq!(arg, &color_address(i as u32).to_le_bytes());

            let shadow =
                (layout.hit_offset() + layout.record_offset(primary + RAY_TYPE_SHADOW)) as usize;
            assert_eq!(
                &table[shadow..shadow + HANDLE_SIZE as usize],
                ids.handle(SHADOW_HIT_GROUP).unwrap()
            );
        }

        // Geometry 1 of instance 0 is the plane.
        let plane = hit_layout.record_index(0, 1, RAY_TYPE_PRIMARY).unwrap();
        let at = (layout.hit_offset() + layout.record_offset(plane)) as usize;
        assert_eq!(&table[at..at + HANDLE_SIZE as usize], ids.handle(PLANE_HIT_GROUP).unwrap());
    }

    #[test]
    fn encode_rejects_incomplete_or_mismatched_records() {
        let hit_layout = HitGroupLayout::from_geometry_counts(RAY_TYPE_COUNT, &[2, 1, 1]).unwrap();
        let ids = scene_identifiers();

        let mut builder = scene_builder(&hit_layout);
        builder.hits[5] = None;
        let layout = builder.table_layout(HANDLE_SIZE, RECORD_ALIGNMENT).unwrap();
        assert!(matches!(
            builder.encode(&layout, &ids),
            Err(RtError::ShaderTable(m)) if m.contains("missing")
        ));

        let mut builder = scene_builder(&hit_layout);
        builder.miss(RAY_TYPE_PRIMARY, ShaderRecord::bare("Mis")).unwrap();
        assert!(matches!(
            builder.encode(&layout, &ids),
            Err(RtError::ShaderTable(m)) if m.contains("unknown export")
        ));

        let mut builder = scene_builder(&hit_layout);
        builder
            .hit(1, 0, RAY_TYPE_PRIMARY, ShaderRecord::bare(TRI_HIT_GROUP))
            .unwrap();
        assert!(matches!(
            builder.encode(&layout, &ids),
            Err(RtError::ShaderTable(m)) if m.contains("local layout")
        ));

        let builder = scene_builder(&hit_layout);
        assert!(builder.hit_layout().record_index(3, 0, 0).is_none());
        let mut builder = builder;
        assert!(builder.hit(3, 0, 0, ShaderRecord::bare(SHADOW_HIT_GROUP)).is_err());
        assert!(builder.miss(2, ShaderRecord::bare(MISS)).is_err());
    }
}

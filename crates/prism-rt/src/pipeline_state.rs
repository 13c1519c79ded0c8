//! Ray-tracing pipeline state assembled from an ordered sub-object arena.
//!
//! The pipeline is described as a flat, fixed-capacity list of
//! [`Subobject`]s. Export associations refer to earlier entries by
//! [`SubobjectIndex`], never by reference, so the description can be built
//! incrementally and resolved in one pass right before pipeline creation.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use ash::vk;
use prism_gpu::{create_shader_module, DescriptorSetLayoutBuilder, VkResultExt};

use crate::device::RtDevice;
use crate::error::{Result, RtError};

/// Ray payload size in bytes (`vec3` colour).
pub const MAX_PAYLOAD_SIZE: u32 = 12;
/// Hit attribute size in bytes (`vec2` barycentrics).
pub const MAX_ATTRIBUTE_SIZE: u32 = 8;
/// Primary ray plus one shadow ray spawned from a hit shader.
pub const MAX_RECURSION_DEPTH: u32 = 2;

/// Hit attributes larger than this are rejected by every implementation.
const ATTRIBUTE_SIZE_LIMIT: u32 = 32;

/// Sub-objects in [`SubobjectArena::scene_default`].
pub const SCENE_SUBOBJECT_COUNT: usize = 16;

/// Entry point and hit-group names. They must match the shader sources.
pub mod exports {
    pub const RAY_GEN: &str = "RayGen";
    pub const MISS: &str = "Miss";
    pub const SHADOW_MISS: &str = "ShadowMiss";
    pub const HIT: &str = "Hit";
    pub const PLANE_HIT: &str = "PlaneHit";
    pub const SHADOW_HIT: &str = "ShadowHit";

    pub const TRI_HIT_GROUP: &str = "TriHitGroup";
    pub const PLANE_HIT_GROUP: &str = "PlaneHitGroup";
    pub const SHADOW_HIT_GROUP: &str = "ShadowHitGroup";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    RayGen,
    Miss,
    ClosestHit,
}

impl ShaderStage {
    pub fn vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            Self::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        }
    }
}

/// One named entry point of a shader library.
#[derive(Clone, Debug)]
pub struct LibraryExport {
    pub name: &'static str,
    pub stage: ShaderStage,
    pub code: &'static [u32],
    /// Calls `traceRayEXT`.
    pub traces: bool,
}

/// The set of SPIR-V entry points a pipeline is built from.
#[derive(Clone, Debug, Default)]
pub struct ShaderLibrary {
    pub exports: Vec<LibraryExport>,
    /// Largest ray payload the shaders declare, in bytes.
    pub payload_size: u32,
    /// Hit attribute size the shaders declare, in bytes.
    pub attribute_size: u32,
}

impl ShaderLibrary {
    /// The six scene shaders.
    pub fn scene() -> Self {
        use exports::*;
        use ShaderStage::{ClosestHit, Miss, RayGen};

        let export = |name, stage, code, traces| LibraryExport {
            name,
            stage,
            code,
            traces,
        };
        Self {
            exports: vec![
                export(RAY_GEN, RayGen, prism_shaders::raygen(), true),
                export(MISS, Miss, prism_shaders::miss(), false),
                export(SHADOW_MISS, Miss, prism_shaders::shadow_miss(), false),
                export(HIT, ClosestHit, prism_shaders::tri_hit(), false),
                export(PLANE_HIT, ClosestHit, prism_shaders::plane_hit(), true),
                export(SHADOW_HIT, ClosestHit, prism_shaders::shadow_hit(), false),
            ],
            payload_size: MAX_PAYLOAD_SIZE,
            attribute_size: MAX_ATTRIBUTE_SIZE,
        }
    }

    /// Position and description of an export.
    pub fn find(&self, name: &str) -> Option<(usize, &LibraryExport)> {
        self.exports.iter().enumerate().find(|(_, e)| e.name == name)
    }

    /// Recursion depth the shaders need: one for rays from ray generation,
    /// one more when a hit or miss shader traces.
    pub fn required_recursion_depth(&self) -> u32 {
        let nested = self
            .exports
            .iter()
            .any(|e| e.traces && e.stage != ShaderStage::RayGen);
        1 + u32::from(nested)
    }
}

/// Triangle hit group with a single closest-hit shader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HitGroupDesc {
    pub name: &'static str,
    pub closest_hit: &'static str,
}

/// One 8-byte argument slot following a shader identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalParameter {
    /// Device address of a constant buffer.
    ConstantBuffer,
    /// Offset into the dispatch's descriptor set.
    DescriptorTable,
}

impl LocalParameter {
    pub const SIZE: u32 = 8;
}

/// Layout of the arguments stored in a shader record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRootSignature {
    pub label: &'static str,
    pub parameters: Vec<LocalParameter>,
}

impl LocalRootSignature {
    pub fn new(label: &'static str, parameters: Vec<LocalParameter>) -> Self {
        Self { label, parameters }
    }

    pub fn empty(label: &'static str) -> Self {
        Self::new(label, Vec::new())
    }

    /// Record trailer size in bytes.
    pub fn size(&self) -> u32 {
        self.parameters.len() as u32 * LocalParameter::SIZE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

/// Pipeline-wide resources: one descriptor set bound for the whole dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalRootSignature {
    pub bindings: Vec<GlobalBinding>,
}

impl GlobalRootSignature {
    /// TLAS at 0, output image at 1, camera constants at 2.
    pub fn scene() -> Self {
        let stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR;
        let binding = |binding, ty| GlobalBinding {
            binding,
            ty,
            stages,
        };
        Self {
            bindings: vec![
                binding(0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
                binding(1, vk::DescriptorType::STORAGE_IMAGE),
                binding(2, vk::DescriptorType::UNIFORM_BUFFER),
            ],
        }
    }
}

/// Position of a sub-object inside its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubobjectIndex(usize);

impl SubobjectIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum Subobject {
    Library(ShaderLibrary),
    HitGroup(HitGroupDesc),
    LocalRootSignature(LocalRootSignature),
    /// Attach the local signature or shader config at `subobject` to `exports`.
    ExportAssociation {
        subobject: SubobjectIndex,
        exports: Vec<&'static str>,
    },
    ShaderConfig {
        max_payload_size: u32,
        max_attribute_size: u32,
    },
    PipelineConfig {
        max_recursion_depth: u32,
    },
    GlobalRootSignature(GlobalRootSignature),
}

impl Subobject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Library(_) => "library",
            Self::HitGroup(_) => "hit group",
            Self::LocalRootSignature(_) => "local root signature",
            Self::ExportAssociation { .. } => "export association",
            Self::ShaderConfig { .. } => "shader config",
            Self::PipelineConfig { .. } => "pipeline config",
            Self::GlobalRootSignature(_) => "global root signature",
        }
    }
}

/// Ordered sub-objects with a capacity fixed at construction.
///
/// The backing storage is never reallocated, so anything resolved from an
/// index stays inside [`Self::address_range`].
#[derive(Debug)]
pub struct SubobjectArena {
    items: Vec<Subobject>,
    capacity: usize,
}

impl SubobjectArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sub-object. Fails once the arena is full.
    pub fn push(&mut self, subobject: Subobject) -> Result<SubobjectIndex> {
        if self.items.len() == self.capacity {
            return Err(RtError::Pipeline(format!(
                "sub-object arena full ({} entries), cannot add {}",
                self.capacity,
                subobject.kind()
            )));
        }
        self.items.push(subobject);
        Ok(SubobjectIndex(self.items.len() - 1))
    }

    /// Append a local root signature and its association in one step.
    pub fn push_local_signature(
        &mut self,
        signature: LocalRootSignature,
        exports: Vec<&'static str>,
    ) -> Result<SubobjectIndex> {
        let subobject = self.push(Subobject::LocalRootSignature(signature))?;
        self.push(Subobject::ExportAssociation { subobject, exports })
    }

    pub fn get(&self, index: SubobjectIndex) -> Option<&Subobject> {
        self.items.get(index.0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (SubobjectIndex, &Subobject)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, s)| (SubobjectIndex(i), s))
    }

    /// Address range of the backing storage, covering the full capacity.
    pub fn address_range(&self) -> Range<*const Subobject> {
        let start = self.items.as_ptr();
        start..start.wrapping_add(self.capacity)
    }

    /// The sub-object set of the scene pipeline, in its required order.
    pub fn scene_default() -> Result<Self> {
        use exports::*;

        let mut arena = Self::with_capacity(SCENE_SUBOBJECT_COUNT);
        arena.push(Subobject::Library(ShaderLibrary::scene()))?;

        for (name, closest_hit) in [
            (TRI_HIT_GROUP, HIT),
            (PLANE_HIT_GROUP, PLANE_HIT),
            (SHADOW_HIT_GROUP, SHADOW_HIT),
        ] {
            arena.push(Subobject::HitGroup(HitGroupDesc { name, closest_hit }))?;
        }

        arena.push_local_signature(
            LocalRootSignature::new("raygen", vec![LocalParameter::DescriptorTable]),
            vec![RAY_GEN],
        )?;
        arena.push_local_signature(
            LocalRootSignature::new("triangle_hit", vec![LocalParameter::ConstantBuffer]),
            vec![HIT],
        )?;
        arena.push_local_signature(
            LocalRootSignature::new("plane_hit", vec![LocalParameter::DescriptorTable]),
            vec![PLANE_HIT_GROUP],
        )?;
        arena.push_local_signature(
            LocalRootSignature::empty("empty"),
            vec![SHADOW_HIT, MISS, SHADOW_MISS],
        )?;

        let shader_config = arena.push(Subobject::ShaderConfig {
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_attribute_size: MAX_ATTRIBUTE_SIZE,
        })?;
        arena.push(Subobject::ExportAssociation {
            subobject: shader_config,
            exports: vec![MISS, SHADOW_MISS, HIT, PLANE_HIT, SHADOW_HIT, RAY_GEN],
        })?;

        arena.push(Subobject::PipelineConfig {
            max_recursion_depth: MAX_RECURSION_DEPTH,
        })?;
        arena.push(Subobject::GlobalRootSignature(GlobalRootSignature::scene()))?;

        Ok(arena)
    }

    /// Resolve every index and check the set is complete and consistent.
    pub fn validate(&self, max_recursion_limit: u32) -> Result<ResolvedPipeline<'_>> {
        let fail = |msg: String| Err(RtError::Pipeline(msg));

        let mut library = None;
        let mut hit_groups = Vec::new();
        let mut associations = Vec::new();
        let mut shader_config = None;
        let mut recursion_depth = None;
        let mut global = None;

        for (index, subobject) in self.iter() {
            match subobject {
                Subobject::Library(lib) => {
                    if library.replace(lib).is_some() {
                        return fail("more than one shader library".to_string());
                    }
                }
                Subobject::HitGroup(group) => hit_groups.push(group),
                Subobject::LocalRootSignature(_) => {}
                Subobject::ExportAssociation { subobject, exports } => {
                    associations.push((index, *subobject, exports))
                }
                Subobject::ShaderConfig {
                    max_payload_size,
                    max_attribute_size,
                } => {
                    if shader_config
                        .replace((*max_payload_size, *max_attribute_size))
                        .is_some()
                    {
                        return fail("more than one shader config".to_string());
                    }
                }
                Subobject::PipelineConfig {
                    max_recursion_depth,
                } => {
                    if recursion_depth.replace(*max_recursion_depth).is_some() {
                        return fail("more than one pipeline config".to_string());
                    }
                }
                Subobject::GlobalRootSignature(signature) => {
                    if global.replace(signature).is_some() {
                        return fail("more than one global root signature".to_string());
                    }
                }
            }
        }

        let Some(library) = library else {
            return fail("no shader library".to_string());
        };
        let Some((max_payload_size, max_attribute_size)) = shader_config else {
            return fail("no shader config".to_string());
        };
        let Some(max_recursion_depth) = recursion_depth else {
            return fail("no pipeline config".to_string());
        };
        if max_attribute_size > ATTRIBUTE_SIZE_LIMIT {
            return fail(format!(
                "attribute size {max_attribute_size} exceeds {ATTRIBUTE_SIZE_LIMIT} bytes"
            ));
        }
        if max_payload_size != library.payload_size {
            return fail(format!(
                "payload size {max_payload_size} does not match the {} bytes the shaders declare",
                library.payload_size
            ));
        }
        if max_attribute_size != library.attribute_size {
            return fail(format!(
                "attribute size {max_attribute_size} does not match the {} bytes the shaders \
                 declare",
                library.attribute_size
            ));
        }
        if max_payload_size == 0 || max_attribute_size == 0 {
            return fail("payload and attribute sizes must be non-zero".to_string());
        }
        let required_depth = library.required_recursion_depth();
        if max_recursion_depth < required_depth || max_recursion_depth > max_recursion_limit {
            return fail(format!(
                "recursion depth {max_recursion_depth} outside \
                 {required_depth}..={max_recursion_limit}"
            ));
        }

        // Hit groups import closest-hit shaders from the library.
        let mut names: HashSet<&str> = library.exports.iter().map(|e| e.name).collect();
        if names.len() != library.exports.len() {
            return fail("duplicate library export".to_string());
        }
        for group in &hit_groups {
            match library.find(group.closest_hit) {
                Some((_, export)) if export.stage == ShaderStage::ClosestHit => {}
                Some((_, export)) => {
                    return fail(format!(
                        "hit group {} imports {}, a {:?} shader",
                        group.name, group.closest_hit, export.stage
                    ))
                }
                None => {
                    return fail(format!(
                        "hit group {} imports unknown export {}",
                        group.name, group.closest_hit
                    ))
                }
            }
            if !names.insert(group.name) {
                return fail(format!("hit group name {} already in use", group.name));
            }
        }
        for export in &library.exports {
            if export.stage == ShaderStage::ClosestHit
                && !hit_groups.iter().any(|g| g.closest_hit == export.name)
            {
                return fail(format!("closest-hit export {} is in no hit group", export.name));
            }
        }
        if !library
            .exports
            .iter()
            .any(|e| e.stage == ShaderStage::RayGen)
        {
            return fail("no ray generation shader".to_string());
        }

        // Local signature per export name.
        let mut local_by_name: HashMap<&str, (SubobjectIndex, &LocalRootSignature)> =
            HashMap::new();
        for (at, target, exports) in associations {
            let resolved = self.get(target).ok_or_else(|| {
                RtError::Pipeline(format!(
                    "association {} points at {}, outside the arena ({} entries)",
                    at.get(),
                    target.get(),
                    self.len()
                ))
            })?;
            for &name in exports.iter() {
                if !names.contains(name) {
                    return fail(format!(
                        "association {} names unknown export {name}",
                        at.get()
                    ));
                }
            }
            match resolved {
                Subobject::LocalRootSignature(signature) => {
                    for &name in exports.iter() {
                        if local_by_name.insert(name, (target, signature)).is_some() {
                            return fail(format!("export {name} has two local root signatures"));
                        }
                    }
                }
                Subobject::ShaderConfig { .. } => {}
                other => {
                    return fail(format!(
                        "association {} targets a {}",
                        at.get(),
                        other.kind()
                    ))
                }
            }
        }

        // General groups in library order, then hit groups in arena order.
        let mut groups = Vec::new();
        for (shader, export) in library.exports.iter().enumerate() {
            if export.stage == ShaderStage::ClosestHit {
                continue;
            }
            let local = local_by_name.get(export.name).map(|(_, s)| *s);
            groups.push(ResolvedGroup {
                name: export.name,
                kind: GroupKind::General { shader },
                local: local.map(|s| s.parameters.clone()).unwrap_or_default(),
            });
        }
        for group in &hit_groups {
            let by_group = local_by_name.get(group.name);
            let by_import = local_by_name.get(group.closest_hit);
            let local = match (by_group, by_import) {
                (Some((a, _)), Some((b, _))) if a != b => {
                    return fail(format!(
                        "hit group {} gets two local root signatures",
                        group.name
                    ))
                }
                (Some((_, s)), _) | (None, Some((_, s))) => s.parameters.clone(),
                (None, None) => Vec::new(),
            };
            let closest_hit = library
                .find(group.closest_hit)
                .map(|(i, _)| i)
                .ok_or_else(|| RtError::Pipeline(format!("lost import {}", group.closest_hit)))?;
            groups.push(ResolvedGroup {
                name: group.name,
                kind: GroupKind::TrianglesHit { closest_hit },
                local,
            });
        }

        Ok(ResolvedPipeline {
            library,
            groups,
            max_payload_size,
            max_attribute_size,
            max_recursion_depth,
            global: global.cloned().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    /// Ray generation or miss shader at this library position.
    General { shader: usize },
    /// Triangle hit group with its closest-hit shader at this library position.
    TrianglesHit { closest_hit: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedGroup<'a> {
    pub name: &'a str,
    pub kind: GroupKind,
    pub local: Vec<LocalParameter>,
}

/// A validated sub-object set, ready to lower to a pipeline.
#[derive(Debug)]
pub struct ResolvedPipeline<'a> {
    pub library: &'a ShaderLibrary,
    pub groups: Vec<ResolvedGroup<'a>>,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
    pub global: GlobalRootSignature,
}

impl ResolvedPipeline<'_> {
    fn stages(
        &self,
        modules: &[vk::ShaderModule],
    ) -> Vec<vk::PipelineShaderStageCreateInfo<'static>> {
        self.library
            .exports
            .iter()
            .zip(modules)
            .map(|(export, &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(export.stage.vk_stage())
                    .module(module)
                    .name(c"main")
            })
            .collect()
    }

    fn groups(&self) -> Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
        self.groups
            .iter()
            .map(|group| {
                let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR);
                match group.kind {
                    GroupKind::General { shader } => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(shader as u32),
                    GroupKind::TrianglesHit { closest_hit } => info
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .closest_hit_shader(closest_hit as u32),
                }
            })
            .collect()
    }
}

/// Group handles and local layouts by group name, fetched from a pipeline.
#[derive(Clone, Debug, Default)]
pub struct ShaderIdentifiers {
    size: u32,
    handles: HashMap<String, Vec<u8>>,
    locals: HashMap<String, Vec<LocalParameter>>,
}

impl ShaderIdentifiers {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn insert(&mut self, name: &str, handle: Vec<u8>, local: Vec<LocalParameter>) {
        self.handles.insert(name.to_string(), handle);
        self.locals.insert(name.to_string(), local);
    }

    /// Identifier size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn handle(&self, name: &str) -> Option<&[u8]> {
        self.handles.get(name).map(Vec::as_slice)
    }

    pub fn local_layout(&self, name: &str) -> Option<&[LocalParameter]> {
        self.locals.get(name).map(Vec::as_slice)
    }

    /// Largest record trailer any group needs.
    pub fn max_local_size(&self) -> u32 {
        self.locals
            .values()
            .map(|l| l.len() as u32 * LocalParameter::SIZE)
            .max()
            .unwrap_or(0)
    }
}

/// A created ray-tracing pipeline with its layout and group identifiers.
pub struct RtPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    identifiers: ShaderIdentifiers,
    max_recursion_depth: u32,
}

impl RtPipeline {
    /// Validate `arena` and create the pipeline it describes.
    ///
    /// # Safety
    /// `rt` must be live.
    pub unsafe fn new(rt: &RtDevice, arena: &SubobjectArena) -> Result<Self> {
        let resolved = arena.validate(rt.limits().max_ray_recursion_depth)?;
        let device = rt.device();

        let set_layout = resolved
            .global
            .bindings
            .iter()
            .fold(DescriptorSetLayoutBuilder::new(), |builder, b| {
                builder.binding(b.binding, b.ty, 1, b.stages)
            })
            .build(device)?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match device
            .create_pipeline_layout(&layout_info, None)
            .call("vkCreatePipelineLayout")
        {
            Ok(layout) => layout,
            Err(e) => {
                device.destroy_descriptor_set_layout(set_layout, None);
                return Err(e.into());
            }
        };

        let created = Self::create_pipeline(rt, &resolved, layout);
        let pipeline = match created {
            Ok(pipeline) => pipeline,
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
                return Err(e);
            }
        };

        let identifiers = match Self::fetch_identifiers(rt, &resolved, pipeline) {
            Ok(identifiers) => identifiers,
            Err(e) => {
                device.destroy_pipeline(pipeline, None);
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
                return Err(e);
            }
        };

        tracing::info!(
            groups = resolved.groups.len(),
            payload = resolved.max_payload_size,
            attributes = resolved.max_attribute_size,
            recursion = resolved.max_recursion_depth,
            "Ray-tracing pipeline created"
        );

        Ok(Self {
            pipeline,
            layout,
            set_layout,
            identifiers,
            max_recursion_depth: resolved.max_recursion_depth,
        })
    }

    unsafe fn create_pipeline(
        rt: &RtDevice,
        resolved: &ResolvedPipeline<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let device = rt.device();

        let mut modules = Vec::with_capacity(resolved.library.exports.len());
        for export in &resolved.library.exports {
            match create_shader_module(device, export.code, export.name) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        device.destroy_shader_module(module, None);
                    }
                    return Err(e.into());
                }
            }
        }

        let stages = resolved.stages(&modules);
        let groups = resolved.groups();
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(resolved.max_recursion_depth)
            .layout(layout);

        let created = rt.rt_loader().create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        );

        for module in modules {
            device.destroy_shader_module(module, None);
        }

        created
            .map_err(|e| RtError::Pipeline(format!("vkCreateRayTracingPipelinesKHR: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| RtError::Pipeline("no pipeline returned".to_string()))
    }

    unsafe fn fetch_identifiers(
        rt: &RtDevice,
        resolved: &ResolvedPipeline<'_>,
        pipeline: vk::Pipeline,
    ) -> Result<ShaderIdentifiers> {
        let handle_size = rt.limits().shader_group_handle_size;
        let group_count = resolved.groups.len() as u32;
        let data = rt
            .rt_loader()
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                (handle_size * group_count) as usize,
            )
            .call("vkGetRayTracingShaderGroupHandlesKHR")?;

        let mut identifiers = ShaderIdentifiers::new(handle_size);
        for (group, handle) in resolved
            .groups
            .iter()
            .zip(data.chunks_exact(handle_size as usize))
        {
            identifiers.insert(group.name, handle.to_vec(), group.local.clone());
        }
        Ok(identifiers)
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn identifiers(&self) -> &ShaderIdentifiers {
        &self.identifiers
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::exports::*;
    use super::*;

    const DEVICE_DEPTH_LIMIT: u32 = 31;

    fn test_library() -> ShaderLibrary {
        let export = |name, stage: ShaderStage| LibraryExport {
            name,
            stage,
            code: &[],
            traces: stage == ShaderStage::RayGen,
        };
        ShaderLibrary {
            exports: vec![
                export(RAY_GEN, ShaderStage::RayGen),
                export(MISS, ShaderStage::Miss),
                export(HIT, ShaderStage::ClosestHit),
            ],
            payload_size: MAX_PAYLOAD_SIZE,
            attribute_size: MAX_ATTRIBUTE_SIZE,
        }
    }

    /// Minimal valid arena; `extra` runs before the configs are pushed.
    fn minimal_arena(extra: impl FnOnce(&mut SubobjectArena)) -> SubobjectArena {
        let mut arena = SubobjectArena::with_capacity(16);
        arena.push(Subobject::Library(test_library())).unwrap();
        arena
            .push(Subobject::HitGroup(HitGroupDesc {
                name: TRI_HIT_GROUP,
                closest_hit: HIT,
            }))
            .unwrap();
        extra(&mut arena);
        arena
            .push(Subobject::ShaderConfig {
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_attribute_size: MAX_ATTRIBUTE_SIZE,
            })
            .unwrap();
        arena
            .push(Subobject::PipelineConfig {
                max_recursion_depth: 1,
            })
            .unwrap();
        arena
    }

    fn expect_error(arena: &SubobjectArena, needle: &str) {
        match arena.validate(DEVICE_DEPTH_LIMIT) {
            Err(RtError::Pipeline(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {msg}")
            }
            other => panic!("expected pipeline error containing {needle:?}, got {other:?}"),
        }
    }

    #[test]
    fn scene_arena_follows_the_fixed_order() {
        let arena = SubobjectArena::scene_default().unwrap();
        assert_eq!(arena.len(), SCENE_SUBOBJECT_COUNT);
        assert_eq!(arena.len(), arena.capacity());

        let kinds: Vec<&str> = arena.iter().map(|(_, s)| s.kind()).collect();
        assert_eq!(kinds[0], "library");
        assert_eq!(&kinds[1..4], &["hit group"; 3]);
        for pair in kinds[4..12].chunks(2) {
            assert_eq!(pair, ["local root signature", "export association"]);
        }
        assert_eq!(
            &kinds[12..],
            &[
                "shader config",
                "export association",
                "pipeline config",
                "global root signature"
            ]
        );
    }

    #[test]
    fn associations_resolve_inside_the_arena() {
        let arena = SubobjectArena::scene_default().unwrap();
        let range = arena.address_range();
        let mut seen = 0;
        for (_, subobject) in arena.iter() {
            if let Subobject::ExportAssociation { subobject, .. } = subobject {
                let target = arena.get(*subobject).expect("association target exists");
                assert!(range.contains(&(target as *const Subobject)));
                assert!(subobject.get() < arena.len());
                seen += 1;
            }
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn arena_never_reallocates() {
        let mut arena = SubobjectArena::with_capacity(3);
        arena.push(Subobject::Library(test_library())).unwrap();
        let base = arena.address_range().start;
        arena
            .push(Subobject::PipelineConfig {
                max_recursion_depth: 1,
            })
            .unwrap();
        arena
            .push(Subobject::ShaderConfig {
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_attribute_size: MAX_ATTRIBUTE_SIZE,
            })
            .unwrap();
        assert_eq!(arena.address_range().start, base);

        let overflow = arena.push(Subobject::PipelineConfig {
            max_recursion_depth: 1,
        });
        assert!(matches!(overflow, Err(RtError::Pipeline(_))));
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.address_range().start, base);
    }

    #[test]
    fn scene_groups_and_local_layouts() {
        let arena = SubobjectArena::scene_default().unwrap();
        let resolved = arena.validate(DEVICE_DEPTH_LIMIT).unwrap();

        let names: Vec<&str> = resolved.groups.iter().map(|g| g.name).collect();
        assert_eq!(
            names,
            vec![
                RAY_GEN,
                MISS,
                SHADOW_MISS,
                TRI_HIT_GROUP,
                PLANE_HIT_GROUP,
                SHADOW_HIT_GROUP
            ]
        );

        let local = |name: &str| {
            resolved
                .groups
                .iter()
                .find(|g| g.name == name)
                .map(|g| g.local.clone())
                .unwrap()
        };
        assert_eq!(local(RAY_GEN), vec![LocalParameter::DescriptorTable]);
        assert_eq!(local(TRI_HIT_GROUP), vec![LocalParameter::ConstantBuffer]);
        assert_eq!(local(PLANE_HIT_GROUP), vec![LocalParameter::DescriptorTable]);
        assert!(local(SHADOW_HIT_GROUP).is_empty());
        assert!(local(MISS).is_empty());

        assert_eq!(resolved.max_recursion_depth, MAX_RECURSION_DEPTH);
        assert_eq!(resolved.global.bindings.len(), 3);
        assert_eq!(
            resolved.groups[3].kind,
            GroupKind::TrianglesHit { closest_hit: 3 }
        );
    }

    #[test]
    fn minimal_arena_is_valid() {
        let arena = minimal_arena(|_| {});
        let resolved = arena.validate(DEVICE_DEPTH_LIMIT).unwrap();
        assert_eq!(resolved.groups.len(), 3);
        assert_eq!(resolved.global, GlobalRootSignature::default());
    }

    #[test]
    fn rejects_dangling_association() {
        let arena = minimal_arena(|arena| {
            arena
                .push(Subobject::ExportAssociation {
                    subobject: SubobjectIndex(99),
                    exports: vec![MISS],
                })
                .unwrap();
        });
        expect_error(&arena, "outside the arena");
    }

    #[test]
    fn rejects_association_to_a_hit_group() {
        let arena = minimal_arena(|arena| {
            arena
                .push(Subobject::ExportAssociation {
                    subobject: SubobjectIndex(1),
                    exports: vec![MISS],
                })
                .unwrap();
        });
        expect_error(&arena, "targets a hit group");
    }

    #[test]
    fn rejects_unknown_export_names() {
        let arena = minimal_arena(|arena| {
            arena
                .push_local_signature(LocalRootSignature::empty("typo"), vec!["Mis"])
                .unwrap();
        });
        expect_error(&arena, "unknown export Mis");
    }

    #[test]
    fn rejects_two_signatures_for_one_group() {
        let arena = minimal_arena(|arena| {
            arena
                .push_local_signature(
                    LocalRootSignature::new("a", vec![LocalParameter::ConstantBuffer]),
                    vec![HIT],
                )
                .unwrap();
            arena
                .push_local_signature(LocalRootSignature::empty("b"), vec![TRI_HIT_GROUP])
                .unwrap();
        });
        expect_error(&arena, "two local root signatures");
    }

    #[test]
    fn rejects_bad_hit_group_imports() {
        let mut arena = SubobjectArena::with_capacity(4);
        arena.push(Subobject::Library(test_library())).unwrap();
        arena
            .push(Subobject::HitGroup(HitGroupDesc {
                name: TRI_HIT_GROUP,
                closest_hit: MISS,
            }))
            .unwrap();
        arena
            .push(Subobject::ShaderConfig {
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_attribute_size: MAX_ATTRIBUTE_SIZE,
            })
            .unwrap();
        arena
            .push(Subobject::PipelineConfig {
                max_recursion_depth: 1,
            })
            .unwrap();
        expect_error(&arena, "Miss shader");
    }

    #[test]
    fn rejects_missing_or_out_of_range_configs() {
        let mut arena = SubobjectArena::with_capacity(2);
        arena.push(Subobject::Library(test_library())).unwrap();
        expect_error(&arena, "no shader config");

        let arena = minimal_arena(|_| {});
        assert!(arena.validate(0).is_err());

        let mut arena = SubobjectArena::with_capacity(4);
        arena.push(Subobject::Library(test_library())).unwrap();
        arena
            .push(Subobject::HitGroup(HitGroupDesc {
                name: TRI_HIT_GROUP,
                closest_hit: HIT,
            }))
            .unwrap();
        arena
            .push(Subobject::ShaderConfig {
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_attribute_size: 40,
            })
            .unwrap();
        arena
            .push(Subobject::PipelineConfig {
                max_recursion_depth: 1,
            })
            .unwrap();
        expect_error(&arena, "attribute size");
    }

    /// Minimal arena with its shader config replaced.
    fn arena_with_config(max_payload_size: u32, max_attribute_size: u32) -> SubobjectArena {
        let mut arena = minimal_arena(|_| {});
        for item in &mut arena.items {
            if let Subobject::ShaderConfig { .. } = item {
                *item = Subobject::ShaderConfig {
                    max_payload_size,
                    max_attribute_size,
                };
            }
        }
        arena
    }

    #[test]
    fn shader_config_must_match_the_library() {
        arena_with_config(MAX_PAYLOAD_SIZE, MAX_ATTRIBUTE_SIZE)
            .validate(DEVICE_DEPTH_LIMIT)
            .unwrap();
        expect_error(&arena_with_config(64, MAX_ATTRIBUTE_SIZE), "payload size 64");
        expect_error(&arena_with_config(4, MAX_ATTRIBUTE_SIZE), "payload size 4");
        expect_error(&arena_with_config(MAX_PAYLOAD_SIZE, 16), "attribute size 16");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let mut arena = minimal_arena(|_| {});
        for item in &mut arena.items {
            if let Subobject::Library(library) = item {
                library.payload_size = 0;
            }
            if let Subobject::ShaderConfig { max_payload_size, .. } = item {
                *max_payload_size = 0;
            }
        }
        expect_error(&arena, "non-zero");
    }

    #[test]
    fn tracing_hit_shaders_need_two_levels() {
        let scene = ShaderLibrary::scene();
        assert_eq!(scene.required_recursion_depth(), MAX_RECURSION_DEPTH);
        assert_eq!(test_library().required_recursion_depth(), 1);

        let mut arena = SubobjectArena::scene_default().unwrap();
        for item in &mut arena.items {
            if let Subobject::PipelineConfig { max_recursion_depth } = item {
                *max_recursion_depth = 1;
            }
        }
        expect_error(&arena, "recursion depth 1 outside 2..=");
    }

    #[test]
    fn identifiers_report_largest_trailer() {
        let mut ids = ShaderIdentifiers::new(32);
        ids.insert(MISS, vec![0; 32], vec![]);
        ids.insert(
            TRI_HIT_GROUP,
            vec![1; 32],
            vec![LocalParameter::ConstantBuffer],
        );
        assert_eq!(ids.max_local_size(), 8);
        assert_eq!(ids.handle(TRI_HIT_GROUP).map(<[u8]>::len), Some(32));
        assert!(ids.handle("nope").is_none());
    }
}

//! Hardware ray tracing for Prism.
//!
//! Builds the pieces a ray dispatch needs, in dependency order:
//!
//! - [`geometry`]: vertex and index buffers usable as build input
//! - [`acceleration`]: bottom-level structures over meshes, and a top-level
//!   structure updated in place every frame
//! - [`hit_groups`]: the hit-record layout shared by the TLAS and the shader table
//! - [`pipeline_state`]: the pipeline, described as an ordered sub-object arena
//! - [`sbt`]: the shader binding table
//!
//! Everything is recorded into caller-owned command buffers. Requires a
//! [`prism_gpu::GpuContext`] built with ray tracing enabled.

pub mod acceleration;
pub mod device;
pub mod error;
pub mod geometry;
pub mod hit_groups;
pub mod pipeline_state;
pub mod sbt;

pub use acceleration::{
    record_build_barrier, write_instances, AccelerationStructureBuffers, BottomLevelAs, BuildMode,
    BuildSizes, InstanceDescriptor, TlasInstance, TopLevelAs,
};
pub use device::RtDevice;
pub use error::{Result, RtError};
pub use geometry::{GeometryBuffer, MeshBuffers};
pub use hit_groups::{HitGroupLayout, HitSlot, RAY_TYPE_COUNT, RAY_TYPE_PRIMARY, RAY_TYPE_SHADOW};
pub use pipeline_state::{
    exports, LocalParameter, LocalRootSignature, RtPipeline, ShaderIdentifiers, Subobject,
    SubobjectArena, SubobjectIndex,
};
pub use sbt::{LocalArgument, ShaderRecord, ShaderTable, ShaderTableBuilder, ShaderTableLayout};

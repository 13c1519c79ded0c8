//! Vulkan abstraction layer for the Prism renderer.
//!
//! This crate provides:
//! - Vulkan instance and device management, with optional ray tracing
//! - GPU capability detection
//! - Memory allocation via gpu-allocator
//! - Command buffer management and timeline-semaphore frame pacing
//! - Swapchain handling

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{CommandPool, SemaphoreSubmit};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_acceleration_structure, write_dynamic_uniform_buffer, write_storage_image,
    write_uniform_buffer, DescriptorPool,
    DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result, VkResultExt};
pub use memory::{BufferKind, GpuAllocator, GpuBuffer, GpuImage, ScratchBuffer};
pub use pipeline::{create_shader_module, MeshPipeline, MeshPipelineDesc};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{create_semaphore, create_timeline_semaphore, FrameFence};

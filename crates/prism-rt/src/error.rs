//! Ray-tracing error types.

use prism_gpu::GpuError;
use thiserror::Error;

/// Errors from building acceleration structures, pipeline state and shader tables.
#[derive(Error, Debug)]
pub enum RtError {
    /// Underlying GPU call or allocation failed.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// The device was created without ray tracing.
    #[error("Hardware ray tracing is not enabled on this device")]
    Unsupported,

    /// Mesh data rejected before upload.
    #[error("Invalid geometry: {0}")]
    Geometry(#[from] prism_core::Error),

    /// Acceleration-structure build misuse.
    #[error("Acceleration structure: {0}")]
    Acceleration(String),

    /// Hit-group layout inconsistency.
    #[error("Hit-group layout: {0}")]
    Layout(String),

    /// Sub-object set failed validation or pipeline creation failed.
    #[error("Pipeline state: {0}")]
    Pipeline(String),

    /// Shader table could not be encoded.
    #[error("Shader table: {0}")]
    ShaderTable(String),
}

impl RtError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Gpu(e) if e.is_device_lost())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RtError>;

//! Render path errors.

use prism_gpu::GpuError;
use prism_rt::RtError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    RayTracing(#[from] RtError),

    /// A frame was recorded with a slot the path has no resources for.
    #[error("frame slot {slot} out of range ({count} slots)")]
    FrameSlot { slot: usize, count: usize },

    #[error("raster path needs per-frame object constants")]
    MissingObjectConstants,
}

impl RenderError {
    pub fn is_device_lost(&self) -> bool {
        match self {
            Self::Gpu(e) => e.is_device_lost(),
            Self::RayTracing(e) => e.is_device_lost(),
            Self::FrameSlot { .. } | Self::MissingObjectConstants => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

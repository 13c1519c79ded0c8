//! The active render path, chosen at start-up and swappable at runtime.

use ash::vk;
use prism_gpu::GpuContext;

use crate::error::Result;
use crate::frame::{FrameBindings, RecordContext};
use crate::raster::RasterPath;
use crate::ray_traced::RayTracedPath;
use crate::scene::Scene;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    Raster,
    RayTraced,
}

impl PathKind {
    pub fn toggled(self) -> Self {
        match self {
            Self::Raster => Self::RayTraced,
            Self::RayTraced => Self::Raster,
        }
    }

    /// Whether frame resources must carry per-object constants.
    pub fn uses_object_constants(self) -> bool {
        self == Self::Raster
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raster => f.write_str("raster"),
            Self::RayTraced => f.write_str("ray traced"),
        }
    }
}

pub enum RenderPath {
    Raster(RasterPath),
    RayTraced(RayTracedPath),
}

impl RenderPath {
    /// Initialize a path of `kind` for a target of `format` and `extent`.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn new(
        kind: PathKind,
        gpu: &GpuContext,
        format: vk::Format,
        extent: vk::Extent2D,
        frames: &[FrameBindings<'_>],
        scene: &Scene,
    ) -> Result<Self> {
        Ok(match kind {
            PathKind::Raster => Self::Raster(RasterPath::new(gpu, format, extent, frames)?),
            PathKind::RayTraced => {
                Self::RayTraced(RayTracedPath::new(gpu, extent, frames, scene)?)
            }
        })
    }

    pub fn kind(&self) -> PathKind {
        match self {
            Self::Raster(_) => PathKind::Raster,
            Self::RayTraced(_) => PathKind::RayTraced,
        }
    }

    /// # Safety
    /// See [`RasterPath::record`] and [`RayTracedPath::record`].
    pub unsafe fn record(&mut self, device: &ash::Device, ctx: &RecordContext<'_>) -> Result<()> {
        match self {
            Self::Raster(path) => path.record(device, ctx),
            Self::RayTraced(path) => path.record(device, ctx),
        }
    }

    /// # Safety
    /// No frame using the path may be in flight.
    pub unsafe fn resize(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> Result<()> {
        match self {
            Self::Raster(path) => path.resize(gpu, extent),
            Self::RayTraced(path) => path.resize(gpu, extent),
        }
    }

    /// # Safety
    /// No frame using the path may be in flight.
    pub unsafe fn destroy(self, gpu: &GpuContext) -> Result<()> {
        match self {
            Self::Raster(path) => path.destroy(gpu),
            Self::RayTraced(path) => path.destroy(gpu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_twice_returns_to_start() {
        for kind in [PathKind::Raster, PathKind::RayTraced] {
            assert_ne!(kind.toggled(), kind);
            assert_eq!(kind.toggled().toggled(), kind);
        }
    }

    #[test]
    fn only_raster_needs_object_constants() {
        assert!(PathKind::Raster.uses_object_constants());
        assert!(!PathKind::RayTraced.uses_object_constants());
    }
}

//! Rendering for Prism.
//!
//! This crate provides:
//! - Camera and per-frame pass constants
//! - The fixed scene and its hit-record layout
//! - A raster path and a hardware ray-traced path behind [`RenderPath`]

pub mod camera;
pub mod error;
pub mod frame;
pub mod path;
pub mod raster;
pub mod ray_traced;
pub mod scene;

pub use camera::{Camera, PassConstants};
pub use error::{RenderError, Result};
pub use frame::{FrameBindings, FrameTarget, RecordContext};
pub use path::{PathKind, RenderPath};
pub use raster::{ObjectConstants, RasterPath};
pub use ray_traced::RayTracedPath;
pub use scene::Scene;

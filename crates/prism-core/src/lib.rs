//! Core types and math for the Prism renderer.
//!
//! This crate provides the foundational types used throughout the renderer:
//! - Row-major instance transforms and alignment helpers
//! - The shared vertex layout and CPU mesh generators
//! - Common error types

pub mod error;
pub mod math;
pub mod mesh;

pub use error::{Error, Result};
pub use math::{align_up, Aabb, Transform3x4};
pub use mesh::{MeshData, RtVertex};

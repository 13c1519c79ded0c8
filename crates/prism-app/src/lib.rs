//! Application framework and frame orchestration for Prism.
//!
//! This crate handles the boilerplate around a render path:
//! - Window creation and management
//! - GPU context initialization, with ray tracing on request
//! - Swapchain creation and recreation
//! - Three round-robin frame resources paced by a timeline fence
//! - Switching between the raster and ray-traced paths
//! - A breadcrumb trail dumped when the device is lost
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{AppConfig, AppContext, FrameContext, RenderApp, run_app};
//!
//! struct MyApp {
//!     // Application state
//! }
//!
//! impl RenderApp for MyApp {
//!     type Options = ();
//!
//!     fn init(ctx: &mut AppContext, options: ()) -> anyhow::Result<Self> {
//!         Ok(MyApp {})
//!     }
//!
//!     fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default(), ())
//! }
//! ```

mod app;
mod breadcrumbs;
mod context;
mod frame;
mod frame_resource;
mod runner;

pub use app::RenderApp;
pub use breadcrumbs::{Breadcrumb, Breadcrumbs};
pub use context::AppContext;
pub use frame::FrameContext;
pub use frame_resource::{FrameResource, FrameResources, FrameSchedule, FRAME_RESOURCE_COUNT};
pub use runner::{run_app, AppConfig};

// Re-export commonly used types for convenience
pub use prism_gpu::{GpuContext, GpuContextBuilder};
pub use prism_render::{Camera, PathKind, RenderPath, Scene};
pub use winit::event::{DeviceEvent, DeviceId, ElementState, KeyEvent, WindowEvent};
pub use winit::keyboard::{KeyCode, PhysicalKey};

//! `RenderApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Prism applications.
///
/// The framework creates the window and GPU context, owns the frame
/// resources and drives the frame loop. The application owns its render
/// path and records into the command buffer it is handed each frame.
pub trait RenderApp: Sized {
    /// Application settings handed from [`run_app`](crate::run_app) to
    /// [`RenderApp::init`].
    type Options;

    /// Initialize the application.
    ///
    /// Called once after the GPU context and window have been created. No
    /// frame is in flight, so this is where the first render path is built.
    fn init(ctx: &mut AppContext, options: Self::Options) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before the frame resource is waited on. Switching
    /// render paths happens here, which is why the context is mutable.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()>;

    /// Record a frame.
    ///
    /// The command buffer is recording. The swapchain image arrives in an
    /// undefined layout and must be left in `frame.target.final_layout`.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// Called after the swapchain has been recreated with every frame
    /// retired.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle device events (raw input).
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Whether the application wants to exit.
    fn should_exit(&self) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}

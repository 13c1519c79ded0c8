//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use prism_gpu::command::{begin_command_buffer, end_command_buffer, submit_command_buffer};
use prism_gpu::{GpuContext, GpuContextBuilder, GpuError, SemaphoreSubmit};
use prism_render::RenderError;
use prism_rt::RtError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::RenderApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Require hardware ray tracing. Start-up fails on devices without it.
    pub ray_tracing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Prism".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            ray_tracing: true,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Require or skip hardware ray tracing.
    pub fn with_ray_tracing(mut self, ray_tracing: bool) -> Self {
        self.ray_tracing = ray_tracing;
        self
    }
}

/// Run a `RenderApp` with the given configuration.
///
/// This function initializes logging, creates the window and GPU context,
/// and runs the event loop until the application exits. `options` is passed
/// to [`RenderApp::init`].
///
/// Any initialization or per-frame error stops the loop and is returned.
pub fn run_app<A: RenderApp + 'static>(
    config: AppConfig,
    options: A::Options,
) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        options: Some(options),
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// What the loop does after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopStep {
    Redraw,
    Exit,
    DeviceLost,
    Fatal,
}

impl LoopStep {
    /// Errors are never retried: a failed frame ends the loop.
    fn after_frame(result: &anyhow::Result<()>, should_exit: bool) -> Self {
        match result {
            Ok(()) if should_exit => Self::Exit,
            Ok(()) => Self::Redraw,
            Err(e) if is_device_lost(e) => Self::DeviceLost,
            Err(_) => Self::Fatal,
        }
    }
}

/// Whether any error in the chain reports a lost device.
pub(crate) fn is_device_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<GpuError>()
            .is_some_and(GpuError::is_device_lost)
            || cause
                .downcast_ref::<RtError>()
                .is_some_and(RtError::is_device_lost)
            || cause
                .downcast_ref::<RenderError>()
                .is_some_and(RenderError::is_device_lost)
    })
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: RenderApp> {
    config: AppConfig,
    options: Option<A::Options>,
    state: Option<AppState<A>>,
    /// First fatal error; returned from `run_app`.
    failure: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: RenderApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: RenderApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        let Some(options) = self.options.take() else {
            return;
        };

        info!("Creating application state...");

        match self.create_state(event_loop, options) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                let result = state.render_frame();
                match LoopStep::after_frame(&result, state.app.should_exit()) {
                    LoopStep::Redraw => state.ctx.window.request_redraw(),
                    LoopStep::Exit => self.shutdown(event_loop),
                    LoopStep::DeviceLost => {
                        state.ctx.breadcrumbs.dump();
                        error!("GPU: {}", state.ctx.gpu.capabilities().summary());
                        if let Err(e) = result {
                            error!("Device lost: {e:#}");
                            self.fail(event_loop, e);
                        }
                    }
                    LoopStep::Fatal => {
                        if let Err(e) = result {
                            error!("Render error: {e:#}");
                            self.fail(event_loop, e);
                        }
                    }
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(size.width, size.height) {
                    error!("Resize error: {e:#}");
                    self.fail(event_loop, e);
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: RenderApp + 'static> AppRunner<A> {
    fn create_state(
        &self,
        event_loop: &ActiveEventLoop,
        options: A::Options,
    ) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = self.create_gpu()?;
        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: The window was just created and has valid handles
        let mut ctx = unsafe { AppContext::new(window, gpu, self.config.vsync)? };

        let app = match A::init(&mut ctx, options) {
            Ok(app) => app,
            Err(e) => {
                if let Err(idle) = ctx.gpu.wait_idle() {
                    error!("Failed to wait idle: {idle}");
                }
                // SAFETY: The device is idle
                unsafe { ctx.cleanup() };
                return Err(e);
            }
        };

        let target_frame_time = self
            .config
            .target_fps
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1))));

        Ok(AppState {
            ctx,
            app,
            target_frame_time,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    /// Create the GPU context. A device without ray tracing is an error when
    /// ray tracing is required.
    fn create_gpu(&self) -> anyhow::Result<GpuContext> {
        Ok(GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .ray_tracing(self.config.ray_tracing)
            .build()?)
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }

    /// Shut down and keep `e` for `run_app` to return.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        self.failure.get_or_insert(e);
        self.shutdown(event_loop);
    }
}

impl<A: RenderApp> AppState<A> {
    /// One pass of the frame loop: wait for the slot's fence value, acquire,
    /// record, submit, store the signalled value on the slot, present.
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;

        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.ctx.breadcrumb("update");
        self.app.update(&mut self.ctx, dt)?;

        self.ctx.breadcrumb("wait frame resource");
        // SAFETY: Device is valid
        let slot = unsafe { self.ctx.frames.begin(self.ctx.gpu.device())? };
        let image_available = self.ctx.frames.current().image_available;
        let cmd = self.ctx.frames.current().command_buffer;

        self.ctx.breadcrumb("acquire");
        // SAFETY: Swapchain and semaphore are valid; the slot's last use has retired
        let acquired = unsafe {
            self.ctx.swapchain.acquire_next_image(
                &self.ctx.surface.swapchain_loader,
                image_available,
                u64::MAX,
            )
        };
        let (image_index, acquire_suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(e) if e.vk_result() == Some(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                let size = self.ctx.window.inner_size();
                return self.handle_resize(size.width, size.height);
            }
            Err(e) => return Err(e.into()),
        };

        self.ctx.breadcrumb("record");
        // SAFETY: The slot's pool was reset by `begin`
        unsafe {
            begin_command_buffer(
                self.ctx.gpu.device(),
                cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }

        let mut frame_ctx = FrameContext::new(
            cmd,
            slot,
            image_index,
            self.ctx.target(image_index),
            dt,
            self.ctx.frame_count,
        );
        self.app.render(&self.ctx, &mut frame_ctx)?;

        // SAFETY: The command buffer is recording
        unsafe { end_command_buffer(self.ctx.gpu.device(), cmd)? };

        self.ctx.breadcrumb("submit");
        let fence_value = self.ctx.frames.next_fence_value();
        let render_finished = self.ctx.render_finished_semaphores[image_index as usize];
        let waits = [SemaphoreSubmit::binary(
            image_available,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        )];
        let signals = [
            SemaphoreSubmit::timeline(
                self.ctx.frames.fence().semaphore(),
                fence_value,
                vk::PipelineStageFlags2::ALL_COMMANDS,
            ),
            SemaphoreSubmit::binary(render_finished, vk::PipelineStageFlags2::ALL_COMMANDS),
        ];
        // SAFETY: All handles are valid and the command buffer has ended
        unsafe {
            submit_command_buffer(
                self.ctx.gpu.device(),
                self.ctx.gpu.graphics_queue(),
                cmd,
                &waits,
                &signals,
            )?;
        }

        self.ctx.breadcrumb("present");
        // Only a queued submission owns its fence value.
        self.ctx.frames.end(fence_value);
        // SAFETY: The image was acquired this frame and rendering signals `render_finished`
        let presented = unsafe {
            self.ctx.swapchain.present(
                &self.ctx.surface.swapchain_loader,
                self.ctx.gpu.graphics_queue(),
                image_index,
                &[render_finished],
            )
        };

        self.ctx.frame_count += 1;

        if presented? || acquire_suboptimal {
            let size = self.ctx.window.inner_size();
            self.handle_resize(size.width, size.height)?;
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.ctx.breadcrumb("resize");
        self.ctx.gpu.wait_idle()?;
        // SAFETY: The device is idle
        unsafe { self.ctx.recreate_swapchain(width, height)? };

        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);

        // SAFETY: The device is idle
        unsafe { self.ctx.cleanup() };

        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn device_loss_is_found_through_wrappers() {
        let lost = || GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST);

        assert!(is_device_lost(&anyhow::Error::from(lost())));
        assert!(is_device_lost(&anyhow::Error::from(RtError::Gpu(lost()))));
        assert!(is_device_lost(&anyhow::Error::from(RenderError::RayTracing(
            RtError::Gpu(lost())
        ))));

        let wrapped: anyhow::Result<()> = Err(lost()).context("recording frame");
        assert!(is_device_lost(&wrapped.unwrap_err()));
    }

    #[test]
    fn other_errors_are_not_device_loss() {
        let out_of_date = GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(!is_device_lost(&anyhow::Error::from(out_of_date)));
        assert!(!is_device_lost(&anyhow::Error::from(RtError::Unsupported)));
        assert!(!is_device_lost(&anyhow::anyhow!("device lost")));
    }

    #[test]
    fn failed_frames_end_the_loop() {
        let out_of_memory: anyhow::Result<()> =
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into());
        assert_eq!(LoopStep::after_frame(&out_of_memory, false), LoopStep::Fatal);

        let lost: anyhow::Result<()> =
            Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)).context("submitting frame");
        assert_eq!(LoopStep::after_frame(&lost, false), LoopStep::DeviceLost);

        let unsupported: anyhow::Result<()> =
            Err(GpuError::RayTracingUnsupported("test".to_string()).into());
        assert_eq!(LoopStep::after_frame(&unsupported, false), LoopStep::Fatal);
    }

    #[test]
    fn successful_frames_continue_until_exit() {
        assert_eq!(LoopStep::after_frame(&Ok(()), false), LoopStep::Redraw);
        assert_eq!(LoopStep::after_frame(&Ok(()), true), LoopStep::Exit);
    }

    #[test]
    fn config_builder_sets_fields() {
        let config = AppConfig::new("test")
            .with_size(640, 480)
            .with_vsync(true)
            .with_ray_tracing(false);
        assert_eq!(config.title, "test");
        assert_eq!((config.width, config.height), (640, 480));
        assert!(config.vsync);
        assert!(!config.ray_tracing);
        assert!(AppConfig::default().ray_tracing);
    }
}

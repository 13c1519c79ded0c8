//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use prism_gpu::{create_semaphore, GpuContext, GpuError, SurfaceContext, Swapchain};
use prism_render::{FrameTarget, ObjectConstants, PathKind, RenderPath, Scene};
use tracing::info;
use winit::window::Window;

use crate::breadcrumbs::Breadcrumbs;
use crate::frame_resource::{FrameResources, FRAME_RESOURCE_COUNT};

/// Application context shared across all app methods.
///
/// Provides access to the GPU context, window, swapchain and the frame
/// resources the render paths bind.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// Surface context for windowed rendering.
    pub surface: SurfaceContext,
    /// Current swapchain.
    pub swapchain: Swapchain,
    /// Round-robin frame resources and their fence.
    pub frames: FrameResources,
    /// Per-swapchain-image render finished semaphores.
    pub(crate) render_finished_semaphores: Vec<vk::Semaphore>,
    /// Trail of recent frame steps, dumped on device loss.
    pub breadcrumbs: Breadcrumbs,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
    /// Whether vsync is enabled.
    pub vsync: bool,
}

impl AppContext {
    /// Create a new application context.
    ///
    /// # Safety
    /// The window must have valid handles.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        vsync: bool,
    ) -> anyhow::Result<Self> {
        // SAFETY: Caller guarantees window has valid handles
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        // SAFETY: GPU context is valid
        let swapchain = unsafe { surface.create_swapchain(&gpu, width, height, vsync, None)? };

        info!(
            "Swapchain created: {}x{} ({} images)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len()
        );

        // Object constants are sized once a path is chosen.
        // SAFETY: GPU context is valid
        let frames = unsafe { FrameResources::new(&gpu, FRAME_RESOURCE_COUNT, None)? };
        // SAFETY: Device is valid
        let render_finished_semaphores =
            unsafe { create_render_finished(gpu.device(), swapchain.images.len())? };

        Ok(Self {
            window,
            gpu,
            surface,
            swapchain,
            frames,
            render_finished_semaphores,
            breadcrumbs: Breadcrumbs::new(),
            frame_count: 0,
            last_frame_time: Instant::now(),
            vsync,
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Get the swapchain width.
    pub fn width(&self) -> u32 {
        self.swapchain.extent.width
    }

    /// Get the swapchain height.
    pub fn height(&self) -> u32 {
        self.swapchain.extent.height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Whether the device was created with hardware ray tracing.
    pub fn ray_tracing_supported(&self) -> bool {
        self.gpu.ray_tracing().is_some()
    }

    /// The swapchain image at `image_index` as a render target.
    pub fn target(&self, image_index: u32) -> FrameTarget {
        let index = image_index as usize;
        FrameTarget {
            image: self.swapchain.images[index],
            view: self.swapchain.image_views[index],
            format: self.swapchain.format,
            extent: self.swapchain.extent,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Record a frame step against the current frame and slot.
    pub fn breadcrumb(&mut self, step: &'static str) {
        let slot = self.frames.current_slot();
        self.breadcrumbs.record(self.frame_count, slot, step);
    }

    /// Create a render path of `kind`, sizing the frame resources to match.
    /// Fails with [`GpuError::RayTracingUnsupported`] for a ray-traced path on
    /// a device created without ray tracing.
    ///
    /// # Safety
    /// No frame may be in flight.
    pub unsafe fn create_path(
        &mut self,
        kind: PathKind,
        scene: &Scene,
    ) -> anyhow::Result<RenderPath> {
        check_path_support(
            kind,
            self.ray_tracing_supported(),
            &self.gpu.capabilities().device_name,
        )?;

        let min_alignment = self.gpu.capabilities().min_uniform_buffer_offset_alignment;
        let object_constants = kind
            .uses_object_constants()
            .then(|| ObjectConstants::buffer_size(min_alignment));
        // SAFETY: Caller guarantees no frame is in flight
        unsafe { self.frames.set_object_constants(&self.gpu, object_constants)? };

        let bindings = self.frames.all_bindings();
        // SAFETY: GPU context is valid
        let path = unsafe {
            RenderPath::new(
                kind,
                &self.gpu,
                self.swapchain.format,
                self.swapchain.extent,
                &bindings,
                scene,
            )?
        };

        info!("Render path: {kind}");
        Ok(path)
    }

    /// Tear down `path` and create the other kind in its place.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn switch_path(
        &mut self,
        path: RenderPath,
        scene: &Scene,
    ) -> anyhow::Result<RenderPath> {
        let next = path.kind().toggled();
        self.breadcrumb("switch path");

        // SAFETY: Device is valid; waiting retires every frame using the path
        unsafe {
            self.frames.wait_idle(self.gpu.device())?;
            path.destroy(&self.gpu)?;
            self.create_path(next, scene)
        }
    }

    /// Recreate the swapchain (e.g., after resize).
    ///
    /// # Safety
    /// No frame may be in flight.
    pub(crate) unsafe fn recreate_swapchain(
        &mut self,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        // SAFETY: Caller guarantees the old swapchain is not in use
        self.swapchain = unsafe {
            self.surface
                .recreate_swapchain(&self.gpu, &mut self.swapchain, width, height, self.vsync)?
        };

        let image_count = self.swapchain.images.len();
        if image_count != self.render_finished_semaphores.len() {
            let device = self.gpu.device();
            // SAFETY: No submission waits on or signals these semaphores
            unsafe {
                for semaphore in self.render_finished_semaphores.drain(..) {
                    device.destroy_semaphore(semaphore, None);
                }
                self.render_finished_semaphores = create_render_finished(device, image_count)?;
            }
        }

        info!(
            "Swapchain recreated: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );

        Ok(())
    }

    /// Cleanup all resources.
    ///
    /// # Safety
    /// The GPU must be idle and all resources must not be in use.
    pub(crate) unsafe fn cleanup(&mut self) {
        // SAFETY: Caller guarantees GPU is idle and resources are not in use
        unsafe {
            if let Err(e) = self.frames.destroy(&self.gpu) {
                tracing::error!("Failed to free frame resources: {e}");
            }

            let device = self.gpu.device();
            for semaphore in self.render_finished_semaphores.drain(..) {
                device.destroy_semaphore(semaphore, None);
            }

            self.swapchain
                .destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}

/// A ray-traced path needs a device created with ray tracing.
fn check_path_support(
    kind: PathKind,
    ray_tracing: bool,
    device_name: &str,
) -> prism_gpu::Result<()> {
    if kind == PathKind::RayTraced && !ray_tracing {
        return Err(GpuError::RayTracingUnsupported(device_name.to_string()));
    }
    Ok(())
}

/// # Safety
/// The device must be valid.
unsafe fn create_render_finished(
    device: &ash::Device,
    count: usize,
) -> prism_gpu::Result<Vec<vk::Semaphore>> {
    (0..count).map(|_| create_semaphore(device)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_traced_path_requires_ray_tracing() {
        let err = check_path_support(PathKind::RayTraced, false, "Test GPU").unwrap_err();
        assert!(matches!(err, GpuError::RayTracingUnsupported(name) if name == "Test GPU"));

        check_path_support(PathKind::RayTraced, true, "Test GPU").unwrap();
    }

    #[test]
    fn raster_path_runs_anywhere() {
        check_path_support(PathKind::Raster, false, "Test GPU").unwrap();
        check_path_support(PathKind::Raster, true, "Test GPU").unwrap();
    }
}

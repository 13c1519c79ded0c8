//! Test harness for headless rendering and visual regression testing.
//!
//! [`HeadlessRenderer`] drives a render path into an offscreen image the way
//! the windowed runner drives it into a swapchain image, then copies the
//! result back to the host.

use std::path::Path;

use ash::vk;
use gpu_allocator::MemoryLocation;
use image::{ImageBuffer, Rgba, RgbaImage};

use prism_gpu::command::execute_single_time_commands;
use prism_gpu::{
    BufferKind, CommandPool, GpuBuffer, GpuContext, GpuContextBuilder, GpuImage, VkResultExt,
};
use prism_render::{
    Camera, FrameBindings, FrameTarget, ObjectConstants, PassConstants, PathKind, RecordContext,
    RenderPath, Scene,
};

use crate::{Result, TestError, VisualTestConfig};

/// Format of the offscreen target.
pub const TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Frame slots cycled through, as many as the windowed runner uses.
const FRAME_SLOTS: usize = 3;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

struct HeadlessFrame {
    pass_constants: GpuBuffer,
    object_constants: GpuBuffer,
}

impl HeadlessFrame {
    fn bindings(&self) -> FrameBindings<'_> {
        FrameBindings {
            pass_constants: &self.pass_constants,
            object_constants: Some(&self.object_constants),
        }
    }
}

/// Headless renderer for testing.
///
/// Owns a GPU context, one render path and an offscreen color target.
pub struct HeadlessRenderer {
    context: GpuContext,
    command_pool: CommandPool,
    target: GpuImage,
    target_view: vk::ImageView,
    readback: GpuBuffer,
    frames: Vec<HeadlessFrame>,
    path: Option<RenderPath>,
    next_slot: usize,
    width: u32,
    height: u32,
}

impl HeadlessRenderer {
    /// Create a headless renderer drawing through `kind`.
    ///
    /// A ray-traced renderer needs a device with hardware ray tracing.
    pub fn new(width: u32, height: u32, kind: PathKind) -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("prism-test")
            .validation(true)
            .ray_tracing(kind == PathKind::RayTraced)
            .build()?;

        let device = context.device();
        let extent = vk::Extent2D { width, height };

        // SAFETY: The device is valid
        let command_pool = unsafe {
            CommandPool::new(
                device,
                context.graphics_queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };

        let mut allocator = context.allocator().lock();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TARGET_FORMAT)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let target = allocator.create_image(&image_info, MemoryLocation::GpuOnly, "test_target")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(target.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(TARGET_FORMAT)
            .subresource_range(COLOR_RANGE);
        // SAFETY: The image is valid
        let target_view = unsafe {
            device
                .create_image_view(&view_info, None)
                .call("vkCreateImageView")?
        };

        let readback = allocator.create_buffer(
            u64::from(width) * u64::from(height) * 4,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "test_readback",
        )?;

        let object_size = ObjectConstants::buffer_size(
            context.capabilities().min_uniform_buffer_offset_alignment,
        );
        let mut frames = Vec::with_capacity(FRAME_SLOTS);
        for i in 0..FRAME_SLOTS {
            frames.push(HeadlessFrame {
                pass_constants: allocator.create_buffer_for(
                    BufferKind::Uniform,
                    PassConstants::SIZE,
                    &format!("test_pass_constants_{i}"),
                )?,
                object_constants: allocator.create_buffer_for(
                    BufferKind::Uniform,
                    object_size,
                    &format!("test_object_constants_{i}"),
                )?,
            });
        }
        drop(allocator);

        let mut renderer = Self {
            context,
            command_pool,
            target,
            target_view,
            readback,
            frames,
            path: None,
            next_slot: 0,
            width,
            height,
        };

        let bindings: Vec<_> = renderer.frames.iter().map(HeadlessFrame::bindings).collect();
        // SAFETY: The context is valid and nothing is in flight
        let path = unsafe {
            RenderPath::new(
                kind,
                &renderer.context,
                TARGET_FORMAT,
                extent,
                &bindings,
                &Scene::new(),
            )?
        };
        renderer.path = Some(path);

        Ok(renderer)
    }

    /// Render one frame of `scene` and return the resulting image.
    ///
    /// Frames cycle through the slots like the windowed runner, so repeated
    /// calls exercise the per-slot resources of the path.
    pub fn render(&mut self, scene: &Scene, camera: &Camera) -> Result<RgbaImage> {
        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.frames.len();

        let device = self.context.device();
        let target = FrameTarget {
            image: self.target.image,
            view: self.target_view,
            format: TARGET_FORMAT,
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        };
        let bindings = self.frames[slot].bindings();
        let path = self
            .path
            .as_mut()
            .ok_or_else(|| TestError::ImageComparison("renderer has no path".to_string()))?;
        let readback = self.readback.buffer;
        let (width, height) = (self.width, self.height);

        // SAFETY: Every handle is owned by this renderer and the queue is idle
        unsafe {
            execute_single_time_commands(
                device,
                &self.command_pool,
                self.context.graphics_queue(),
                |cmd| -> Result<()> {
                    let ctx = RecordContext {
                        cmd,
                        slot,
                        target,
                        bindings,
                        camera,
                        scene,
                    };
                    path.record(device, &ctx)?;
                    record_readback(device, cmd, target.image, readback, width, height);
                    Ok(())
                },
            )?;
        }

        let data = self
            .readback
            .mapped_slice()
            .ok_or_else(|| TestError::ImageComparison("readback buffer not mapped".to_string()))?
            .to_vec();

        ImageBuffer::from_raw(self.width, self.height, data)
            .ok_or_else(|| TestError::ImageComparison("readback size mismatch".to_string()))
    }

    /// The active render path.
    pub fn path(&self) -> Option<&RenderPath> {
        self.path.as_ref()
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Slot the most recent [`Self::render`] recorded into.
    pub fn last_slot(&self) -> usize {
        (self.next_slot + self.frames.len() - 1) % self.frames.len()
    }

    /// Get the output dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Copy the target into the readback buffer and make it visible to the host.
///
/// # Safety
/// The command buffer must be recording and the image must be in
/// `TRANSFER_SRC_OPTIMAL`.
unsafe fn record_readback(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    buffer: vk::Buffer,
    width: u32,
    height: u32,
) {
    let region = vk::BufferImageCopy::default()
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        });
    device.cmd_copy_image_to_buffer(
        cmd,
        image,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        buffer,
        &[region],
    );

    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
        .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::HOST)
        .dst_access_mask(vk::AccessFlags2::HOST_READ);
    let dependency_info =
        vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

impl Drop for HeadlessRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            tracing::warn!("Failed to wait idle: {e}");
        }

        if let Some(path) = self.path.take() {
            // SAFETY: The device is idle
            if let Err(e) = unsafe { path.destroy(&self.context) } {
                tracing::warn!("Failed to destroy render path: {e}");
            }
        }

        let device = self.context.device();
        // SAFETY: The device is idle
        unsafe {
            device.destroy_image_view(self.target_view, None);
            self.command_pool.destroy(device);
        }

        let mut allocator = self.context.allocator().lock();
        let mut freed = allocator.free_image(&mut self.target);
        freed = freed.and(allocator.free_buffer(&mut self.readback));
        for frame in &mut self.frames {
            freed = freed.and(allocator.free_buffer(&mut frame.pass_constants));
            freed = freed.and(allocator.free_buffer(&mut frame.object_constants));
        }
        if let Err(e) = freed {
            tracing::warn!("Failed to free test resources: {e}");
        }
    }
}

/// Visual regression test runner.
///
/// Compares rendered images against baseline images and reports differences.
pub struct VisualRegressionTest {
    config: VisualTestConfig,
    renderer: HeadlessRenderer,
}

impl VisualRegressionTest {
    /// Create a runner rendering 256x256 images through `kind`.
    pub fn new(config: VisualTestConfig, kind: PathKind) -> Result<Self> {
        Self::with_dimensions(config, 256, 256, kind)
    }

    /// Create with custom dimensions.
    pub fn with_dimensions(
        config: VisualTestConfig,
        width: u32,
        height: u32,
        kind: PathKind,
    ) -> Result<Self> {
        let renderer = HeadlessRenderer::new(width, height, kind)?;
        Ok(Self { config, renderer })
    }

    /// Render `scene` and compare it against the baseline called `name`.
    ///
    /// The first run saves the baseline.
    pub fn run_test(&mut self, name: &str, scene: &Scene, camera: &Camera) -> Result<()> {
        let image = self.renderer.render(scene, camera)?;
        compare_with_baseline(&self.config, name, &image)
    }

    pub fn renderer(&self) -> &HeadlessRenderer {
        &self.renderer
    }
}

/// Save `image` to the output directory and compare it against the baseline
/// called `name`, writing a diff image on failure. Saves the baseline when
/// there is none yet.
pub fn compare_with_baseline(
    config: &VisualTestConfig,
    name: &str,
    image: &RgbaImage,
) -> Result<()> {
    std::fs::create_dir_all(&config.baseline_dir)?;
    std::fs::create_dir_all(&config.output_dir)?;

    let baseline_path = format!("{}/{}.png", config.baseline_dir, name);
    let output_path = format!("{}/{}.png", config.output_dir, name);

    image.save(&output_path)?;

    if Path::new(&baseline_path).exists() {
        let baseline = image::open(&baseline_path)?.to_rgba8();

        let diff = image_difference(&baseline, image)?;
        if diff > config.threshold {
            let diff_path = format!("{}/{}_diff.png", config.output_dir, name);
            diff_image(&baseline, image).save(&diff_path)?;

            return Err(TestError::ImageComparison(format!(
                "Image difference {:.4} exceeds threshold {:.4} (see {})",
                diff, config.threshold, diff_path
            )));
        }
    } else {
        image.save(&baseline_path)?;
        tracing::info!("Created new baseline: {}", baseline_path);
    }

    Ok(())
}

/// Normalized RGB difference between two images (0.0-1.0).
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    if max_diff == 0 {
        return Ok(0.0);
    }
    Ok(total_diff as f64 / max_diff as f64)
}

/// Differences in red over a dimmed copy of `a`.
pub fn diff_image(a: &RgbaImage, b: &RgbaImage) -> RgbaImage {
    let (width, height) = a.dimensions();
    let mut diff = ImageBuffer::new(width, height);

    for (x, y, pixel) in diff.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);

        let max_diff = (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0);
        *pixel = if max_diff > 10 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([pa[0] / 2, pa[1] / 2, pa[2] / 2, 255])
        };
    }

    diff
}

/// Camera framing the scene with the aspect of a `width` x `height` target.
pub fn create_test_camera(width: u32, height: u32) -> Camera {
    let mut camera = Camera::default();
    camera.set_aspect(width as f32 / height.max(1) as f32);
    camera
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
        ImageBuffer::from_pixel(width, height, Rgba(color))
    }

    #[test]
    fn identical_images_do_not_differ() {
        let a = solid(8, 8, [10, 20, 30, 255]);
        assert_eq!(image_difference(&a, &a.clone()).unwrap(), 0.0);
    }

    #[test]
    fn black_and_white_differ_completely() {
        let black = solid(4, 4, [0, 0, 0, 255]);
        let white = solid(4, 4, [255, 255, 255, 255]);
        assert!((image_difference(&black, &white).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn alpha_is_ignored() {
        let opaque = solid(4, 4, [50, 50, 50, 255]);
        let clear = solid(4, 4, [50, 50, 50, 0]);
        assert_eq!(image_difference(&opaque, &clear).unwrap(), 0.0);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = solid(4, 4, [0; 4]);
        let b = solid(4, 5, [0; 4]);
        assert!(image_difference(&a, &b).is_err());
    }

    #[test]
    fn diff_marks_changed_pixels_red() {
        let a = solid(2, 1, [100, 100, 100, 255]);
        let mut b = a.clone();
        b.put_pixel(1, 0, Rgba([200, 100, 100, 255]));

        let diff = diff_image(&a, &b);
        assert_eq!(diff.get_pixel(0, 0), &Rgba([50, 50, 50, 255]));
        assert_eq!(diff.get_pixel(1, 0), &Rgba([255, 0, 0, 255]));
    }

    fn scratch_config(test: &str) -> VisualTestConfig {
        let root = std::env::temp_dir().join(format!("prism-{test}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        VisualTestConfig {
            threshold: 0.01,
            baseline_dir: root.join("baselines").display().to_string(),
            output_dir: root.join("output").display().to_string(),
        }
    }

    #[test]
    fn first_run_saves_the_baseline() {
        let config = scratch_config("first-run");
        let image = solid(4, 4, [10, 20, 30, 255]);

        compare_with_baseline(&config, "scene", &image).unwrap();
        assert!(Path::new(&format!("{}/scene.png", config.baseline_dir)).exists());
        assert!(Path::new(&format!("{}/scene.png", config.output_dir)).exists());

        // Matching the saved baseline passes.
        compare_with_baseline(&config, "scene", &image).unwrap();
    }

    #[test]
    fn changed_image_fails_and_writes_a_diff() {
        let config = scratch_config("changed");
        compare_with_baseline(&config, "scene", &solid(4, 4, [0, 0, 0, 255])).unwrap();

        let result = compare_with_baseline(&config, "scene", &solid(4, 4, [255, 255, 255, 255]));
        assert!(matches!(result, Err(TestError::ImageComparison(_))));
        assert!(Path::new(&format!("{}/scene_diff.png", config.output_dir)).exists());
    }

    #[test]
    fn test_camera_matches_target_aspect() {
        let camera = create_test_camera(320, 160);
        assert!((camera.aspect - 2.0).abs() < 1e-6);
    }

    // These tests require a GPU and will be skipped in CI without GPU support

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_raster_renderer_creation() {
        let renderer = HeadlessRenderer::new(64, 64, PathKind::Raster).unwrap();
        assert_eq!(renderer.dimensions(), (64, 64));
        assert_eq!(renderer.path().map(RenderPath::kind), Some(PathKind::Raster));
    }
}

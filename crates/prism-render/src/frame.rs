//! What a render path records into each frame.

use ash::vk;
use prism_gpu::GpuBuffer;

use crate::camera::Camera;
use crate::scene::Scene;

/// The image a frame ends up in: a swapchain back buffer, or an offscreen
/// image in tests.
#[derive(Clone, Copy, Debug)]
pub struct FrameTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Layout the image is left in, `PRESENT_SRC_KHR` for swapchain images.
    pub final_layout: vk::ImageLayout,
}

/// Per-frame buffers owned by a frame resource and bound by the paths.
#[derive(Clone, Copy)]
pub struct FrameBindings<'a> {
    pub pass_constants: &'a GpuBuffer,
    pub object_constants: Option<&'a GpuBuffer>,
}

/// Everything a path needs to record one frame.
pub struct RecordContext<'a> {
    pub cmd: vk::CommandBuffer,
    /// Frame-resource slot; selects descriptor sets and instance storage.
    pub slot: usize,
    pub target: FrameTarget,
    pub bindings: FrameBindings<'a>,
    pub camera: &'a Camera,
    pub scene: &'a Scene,
}

pub(crate) const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// One side of an image layout transition.
#[derive(Clone, Copy)]
pub(crate) struct ImageAccess {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl ImageAccess {
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };

    pub const fn new(
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        Self {
            layout,
            stage,
            access,
        }
    }

    /// The handoff to presentation or to a later copy out of the target.
    pub fn target_final(layout: vk::ImageLayout) -> Self {
        if layout == vk::ImageLayout::PRESENT_SRC_KHR {
            Self::new(
                layout,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            )
        } else {
            Self::new(
                layout,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            )
        }
    }
}

/// Record one image layout transition.
///
/// # Safety
/// The command buffer must be recording.
pub(crate) unsafe fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    from: ImageAccess,
    to: ImageAccess,
) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(from.stage)
        .src_access_mask(from.access)
        .dst_stage_mask(to.stage)
        .dst_access_mask(to.access)
        .old_layout(from.layout)
        .new_layout(to.layout)
        .image(image)
        .subresource_range(range);

    let dependency_info =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    device.cmd_pipeline_barrier2(cmd, &dependency_info);
}

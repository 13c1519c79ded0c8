//! Per-frame context for rendering.

use ash::vk;
use prism_render::FrameTarget;

/// Context for the current frame being rendered.
///
/// Provides access to the command buffer, the frame-resource slot and the
/// acquired swapchain image for this frame.
pub struct FrameContext {
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Frame-resource slot the frame records into.
    pub slot: usize,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image, left in `PRESENT_SRC_KHR` when recording ends.
    pub target: FrameTarget,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
}

impl FrameContext {
    pub(crate) fn new(
        command_buffer: vk::CommandBuffer,
        slot: usize,
        image_index: u32,
        target: FrameTarget,
        dt: f32,
        frame_number: u64,
    ) -> Self {
        Self {
            command_buffer,
            slot,
            image_index,
            target,
            dt,
            frame_number,
        }
    }
}

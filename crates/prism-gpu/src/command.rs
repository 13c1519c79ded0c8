//! Command buffer management.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device
            .create_command_pool(&create_info, None)
            .call("vkCreateCommandPool")?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffer(
        &self,
        device: &ash::Device,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        device
            .allocate_command_buffers(&alloc_info)
            .call("vkAllocateCommandBuffers")?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))
    }

    /// Reset the pool, returning every command buffer to the initial state.
    ///
    /// # Safety
    /// The device must be valid and all command buffers from this pool must not be in use.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device
            .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
            .call("vkResetCommandPool")
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device
        .begin_command_buffer(cmd, &begin_info)
        .call("vkBeginCommandBuffer")
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd).call("vkEndCommandBuffer")
}

/// A semaphore to wait on or signal in a submission.
///
/// `value` is ignored for binary semaphores.
#[derive(Clone, Copy, Debug)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreSubmit {
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            value: 0,
            stage,
        }
    }

    pub fn timeline(semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            value,
            stage,
        }
    }

    fn info(&self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .value(self.value)
            .stage_mask(self.stage)
    }
}

/// Submit one command buffer to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit_command_buffer(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    waits: &[SemaphoreSubmit],
    signals: &[SemaphoreSubmit],
) -> Result<()> {
    let wait_infos: Vec<_> = waits.iter().map(SemaphoreSubmit::info).collect();
    let signal_infos: Vec<_> = signals.iter().map(SemaphoreSubmit::info).collect();
    let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];

    let submit_info = vk::SubmitInfo2::default()
        .wait_semaphore_infos(&wait_infos)
        .command_buffer_infos(&cmd_infos)
        .signal_semaphore_infos(&signal_infos);

    device
        .queue_submit2(queue, &[submit_info], vk::Fence::null())
        .call("vkQueueSubmit2")
}

/// Record, submit and wait for a one-off command buffer.
///
/// Used for initialization work such as acceleration-structure builds and
/// image layout setup.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn execute_single_time_commands<F, R, E>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> std::result::Result<R, E>
where
    F: FnOnce(vk::CommandBuffer) -> std::result::Result<R, E>,
    E: From<GpuError>,
{
    let cmd = pool.allocate_command_buffer(device)?;

    let result = begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .map_err(E::from)
        .and_then(|()| f(cmd))
        .and_then(|value| {
            end_command_buffer(device, cmd)?;
            submit_command_buffer(device, queue, cmd, &[], &[])?;
            device.queue_wait_idle(queue).call("vkQueueWaitIdle")?;
            Ok(value)
        });

    device.free_command_buffers(pool.handle(), &[cmd]);

    result
}

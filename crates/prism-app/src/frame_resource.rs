//! Per-frame resources recycled round-robin behind a timeline fence.
//!
//! Each frame resource owns a command pool, the per-frame constant buffers
//! and the semaphore the swapchain signals on acquire. A slot is only reused
//! once the fence value its last submission signals has been reached.

use ash::vk;
use prism_gpu::{
    create_semaphore, BufferKind, CommandPool, FrameFence, GpuBuffer, GpuContext, Result,
};
use prism_render::{FrameBindings, PassConstants};
use tracing::debug;

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAME_RESOURCE_COUNT: usize = 3;

/// Slot rotation and the fence value each slot last signalled.
#[derive(Clone, Debug)]
pub struct FrameSchedule {
    fence_values: Vec<u64>,
    current: usize,
}

impl FrameSchedule {
    pub fn new(count: usize) -> Self {
        Self {
            fence_values: vec![0; count.max(1)],
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.fence_values.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Value the current slot's previous submission signals. Zero for a slot
    /// that has never been submitted.
    pub fn pending_value(&self) -> u64 {
        self.fence_values[self.current]
    }

    /// Whether recording into the current slot must wait for the GPU.
    pub fn must_wait(&self, completed: u64) -> bool {
        self.pending_value() > completed
    }

    /// Store the value the current slot's submission signals and move on.
    pub fn complete(&mut self, value: u64) {
        self.fence_values[self.current] = value;
        self.current = (self.current + 1) % self.fence_values.len();
    }
}

/// One slot of per-frame state.
pub struct FrameResource {
    pub command_pool: CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub pass_constants: GpuBuffer,
    /// Only present while the active path draws per-object constants.
    pub object_constants: Option<GpuBuffer>,
    /// Signalled by the swapchain when the acquired image is ready.
    pub image_available: vk::Semaphore,
}

impl FrameResource {
    unsafe fn new(gpu: &GpuContext, index: usize, object_constants: Option<u64>) -> Result<Self> {
        let device = gpu.device();
        let command_pool = CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let command_buffer = command_pool.allocate_command_buffer(device)?;
        let image_available = create_semaphore(device)?;

        let mut allocator = gpu.allocator().lock();
        let pass_constants = allocator.create_buffer_for(
            BufferKind::Uniform,
            PassConstants::SIZE,
            &format!("pass_constants_{index}"),
        )?;
        let object_constants = object_constants
            .map(|size| {
                allocator.create_buffer_for(
                    BufferKind::Uniform,
                    size,
                    &format!("object_constants_{index}"),
                )
            })
            .transpose()?;

        Ok(Self {
            command_pool,
            command_buffer,
            pass_constants,
            object_constants,
            image_available,
        })
    }

    pub fn bindings(&self) -> FrameBindings<'_> {
        FrameBindings {
            pass_constants: &self.pass_constants,
            object_constants: self.object_constants.as_ref(),
        }
    }

    unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        let device = gpu.device();
        device.destroy_semaphore(self.image_available, None);
        self.command_pool.destroy(device);

        let mut allocator = gpu.allocator().lock();
        allocator.free_buffer(&mut self.pass_constants)?;
        if let Some(mut buffer) = self.object_constants.take() {
            allocator.free_buffer(&mut buffer)?;
        }
        Ok(())
    }
}

/// The ring of frame resources and the fence that paces it.
pub struct FrameResources {
    frames: Vec<FrameResource>,
    schedule: FrameSchedule,
    fence: FrameFence,
}

impl FrameResources {
    /// Create `count` frame resources. `object_constants` is the size of the
    /// per-object buffer each slot carries, if any.
    ///
    /// # Safety
    /// The context must be valid.
    pub unsafe fn new(
        gpu: &GpuContext,
        count: usize,
        object_constants: Option<u64>,
    ) -> Result<Self> {
        let frames = (0..count)
            .map(|index| FrameResource::new(gpu, index, object_constants))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            frames,
            schedule: FrameSchedule::new(count),
            fence: FrameFence::new(gpu.device())?,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current_slot(&self) -> usize {
        self.schedule.current()
    }

    pub fn current(&self) -> &FrameResource {
        &self.frames[self.schedule.current()]
    }

    pub fn fence(&self) -> &FrameFence {
        &self.fence
    }

    /// Wait until the current slot's previous frame has retired, then reset
    /// its command pool. Returns the slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn begin(&mut self, device: &ash::Device) -> Result<usize> {
        let slot = self.schedule.current();
        let completed = self.fence.completed_value(device)?;
        if self.schedule.must_wait(completed) {
            debug!(
                slot,
                waiting_for = self.schedule.pending_value(),
                completed,
                "Frame resource still in flight"
            );
            self.fence.wait(device, self.schedule.pending_value())?;
        }
        self.frames[slot].command_pool.reset(device)?;
        Ok(slot)
    }

    /// The fence value the current slot's submission will signal.
    pub fn next_fence_value(&self) -> u64 {
        self.fence.next_value()
    }

    /// Commit the value a queued submission signals, store it on the current
    /// slot and advance to the next. Call only after the submit succeeded.
    pub fn end(&mut self, fence_value: u64) {
        self.fence.commit(fence_value);
        self.schedule.complete(fence_value);
    }

    /// Per-frame buffers of every slot, in slot order.
    pub fn all_bindings(&self) -> Vec<FrameBindings<'_>> {
        self.frames.iter().map(FrameResource::bindings).collect()
    }

    /// Add, resize or drop the per-object buffer of every slot.
    ///
    /// # Safety
    /// No frame may be in flight.
    pub unsafe fn set_object_constants(
        &mut self,
        gpu: &GpuContext,
        size: Option<u64>,
    ) -> Result<()> {
        let mut allocator = gpu.allocator().lock();
        for (index, frame) in self.frames.iter_mut().enumerate() {
            if frame.object_constants.as_ref().map(|b| b.size) == size {
                continue;
            }
            if let Some(mut buffer) = frame.object_constants.take() {
                allocator.free_buffer(&mut buffer)?;
            }
            frame.object_constants = size
                .map(|size| {
                    allocator.create_buffer_for(
                        BufferKind::Uniform,
                        size,
                        &format!("object_constants_{index}"),
                    )
                })
                .transpose()?;
        }
        Ok(())
    }

    /// Block until every submitted frame has finished.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_idle(&self, device: &ash::Device) -> Result<()> {
        self.fence.wait_all(device)
    }

    /// # Safety
    /// No frame may be in flight.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        for frame in &mut self.frames {
            frame.destroy(gpu)?;
        }
        self.frames.clear();
        self.fence.destroy(gpu.device());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_rotate_round_robin() {
        let mut schedule = FrameSchedule::new(FRAME_RESOURCE_COUNT);
        let visited: Vec<_> = (1..=7)
            .map(|value| {
                let slot = schedule.current();
                schedule.complete(value);
                slot
            })
            .collect();
        assert_eq!(visited, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn fresh_slots_never_wait() {
        let schedule = FrameSchedule::new(FRAME_RESOURCE_COUNT);
        assert_eq!(schedule.pending_value(), 0);
        assert!(!schedule.must_wait(0));
    }

    #[test]
    fn reused_slot_waits_for_its_own_value() {
        let mut schedule = FrameSchedule::new(FRAME_RESOURCE_COUNT);
        for value in 1..=3 {
            schedule.complete(value);
        }

        // Back at slot 0, which signalled 1.
        assert_eq!(schedule.current(), 0);
        assert_eq!(schedule.pending_value(), 1);
        assert!(schedule.must_wait(0));
        assert!(!schedule.must_wait(1));
        assert!(!schedule.must_wait(3));
    }

    #[test]
    fn cpu_runs_at_most_count_frames_ahead() {
        let mut schedule = FrameSchedule::new(FRAME_RESOURCE_COUNT);
        let mut completed = 0;
        for value in 1..=20u64 {
            if schedule.must_wait(completed) {
                completed = schedule.pending_value();
            }
            assert!(value - completed <= FRAME_RESOURCE_COUNT as u64);
            schedule.complete(value);
        }
    }

    #[test]
    fn zero_count_keeps_one_slot() {
        let schedule = FrameSchedule::new(0);
        assert_eq!(schedule.len(), 1);
    }
}

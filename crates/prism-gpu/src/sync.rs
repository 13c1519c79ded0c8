//! Synchronization primitives.
//!
//! CPU/GPU pacing runs on a single timeline semaphore ([`FrameFence`]);
//! binary semaphores are only used where the swapchain requires them.

use crate::error::{Result, VkResultExt};
use ash::vk;

/// Create a binary semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    device
        .create_semaphore(&create_info, None)
        .call("vkCreateSemaphore")
}

/// Create a timeline semaphore starting at `initial_value`.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_timeline_semaphore(
    device: &ash::Device,
    initial_value: u64,
) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    device
        .create_semaphore(&create_info, None)
        .call("vkCreateSemaphore")
}

/// Monotonically increasing fence backed by a timeline semaphore.
///
/// The CPU takes the next value from [`FrameFence::next_value`], submits work
/// that signals it, commits it with [`FrameFence::commit`] once the submission
/// is queued, and later blocks with [`FrameFence::wait`] until the GPU has
/// reached it. A value that was never committed is never waited for.
pub struct FrameFence {
    semaphore: vk::Semaphore,
    last_signaled: u64,
}

impl FrameFence {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            semaphore: create_timeline_semaphore(device, 0)?,
            last_signaled: 0,
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// The value the next submission will signal.
    pub fn next_value(&self) -> u64 {
        self.last_signaled + 1
    }

    /// Record that a queued submission signals `value`.
    pub fn commit(&mut self, value: u64) {
        debug_assert!(value > self.last_signaled, "fence values must increase");
        self.last_signaled = self.last_signaled.max(value);
    }

    /// The most recently committed value.
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// Value the GPU has reached.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn completed_value(&self, device: &ash::Device) -> Result<u64> {
        device
            .get_semaphore_counter_value(self.semaphore)
            .call("vkGetSemaphoreCounterValue")
    }

    /// Block until the GPU reaches `value`. Returns immediately for 0.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device, value: u64) -> Result<()> {
        if value == 0 || self.completed_value(device)? >= value {
            return Ok(());
        }
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        device
            .wait_semaphores(&wait_info, u64::MAX)
            .call("vkWaitSemaphores")
    }

    /// Block until every committed value has been reached.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all(&self, device: &ash::Device) -> Result<()> {
        self.wait(device, self.last_signaled)
    }

    /// # Safety
    /// The device must be valid and the semaphore must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.semaphore, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence() -> FrameFence {
        FrameFence {
            semaphore: vk::Semaphore::null(),
            last_signaled: 0,
        }
    }

    #[test]
    fn values_increase_monotonically() {
        let mut fence = fence();
        assert_eq!(fence.next_value(), 1);
        fence.commit(1);
        assert_eq!(fence.next_value(), 2);
        fence.commit(2);
        assert_eq!(fence.last_signaled(), 2);
    }

    #[test]
    fn uncommitted_value_is_not_waited_for() {
        let mut fence = fence();
        fence.commit(fence.next_value());

        // A submission that failed never commits its value.
        let reserved = fence.next_value();
        assert_eq!(reserved, 2);
        assert_eq!(fence.last_signaled(), 1);

        // The retry signals the same value.
        assert_eq!(fence.next_value(), reserved);
        fence.commit(reserved);
        assert_eq!(fence.last_signaled(), 2);
    }
}

// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct and efficient multi-frame rendering

use ash::vk;
use anyhow::Result;
use super::deletion_queue::unwind_on_error;
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unwind_on_error(device, |created| unsafe {
            let image_available = device.device.create_semaphore(&semaphore_info, None)?;
            created.push(move |device: &VulkanDevice| device.device.destroy_semaphore(image_available, None));

            let render_finished = device.device.create_semaphore(&semaphore_info, None)?;
            created.push(move |device: &VulkanDevice| device.device.destroy_semaphore(render_finished, None));

            let in_flight_fence = device.device.create_fence(&fence_info, None)?;

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Tracks which frame's fence is still using each swapchain image.
///
/// The swapchain may hand back an image whose previous frame is still in
/// flight under a different frame slot; that fence must be waited on first.
#[derive(Debug, Default)]
pub struct ImagesInFlight {
    fences: Vec<vk::Fence>,
}

impl ImagesInFlight {
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![vk::Fence::null(); image_count],
        }
    }

    /// Forget all owners, e.g. after swapchain recreation
    pub fn reset(&mut self, image_count: usize) {
        self.fences.clear();
        self.fences.resize(image_count, vk::Fence::null());
    }

    /// Mark `image_index` as used by `fence`.
    /// Returns the fence of the previous user, if any, which must be waited on.
    pub fn claim(&mut self, image_index: usize, fence: vk::Fence) -> Option<vk::Fence> {
        let previous = std::mem::replace(&mut self.fences[image_index], fence);
        (previous != vk::Fence::null() && previous != fence).then_some(previous)
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn first_claim_has_nothing_to_wait_for() {
        let mut images = ImagesInFlight::new(3);
        assert_eq!(images.claim(0, vk::Fence::from_raw(1)), None);
        assert_eq!(images.claim(1, vk::Fence::from_raw(2)), None);
    }

    #[test]
    fn reclaim_by_another_frame_waits_on_previous() {
        let (frame_a, frame_b) = (vk::Fence::from_raw(1), vk::Fence::from_raw(2));
        let mut images = ImagesInFlight::new(2);

        images.claim(1, frame_a);
        assert_eq!(images.claim(1, frame_b), Some(frame_a));
        // Same frame slot already waited on its own fence
        assert_eq!(images.claim(1, frame_b), None);
    }

    #[test]
    fn reset_forgets_owners() {
        let mut images = ImagesInFlight::new(2);
        images.claim(0, vk::Fence::from_raw(7));

        images.reset(4);
        assert_eq!(images.len(), 4);
        assert_eq!(images.claim(0, vk::Fence::from_raw(8)), None);
    }
}

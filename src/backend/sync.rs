// Synchronization primitives and the per-frame protocol
//
// Each frame slot owns an image-available semaphore and an in-flight fence.
// Render-finished semaphores belong to swapchain images (see swapchain.rs).
// FrameScheduler drives one frame at a time against a FrameTarget:
//
//   wait slot fence -> acquire -> image hazard wait -> record -> submit -> present
//
// and rebuilds the swapchain when it goes stale or the window is resized.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create image-available semaphore")?,
                in_flight_fence: device
                    .device
                    .create_fence(&fence_info, None)
                    .context("Failed to create in-flight fence")?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Ready { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be rebuilt
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Done,
    /// Suboptimal or out of date: presented (or dropped), rebuild before the next frame
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    Skipped,
}

/// Which frame slot last submitted work touching each swapchain image.
///
/// Replaced wholesale on every swapchain rebuild; `generation` counts rebuilds.
#[derive(Debug, Clone)]
pub struct ImageFences {
    owners: Vec<Option<usize>>,
    generation: u64,
}

impl ImageFences {
    pub fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
            generation: 0,
        }
    }

    /// Forget every owner and size the map for a new swapchain
    pub fn reset(&mut self, image_count: usize) {
        self.owners = vec![None; image_count];
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[cfg(test)]
    pub fn owner(&self, image_index: u32) -> Option<usize> {
        self.owners.get(image_index as usize).copied().flatten()
    }

    pub fn all_free(&self) -> bool {
        self.owners.iter().all(Option::is_none)
    }

    /// Mark `image_index` as used by `slot`.
    ///
    /// Returns the previous owner when it was a different slot; the caller must
    /// wait on that slot's fence before touching the image again.
    pub fn claim(&mut self, image_index: u32, slot: usize) -> Result<Option<usize>> {
        let count = self.owners.len();
        let owner = self.owners.get_mut(image_index as usize).with_context(|| {
            format!("Swapchain returned image {} but only {} exist", image_index, count)
        })?;

        let previous = owner.replace(slot);
        Ok(previous.filter(|&prev| prev != slot))
    }
}

/// The GPU-facing half of a frame. `Renderer` implements this with Vulkan.
pub trait FrameTarget {
    /// Current drawable size of the window, zero while minimized
    fn drawable_extent(&self) -> vk::Extent2D;

    /// Block until the slot's last submission has completed
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    fn acquire_image(&mut self, slot: usize) -> Result<Acquire>;

    /// Unsignal the slot's fence ahead of a submission
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn present(&mut self, image_index: u32) -> Result<PresentStatus>;

    /// Drain the device and replace the swapchain. Returns the new image count.
    fn recreate_swapchain(&mut self) -> Result<usize>;
}

/// Per-frame state machine over N frame slots
pub struct FrameScheduler {
    frames_in_flight: usize,
    current_slot: usize,
    images: ImageFences,
    /// Set by the window event handler, consumed after present
    resized: bool,
    /// A rebuild was requested while the drawable size was zero
    rebuild_pending: bool,
    frames_presented: u64,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_slot: 0,
            images: ImageFences::new(image_count),
            resized: false,
            rebuild_pending: false,
            frames_presented: 0,
        }
    }

    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    #[cfg(test)]
    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Run one frame transition.
    pub fn draw_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<FrameOutcome> {
        if self.rebuild_pending && !self.rebuild(target)? {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.current_slot;

        target.wait_for_slot(slot)?;

        let (image_index, suboptimal) = match target.acquire_image(slot)? {
            Acquire::Ready { image_index, suboptimal } => (image_index, suboptimal),
            Acquire::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                // The slot fence is still signaled, so this slot is reusable as is
                self.rebuild(target)?;
                return Ok(FrameOutcome::Skipped);
            }
        };

        if let Some(previous) = self.images.claim(image_index, slot)? {
            log::trace!("Image {} still owned by slot {}, waiting", image_index, previous);
            target.wait_for_slot(previous)?;
        }

        target.reset_slot(slot)?;
        target.record(slot, image_index)?;
        target.submit(slot, image_index)?;

        let status = target.present(image_index)?;
        if status == PresentStatus::Stale || suboptimal || self.resized {
            self.rebuild(target)?;
        }

        self.current_slot = (slot + 1) % self.frames_in_flight;
        self.frames_presented += 1;

        Ok(FrameOutcome::Presented)
    }

    /// Rebuild now, or defer until the window has a drawable area.
    ///
    /// Returns whether the swapchain was actually rebuilt.
    fn rebuild<T: FrameTarget>(&mut self, target: &mut T) -> Result<bool> {
        let extent = target.drawable_extent();
        if extent.width == 0 || extent.height == 0 {
            if !self.rebuild_pending {
                log::debug!("Drawable size is zero, deferring swapchain rebuild");
            }
            self.rebuild_pending = true;
            return Ok(false);
        }

        let image_count = target.recreate_swapchain()?;
        self.images.reset(image_count);
        self.rebuild_pending = false;
        self.resized = false;
        debug_assert!(self.images.all_free());

        log::debug!(
            "Swapchain generation {} ({} images)",
            self.images.generation(),
            self.images.len()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap, VecDeque};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize, u32),
        Present(u32),
        Recreate,
    }

    /// GPU stand-in: work submitted on a slot completes when that slot is waited on.
    struct MockTarget {
        calls: Vec<Call>,
        extent: vk::Extent2D,
        image_count: usize,
        next_image: u32,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<PresentStatus>,
        recreated_image_count: usize,
        fail_submit: bool,

        outstanding: BTreeSet<usize>,
        max_outstanding: usize,
        image_last_slot: HashMap<u32, usize>,
    }

    impl MockTarget {
        fn new(image_count: usize) -> Self {
            Self {
                calls: Vec::new(),
                extent: vk::Extent2D { width: 800, height: 600 },
                image_count,
                next_image: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                recreated_image_count: image_count,
                fail_submit: false,
                outstanding: BTreeSet::new(),
                max_outstanding: 0,
                image_last_slot: HashMap::new(),
            }
        }

        fn with_images(mut self, indices: &[u32]) -> Self {
            self.acquires = indices
                .iter()
                .map(|&image_index| Acquire::Ready { image_index, suboptimal: false })
                .collect();
            self
        }

        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }

        fn count_recreates(&self) -> usize {
            self.count(&Call::Recreate)
        }

        fn take_calls(&mut self) -> Vec<Call> {
            std::mem::take(&mut self.calls)
        }
    }

    impl FrameTarget for MockTarget {
        fn drawable_extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.outstanding.remove(&slot);
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<Acquire> {
            self.calls.push(Call::Acquire(slot));
            if let Some(scripted) = self.acquires.pop_front() {
                return Ok(scripted);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(Acquire::Ready { image_index, suboptimal: false })
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            assert!(
                !self.outstanding.contains(&slot),
                "fence of slot {} reset while its work is in flight",
                slot
            );
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            if let Some(&other) = self.image_last_slot.get(&image_index) {
                assert!(
                    other == slot || !self.outstanding.contains(&other),
                    "image {} recorded on slot {} while slot {} still uses it",
                    image_index,
                    slot,
                    other
                );
            }
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
            if self.fail_submit {
                anyhow::bail!("device lost");
            }
            self.calls.push(Call::Submit(slot, image_index));
            self.outstanding.insert(slot);
            self.max_outstanding = self.max_outstanding.max(self.outstanding.len());
            self.image_last_slot.insert(image_index, slot);
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<PresentStatus> {
            self.calls.push(Call::Present(image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentStatus::Done))
        }

        fn recreate_swapchain(&mut self) -> Result<usize> {
            self.calls.push(Call::Recreate);
            // Device idle: everything retires
            self.outstanding.clear();
            self.image_last_slot.clear();
            self.image_count = self.recreated_image_count;
            self.next_image = 0;
            Ok(self.image_count)
        }
    }

    // ── image fence map ───────────────────────────────────────────────────

    #[test]
    fn claim_reports_previous_owner_from_other_slot() {
        let mut images = ImageFences::new(3);
        assert_eq!(images.claim(1, 0).unwrap(), None);
        assert_eq!(images.claim(1, 0).unwrap(), None);
        assert_eq!(images.claim(1, 1).unwrap(), Some(0));
        assert_eq!(images.owner(1), Some(1));
        assert_eq!(images.owner(0), None);
    }

    #[test]
    fn claim_out_of_range_is_an_error() {
        let mut images = ImageFences::new(2);
        assert!(images.claim(2, 0).is_err());
        assert_eq!(images.owner(7), None);
    }

    #[test]
    fn reset_frees_every_image_and_bumps_generation() {
        let mut images = ImageFences::new(2);
        images.claim(0, 0).unwrap();
        images.claim(1, 1).unwrap();
        assert!(!images.all_free());

        images.reset(4);
        assert!(images.all_free());
        assert_eq!(images.len(), 4);
        assert_eq!(images.generation(), 1);
    }

    // ── frame protocol ────────────────────────────────────────────────────

    #[test]
    fn frame_runs_steps_in_order() {
        let mut target = MockTarget::new(3);
        let mut scheduler = FrameScheduler::new(2, 3);

        let outcome = scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(
            target.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Submit(0, 0),
                Call::Present(0),
            ]
        );
    }

    #[test]
    fn slots_advance_round_robin() {
        let mut target = MockTarget::new(3);
        let mut scheduler = FrameScheduler::new(2, 3);

        let mut slots = Vec::new();
        for _ in 0..5 {
            slots.push(scheduler.current_slot());
            scheduler.draw_frame(&mut target).unwrap();
        }

        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(scheduler.current_slot(), 1);
        assert_eq!(scheduler.frames_presented(), 5);
    }

    #[test]
    fn outstanding_submissions_never_exceed_frames_in_flight() {
        for frames_in_flight in 1..=3 {
            let mut target = MockTarget::new(4);
            let mut scheduler = FrameScheduler::new(frames_in_flight, 4);

            for _ in 0..40 {
                scheduler.draw_frame(&mut target).unwrap();
                assert!(target.outstanding.len() <= frames_in_flight);
            }
            assert_eq!(target.max_outstanding, frames_in_flight);
        }
    }

    #[test]
    fn busy_image_waits_for_owning_slot_before_record() {
        // slot 0 -> image 0, slot 1 -> image 1, slot 0 -> image 1 (owned by slot 1)
        let mut target = MockTarget::new(3).with_images(&[0, 1, 1]);
        let mut scheduler = FrameScheduler::new(2, 3);

        scheduler.draw_frame(&mut target).unwrap();
        scheduler.draw_frame(&mut target).unwrap();
        target.take_calls();

        scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(
            target.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Wait(1),
                Call::Reset(0),
                Call::Record(0, 1),
                Call::Submit(0, 1),
                Call::Present(1),
            ]
        );
        assert_eq!(scheduler.images.owner(1), Some(0));
    }

    #[test]
    fn reacquiring_own_image_needs_no_extra_wait() {
        let mut target = MockTarget::new(3).with_images(&[0, 1, 0]);
        let mut scheduler = FrameScheduler::new(2, 3);

        scheduler.draw_frame(&mut target).unwrap();
        scheduler.draw_frame(&mut target).unwrap();
        target.take_calls();
        scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(target.count(&Call::Wait(0)), 1);
        assert_eq!(target.count(&Call::Wait(1)), 0);
    }

    #[test]
    fn out_of_date_acquire_skips_frame_and_rebuilds() {
        let mut target = MockTarget::new(3);
        target.acquires.push_back(Acquire::OutOfDate);
        let mut scheduler = FrameScheduler::new(2, 3);

        let outcome = scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(
            target.take_calls(),
            vec![Call::Wait(0), Call::Acquire(0), Call::Recreate]
        );
        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(scheduler.frames_presented(), 0);
        assert_eq!(scheduler.images.generation(), 1);

        // Next frame reuses slot 0, then advances as usual
        let outcome = scheduler.draw_frame(&mut target).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(target.calls[0], Call::Wait(0));
        assert_eq!(target.calls.last(), Some(&Call::Present(0)));
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn rebuild_frees_every_image_marker() {
        let mut target = MockTarget::new(3);
        target.recreated_image_count = 4;
        let mut scheduler = FrameScheduler::new(2, 3);

        scheduler.draw_frame(&mut target).unwrap();
        scheduler.draw_frame(&mut target).unwrap();
        assert!(!scheduler.images.all_free());

        scheduler.notify_resized();
        scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(target.count_recreates(), 1);
        assert!(scheduler.images.all_free());
        assert_eq!(scheduler.images.len(), 4);
        assert_eq!(scheduler.images.generation(), 1);
    }

    #[test]
    fn stale_present_triggers_rebuild() {
        let mut target = MockTarget::new(3);
        target.presents.push_back(PresentStatus::Stale);
        let mut scheduler = FrameScheduler::new(2, 3);

        let outcome = scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(target.calls.last(), Some(&Call::Recreate));
        assert_eq!(scheduler.current_slot(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_draws_then_rebuilds() {
        let mut target = MockTarget::new(3);
        target.acquires.push_back(Acquire::Ready { image_index: 2, suboptimal: true });
        let mut scheduler = FrameScheduler::new(2, 3);

        scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(target.count(&Call::Submit(0, 2)), 1);
        assert_eq!(target.count(&Call::Present(2)), 1);
        assert_eq!(target.calls.last(), Some(&Call::Recreate));
    }

    #[test]
    fn resize_flag_is_consumed_by_one_rebuild() {
        let mut target = MockTarget::new(3);
        let mut scheduler = FrameScheduler::new(2, 3);

        scheduler.notify_resized();
        scheduler.notify_resized();
        scheduler.draw_frame(&mut target).unwrap();
        scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(target.count_recreates(), 1);
    }

    #[test]
    fn minimized_window_defers_rebuild_until_drawable() {
        let mut target = MockTarget::new(3);
        target.extent = vk::Extent2D { width: 0, height: 0 };
        let mut scheduler = FrameScheduler::new(2, 3);

        scheduler.notify_resized();
        scheduler.draw_frame(&mut target).unwrap();
        assert!(scheduler.rebuild_pending());
        target.take_calls();

        for _ in 0..5 {
            scheduler.notify_resized();
            let outcome = scheduler.draw_frame(&mut target).unwrap();
            assert_eq!(outcome, FrameOutcome::Skipped);
        }
        assert!(target.calls.is_empty());

        target.extent = vk::Extent2D { width: 640, height: 480 };
        let outcome = scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(target.count_recreates(), 1);
        assert_eq!(target.calls[0], Call::Recreate);
        assert!(!scheduler.rebuild_pending());
    }

    #[test]
    fn out_of_date_while_minimized_waits_for_size() {
        let mut target = MockTarget::new(3);
        target.extent = vk::Extent2D { width: 0, height: 0 };
        target.acquires.push_back(Acquire::OutOfDate);
        let mut scheduler = FrameScheduler::new(2, 3);

        assert_eq!(scheduler.draw_frame(&mut target).unwrap(), FrameOutcome::Skipped);
        assert_eq!(target.count_recreates(), 0);
        assert!(scheduler.rebuild_pending());

        target.extent = vk::Extent2D { width: 1, height: 1 };
        assert_eq!(scheduler.draw_frame(&mut target).unwrap(), FrameOutcome::Presented);
        assert_eq!(target.count_recreates(), 1);
    }

    #[test]
    fn submit_failure_is_fatal() {
        let mut target = MockTarget::new(3);
        target.fail_submit = true;
        let mut scheduler = FrameScheduler::new(2, 3);

        let err = scheduler.draw_frame(&mut target).unwrap_err();

        assert!(err.to_string().contains("device lost"));
        assert_eq!(target.count(&Call::Present(0)), 0);
        assert_eq!(scheduler.frames_presented(), 0);
    }

    #[test]
    fn zero_frames_in_flight_behaves_as_one() {
        let mut target = MockTarget::new(2);
        let mut scheduler = FrameScheduler::new(0, 2);

        scheduler.draw_frame(&mut target).unwrap();
        scheduler.draw_frame(&mut target).unwrap();

        assert_eq!(scheduler.current_slot(), 0);
        assert_eq!(target.max_outstanding, 1);
    }
}

use super::{RenderContext, RenderResult, MAX_FRAMES_IN_FLIGHT};
use crate::{
    gc::{CleanupId, CleanupTask},
    gpu::{Fence, Semaphore},
};
use log::*;

/// Per-frame synchronization primitives.
///
/// For every frame slot there's:
///  * an `image_ready` semaphore, signalled by the acquire and waited on by the graphics submit,
///  * a `render_finished` semaphore, signalled by the graphics submit and waited on by the present,
///  * an `in_flight` fence, signalled by the graphics submit and waited on before the slot is
///    reused. It's created signalled, so the very first wait returns immediately.
#[derive(Debug)]
pub struct SyncManager {
    context: RenderContext,
    image_ready: Vec<Semaphore>,
    render_finished: Vec<Semaphore>,
    in_flight: Vec<Fence>,
}

impl SyncManager {
    pub fn new(context: RenderContext) -> RenderResult<Self> {
        let device = &context.device;
        let mut image_ready = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut render_finished = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut in_flight = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let ready = device.create_semaphore()?;
            let finished = device.create_semaphore()?;
            let fence = device.create_fence(true)?;

            let cleanup_device = device.clone();
            context.gc.create_cleanup_task(
                CleanupTask::new("SyncManager::new", move || {
                    cleanup_device.destroy_semaphore(ready);
                    cleanup_device.destroy_semaphore(finished);
                    cleanup_device.destroy_fence(fence);
                })
                .with_object("image ready semaphore", ready)
                .with_object("render finished semaphore", finished)
                .with_object("in flight fence", fence),
            );

            image_ready.push(ready);
            render_finished.push(finished);
            in_flight.push(fence);
        }

        debug!("Created synchronization primitives for {MAX_FRAMES_IN_FLIGHT} frames in flight");
        Ok(Self {
            context,
            image_ready,
            render_finished,
            in_flight,
        })
    }

    pub fn image_ready(&self, slot: usize) -> Semaphore {
        self.image_ready[slot]
    }

    pub fn render_finished(&self, slot: usize) -> Semaphore {
        self.render_finished[slot]
    }

    pub fn in_flight(&self, slot: usize) -> Fence {
        self.in_flight[slot]
    }

    /// Blocks until the GPU is done with the previous use of `slot`.
    pub fn wait_for_frame(&self, slot: usize) -> RenderResult {
        self.context
            .device
            .wait_for_fences(&[self.in_flight[slot]], None)?;
        Ok(())
    }

    pub fn reset_frame(&self, slot: usize) -> RenderResult {
        self.context.device.reset_fences(&[self.in_flight[slot]])?;
        Ok(())
    }

    /// Creates an unsignalled fence for a one-off submission. The fence is released by
    /// [`Self::wait_single_use_fence`], or by the cleanup stack if nobody waits for it.
    pub fn create_single_use_fence(&self) -> RenderResult<(Fence, CleanupId)> {
        create_single_use_fence(&self.context)
    }

    pub fn wait_single_use_fence(&self, fence: Fence, cleanup: CleanupId) -> RenderResult {
        wait_single_use_fence(&self.context, fence, cleanup)
    }
}

pub(crate) fn create_single_use_fence(context: &RenderContext) -> RenderResult<(Fence, CleanupId)> {
    let fence = context.device.create_fence(false)?;
    let device = context.device.clone();
    let cleanup = context.gc.create_cleanup_task(
        CleanupTask::new("SyncManager::create_single_use_fence", move || {
            device.destroy_fence(fence)
        })
        .with_object("single use fence", fence),
    );
    Ok((fence, cleanup))
}

pub(crate) fn wait_single_use_fence(
    context: &RenderContext,
    fence: Fence,
    cleanup: CleanupId,
) -> RenderResult {
    let waited = context.device.wait_for_fences(&[fence], None);
    // Released either way, a failed wait means the device is gone anyway
    context.gc.execute_cleanup_task(cleanup)?;
    waited?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{headless::HeadlessConfig, Device, GpuObject};

    #[test]
    pub fn in_flight_fences_start_signalled() {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let sync = SyncManager::new(context).unwrap();

        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            assert_eq!(device.fence_signalled(sync.in_flight(slot)), Ok(true));
            sync.wait_for_frame(slot).unwrap();
        }
        assert_eq!(device.live_count("Semaphore"), 2 * MAX_FRAMES_IN_FLIGHT);

        sync.reset_frame(1).unwrap();
        assert_eq!(device.fence_signalled(sync.in_flight(1)), Ok(false));
        assert!(sync.wait_for_frame(1).is_err());
    }

    #[test]
    pub fn single_use_fences_die_after_the_wait() {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let sync = SyncManager::new(context.clone()).unwrap();

        let (fence, cleanup) = sync.create_single_use_fence().unwrap();
        device
            .queue_submit(crate::gpu::QueueKind::Graphics, &[], Some(fence))
            .unwrap();
        sync.wait_single_use_fence(fence, cleanup).unwrap();

        assert!(!device.is_alive(GpuObject::Fence(fence)));
        // The task is spent, the cleanup stack won't touch it again
        assert_eq!(context.gc.execute_cleanup_task(cleanup), Ok(false));
    }
}

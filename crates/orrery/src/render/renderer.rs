use super::{
    BufferManager, CommandManager, FrameTimingHistory, RenderContext, RenderError, RenderResult,
    SwapchainManager, SyncManager, TextureRegistry, MAX_FRAMES_IN_FLIGHT,
};
use crate::{
    config::RendererConfig,
    ecs::Registry,
    events::UpdateViewportSize,
    gpu::{Extent2D, ImageLayout, PipelineStages, QueueKind, SubmitInfo},
};
use log::*;
use std::{fmt, sync::Arc};

/// What happened to a frame passed through [`Renderer::draw_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted. Its present may still have triggered a swapchain recreation.
    Presented,
    /// The swapchain went stale while acquiring an image. Nothing was submitted.
    Dropped,
}

/// The frame scheduler. Owns every render manager and drives them through a frame.
pub struct Renderer {
    context: RenderContext,
    registry: Arc<Registry>,
    sync: SyncManager,
    commands: Arc<CommandManager>,
    buffers: Arc<BufferManager>,
    textures: Arc<TextureRegistry>,
    swapchains: Arc<SwapchainManager>,
    frame_counter: u64,
    framebuffer_size: Extent2D,
    timing: FrameTimingHistory,
}

impl Renderer {
    pub fn new(
        context: RenderContext,
        registry: Arc<Registry>,
        config: &RendererConfig,
    ) -> RenderResult<Self> {
        let swapchains = SwapchainManager::new(context.clone(), config.prefer_mailbox)?;
        let commands = CommandManager::new(context.clone())?;
        commands.set_clear_color(config.clear_color);
        let buffers = BufferManager::new(context.clone(), registry.clone(), commands.clone())?;
        let textures = TextureRegistry::new(
            context.clone(),
            commands.clone(),
            buffers.clone(),
            config.max_anisotropy,
        )?;
        let sync = SyncManager::new(context.clone())?;

        info!(
            "Renderer ready: {} swapchain images, {:?}",
            swapchains.image_count(),
            swapchains.extent()
        );

        Ok(Self {
            framebuffer_size: context.window.framebuffer_size(),
            context,
            registry,
            sync,
            commands,
            buffers,
            textures,
            swapchains,
            frame_counter: 0,
            timing: FrameTimingHistory::new(config.frame_timing_history),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn commands(&self) -> &Arc<CommandManager> {
        &self.commands
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    pub fn textures(&self) -> &Arc<TextureRegistry> {
        &self.textures
    }

    pub fn swapchains(&self) -> &Arc<SwapchainManager> {
        &self.swapchains
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// Amount of frames submitted so far. Dropped frames don't count.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_counter % MAX_FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn timing(&self) -> &FrameTimingHistory {
        &self.timing
    }

    /// Runs a single frame.
    ///
    /// Events queued by other threads are delivered first, on the calling thread. The only
    /// blocking GPU wait is the one on the slot's in-flight fence.
    pub fn draw_frame(&mut self) -> RenderResult<FrameOutcome> {
        let delivered = self.context.dispatcher.process_queued_events();
        if delivered > 0 {
            trace!("Delivered {delivered} queued event(s)");
        }

        let slot = self.current_slot();
        self.timing.begin_frame(self.frame_counter, slot);
        let outcome = self.render_slot(slot);
        self.timing
            .finish_frame(matches!(outcome, Ok(FrameOutcome::Presented)));
        outcome
    }

    fn render_slot(&mut self, slot: usize) -> RenderResult<FrameOutcome> {
        let device = self.context.device.clone();
        self.sync.wait_for_frame(slot)?;

        let image_ready = self.sync.image_ready(slot);
        let image_index = match self.swapchains.acquire_next_image(image_ready) {
            Ok(index) => index,
            Err(error) if error.is_stale_swapchain() => {
                debug!("Dropping frame {}: {error}", self.frame_counter);
                self.recreate_swapchain()?;
                return Ok(FrameOutcome::Dropped);
            }
            Err(error) => return Err(error.into()),
        };

        self.sync.reset_frame(slot)?;

        let draws = if self.buffers.global_ubo(slot).is_some() {
            let origin = self.buffers.camera().position;
            self.buffers.update_ubos(slot, origin)?
        } else {
            Vec::new()
        };

        let target = self.swapchains.present_target(image_index)?;
        self.commands.record_primary(slot, &target, &draws)?;
        self.swapchains
            .set_image_layout(image_index, ImageLayout::PresentSrc);

        let render_finished = self.sync.render_finished(slot);
        device.queue_submit(
            QueueKind::Graphics,
            &[SubmitInfo {
                wait: vec![(image_ready, PipelineStages::COLOR_ATTACHMENT_OUTPUT)],
                command_buffers: vec![self.commands.primary_buffer(slot)],
                signal: vec![render_finished],
            }],
            Some(self.sync.in_flight(slot)),
        )?;

        match self.swapchains.present(image_index, render_finished) {
            Ok(()) => {
                let size = self.context.window.framebuffer_size();
                if size != self.framebuffer_size {
                    debug!("Framebuffer resized to {size:?}");
                    self.recreate_swapchain()?;
                }
            }
            Err(error) if error.is_stale_swapchain() => {
                debug!("Present reported {error}");
                self.recreate_swapchain()?;
            }
            Err(error) => return Err(error.into()),
        }

        self.frame_counter += 1;
        Ok(FrameOutcome::Presented)
    }

    /// Rebuilds the swapchain and notifies everything that depends on the viewport size.
    pub fn recreate_swapchain(&mut self) -> RenderResult {
        self.swapchains.recreate()?;
        self.framebuffer_size = self.context.window.framebuffer_size();
        self.context.dispatcher.dispatch(&UpdateViewportSize {
            extent: self.swapchains.extent(),
        });
        Ok(())
    }

    /// Waits for all submitted work to finish.
    pub fn wait_idle(&self) -> RenderResult {
        self.context
            .device
            .device_wait_idle()
            .map_err(RenderError::from)
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("frame_counter", &self.frame_counter)
            .field("framebuffer_size", &self.framebuffer_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{Event, InitPresentPipeline, SwapchainRecreated, UpdateRenderables},
        gpu::{
            headless::{DeviceCall, HeadlessConfig, HeadlessDevice},
            Device, Format, GpuError, RenderPassDesc,
        },
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn renderer() -> (Renderer, Arc<HeadlessDevice>) {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let registry = Arc::new(
            Registry::with_context(context.dispatcher.clone(), context.device.clone()).unwrap(),
        );
        let renderer =
            Renderer::new(context.clone(), registry, &RendererConfig::default()).unwrap();

        let render_pass = device
            .create_render_pass(&RenderPassDesc {
                label: "present",
                color_format: Format::R8G8B8A8Srgb,
                final_layout: ImageLayout::PresentSrc,
            })
            .unwrap();
        context.dispatcher.dispatch(&InitPresentPipeline { render_pass });
        (renderer, device)
    }

    fn count_calls(device: &HeadlessDevice, f: impl Fn(&DeviceCall) -> bool) -> usize {
        device.calls().iter().filter(|call| f(call)).count()
    }

    fn counter<E: Event>(renderer: &Renderer) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = &renderer.context.dispatcher;
        let subscriber = dispatcher.register_subscriber::<E>();
        let seen = count.clone();
        dispatcher
            .subscribe::<E>(subscriber, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        count
    }

    #[test]
    pub fn frames_cycle_through_the_slots() {
        let (mut renderer, device) = renderer();
        let gui_draws = counter::<UpdateRenderables>(&renderer);

        for expected_slot in [0, 1, 2, 0, 1] {
            assert_eq!(renderer.current_slot(), expected_slot);
            assert_eq!(renderer.draw_frame().unwrap(), FrameOutcome::Presented);
        }

        assert_eq!(renderer.frame_counter(), 5);
        assert_eq!(device.submit_count(), 5);
        assert_eq!(
            count_calls(&device, |call| matches!(
                call,
                DeviceCall::Present { result: Ok(()), .. }
            )),
            5
        );
        assert_eq!(gui_draws.load(Ordering::SeqCst), 5);
        assert_eq!(renderer.timing().len(), 5);
        assert_eq!(renderer.timing().dropped_frames(), 0);
    }

    #[test]
    pub fn stale_acquires_drop_the_frame() {
        let (mut renderer, device) = renderer();
        let recreated = counter::<SwapchainRecreated>(&renderer);
        let viewport_updates = counter::<UpdateViewportSize>(&renderer);

        device.script_acquire_failure(GpuError::SwapchainOutOfDate);
        assert_eq!(renderer.draw_frame().unwrap(), FrameOutcome::Dropped);

        assert_eq!(device.submit_count(), 0);
        assert!(device.fence_signalled(renderer.sync().in_flight(0)).unwrap());
        assert_eq!(renderer.frame_counter(), 0);
        assert_eq!(recreated.load(Ordering::SeqCst), 1);
        assert_eq!(viewport_updates.load(Ordering::SeqCst), 1);
        assert_eq!(renderer.timing().dropped_frames(), 1);

        // The same slot gets reused for the next attempt
        assert_eq!(renderer.draw_frame().unwrap(), FrameOutcome::Presented);
        assert_eq!(renderer.frame_counter(), 1);
        assert_eq!(device.submit_count(), 1);
    }

    #[test]
    pub fn stale_presents_still_count() {
        let (mut renderer, device) = renderer();
        let recreated = counter::<SwapchainRecreated>(&renderer);

        device.script_present_failure(GpuError::SwapchainSuboptimal);
        assert_eq!(renderer.draw_frame().unwrap(), FrameOutcome::Presented);

        assert_eq!(renderer.frame_counter(), 1);
        assert_eq!(device.submit_count(), 1);
        assert_eq!(recreated.load(Ordering::SeqCst), 1);

        assert_eq!(renderer.draw_frame().unwrap(), FrameOutcome::Presented);
        assert_eq!(renderer.frame_counter(), 2);
    }

    #[test]
    pub fn resizes_recreate_the_swapchain() {
        let (mut renderer, device) = renderer();
        let viewport_updates = counter::<UpdateViewportSize>(&renderer);

        renderer.draw_frame().unwrap();
        assert_eq!(viewport_updates.load(Ordering::SeqCst), 0);

        device.resize(Extent2D::new(800, 600));
        renderer.draw_frame().unwrap();
        assert_eq!(viewport_updates.load(Ordering::SeqCst), 1);
        assert_eq!(renderer.swapchains().extent(), Extent2D::new(800, 600));

        renderer.draw_frame().unwrap();
        assert_eq!(viewport_updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    pub fn fatal_errors_propagate() {
        let (mut renderer, device) = renderer();
        device.script_acquire_failure(GpuError::DeviceLost);
        assert!(matches!(
            renderer.draw_frame(),
            Err(RenderError::Gpu(GpuError::DeviceLost))
        ));
        assert_eq!(renderer.timing().dropped_frames(), 1);
    }

    #[test]
    pub fn queued_events_are_delivered_before_the_frame() {
        let (mut renderer, _device) = renderer();
        let viewport_updates = counter::<UpdateViewportSize>(&renderer);

        renderer.context.dispatcher.queue(UpdateViewportSize {
            extent: Extent2D::new(1, 1),
        });
        assert_eq!(viewport_updates.load(Ordering::SeqCst), 0);
        renderer.draw_frame().unwrap();
        assert_eq!(viewport_updates.load(Ordering::SeqCst), 1);
    }
}

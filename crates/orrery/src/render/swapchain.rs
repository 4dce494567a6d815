use super::{PresentTarget, RenderContext, RenderError, RenderResult};
use crate::{
    events::{InitPresentPipeline, InitSwapchainManager, SubscriberIndex, SwapchainRecreated},
    gc::{CleanupId, CleanupTask},
    gpu::{
        ColorSpace, Extent2D, Format, Framebuffer, GpuError, GpuResult, Image, ImageLayout,
        ImageUsage, ImageView, PresentInfo, PresentMode, RenderPass, Semaphore, SharingMode,
        SurfaceCapabilities, SurfaceFormat, Swapchain, SwapchainDesc,
    },
};
use log::*;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::{
    fmt,
    sync::{Arc, Weak},
};

/// Picks `R8G8B8A8Srgb` in the sRGB color space if the surface supports it, the first format it
/// reports otherwise.
pub fn choose_surface_format(formats: &[SurfaceFormat]) -> SurfaceFormat {
    let preferred = SurfaceFormat {
        format: Format::R8G8B8A8Srgb,
        color_space: ColorSpace::SrgbNonlinear,
    };
    if formats.contains(&preferred) {
        return preferred;
    }
    formats.first().copied().unwrap_or_else(|| {
        warn!("Surface reports no formats, assuming {preferred:?}");
        preferred
    })
}

/// Mailbox if allowed and available, FIFO otherwise. FIFO support is guaranteed.
pub fn choose_present_mode(modes: &[PresentMode], prefer_mailbox: bool) -> PresentMode {
    if prefer_mailbox && modes.contains(&PresentMode::Mailbox) {
        PresentMode::Mailbox
    } else {
        PresentMode::Fifo
    }
}

/// The surface's current extent, unless the surface leaves the choice to the window.
pub fn choose_extent(capabilities: &SurfaceCapabilities, framebuffer_size: Extent2D) -> Extent2D {
    if capabilities.current_extent != Extent2D::UNDEFINED {
        return capabilities.current_extent;
    }
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    Extent2D::new(
        framebuffer_size.width.clamp(min.width, max.width),
        framebuffer_size.height.clamp(min.height, max.height),
    )
}

/// One more than the minimum, without going over the maximum (if there's one).
pub fn choose_image_count(capabilities: &SurfaceCapabilities) -> u32 {
    let count = capabilities.min_image_count + 1;
    match capabilities.max_image_count {
        0 => count,
        max => count.min(max),
    }
}

#[derive(Debug, Default)]
struct SwapchainState {
    swapchain: Option<Swapchain>,
    surface_format: Option<SurfaceFormat>,
    present_mode: Option<PresentMode>,
    extent: Extent2D,
    images: Vec<Image>,
    image_views: Vec<ImageView>,
    image_layouts: Vec<ImageLayout>,
    framebuffers: Vec<Framebuffer>,
    present_render_pass: Option<RenderPass>,
    views_cleanup: Option<CleanupId>,
    framebuffers_cleanup: Option<CleanupId>,
    swapchain_cleanup: Option<CleanupId>,
}

/// Owns the swapchain, its image views and the present pass framebuffers.
///
/// Framebuffers need the present render pass, so they're only created once
/// [`InitPresentPipeline`] arrives. The layout every image is currently in is tracked here, and
/// updated by the renderer after each recording.
pub struct SwapchainManager {
    context: RenderContext,
    subscriber: SubscriberIndex,
    prefer_mailbox: bool,
    state: Mutex<SwapchainState>,
}

impl SwapchainManager {
    pub fn new(context: RenderContext, prefer_mailbox: bool) -> RenderResult<Arc<Self>> {
        let manager = Arc::new(Self {
            subscriber: context.dispatcher.register_subscriber::<Self>(),
            context,
            prefer_mailbox,
            state: Mutex::new(SwapchainState::default()),
        });

        manager.create_swapchain()?;

        let weak = Arc::downgrade(&manager);
        manager
            .context
            .dispatcher
            .subscribe::<InitPresentPipeline>(manager.subscriber, move |event| {
                with_manager(&weak, |manager| {
                    if let Err(error) = manager.on_present_pipeline(event.render_pass) {
                        error!("Couldn't create the present framebuffers: {error}");
                    }
                })
            })?;

        manager.context.dispatcher.dispatch(&InitSwapchainManager);
        Ok(manager)
    }

    pub fn swapchain(&self) -> Option<Swapchain> {
        self.state.lock().swapchain
    }

    pub fn extent(&self) -> Extent2D {
        self.state.lock().extent
    }

    pub fn surface_format(&self) -> Option<SurfaceFormat> {
        self.state.lock().surface_format
    }

    pub fn present_mode(&self) -> Option<PresentMode> {
        self.state.lock().present_mode
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn image_views(&self) -> Vec<ImageView> {
        self.state.lock().image_views.clone()
    }

    pub fn framebuffers(&self) -> Vec<Framebuffer> {
        self.state.lock().framebuffers.clone()
    }

    pub fn image_layouts(&self) -> Vec<ImageLayout> {
        self.state.lock().image_layouts.clone()
    }

    pub fn image_layout(&self, index: u32) -> Option<ImageLayout> {
        self.state.lock().image_layouts.get(index as usize).copied()
    }

    pub fn set_image_layout(&self, index: u32, layout: ImageLayout) {
        match self.state.lock().image_layouts.get_mut(index as usize) {
            Some(current) => *current = layout,
            None => warn!("Swapchain image #{index} doesn't exist"),
        }
    }

    /// Everything a primary command buffer needs to render into image `index`.
    pub fn present_target(&self, index: u32) -> RenderResult<PresentTarget> {
        let state = self.state.lock();
        let index = index as usize;
        let framebuffer = *state
            .framebuffers
            .get(index)
            .ok_or(RenderError::NotInitialized("the present framebuffers"))?;
        Ok(PresentTarget {
            image: state.images[index],
            image_layout: state.image_layouts[index],
            framebuffer,
            extent: state.extent,
        })
    }

    /// Acquires the next image, signalling `signal` when it's ready. Blocks for as long as it
    /// takes.
    pub fn acquire_next_image(&self, signal: Semaphore) -> GpuResult<u32> {
        let swapchain = self.live_swapchain()?;
        self.context
            .device
            .acquire_next_image(swapchain, None, signal)
    }

    pub fn present(&self, image_index: u32, wait: Semaphore) -> GpuResult {
        let swapchain = self.live_swapchain()?;
        self.context.device.queue_present(&PresentInfo {
            wait: vec![wait],
            swapchain,
            image_index,
        })
    }

    fn live_swapchain(&self) -> GpuResult<Swapchain> {
        self.swapchain()
            .ok_or_else(|| GpuError::InvalidUsage("no swapchain".into()))
    }

    /// Tears down the swapchain and everything derived from it, and builds it again for the
    /// current surface size.
    ///
    /// While the window is minimized this blocks, waiting for window events until the framebuffer
    /// has a non-zero size again.
    pub fn recreate(&self) -> RenderResult {
        let app_state = &self.context.app_state;
        app_state.set_swapchain_recreating(true);
        let result = self.recreate_inner();
        app_state.set_swapchain_recreating(false);
        result
    }

    fn recreate_inner(&self) -> RenderResult {
        let window = &self.context.window;
        let mut size = window.framebuffer_size();
        if size.is_zero() {
            info!("Window is minimized, waiting");
        }
        while size.is_zero() {
            window.wait_events();
            size = window.framebuffer_size();
        }

        self.context.device.device_wait_idle()?;

        let tasks = {
            let mut state = self.state.lock();
            [
                state.views_cleanup.take(),
                state.framebuffers_cleanup.take(),
                state.swapchain_cleanup.take(),
            ]
        };
        for task in tasks.into_iter().flatten() {
            self.context.gc.execute_cleanup_task(task)?;
        }

        self.create_swapchain()?;
        let render_pass = self.state.lock().present_render_pass;
        if let Some(render_pass) = render_pass {
            self.create_framebuffers(render_pass)?;
        }

        let event = {
            let state = self.state.lock();
            SwapchainRecreated {
                extent: state.extent,
                image_layouts: state.image_layouts.clone(),
                framebuffers: state.framebuffers.clone(),
            }
        };
        info!(
            "Recreated the swapchain at {}x{}",
            event.extent.width, event.extent.height
        );
        self.context.dispatcher.dispatch(&event);
        Ok(())
    }

    fn create_swapchain(&self) -> RenderResult {
        let device = self.context.device.clone();
        let capabilities = device.surface_capabilities();
        let surface_format = choose_surface_format(&device.surface_formats());
        let present_mode = choose_present_mode(&device.present_modes(), self.prefer_mailbox);
        let extent = choose_extent(&capabilities, self.context.window.framebuffer_size());

        let families = device.queue_families();
        let sharing = if families.graphics_supports_present {
            SharingMode::Exclusive
        } else {
            SharingMode::Concurrent(smallvec![families.graphics, families.present])
        };

        let swapchain = device.create_swapchain(&SwapchainDesc {
            min_image_count: choose_image_count(&capabilities),
            surface_format,
            extent,
            present_mode,
            usage: ImageUsage::COLOR_ATTACHMENT,
            sharing,
        })?;
        let swapchain_device = device.clone();
        let swapchain_cleanup = self.context.gc.create_cleanup_task(
            CleanupTask::new("SwapchainManager::create_swapchain", move || {
                swapchain_device.destroy_swapchain(swapchain)
            })
            .with_object("swapchain", swapchain),
        );

        let images = device.swapchain_images(swapchain)?;
        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            image_views.push(device.create_image_view(image, surface_format.format)?);
        }
        let views_device = device.clone();
        let views = image_views.clone();
        let mut views_task = CleanupTask::new("SwapchainManager::create_swapchain", move || {
            for view in views {
                views_device.destroy_image_view(view);
            }
        });
        for (i, &view) in image_views.iter().enumerate() {
            views_task = views_task.with_object(format!("swapchain image view #{i}"), view);
        }
        let views_cleanup = self.context.gc.create_cleanup_task(views_task);

        debug!(
            "Created a swapchain with {} images ({:?}, {:?}, {}x{})",
            images.len(),
            surface_format.format,
            present_mode,
            extent.width,
            extent.height
        );

        let mut state = self.state.lock();
        state.swapchain = Some(swapchain);
        state.surface_format = Some(surface_format);
        state.present_mode = Some(present_mode);
        state.extent = extent;
        state.image_layouts = vec![ImageLayout::Undefined; images.len()];
        state.images = images;
        state.image_views = image_views;
        state.framebuffers.clear();
        state.views_cleanup = Some(views_cleanup);
        state.swapchain_cleanup = Some(swapchain_cleanup);
        Ok(())
    }

    fn create_framebuffers(&self, render_pass: RenderPass) -> RenderResult {
        let device = self.context.device.clone();
        let (views, extent) = {
            let state = self.state.lock();
            (state.image_views.clone(), state.extent)
        };

        let mut framebuffers = Vec::with_capacity(views.len());
        for view in views {
            framebuffers.push(device.create_framebuffer(render_pass, &[view], extent)?);
        }

        let list = framebuffers.clone();
        let mut task = CleanupTask::new("SwapchainManager::create_framebuffers", move || {
            for framebuffer in list {
                device.destroy_framebuffer(framebuffer);
            }
        });
        for (i, &framebuffer) in framebuffers.iter().enumerate() {
            task = task.with_object(format!("present framebuffer #{i}"), framebuffer);
        }
        let cleanup = self.context.gc.create_cleanup_task(task);

        let mut state = self.state.lock();
        state.framebuffers = framebuffers;
        state.framebuffers_cleanup = Some(cleanup);
        Ok(())
    }

    fn on_present_pipeline(&self, render_pass: RenderPass) -> RenderResult {
        let previous = {
            let mut state = self.state.lock();
            state.present_render_pass = Some(render_pass);
            state.framebuffers_cleanup.take()
        };
        if let Some(previous) = previous {
            self.context.gc.execute_cleanup_task(previous)?;
        }
        self.create_framebuffers(render_pass)
    }
}

fn with_manager(manager: &Weak<SwapchainManager>, f: impl FnOnce(&SwapchainManager)) {
    if let Some(manager) = manager.upgrade() {
        f(&manager);
    }
}

impl fmt::Debug for SwapchainManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SwapchainManager")
            .field("swapchain", &state.swapchain)
            .field("extent", &state.extent)
            .field("images", &state.images.len())
            .field("prefer_mailbox", &self.prefer_mailbox)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        headless::{DeviceCall, HeadlessConfig, HeadlessDevice},
        Device, GpuObject, RenderPassDesc,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn present_pass(device: &HeadlessDevice) -> RenderPass {
        device
            .create_render_pass(&RenderPassDesc {
                label: "present",
                color_format: Format::R8G8B8A8Srgb,
                final_layout: ImageLayout::PresentSrc,
            })
            .unwrap()
    }

    fn capabilities(current: Extent2D, max_images: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: max_images,
            current_extent: current,
            min_image_extent: Extent2D::new(16, 16),
            max_image_extent: Extent2D::new(4096, 4096),
        }
    }

    #[test]
    pub fn surface_choices() {
        let bgra = SurfaceFormat {
            format: Format::B8G8R8A8Unorm,
            color_space: ColorSpace::SrgbNonlinear,
        };
        let srgb = SurfaceFormat {
            format: Format::R8G8B8A8Srgb,
            color_space: ColorSpace::SrgbNonlinear,
        };
        assert_eq!(choose_surface_format(&[bgra, srgb]), srgb);
        assert_eq!(choose_surface_format(&[bgra]), bgra);

        let modes = [PresentMode::Fifo, PresentMode::Mailbox];
        assert_eq!(choose_present_mode(&modes, true), PresentMode::Mailbox);
        assert_eq!(choose_present_mode(&modes, false), PresentMode::Fifo);
        assert_eq!(choose_present_mode(&[PresentMode::Fifo], true), PresentMode::Fifo);

        let fixed = capabilities(Extent2D::new(800, 600), 0);
        assert_eq!(choose_extent(&fixed, Extent2D::new(1, 1)), Extent2D::new(800, 600));
        let free = capabilities(Extent2D::UNDEFINED, 0);
        assert_eq!(
            choose_extent(&free, Extent2D::new(8, 10_000)),
            Extent2D::new(16, 4096)
        );

        assert_eq!(choose_image_count(&fixed), 3);
        assert_eq!(choose_image_count(&capabilities(Extent2D::UNDEFINED, 2)), 2);
    }

    #[test]
    pub fn framebuffers_follow_the_present_pipeline() {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let swapchains = SwapchainManager::new(context.clone(), true).unwrap();

        assert_eq!(swapchains.image_count(), 3);
        assert_eq!(swapchains.present_mode(), Some(PresentMode::Mailbox));
        assert_eq!(swapchains.extent(), Extent2D::new(1280, 720));
        assert!(swapchains.framebuffers().is_empty());
        assert!(swapchains.present_target(0).is_err());

        context.dispatcher.dispatch(&InitPresentPipeline {
            render_pass: present_pass(&device),
        });
        assert_eq!(swapchains.framebuffers().len(), 3);
        let target = swapchains.present_target(2).unwrap();
        assert_eq!(target.image_layout, ImageLayout::Undefined);
        assert_eq!(target.extent, Extent2D::new(1280, 720));
    }

    #[test]
    pub fn recreation_replaces_everything_in_order() {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let swapchains = SwapchainManager::new(context.clone(), true).unwrap();
        context.dispatcher.dispatch(&InitPresentPipeline {
            render_pass: present_pass(&device),
        });
        swapchains.set_image_layout(0, ImageLayout::PresentSrc);

        let recreated = Arc::new(AtomicUsize::new(0));
        let subscriber = context.dispatcher.register_subscriber::<AtomicUsize>();
        let counter = recreated.clone();
        let recreating = context.app_state.clone();
        context
            .dispatcher
            .subscribe::<SwapchainRecreated>(subscriber, move |event| {
                assert_eq!(event.extent, Extent2D::new(800, 600));
                assert_eq!(event.image_layouts, vec![ImageLayout::Undefined; 3]);
                assert_eq!(event.framebuffers.len(), 3);
                assert!(recreating.swapchain_recreating());
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let old_swapchain = swapchains.swapchain().unwrap();
        let old_view = swapchains.image_views()[0];
        let old_framebuffer = swapchains.framebuffers()[0];
        device.clear_calls();
        device.resize(Extent2D::new(800, 600));
        swapchains.recreate().unwrap();

        assert_eq!(recreated.load(Ordering::SeqCst), 1);
        assert!(!context.app_state.swapchain_recreating());
        assert_eq!(swapchains.extent(), Extent2D::new(800, 600));
        assert_eq!(swapchains.image_layout(0), Some(ImageLayout::Undefined));
        assert!(!device.is_alive(old_swapchain.into()));

        let calls = device.calls();
        let position = |object: GpuObject| {
            calls
                .iter()
                .position(|call| *call == DeviceCall::Destroy(object))
                .unwrap()
        };
        assert_eq!(calls[0], DeviceCall::DeviceWaitIdle);
        assert!(position(old_view.into()) < position(old_framebuffer.into()));
        assert!(position(old_framebuffer.into()) < position(old_swapchain.into()));
        assert_eq!(device.live_count("Framebuffer"), 3);
        assert_eq!(device.live_count("ImageView"), 3);
    }

    #[test]
    pub fn minimized_windows_block_recreation() {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let swapchains = SwapchainManager::new(context, false).unwrap();

        device.resize(Extent2D::new(0, 0));
        device.queue_framebuffer_sizes([Extent2D::new(0, 0), Extent2D::new(640, 480)]);
        swapchains.recreate().unwrap();

        let waits = device
            .calls()
            .iter()
            .filter(|call| **call == DeviceCall::WaitEvents)
            .count();
        assert_eq!(waits, 2);
        assert_eq!(swapchains.extent(), Extent2D::new(640, 480));
        assert_eq!(swapchains.present_mode(), Some(PresentMode::Fifo));
    }
}

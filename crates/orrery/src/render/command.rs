use super::{sync, RenderContext, RenderError, RenderResult, MAX_FRAMES_IN_FLIGHT};
use crate::{
    events::{
        InitOffscreenPipeline, InitPresentPipeline, OffscreenResourcesRecreated,
        ProcessSecondaryCommandBuffers, RenderableKind, SecondaryStage, SessionStatus,
        SubscriberIndex, UpdateRenderables, UpdateSessionStatus,
    },
    gc::{CleanupId, CleanupTask},
    gpu::{
        AccessFlags, Command, CommandBuffer, CommandBufferLevel, CommandBufferUsage, CommandPool,
        CommandPoolFlags, DescriptorSet, Extent2D, Fence, Framebuffer, Image, ImageBarrier,
        ImageLayout, InheritanceInfo, Pipeline, PipelineStages, QueueKind, RenderPass,
        RenderPassBegin, Semaphore, SubmitInfo, SubpassContents,
    },
};
use ahash::AHashMap;
use derive_builder::Builder;
use log::*;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
};

const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// A single indexed draw of a mesh renderable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshDraw {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
    /// Byte offset of the renderable's object UBO.
    pub dynamic_offset: u32,
}

/// The swapchain image a primary command buffer renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentTarget {
    pub image: Image,
    /// Layout the image is in right now, either undefined (never rendered to) or present source.
    pub image_layout: ImageLayout,
    pub framebuffer: Framebuffer,
    pub extent: Extent2D,
}

/// Configuration of a one-off command buffer, see [`CommandManager::begin_single_use`].
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct SingleUseConfig {
    /// Pool to allocate from. A cached transient pool of the queue's family is used if unset.
    #[builder(default, setter(strip_option))]
    pub pool: Option<CommandPool>,
    #[builder(default = "QueueKind::Graphics")]
    pub queue: QueueKind,
    #[builder(default = "CommandBufferLevel::Primary")]
    pub level: CommandBufferLevel,
    #[builder(default = "CommandBufferUsage::ONE_TIME_SUBMIT")]
    pub usage: CommandBufferUsage,
    #[builder(default, setter(strip_option))]
    pub inheritance: Option<InheritanceInfo>,
    /// Fence signalled by the submission, waited on and reset afterwards.
    #[builder(default, setter(strip_option))]
    pub fence: Option<Fence>,
    #[builder(default)]
    pub wait: Vec<(Semaphore, PipelineStages)>,
    #[builder(default)]
    pub signal: Vec<Semaphore>,
    /// When disabled, [`CommandManager::end_single_use`] only ends recording, and the caller
    /// hands the buffer over to the command manager with a [`ProcessSecondaryCommandBuffers`].
    #[builder(default = "true")]
    pub auto_submit: bool,
    #[builder(default = "true")]
    pub free_after_submit: bool,
    /// Submit with a fence created just for this buffer, and released right after the wait.
    #[builder(default)]
    pub uses_single_use_fence: bool,
}

impl SingleUseConfig {
    pub fn builder() -> SingleUseConfigBuilder {
        SingleUseConfigBuilder::default()
    }
}

/// A single-use command buffer in the recording state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleUseBuffer {
    pub buffer: CommandBuffer,
    pub pool: CommandPool,
    single_use_fence: Option<(Fence, CleanupId)>,
}

#[derive(Debug, Clone)]
struct OffscreenTargets {
    render_pass: RenderPass,
    pipeline: Pipeline,
    framebuffers: Vec<Framebuffer>,
    descriptor_set: DescriptorSet,
}

type PoolKey = (u32, CommandPoolFlags, ThreadId);

/// Records the primary command buffer of every frame and manages command pools.
///
/// Other subsystems (and worker threads) hand over secondary command buffers with a
/// [`ProcessSecondaryCommandBuffers`] event. They're sorted into three stages:
///  * [`SecondaryStage::None`], executed before any render pass (texture uploads),
///  * [`SecondaryStage::Offscreen`], executed inside the offscreen scene pass,
///  * [`SecondaryStage::Present`], which can't be executed at all while the GUI records inline
///    into the present pass.
///
/// Every stage list is empty once [`CommandManager::record_primary`] returns.
pub struct CommandManager {
    context: RenderContext,
    subscriber: SubscriberIndex,
    pools: Mutex<AHashMap<PoolKey, CommandPool>>,
    primary: Vec<CommandBuffer>,
    mesh_secondary: Vec<CommandBuffer>,
    secondary: Mutex<[Vec<CommandBuffer>; 3]>,
    present_render_pass: Mutex<Option<RenderPass>>,
    offscreen: Mutex<Option<OffscreenTargets>>,
    scene_ready: AtomicBool,
    clear_color: Mutex<[f32; 4]>,
}

impl CommandManager {
    pub fn new(context: RenderContext) -> RenderResult<Arc<Self>> {
        let subscriber = context.dispatcher.register_subscriber::<Self>();
        let mut manager = Self {
            context,
            subscriber,
            pools: Mutex::new(AHashMap::new()),
            primary: Vec::new(),
            mesh_secondary: Vec::new(),
            secondary: Mutex::new(Default::default()),
            present_render_pass: Mutex::new(None),
            offscreen: Mutex::new(None),
            scene_ready: AtomicBool::new(false),
            clear_color: Mutex::new(DEFAULT_CLEAR_COLOR),
        };

        let graphics_family = manager.family_of(QueueKind::Graphics);
        let pool = manager.command_pool(graphics_family, CommandPoolFlags::RESET_COMMAND_BUFFER)?;
        let device = &manager.context.device;
        manager.primary = device.allocate_command_buffers(
            pool,
            CommandBufferLevel::Primary,
            MAX_FRAMES_IN_FLIGHT as u32,
        )?;
        manager.mesh_secondary = device.allocate_command_buffers(
            pool,
            CommandBufferLevel::Secondary,
            MAX_FRAMES_IN_FLIGHT as u32,
        )?;

        let manager = Arc::new(manager);
        manager.subscribe()?;
        Ok(manager)
    }

    fn subscribe(self: &Arc<Self>) -> RenderResult {
        let dispatcher = &self.context.dispatcher;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<ProcessSecondaryCommandBuffers>(self.subscriber, move |event| {
            with_manager(&weak, |manager| manager.push_secondary(event.stage, &event.buffers))
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<UpdateSessionStatus>(self.subscriber, move |event| {
            with_manager(&weak, |manager| manager.on_session_status(event.status))
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<InitPresentPipeline>(self.subscriber, move |event| {
            with_manager(&weak, |manager| {
                *manager.present_render_pass.lock() = Some(event.render_pass);
            })
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<InitOffscreenPipeline>(self.subscriber, move |event| {
            with_manager(&weak, |manager| {
                *manager.offscreen.lock() = Some(OffscreenTargets {
                    render_pass: event.render_pass,
                    pipeline: event.pipeline,
                    framebuffers: event.framebuffers.clone(),
                    descriptor_set: event.tex_array_descriptor_set,
                });
            })
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<OffscreenResourcesRecreated>(self.subscriber, move |event| {
            with_manager(&weak, |manager| {
                match manager.offscreen.lock().as_mut() {
                    Some(targets) => targets.framebuffers = event.framebuffers.clone(),
                    None => warn!("Offscreen resources were recreated before initialization"),
                }
            })
        })?;

        Ok(())
    }

    pub fn subscriber(&self) -> SubscriberIndex {
        self.subscriber
    }

    pub fn primary_buffer(&self, frame: usize) -> CommandBuffer {
        self.primary[frame]
    }

    /// Color both render passes are cleared to.
    pub fn set_clear_color(&self, color: [f32; 4]) {
        *self.clear_color.lock() = color;
    }

    pub fn scene_ready(&self) -> bool {
        self.scene_ready.load(Ordering::Acquire)
    }

    /// Amount of pending secondary buffers, per stage.
    pub fn pending_secondary_buffers(&self) -> [usize; 3] {
        let lists = self.secondary.lock();
        [lists[0].len(), lists[1].len(), lists[2].len()]
    }

    fn family_of(&self, queue: QueueKind) -> u32 {
        self.context.device.queue_families().family_of(queue)
    }

    /// Returns the calling thread's pool for a queue family, creating it if needed.
    ///
    /// Pools are externally synchronized, so every thread gets its own.
    pub fn command_pool(&self, family: u32, flags: CommandPoolFlags) -> RenderResult<CommandPool> {
        let key = (family, flags, thread::current().id());
        let mut pools = self.pools.lock();
        if let Some(&pool) = pools.get(&key) {
            return Ok(pool);
        }

        let device = self.context.device.clone();
        let pool = device.create_command_pool(family, flags)?;
        self.context.gc.create_cleanup_task(
            CleanupTask::new("CommandManager::command_pool", move || {
                device.destroy_command_pool(pool)
            })
            .with_object("command pool", pool),
        );
        debug!("Created a command pool for queue family {family} ({flags:?})");
        pools.insert(key, pool);
        Ok(pool)
    }

    fn push_secondary(&self, stage: SecondaryStage, buffers: &[CommandBuffer]) {
        trace!("Received {} {stage:?} stage secondary buffer(s)", buffers.len());
        self.secondary.lock()[stage as usize].extend_from_slice(buffers);
    }

    fn take_stage(&self, stage: SecondaryStage) -> Vec<CommandBuffer> {
        std::mem::take(&mut self.secondary.lock()[stage as usize])
    }

    fn on_session_status(&self, status: SessionStatus) {
        match status {
            SessionStatus::PrepareForReset => {
                self.scene_ready.store(false, Ordering::Release);
            }
            SessionStatus::Initialized => {
                if let Err(error) = self.context.device.device_wait_idle() {
                    error!("Couldn't wait for the device before marking the scene ready: {error}");
                }
                self.scene_ready.store(true, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Records the primary command buffer of a frame slot, from begin to end.
    ///
    /// While the swapchain is being recreated, the buffer is left empty. Pending secondary buffers
    /// that couldn't be executed are discarded.
    pub fn record_primary(
        &self,
        frame: usize,
        target: &PresentTarget,
        draws: &[MeshDraw],
    ) -> RenderResult {
        let device = &self.context.device;
        let buffer = self.primary[frame];
        device.reset_command_buffer(buffer)?;
        device.begin_command_buffer(buffer, CommandBufferUsage::empty(), None)?;

        let recorded = if self.context.app_state.swapchain_recreating() {
            debug!("Swapchain recreation in progress, recording an empty frame");
            Ok(())
        } else {
            self.record_passes(buffer, frame, target, draws)
        };

        let leftover: usize = std::mem::take(&mut *self.secondary.lock())
            .iter()
            .map(Vec::len)
            .sum();
        if leftover > 0 {
            warn!("Discarding {leftover} secondary command buffer(s) that couldn't be executed");
        }

        recorded?;
        device.end_command_buffer(buffer)?;
        Ok(())
    }

    fn record_passes(
        &self,
        buffer: CommandBuffer,
        frame: usize,
        target: &PresentTarget,
        draws: &[MeshDraw],
    ) -> RenderResult {
        let device = &self.context.device;

        if self.scene_ready() {
            let offscreen = self.offscreen.lock().clone();
            match offscreen {
                Some(offscreen) => {
                    self.record_offscreen_pass(buffer, frame, target, &offscreen, draws)?
                }
                None => warn!("The scene is ready, but the offscreen pipeline isn't"),
            }
        }

        let present_pass = self
            .present_render_pass
            .lock()
            .ok_or(RenderError::NotInitialized("the present render pass"))?;

        let (src_stage, src_access) = match target.image_layout {
            ImageLayout::Undefined => (PipelineStages::TOP_OF_PIPE, AccessFlags::empty()),
            // Nothing wrote to it this frame yet
            ImageLayout::PresentSrc => (PipelineStages::BOTTOM_OF_PIPE, AccessFlags::MEMORY_READ),
            old => {
                return Err(RenderError::UnsupportedLayoutTransition {
                    old,
                    new: ImageLayout::ColorAttachmentOptimal,
                })
            }
        };
        device.cmd(
            buffer,
            Command::PipelineBarrier(ImageBarrier {
                image: target.image,
                old_layout: target.image_layout,
                new_layout: ImageLayout::ColorAttachmentOptimal,
                src_stage,
                dst_stage: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                src_access,
                dst_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
            }),
        )?;

        device.cmd(
            buffer,
            Command::BeginRenderPass(RenderPassBegin {
                render_pass: present_pass,
                framebuffer: target.framebuffer,
                extent: target.extent,
                clear_color: *self.clear_color.lock(),
                contents: SubpassContents::Inline,
            }),
        )?;

        self.context.dispatcher.dispatch_quiet(&UpdateRenderables {
            kind: RenderableKind::Gui,
            command_buffer: buffer,
            current_frame: frame,
        });

        let present = self.take_stage(SecondaryStage::Present);
        if !present.is_empty() {
            error!(
                "{} present stage secondary buffer(s) were submitted alongside inline GUI draws",
                present.len()
            );
            return Err(RenderError::MixedPresentContents);
        }

        device.cmd(buffer, Command::EndRenderPass)?;
        Ok(())
    }

    fn record_offscreen_pass(
        &self,
        buffer: CommandBuffer,
        frame: usize,
        target: &PresentTarget,
        offscreen: &OffscreenTargets,
        draws: &[MeshDraw],
    ) -> RenderResult {
        let device = &self.context.device;

        let uncategorized = self.take_stage(SecondaryStage::None);
        if !uncategorized.is_empty() {
            device.cmd(buffer, Command::ExecuteCommands(uncategorized))?;
        }

        let framebuffer = *offscreen
            .framebuffers
            .get(frame)
            .ok_or(RenderError::NotInitialized("the offscreen framebuffers"))?;
        let mesh = self.record_mesh_draws(frame, offscreen, framebuffer, draws)?;

        device.cmd(
            buffer,
            Command::BeginRenderPass(RenderPassBegin {
                render_pass: offscreen.render_pass,
                framebuffer,
                extent: target.extent,
                clear_color: *self.clear_color.lock(),
                contents: SubpassContents::SecondaryCommandBuffers,
            }),
        )?;

        let mut secondaries = vec![mesh];
        secondaries.extend(self.take_stage(SecondaryStage::Offscreen));
        device.cmd(buffer, Command::ExecuteCommands(secondaries))?;
        device.cmd(buffer, Command::EndRenderPass)?;
        Ok(())
    }

    /// Records the scene's draws into the frame's mesh secondary buffer.
    fn record_mesh_draws(
        &self,
        frame: usize,
        offscreen: &OffscreenTargets,
        framebuffer: Framebuffer,
        draws: &[MeshDraw],
    ) -> RenderResult<CommandBuffer> {
        let device = &self.context.device;
        let buffer = self.mesh_secondary[frame];
        let inheritance = InheritanceInfo {
            render_pass: Some(offscreen.render_pass),
            subpass: 0,
            framebuffer: Some(framebuffer),
        };

        device.reset_command_buffer(buffer)?;
        device.begin_command_buffer(
            buffer,
            CommandBufferUsage::RENDER_PASS_CONTINUE,
            Some(&inheritance),
        )?;
        device.cmd(buffer, Command::BindPipeline(offscreen.pipeline))?;
        for draw in draws {
            device.cmd(
                buffer,
                Command::BindDescriptorSet {
                    set: offscreen.descriptor_set,
                    dynamic_offsets: smallvec![draw.dynamic_offset],
                },
            )?;
            device.cmd(
                buffer,
                Command::DrawIndexed {
                    index_count: draw.index_count,
                    first_index: draw.first_index,
                    vertex_offset: draw.vertex_offset,
                },
            )?;
        }

        self.context.dispatcher.dispatch_quiet(&UpdateRenderables {
            kind: RenderableKind::Mesh,
            command_buffer: buffer,
            current_frame: frame,
        });

        device.end_command_buffer(buffer)?;
        Ok(buffer)
    }

    /// Allocates a command buffer and begins recording it.
    pub fn begin_single_use(&self, config: &SingleUseConfig) -> RenderResult<SingleUseBuffer> {
        let device = &self.context.device;
        let pool = match config.pool {
            Some(pool) => pool,
            None => self.command_pool(self.family_of(config.queue), CommandPoolFlags::TRANSIENT)?,
        };

        let buffer = device
            .allocate_command_buffers(pool, config.level, 1)?
            .pop()
            .ok_or_else(|| RenderError::NotInitialized("the single-use command buffer"))?;
        device.begin_command_buffer(buffer, config.usage, config.inheritance.as_ref())?;

        let single_use_fence = if config.uses_single_use_fence && config.auto_submit {
            if config.fence.is_some() {
                warn!("Single-use command buffer has both a fence and a single-use fence");
            }
            Some(sync::create_single_use_fence(&self.context)?)
        } else {
            None
        };

        Ok(SingleUseBuffer {
            buffer,
            pool,
            single_use_fence,
        })
    }

    /// Ends recording, then submits and waits for the buffer if the config says so.
    pub fn end_single_use(
        &self,
        single: SingleUseBuffer,
        config: &SingleUseConfig,
    ) -> RenderResult {
        let device = &self.context.device;
        device.end_command_buffer(single.buffer)?;

        if !config.auto_submit {
            if cfg!(debug_assertions) && (config.uses_single_use_fence || config.fence.is_some()) {
                warn!(
                    "Command buffer {:#x} isn't auto-submitted, but uses a fence. Either enable \
                     auto-submission or remove the fence.",
                    single.buffer.raw()
                );
            }
            return Ok(());
        }

        let submit = SubmitInfo {
            wait: config.wait.clone(),
            command_buffers: vec![single.buffer],
            signal: config.signal.clone(),
        };

        match (single.single_use_fence, config.fence) {
            (Some((fence, cleanup)), _) => {
                device.queue_submit(config.queue, &[submit], Some(fence))?;
                sync::wait_single_use_fence(&self.context, fence, cleanup)?;
            }
            (None, Some(fence)) => {
                device.queue_submit(config.queue, &[submit], Some(fence))?;
                device.wait_for_fences(&[fence], None)?;
                device.reset_fences(&[fence])?;
            }
            (None, None) => {
                device.queue_submit(config.queue, &[submit], None)?;
                device.queue_wait_idle(config.queue)?;
            }
        }

        if config.free_after_submit {
            device.free_command_buffers(single.pool, &[single.buffer]);
        }
        Ok(())
    }
}

fn with_manager(manager: &Weak<CommandManager>, f: impl FnOnce(&CommandManager)) {
    match manager.upgrade() {
        Some(manager) => f(&manager),
        None => trace!("Command manager is gone, ignoring event"),
    }
}

impl fmt::Debug for CommandManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandManager")
            .field("primary", &self.primary)
            .field("scene_ready", &self.scene_ready())
            .field("pending", &self.pending_secondary_buffers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        headless::{DeviceCall, HeadlessConfig, HeadlessDevice},
        Device, Format, ImageDesc, ImageUsage, MemoryProperties, RenderPassDesc,
    };

    struct Fixture {
        context: RenderContext,
        device: Arc<HeadlessDevice>,
        manager: Arc<CommandManager>,
        target: PresentTarget,
    }

    fn color_image(device: &HeadlessDevice) -> Image {
        device
            .create_image(&ImageDesc {
                label: "test target",
                extent: Extent2D::new(4, 4),
                format: Format::B8G8R8A8Srgb,
                usage: ImageUsage::COLOR_ATTACHMENT,
                mip_levels: 1,
                memory: MemoryProperties::DEVICE_LOCAL,
            })
            .unwrap()
    }

    fn fixture(with_offscreen: bool) -> Fixture {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let manager = CommandManager::new(context.clone()).unwrap();

        let present_pass = device
            .create_render_pass(&RenderPassDesc {
                label: "present",
                color_format: Format::B8G8R8A8Srgb,
                final_layout: ImageLayout::PresentSrc,
            })
            .unwrap();
        context.dispatcher.dispatch(&InitPresentPipeline {
            render_pass: present_pass,
        });

        let image = color_image(&device);
        let view = device.create_image_view(image, Format::B8G8R8A8Srgb).unwrap();
        let framebuffer = device
            .create_framebuffer(present_pass, &[view], Extent2D::new(4, 4))
            .unwrap();

        if with_offscreen {
            let offscreen_pass = device
                .create_render_pass(&RenderPassDesc {
                    label: "offscreen",
                    color_format: Format::R8G8B8A8Unorm,
                    final_layout: ImageLayout::ShaderReadOnlyOptimal,
                })
                .unwrap();
            let pipeline = device.create_pipeline(offscreen_pass).unwrap();
            let framebuffers = (0..MAX_FRAMES_IN_FLIGHT)
                .map(|_| {
                    let image = color_image(&device);
                    let view = device.create_image_view(image, Format::B8G8R8A8Srgb).unwrap();
                    device
                        .create_framebuffer(offscreen_pass, &[view], Extent2D::new(4, 4))
                        .unwrap()
                })
                .collect();
            let pool = device.create_descriptor_pool(1, 4).unwrap();
            let set = device.allocate_descriptor_set(pool, 4).unwrap();
            context.dispatcher.dispatch(&InitOffscreenPipeline {
                render_pass: offscreen_pass,
                pipeline,
                offscreen_images: vec![],
                offscreen_image_views: vec![],
                offscreen_samplers: vec![],
                framebuffers,
                tex_array_descriptor_set: set,
            });
        }

        Fixture {
            context,
            device,
            manager,
            target: PresentTarget {
                image,
                image_layout: ImageLayout::Undefined,
                framebuffer,
                extent: Extent2D::new(4, 4),
            },
        }
    }

    fn secondary(fixture: &Fixture) -> CommandBuffer {
        let config = SingleUseConfig::builder()
            .level(CommandBufferLevel::Secondary)
            .inheritance(InheritanceInfo::default())
            .auto_submit(false)
            .build()
            .unwrap();
        let single = fixture.manager.begin_single_use(&config).unwrap();
        fixture.manager.end_single_use(single, &config).unwrap();
        single.buffer
    }

    fn names(commands: &[Command]) -> Vec<&'static str> {
        commands.iter().map(Command::name).collect()
    }

    #[test]
    pub fn scene_ready_frame_runs_both_passes() {
        let fixture = fixture(true);
        fixture.context.dispatcher.dispatch(&UpdateSessionStatus {
            status: SessionStatus::Initialized,
        });
        assert!(fixture.manager.scene_ready());

        let upload = secondary(&fixture);
        fixture.context.dispatcher.dispatch(&ProcessSecondaryCommandBuffers {
            stage: SecondaryStage::None,
            buffers: vec![upload],
        });

        let draws = [MeshDraw {
            first_index: 36,
            index_count: 36,
            vertex_offset: 0,
            dynamic_offset: 256,
        }];
        fixture.manager.record_primary(0, &fixture.target, &draws).unwrap();

        let primary = fixture.device.recorded_commands(fixture.manager.primary_buffer(0));
        assert_eq!(
            names(&primary),
            vec![
                "ExecuteCommands",
                "BeginRenderPass",
                "ExecuteCommands",
                "EndRenderPass",
                "PipelineBarrier",
                "BeginRenderPass",
                "EndRenderPass",
            ]
        );
        match &primary[4] {
            Command::PipelineBarrier(barrier) => {
                assert_eq!(barrier.src_stage, PipelineStages::TOP_OF_PIPE);
                assert_eq!(barrier.new_layout, ImageLayout::ColorAttachmentOptimal);
            }
            other => panic!("expected a barrier, got {other:?}"),
        }

        let mesh = fixture.device.recorded_commands(fixture.manager.mesh_secondary[0]);
        assert_eq!(
            names(&mesh),
            vec!["BindPipeline", "BindDescriptorSet", "DrawIndexed"]
        );
        assert_eq!(fixture.manager.pending_secondary_buffers(), [0, 0, 0]);
    }

    #[test]
    pub fn lists_drain_even_when_the_scene_is_not_ready() {
        let fixture = fixture(true);
        let buffers = vec![secondary(&fixture), secondary(&fixture)];
        fixture.context.dispatcher.dispatch(&ProcessSecondaryCommandBuffers {
            stage: SecondaryStage::Offscreen,
            buffers,
        });
        assert_eq!(fixture.manager.pending_secondary_buffers(), [0, 2, 0]);

        fixture.manager.record_primary(1, &fixture.target, &[]).unwrap();
        assert_eq!(fixture.manager.pending_secondary_buffers(), [0, 0, 0]);

        // Only the present pass got recorded
        let primary = fixture.device.recorded_commands(fixture.manager.primary_buffer(1));
        assert_eq!(
            names(&primary),
            vec!["PipelineBarrier", "BeginRenderPass", "EndRenderPass"]
        );
    }

    #[test]
    pub fn recreating_swapchain_records_an_empty_buffer() {
        let fixture = fixture(true);
        fixture.context.app_state.set_swapchain_recreating(true);
        fixture.context.dispatcher.dispatch(&ProcessSecondaryCommandBuffers {
            stage: SecondaryStage::None,
            buffers: vec![secondary(&fixture)],
        });

        fixture.manager.record_primary(0, &fixture.target, &[]).unwrap();
        assert!(fixture
            .device
            .recorded_commands(fixture.manager.primary_buffer(0))
            .is_empty());
        assert_eq!(fixture.manager.pending_secondary_buffers(), [0, 0, 0]);
    }

    #[test]
    pub fn present_secondaries_are_rejected() {
        let fixture = fixture(false);
        fixture.context.dispatcher.dispatch(&ProcessSecondaryCommandBuffers {
            stage: SecondaryStage::Present,
            buffers: vec![secondary(&fixture)],
        });

        let result = fixture.manager.record_primary(0, &fixture.target, &[]);
        assert!(matches!(result, Err(RenderError::MixedPresentContents)));
        assert_eq!(fixture.manager.pending_secondary_buffers(), [0, 0, 0]);
    }

    #[test]
    pub fn unsupported_swapchain_layouts_fail() {
        let fixture = fixture(false);
        let target = PresentTarget {
            image_layout: ImageLayout::TransferDstOptimal,
            ..fixture.target
        };
        let result = fixture.manager.record_primary(0, &target, &[]);
        assert!(matches!(
            result,
            Err(RenderError::UnsupportedLayoutTransition { .. })
        ));
    }

    #[test]
    pub fn single_use_buffers_submit_and_free() {
        let fixture = fixture(false);
        let config = SingleUseConfig::builder()
            .queue(QueueKind::Transfer)
            .uses_single_use_fence(true)
            .build()
            .unwrap();

        let single = fixture.manager.begin_single_use(&config).unwrap();
        fixture.manager.end_single_use(single, &config).unwrap();

        let calls = fixture.device.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            DeviceCall::Submit { queue: QueueKind::Transfer, fence: Some(_), .. }
        )));
        assert!(!fixture.device.is_alive(single.buffer.into()));
        assert_eq!(fixture.device.live_count("Fence"), 0);
    }

    #[test]
    pub fn pools_are_cached_per_family_and_flags() {
        let fixture = fixture(false);
        let a = fixture.manager.command_pool(0, CommandPoolFlags::TRANSIENT).unwrap();
        let b = fixture.manager.command_pool(0, CommandPoolFlags::TRANSIENT).unwrap();
        let c = fixture.manager.command_pool(1, CommandPoolFlags::TRANSIENT).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

//! Headless, in-memory implementation of the GPU boundary
//!
//! The [`HeadlessDevice`] never talks to real hardware. Buffers and images are plain byte vectors,
//! submissions replay their recorded commands synchronously on the calling thread, and presentation
//! only validates the semaphore and layout state. What it does keep track of is everything that
//! matters for correctness of the frame pipeline:
//!  * fence and semaphore signal state (waiting on something that would never signal is an error
//!    instead of a hang),
//!  * command buffer recording state and level,
//!  * image layouts, transitioned by barriers and render pass final layouts,
//!  * a call log of submissions, presents, waits, descriptor writes and object lifetimes.
//!
//! Acquire and present results can be scripted to simulate out-of-date swapchains, and the window
//! framebuffer size can be scripted to simulate minimized windows.

use super::*;
use ahash::AHashMap;
use log::*;
use orrery_utils::Counter;
use parking_lot::Mutex;
use std::{collections::VecDeque, num::NonZeroU64, time::Duration};

/// Static properties of the emulated device and surface.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub limits: DeviceLimits,
    pub queue_families: QueueFamilies,
    pub surface_capabilities: SurfaceCapabilities,
    pub surface_formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
    pub framebuffer_size: Extent2D,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits {
                min_uniform_buffer_offset_alignment: 256,
                max_sampler_anisotropy: 16.0,
            },
            queue_families: QueueFamilies {
                graphics: 0,
                present: 0,
                transfer: Some(1),
                graphics_supports_present: true,
            },
            surface_capabilities: SurfaceCapabilities {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: Extent2D::new(1280, 720),
                min_image_extent: Extent2D::new(1, 1),
                max_image_extent: Extent2D::new(8192, 8192),
            },
            surface_formats: vec![
                SurfaceFormat {
                    format: Format::B8G8R8A8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                SurfaceFormat {
                    format: Format::R8G8B8A8Srgb,
                    color_space: ColorSpace::SrgbNonlinear,
                },
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
            framebuffer_size: Extent2D::new(1280, 720),
        }
    }
}

/// An entry of the headless call log.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Create(GpuObject),
    Destroy(GpuObject),
    Acquire {
        swapchain: Swapchain,
        result: GpuResult<u32>,
    },
    Submit {
        queue: QueueKind,
        command_buffers: Vec<CommandBuffer>,
        fence: Option<Fence>,
    },
    Present {
        image_index: u32,
        result: GpuResult,
    },
    DescriptorWrite {
        set: DescriptorSet,
        binding: u32,
        array_element: u32,
    },
    WaitForFences(Vec<Fence>),
    QueueWaitIdle(QueueKind),
    DeviceWaitIdle,
    WaitEvents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordPhase {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
enum Object {
    Buffer {
        desc: BufferDesc,
        data: Vec<u8>,
        mapped: bool,
    },
    Image {
        desc: ImageDesc,
        layout: ImageLayout,
        data: Vec<u8>,
    },
    ImageView {
        image: Image,
    },
    Sampler {
        desc: SamplerDesc,
    },
    Swapchain {
        images: Vec<Image>,
        next_image: u32,
    },
    RenderPass {
        desc: RenderPassDesc,
    },
    Pipeline {
        render_pass: RenderPass,
    },
    Framebuffer {
        attachments: Vec<ImageView>,
    },
    DescriptorPool {
        max_sets: u32,
        allocated: u32,
    },
    DescriptorSet {
        slots: Vec<Option<DescriptorImageInfo>>,
    },
    CommandPool {
        family: u32,
    },
    CommandBuffer {
        pool: CommandPool,
        level: CommandBufferLevel,
        phase: RecordPhase,
        commands: Vec<Command>,
        render_pass_depth: u32,
    },
    Semaphore {
        signalled: bool,
    },
    Fence {
        signalled: bool,
    },
}

/// Fetches an object of a specific variant, returning a tuple of mutable references to the
/// requested fields. Bails out of the enclosing function with [`GpuError::InvalidHandle`] if
/// the handle is dead or refers to another kind of object.
macro_rules! object_fields {
    ($state:expr, $handle:expr, $variant:ident { $($field:ident),* $(,)? }) => {
        match $state.objects.get_mut(&$handle.raw()) {
            Some(Object::$variant { $($field,)* .. }) => ($($field,)*),
            _ => return Err(GpuError::invalid_handle($handle)),
        }
    };
}

struct HeadlessState {
    objects: AHashMap<u64, Object>,
    calls: Vec<DeviceCall>,
    surface_capabilities: SurfaceCapabilities,
    framebuffer_size: Extent2D,
    /// Size the window gets restored to when nothing else is queued.
    restored_size: Extent2D,
    pending_framebuffer_sizes: VecDeque<Extent2D>,
    scripted_acquires: VecDeque<GpuError>,
    scripted_presents: VecDeque<GpuError>,
}

impl HeadlessState {
    fn insert(&mut self, raw: NonZeroU64, object: Object, handle: GpuObject) {
        self.objects.insert(raw.get(), object);
        self.calls.push(DeviceCall::Create(handle));
    }

    fn remove(&mut self, handle: GpuObject) -> Option<Object> {
        let removed = self.objects.remove(&handle.raw());
        match removed {
            Some(_) => self.calls.push(DeviceCall::Destroy(handle)),
            None => warn!(
                "Attempted to destroy a dead {} handle {:#x}",
                handle.kind(),
                handle.raw()
            ),
        }
        removed
    }

    fn set_image_layout(&mut self, image: Image, new_layout: ImageLayout) -> GpuResult {
        let (layout,) = object_fields!(self, image, Image { layout });
        *layout = new_layout;
        ok()
    }

    fn transition(&mut self, barrier: &ImageBarrier) -> GpuResult {
        let (layout,) = object_fields!(self, barrier.image, Image { layout });
        if barrier.old_layout != ImageLayout::Undefined && *layout != barrier.old_layout {
            return Err(GpuError::InvalidUsage(format!(
                "image {:#x} is in layout {:?}, but the barrier expects {:?}",
                barrier.image.raw(),
                layout,
                barrier.old_layout
            )));
        }
        *layout = barrier.new_layout;
        ok()
    }

    fn read_buffer(&mut self, buffer: Buffer, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        let (data,) = object_fields!(self, buffer, Buffer { data });
        let range = byte_range(offset, len, data.len())?;
        Ok(data[range].to_vec())
    }

    fn write_buffer(&mut self, buffer: Buffer, offset: u64, bytes: &[u8]) -> GpuResult {
        let (data,) = object_fields!(self, buffer, Buffer { data });
        let range = byte_range(offset, bytes.len() as u64, data.len())?;
        data[range].copy_from_slice(bytes);
        ok()
    }

    fn image_byte_len(&mut self, image: Image, extent: Extent2D) -> GpuResult<u64> {
        let (desc,) = object_fields!(self, image, Image { desc });
        let texel = desc.format.texel_size().ok_or_else(|| {
            GpuError::InvalidUsage(format!("image {:#x} has no texel size", image.raw()))
        })?;
        Ok(extent.width as u64 * extent.height as u64 * texel)
    }

    fn signal_semaphore(&mut self, semaphore: Semaphore) -> GpuResult {
        let (signalled,) = object_fields!(self, semaphore, Semaphore { signalled });
        if *signalled {
            return Err(GpuError::InvalidUsage(format!(
                "semaphore {:#x} is signalled twice without a wait",
                semaphore.raw()
            )));
        }
        *signalled = true;
        ok()
    }

    fn consume_semaphore(&mut self, semaphore: Semaphore) -> GpuResult {
        let (signalled,) = object_fields!(self, semaphore, Semaphore { signalled });
        if !*signalled {
            return Err(GpuError::InvalidUsage(format!(
                "waiting on semaphore {:#x}, which nothing will signal",
                semaphore.raw()
            )));
        }
        *signalled = false;
        ok()
    }

    /// Replays a command buffer against the emulated memory.
    fn execute(&mut self, buffer: CommandBuffer, expected_level: CommandBufferLevel) -> GpuResult {
        let commands = {
            let (level, phase, commands) =
                object_fields!(self, buffer, CommandBuffer { level, phase, commands });
            if *level != expected_level {
                return Err(GpuError::InvalidUsage(format!(
                    "command buffer {:#x} is {:?}, expected {:?}",
                    buffer.raw(),
                    level,
                    expected_level
                )));
            }
            if *phase != RecordPhase::Executable {
                return Err(GpuError::InvalidUsage(format!(
                    "command buffer {:#x} is not executable ({:?})",
                    buffer.raw(),
                    phase
                )));
            }
            commands.clone()
        };

        let mut active_pass: Option<(RenderPass, Framebuffer)> = None;
        for command in &commands {
            match command {
                Command::BeginRenderPass(begin) => {
                    active_pass = Some((begin.render_pass, begin.framebuffer));
                }
                Command::EndRenderPass => {
                    if let Some((render_pass, framebuffer)) = active_pass.take() {
                        self.apply_final_layout(render_pass, framebuffer)?;
                    }
                }
                Command::ExecuteCommands(secondaries) => {
                    for &secondary in secondaries {
                        self.execute(secondary, CommandBufferLevel::Secondary)?;
                    }
                }
                Command::PipelineBarrier(barrier) => self.transition(barrier)?,
                Command::CopyBuffer { src, dst, region } => {
                    let bytes = self.read_buffer(*src, region.src_offset, region.size)?;
                    self.write_buffer(*dst, region.dst_offset, &bytes)?;
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    region,
                } => {
                    let len = self.image_byte_len(*dst, region.extent)?;
                    let bytes = self.read_buffer(*src, region.buffer_offset, len)?;
                    let (layout, data) = object_fields!(self, *dst, Image { layout, data });
                    if *dst_layout != ImageLayout::TransferDstOptimal || *layout != *dst_layout {
                        return Err(GpuError::InvalidUsage(format!(
                            "buffer to image copy into image {:#x} in layout {:?}",
                            dst.raw(),
                            layout
                        )));
                    }
                    let range = byte_range(0, len, data.len())?;
                    data[range].copy_from_slice(&bytes);
                }
                Command::CopyImageToBuffer {
                    src,
                    src_layout,
                    dst,
                    region,
                } => {
                    let len = self.image_byte_len(*src, region.extent)?;
                    let bytes = {
                        let (layout, data) = object_fields!(self, *src, Image { layout, data });
                        if *layout != *src_layout {
                            return Err(GpuError::InvalidUsage(format!(
                                "image {:#x} is in layout {:?}, copy expects {:?}",
                                src.raw(),
                                layout,
                                src_layout
                            )));
                        }
                        let range = byte_range(0, len, data.len())?;
                        data[range].to_vec()
                    };
                    self.write_buffer(*dst, region.buffer_offset, &bytes)?;
                }
                Command::BindPipeline(_)
                | Command::BindDescriptorSet { .. }
                | Command::DrawIndexed { .. } => {}
            }
        }

        ok()
    }

    fn apply_final_layout(
        &mut self,
        render_pass: RenderPass,
        framebuffer: Framebuffer,
    ) -> GpuResult {
        let final_layout = {
            let (desc,) = object_fields!(self, render_pass, RenderPass { desc });
            desc.final_layout
        };
        let attachments = {
            let (attachments,) = object_fields!(self, framebuffer, Framebuffer { attachments });
            attachments.clone()
        };
        for view in attachments {
            let image = {
                let (image,) = object_fields!(self, view, ImageView { image });
                *image
            };
            self.set_image_layout(image, final_layout)?;
        }
        ok()
    }
}

fn byte_range(offset: u64, len: u64, available: usize) -> GpuResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= available as u64)
        .ok_or_else(|| {
            GpuError::InvalidUsage(format!(
                "byte range {offset}..{} exceeds allocation of {available} bytes",
                offset.saturating_add(len)
            ))
        })?;
    Ok(offset as usize..end as usize)
}

const fn ok() -> GpuResult {
    Ok(())
}

/// See the module docs.
pub struct HeadlessDevice {
    limits: DeviceLimits,
    queue_families: QueueFamilies,
    surface_formats: Vec<SurfaceFormat>,
    present_modes: Vec<PresentMode>,
    handles: Counter,
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Self {
        info!("Creating a headless device");
        Self {
            limits: config.limits,
            queue_families: config.queue_families,
            surface_formats: config.surface_formats,
            present_modes: config.present_modes,
            handles: Counter::new(1),
            state: Mutex::new(HeadlessState {
                objects: AHashMap::new(),
                calls: Vec::new(),
                surface_capabilities: config.surface_capabilities,
                framebuffer_size: config.framebuffer_size,
                restored_size: config.framebuffer_size,
                pending_framebuffer_sizes: VecDeque::new(),
                scripted_acquires: VecDeque::new(),
                scripted_presents: VecDeque::new(),
            }),
        }
    }

    fn next_raw(&self) -> NonZeroU64 {
        NonZeroU64::new(self.handles.next()).expect("handle counter starts at one")
    }

    /// Makes the next acquire fail with `error` instead of returning an image.
    pub fn script_acquire_failure(&self, error: GpuError) {
        self.state.lock().scripted_acquires.push_back(error);
    }

    /// Makes the next present fail with `error`.
    pub fn script_present_failure(&self, error: GpuError) {
        self.state.lock().scripted_presents.push_back(error);
    }

    /// Simulates a window resize: both the framebuffer size and the surface's current extent
    /// change.
    pub fn resize(&self, extent: Extent2D) {
        let mut state = self.state.lock();
        state.framebuffer_size = extent;
        state.surface_capabilities.current_extent = extent;
        if !extent.is_zero() {
            state.restored_size = extent;
        }
    }

    /// Queues framebuffer sizes observed by successive [`WindowSurface::wait_events`] calls.
    pub fn queue_framebuffer_sizes(&self, sizes: impl IntoIterator<Item = Extent2D>) {
        self.state.lock().pending_framebuffer_sizes.extend(sizes);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn submit_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, DeviceCall::Submit { .. }))
            .count()
    }

    /// Counts live objects of a kind, as named by [`GpuObject::kind`].
    pub fn live_count(&self, kind: &str) -> usize {
        let state = self.state.lock();
        state
            .objects
            .values()
            .filter(|object| object_kind(object) == kind)
            .count()
    }

    pub fn image_layout(&self, image: Image) -> Option<ImageLayout> {
        match self.state.lock().objects.get(&image.raw()) {
            Some(Object::Image { layout, .. }) => Some(*layout),
            _ => None,
        }
    }

    pub fn image_data(&self, image: Image) -> Option<Vec<u8>> {
        match self.state.lock().objects.get(&image.raw()) {
            Some(Object::Image { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Raw contents of any buffer, mapped or not. Used for inspection only.
    pub fn buffer_data(&self, buffer: Buffer) -> Option<Vec<u8>> {
        match self.state.lock().objects.get(&buffer.raw()) {
            Some(Object::Buffer { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn buffer_desc(&self, buffer: Buffer) -> Option<BufferDesc> {
        match self.state.lock().objects.get(&buffer.raw()) {
            Some(Object::Buffer { desc, .. }) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn is_mapped(&self, buffer: Buffer) -> bool {
        matches!(
            self.state.lock().objects.get(&buffer.raw()),
            Some(Object::Buffer { mapped: true, .. })
        )
    }

    pub fn descriptor(&self, set: DescriptorSet, element: u32) -> Option<DescriptorImageInfo> {
        match self.state.lock().objects.get(&set.raw()) {
            Some(Object::DescriptorSet { slots }) => slots.get(element as usize).copied().flatten(),
            _ => None,
        }
    }

    pub fn recorded_commands(&self, buffer: CommandBuffer) -> Vec<Command> {
        match self.state.lock().objects.get(&buffer.raw()) {
            Some(Object::CommandBuffer { commands, .. }) => commands.clone(),
            _ => Vec::new(),
        }
    }

    pub fn sampler_desc(&self, sampler: Sampler) -> Option<SamplerDesc> {
        match self.state.lock().objects.get(&sampler.raw()) {
            Some(Object::Sampler { desc }) => Some(*desc),
            _ => None,
        }
    }

    pub fn semaphore_signalled(&self, semaphore: Semaphore) -> Option<bool> {
        match self.state.lock().objects.get(&semaphore.raw()) {
            Some(Object::Semaphore { signalled }) => Some(*signalled),
            _ => None,
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

fn object_kind(object: &Object) -> &'static str {
    match object {
        Object::Buffer { .. } => "Buffer",
        Object::Image { .. } => "Image",
        Object::ImageView { .. } => "ImageView",
        Object::Sampler { .. } => "Sampler",
        Object::Swapchain { .. } => "Swapchain",
        Object::RenderPass { .. } => "RenderPass",
        Object::Pipeline { .. } => "Pipeline",
        Object::Framebuffer { .. } => "Framebuffer",
        Object::DescriptorPool { .. } => "DescriptorPool",
        Object::DescriptorSet { .. } => "DescriptorSet",
        Object::CommandPool { .. } => "CommandPool",
        Object::CommandBuffer { .. } => "CommandBuffer",
        Object::Semaphore { .. } => "Semaphore",
        Object::Fence { .. } => "Fence",
    }
}

impl Device for HeadlessDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    fn surface_capabilities(&self) -> SurfaceCapabilities {
        self.state.lock().surface_capabilities
    }

    fn surface_formats(&self) -> Vec<SurfaceFormat> {
        self.surface_formats.clone()
    }

    fn present_modes(&self) -> Vec<PresentMode> {
        self.present_modes.clone()
    }

    fn is_alive(&self, object: GpuObject) -> bool {
        self.state
            .lock()
            .objects
            .get(&object.raw())
            .map(|live| object_kind(live) == object.kind())
            .unwrap_or(false)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Buffer> {
        if desc.size == 0 {
            return Err(GpuError::InvalidUsage(format!(
                "buffer `{}` has zero size",
                desc.label
            )));
        }
        let raw = self.next_raw();
        let handle = Buffer::from_raw(raw);
        let object = Object::Buffer {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
            mapped: false,
        };
        self.state.lock().insert(raw, object, handle.into());
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        self.state.lock().remove(buffer.into());
    }

    fn map_memory(&self, buffer: Buffer) -> GpuResult {
        let mut state = self.state.lock();
        let (desc, mapped) = object_fields!(state, buffer, Buffer { desc, mapped });
        if !desc.memory.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(GpuError::InvalidUsage(format!(
                "buffer `{}` is not host visible",
                desc.label
            )));
        }
        if *mapped {
            return Err(GpuError::InvalidUsage(format!(
                "buffer `{}` is already mapped",
                desc.label
            )));
        }
        *mapped = true;
        ok()
    }

    fn unmap_memory(&self, buffer: Buffer) {
        let mut state = self.state.lock();
        match state.objects.get_mut(&buffer.raw()) {
            Some(Object::Buffer { mapped, .. }) => *mapped = false,
            _ => warn!("Attempted to unmap a dead buffer {:#x}", buffer.raw()),
        }
    }

    fn write_mapped(&self, buffer: Buffer, offset: u64, data: &[u8]) -> GpuResult {
        let mut state = self.state.lock();
        {
            let (mapped,) = object_fields!(state, buffer, Buffer { mapped });
            if !*mapped {
                return Err(GpuError::InvalidUsage(format!(
                    "writing to unmapped buffer {:#x}",
                    buffer.raw()
                )));
            }
        }
        state.write_buffer(buffer, offset, data)
    }

    fn read_mapped(&self, buffer: Buffer, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        let mut state = self.state.lock();
        {
            let (mapped,) = object_fields!(state, buffer, Buffer { mapped });
            if !*mapped {
                return Err(GpuError::InvalidUsage(format!(
                    "reading from unmapped buffer {:#x}",
                    buffer.raw()
                )));
            }
        }
        state.read_buffer(buffer, offset, len)
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<Image> {
        let texel = desc.format.texel_size().ok_or_else(|| {
            GpuError::InvalidUsage(format!("image `{}` has an undefined format", desc.label))
        })?;
        let raw = self.next_raw();
        let handle = Image::from_raw(raw);
        let size = desc.extent.width as u64 * desc.extent.height as u64 * texel;
        let object = Object::Image {
            desc: desc.clone(),
            layout: ImageLayout::Undefined,
            data: vec![0; size as usize],
        };
        self.state.lock().insert(raw, object, handle.into());
        Ok(handle)
    }

    fn destroy_image(&self, image: Image) {
        self.state.lock().remove(image.into());
    }

    fn create_image_view(&self, image: Image, _format: Format) -> GpuResult<ImageView> {
        let mut state = self.state.lock();
        if !matches!(state.objects.get(&image.raw()), Some(Object::Image { .. })) {
            return Err(GpuError::invalid_handle(image));
        }
        let raw = self.next_raw();
        let handle = ImageView::from_raw(raw);
        state.insert(raw, Object::ImageView { image }, handle.into());
        Ok(handle)
    }

    fn destroy_image_view(&self, view: ImageView) {
        self.state.lock().remove(view.into());
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> GpuResult<Sampler> {
        if desc.anisotropy_enable && desc.max_anisotropy.0 > self.limits.max_sampler_anisotropy {
            return Err(GpuError::InvalidUsage(format!(
                "sampler anisotropy {} exceeds the device limit of {}",
                desc.max_anisotropy, self.limits.max_sampler_anisotropy
            )));
        }
        let raw = self.next_raw();
        let handle = Sampler::from_raw(raw);
        self.state
            .lock()
            .insert(raw, Object::Sampler { desc: *desc }, handle.into());
        Ok(handle)
    }

    fn destroy_sampler(&self, sampler: Sampler) {
        self.state.lock().remove(sampler.into());
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<Swapchain> {
        if desc.extent.is_zero() {
            return Err(GpuError::InvalidUsage(
                "swapchain extent must be non-zero".into(),
            ));
        }
        let mut images = Vec::with_capacity(desc.min_image_count as usize);
        for _ in 0..desc.min_image_count {
            images.push(self.create_image(&ImageDesc {
                label: "swapchain image",
                extent: desc.extent,
                format: desc.surface_format.format,
                usage: desc.usage,
                mip_levels: 1,
                memory: MemoryProperties::DEVICE_LOCAL,
            })?);
        }
        let raw = self.next_raw();
        let handle = Swapchain::from_raw(raw);
        self.state.lock().insert(
            raw,
            Object::Swapchain {
                images,
                next_image: 0,
            },
            handle.into(),
        );
        Ok(handle)
    }

    fn destroy_swapchain(&self, swapchain: Swapchain) {
        let mut state = self.state.lock();
        if let Some(Object::Swapchain { images, .. }) = state.remove(swapchain.into()) {
            for image in images {
                state.remove(image.into());
            }
        }
    }

    fn swapchain_images(&self, swapchain: Swapchain) -> GpuResult<Vec<Image>> {
        let mut state = self.state.lock();
        let (images,) = object_fields!(state, swapchain, Swapchain { images });
        Ok(images.clone())
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GpuResult<RenderPass> {
        let raw = self.next_raw();
        let handle = RenderPass::from_raw(raw);
        self.state
            .lock()
            .insert(raw, Object::RenderPass { desc: *desc }, handle.into());
        Ok(handle)
    }

    fn destroy_render_pass(&self, render_pass: RenderPass) {
        self.state.lock().remove(render_pass.into());
    }

    fn create_pipeline(&self, render_pass: RenderPass) -> GpuResult<Pipeline> {
        let mut state = self.state.lock();
        if !matches!(
            state.objects.get(&render_pass.raw()),
            Some(Object::RenderPass { .. })
        ) {
            return Err(GpuError::invalid_handle(render_pass));
        }
        let raw = self.next_raw();
        let handle = Pipeline::from_raw(raw);
        state.insert(raw, Object::Pipeline { render_pass }, handle.into());
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: Pipeline) {
        self.state.lock().remove(pipeline.into());
    }

    fn create_framebuffer(
        &self,
        render_pass: RenderPass,
        attachments: &[ImageView],
        extent: Extent2D,
    ) -> GpuResult<Framebuffer> {
        let mut state = self.state.lock();
        if !matches!(
            state.objects.get(&render_pass.raw()),
            Some(Object::RenderPass { .. })
        ) {
            return Err(GpuError::invalid_handle(render_pass));
        }
        for &view in attachments {
            if !matches!(state.objects.get(&view.raw()), Some(Object::ImageView { .. })) {
                return Err(GpuError::invalid_handle(view));
            }
        }
        if extent.is_zero() {
            return Err(GpuError::InvalidUsage(
                "framebuffer extent must be non-zero".into(),
            ));
        }
        let raw = self.next_raw();
        let handle = Framebuffer::from_raw(raw);
        state.insert(
            raw,
            Object::Framebuffer {
                attachments: attachments.to_vec(),
            },
            handle.into(),
        );
        Ok(handle)
    }

    fn destroy_framebuffer(&self, framebuffer: Framebuffer) {
        self.state.lock().remove(framebuffer.into());
    }

    fn create_descriptor_pool(&self, max_sets: u32, _max_images: u32) -> GpuResult<DescriptorPool> {
        let raw = self.next_raw();
        let handle = DescriptorPool::from_raw(raw);
        self.state.lock().insert(
            raw,
            Object::DescriptorPool {
                max_sets,
                allocated: 0,
            },
            handle.into(),
        );
        Ok(handle)
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPool) {
        self.state.lock().remove(pool.into());
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPool,
        variable_count: u32,
    ) -> GpuResult<DescriptorSet> {
        let mut state = self.state.lock();
        {
            let (max_sets, allocated) =
                object_fields!(state, pool, DescriptorPool { max_sets, allocated });
            if *allocated >= *max_sets {
                return Err(GpuError::OutOfDeviceMemory);
            }
            *allocated += 1;
        }
        let raw = self.next_raw();
        let handle = DescriptorSet::from_raw(raw);
        state.insert(
            raw,
            Object::DescriptorSet {
                slots: vec![None; variable_count as usize],
            },
            handle.into(),
        );
        Ok(handle)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> GpuResult {
        let mut state = self.state.lock();
        for write in writes {
            {
                let (slots,) = object_fields!(state, write.set, DescriptorSet { slots });
                let slot = slots.get_mut(write.array_element as usize).ok_or_else(|| {
                    GpuError::InvalidUsage(format!(
                        "descriptor array element {} is out of range",
                        write.array_element
                    ))
                })?;
                *slot = Some(write.image);
            }
            state.calls.push(DeviceCall::DescriptorWrite {
                set: write.set,
                binding: write.binding,
                array_element: write.array_element,
            });
        }
        ok()
    }

    fn create_command_pool(
        &self,
        queue_family: u32,
        _flags: CommandPoolFlags,
    ) -> GpuResult<CommandPool> {
        let raw = self.next_raw();
        let handle = CommandPool::from_raw(raw);
        self.state.lock().insert(
            raw,
            Object::CommandPool {
                family: queue_family,
            },
            handle.into(),
        );
        Ok(handle)
    }

    fn destroy_command_pool(&self, pool: CommandPool) {
        let mut state = self.state.lock();
        if state.remove(pool.into()).is_some() {
            // Buffers die along with their pool
            let orphaned: Vec<u64> = state
                .objects
                .iter()
                .filter_map(|(&raw, object)| match object {
                    Object::CommandBuffer { pool: owner, .. } if *owner == pool => Some(raw),
                    _ => None,
                })
                .collect();
            for raw in orphaned {
                state.objects.remove(&raw);
            }
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPool,
        level: CommandBufferLevel,
        count: u32,
    ) -> GpuResult<Vec<CommandBuffer>> {
        let mut state = self.state.lock();
        {
            let (_family,) = object_fields!(state, pool, CommandPool { family });
        }
        let mut result = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = self.next_raw();
            let handle = CommandBuffer::from_raw(raw);
            state.insert(
                raw,
                Object::CommandBuffer {
                    pool,
                    level,
                    phase: RecordPhase::Initial,
                    commands: Vec::new(),
                    render_pass_depth: 0,
                },
                handle.into(),
            );
            result.push(handle);
        }
        Ok(result)
    }

    fn free_command_buffers(&self, _pool: CommandPool, buffers: &[CommandBuffer]) {
        let mut state = self.state.lock();
        for &buffer in buffers {
            state.remove(buffer.into());
        }
    }

    fn begin_command_buffer(
        &self,
        buffer: CommandBuffer,
        _usage: CommandBufferUsage,
        inheritance: Option<&InheritanceInfo>,
    ) -> GpuResult {
        let mut state = self.state.lock();
        let (level, phase, commands, render_pass_depth) = object_fields!(
            state,
            buffer,
            CommandBuffer {
                level,
                phase,
                commands,
                render_pass_depth
            }
        );
        if *phase == RecordPhase::Recording {
            return Err(GpuError::InvalidUsage(format!(
                "command buffer {:#x} is already recording",
                buffer.raw()
            )));
        }
        if *level == CommandBufferLevel::Secondary && inheritance.is_none() {
            return Err(GpuError::InvalidUsage(
                "secondary command buffers need inheritance info".into(),
            ));
        }
        *phase = RecordPhase::Recording;
        *render_pass_depth = 0;
        commands.clear();
        ok()
    }

    fn cmd(&self, buffer: CommandBuffer, command: Command) -> GpuResult {
        let mut state = self.state.lock();
        let (level, phase, commands, render_pass_depth) = object_fields!(
            state,
            buffer,
            CommandBuffer {
                level,
                phase,
                commands,
                render_pass_depth
            }
        );
        if *phase != RecordPhase::Recording {
            return Err(GpuError::InvalidUsage(format!(
                "recording {} into command buffer {:#x}, which isn't recording",
                command.name(),
                buffer.raw()
            )));
        }
        match &command {
            Command::BeginRenderPass(_) if *render_pass_depth > 0 => {
                return Err(GpuError::InvalidUsage("render passes can't nest".into()));
            }
            Command::BeginRenderPass(_) => *render_pass_depth += 1,
            Command::EndRenderPass if *render_pass_depth == 0 => {
                return Err(GpuError::InvalidUsage(
                    "ending a render pass that was never begun".into(),
                ));
            }
            Command::EndRenderPass => *render_pass_depth -= 1,
            Command::ExecuteCommands(_) if *level != CommandBufferLevel::Primary => {
                return Err(GpuError::InvalidUsage(
                    "only primary buffers can execute secondary buffers".into(),
                ));
            }
            _ => {}
        }
        commands.push(command);
        ok()
    }

    fn end_command_buffer(&self, buffer: CommandBuffer) -> GpuResult {
        let mut state = self.state.lock();
        let (phase, render_pass_depth) =
            object_fields!(state, buffer, CommandBuffer { phase, render_pass_depth });
        if *phase != RecordPhase::Recording {
            return Err(GpuError::InvalidUsage(format!(
                "ending command buffer {:#x}, which isn't recording",
                buffer.raw()
            )));
        }
        if *render_pass_depth != 0 {
            return Err(GpuError::InvalidUsage(
                "command buffer ended inside a render pass".into(),
            ));
        }
        *phase = RecordPhase::Executable;
        ok()
    }

    fn reset_command_buffer(&self, buffer: CommandBuffer) -> GpuResult {
        let mut state = self.state.lock();
        let (phase, commands, render_pass_depth) = object_fields!(
            state,
            buffer,
            CommandBuffer {
                phase,
                commands,
                render_pass_depth
            }
        );
        *phase = RecordPhase::Initial;
        *render_pass_depth = 0;
        commands.clear();
        ok()
    }

    fn create_semaphore(&self) -> GpuResult<Semaphore> {
        let raw = self.next_raw();
        let handle = Semaphore::from_raw(raw);
        self.state
            .lock()
            .insert(raw, Object::Semaphore { signalled: false }, handle.into());
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: Semaphore) {
        self.state.lock().remove(semaphore.into());
    }

    fn create_fence(&self, signalled: bool) -> GpuResult<Fence> {
        let raw = self.next_raw();
        let handle = Fence::from_raw(raw);
        self.state
            .lock()
            .insert(raw, Object::Fence { signalled }, handle.into());
        Ok(handle)
    }

    fn destroy_fence(&self, fence: Fence) {
        self.state.lock().remove(fence.into());
    }

    fn wait_for_fences(&self, fences: &[Fence], timeout: Option<Duration>) -> GpuResult {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitForFences(fences.to_vec()));
        for &fence in fences {
            let (signalled,) = object_fields!(state, fence, Fence { signalled });
            if !*signalled {
                // Submissions complete immediately, so an unsignalled fence will stay that way
                return match timeout {
                    Some(_) => Err(GpuError::Timeout),
                    None => Err(GpuError::InvalidUsage(format!(
                        "waiting forever on fence {:#x}, which nothing will signal",
                        fence.raw()
                    ))),
                };
            }
        }
        ok()
    }

    fn reset_fences(&self, fences: &[Fence]) -> GpuResult {
        let mut state = self.state.lock();
        for &fence in fences {
            let (signalled,) = object_fields!(state, fence, Fence { signalled });
            *signalled = false;
        }
        ok()
    }

    fn fence_signalled(&self, fence: Fence) -> GpuResult<bool> {
        let mut state = self.state.lock();
        let (signalled,) = object_fields!(state, fence, Fence { signalled });
        Ok(*signalled)
    }

    fn acquire_next_image(
        &self,
        swapchain: Swapchain,
        _timeout: Option<Duration>,
        signal: Semaphore,
    ) -> GpuResult<u32> {
        let mut state = self.state.lock();
        if let Some(error) = state.scripted_acquires.pop_front() {
            state.calls.push(DeviceCall::Acquire {
                swapchain,
                result: Err(error.clone()),
            });
            return Err(error);
        }

        let index = {
            let (images, next_image) =
                object_fields!(state, swapchain, Swapchain { images, next_image });
            let index = *next_image;
            *next_image = (index + 1) % images.len().max(1) as u32;
            index
        };
        state.signal_semaphore(signal)?;
        state.calls.push(DeviceCall::Acquire {
            swapchain,
            result: Ok(index),
        });
        Ok(index)
    }

    fn queue_submit(
        &self,
        queue: QueueKind,
        submits: &[SubmitInfo],
        fence: Option<Fence>,
    ) -> GpuResult {
        let mut state = self.state.lock();
        if let Some(fence) = fence {
            let (signalled,) = object_fields!(state, fence, Fence { signalled });
            if *signalled {
                return Err(GpuError::InvalidUsage(format!(
                    "submitting with fence {:#x}, which is still signalled",
                    fence.raw()
                )));
            }
        }

        let mut submitted = Vec::new();
        for submit in submits {
            for &(semaphore, _) in &submit.wait {
                state.consume_semaphore(semaphore)?;
            }
            for &buffer in &submit.command_buffers {
                state.execute(buffer, CommandBufferLevel::Primary)?;
                submitted.push(buffer);
            }
            for &semaphore in &submit.signal {
                state.signal_semaphore(semaphore)?;
            }
        }

        if let Some(fence) = fence {
            let (signalled,) = object_fields!(state, fence, Fence { signalled });
            *signalled = true;
        }

        state.calls.push(DeviceCall::Submit {
            queue,
            command_buffers: submitted,
            fence,
        });
        ok()
    }

    fn queue_present(&self, info: &PresentInfo) -> GpuResult {
        let mut state = self.state.lock();
        for &semaphore in &info.wait {
            state.consume_semaphore(semaphore)?;
        }

        if let Some(error) = state.scripted_presents.pop_front() {
            state.calls.push(DeviceCall::Present {
                image_index: info.image_index,
                result: Err(error.clone()),
            });
            return Err(error);
        }

        let image = {
            let (images,) = object_fields!(state, info.swapchain, Swapchain { images });
            *images.get(info.image_index as usize).ok_or_else(|| {
                GpuError::InvalidUsage(format!(
                    "presenting image index {} out of range",
                    info.image_index
                ))
            })?
        };
        let (layout,) = object_fields!(state, image, Image { layout });
        if *layout != ImageLayout::PresentSrc {
            return Err(GpuError::InvalidUsage(format!(
                "presenting image {} in layout {:?}",
                info.image_index, layout
            )));
        }

        state.calls.push(DeviceCall::Present {
            image_index: info.image_index,
            result: Ok(()),
        });
        ok()
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> GpuResult {
        self.state.lock().calls.push(DeviceCall::QueueWaitIdle(queue));
        ok()
    }

    fn device_wait_idle(&self) -> GpuResult {
        self.state.lock().calls.push(DeviceCall::DeviceWaitIdle);
        ok()
    }
}

impl WindowSurface for HeadlessDevice {
    fn framebuffer_size(&self) -> Extent2D {
        self.state.lock().framebuffer_size
    }

    fn wait_events(&self) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitEvents);
        let size = match state.pending_framebuffer_sizes.pop_front() {
            Some(size) => size,
            None if state.framebuffer_size.is_zero() => {
                // Nothing scripted would ever wake us up, so pretend the window got restored
                warn!("Headless window has no pending events, restoring its last size");
                state.restored_size
            }
            None => return,
        };
        state.framebuffer_size = size;
        state.surface_capabilities.current_extent = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordered_float::OrderedFloat;

    fn staging_desc(size: u64) -> BufferDesc {
        BufferDesc {
            label: "test",
            size,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            memory: MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            sharing: SharingMode::Exclusive,
        }
    }

    #[test]
    pub fn submitted_copies_are_replayed() {
        let device = HeadlessDevice::default();
        let src = device.create_buffer(&staging_desc(4)).unwrap();
        let dst = device.create_buffer(&staging_desc(4)).unwrap();
        device.map_memory(src).unwrap();
        device.write_mapped(src, 0, &[9, 8, 7, 6]).unwrap();

        let pool = device
            .create_command_pool(0, CommandPoolFlags::TRANSIENT)
            .unwrap();
        let cb = device
            .allocate_command_buffers(pool, CommandBufferLevel::Primary, 1)
            .unwrap()[0];
        device
            .begin_command_buffer(cb, CommandBufferUsage::ONE_TIME_SUBMIT, None)
            .unwrap();
        device
            .cmd(
                cb,
                Command::CopyBuffer {
                    src,
                    dst,
                    region: BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: 4,
                    },
                },
            )
            .unwrap();
        device.end_command_buffer(cb).unwrap();

        let fence = device.create_fence(false).unwrap();
        device
            .queue_submit(QueueKind::Transfer, &[single_submit(None, cb, None)], Some(fence))
            .unwrap();

        assert!(device.fence_signalled(fence).unwrap());
        assert_eq!(device.buffer_data(dst).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    pub fn unsignalled_waits_are_errors() {
        let device = HeadlessDevice::default();
        let fence = device.create_fence(false).unwrap();
        assert!(device.wait_for_fences(&[fence], None).is_err());
        assert_eq!(
            device.wait_for_fences(&[fence], Some(Duration::from_millis(1))),
            Err(GpuError::Timeout)
        );

        let signalled = device.create_fence(true).unwrap();
        assert!(device.wait_for_fences(&[signalled], None).is_ok());
    }

    #[test]
    pub fn recording_state_is_enforced() {
        let device = HeadlessDevice::default();
        let pool = device
            .create_command_pool(0, CommandPoolFlags::RESET_COMMAND_BUFFER)
            .unwrap();
        let cb = device
            .allocate_command_buffers(pool, CommandBufferLevel::Primary, 1)
            .unwrap()[0];

        assert!(device.cmd(cb, Command::EndRenderPass).is_err());
        device
            .begin_command_buffer(cb, CommandBufferUsage::empty(), None)
            .unwrap();
        assert!(device.cmd(cb, Command::EndRenderPass).is_err());
        device.end_command_buffer(cb).unwrap();

        // A secondary can't be submitted directly
        let secondary = device
            .allocate_command_buffers(pool, CommandBufferLevel::Secondary, 1)
            .unwrap()[0];
        device
            .begin_command_buffer(
                secondary,
                CommandBufferUsage::empty(),
                Some(&InheritanceInfo::default()),
            )
            .unwrap();
        device.end_command_buffer(secondary).unwrap();
        assert!(device
            .queue_submit(QueueKind::Graphics, &[single_submit(None, secondary, None)], None)
            .is_err());
    }

    #[test]
    pub fn destroyed_objects_are_dead() {
        let device = HeadlessDevice::default();
        let sampler = device
            .create_sampler(&SamplerDesc {
                mag_filter: Filter::Linear,
                min_filter: Filter::Linear,
                address_mode_u: SamplerAddressMode::Repeat,
                address_mode_v: SamplerAddressMode::Repeat,
                address_mode_w: SamplerAddressMode::Repeat,
                border_color: BorderColor::IntOpaqueBlack,
                anisotropy_enable: false,
                max_anisotropy: OrderedFloat(1.0),
                unnormalized_coordinates: false,
                compare_enable: false,
                compare_op: CompareOp::Always,
                mipmap_mode: SamplerMipmapMode::Linear,
                mip_lod_bias: OrderedFloat(0.0),
                min_lod: OrderedFloat(0.0),
                max_lod: OrderedFloat(0.0),
            })
            .unwrap();

        assert!(device.is_alive(sampler.into()));
        device.destroy_sampler(sampler);
        assert!(!device.is_alive(sampler.into()));
        assert_eq!(device.live_count("Sampler"), 0);
    }

    #[test]
    pub fn minimized_window_waits_for_queued_sizes() {
        let device = HeadlessDevice::default();
        device.resize(Extent2D::new(0, 0));
        device.queue_framebuffer_sizes([Extent2D::new(0, 0), Extent2D::new(640, 480)]);

        device.wait_events();
        assert!(device.framebuffer_size().is_zero());
        device.wait_events();
        assert_eq!(device.framebuffer_size(), Extent2D::new(640, 480));
        assert_eq!(
            device.surface_capabilities().current_extent,
            Extent2D::new(640, 480)
        );

        device.resize(Extent2D::new(0, 0));
        device.wait_events();
        assert_eq!(device.framebuffer_size(), Extent2D::new(1280, 720));
    }
}

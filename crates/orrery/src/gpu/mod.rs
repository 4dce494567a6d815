//! The GPU API boundary
//!
//! Orrery talks to the graphics API exclusively through the [`Device`] trait (and the
//! [`WindowSurface`] trait for the handful of window queries the swapchain needs). Every object the
//! API creates is referred to by a small copyable handle, and every command recorded into a command
//! buffer is a variant of [`Command`].
//!
//! The model follows a Vulkan 1.2 class API: explicit queues, binary semaphores, fences, primary
//! and secondary command buffers, render passes with subpass contents, and image layouts that must
//! be transitioned with pipeline barriers.
//!
//! ## Backends
//! The only backend shipped right now is [`headless::HeadlessDevice`], which backs buffers and
//! images with host memory and executes submitted command buffers immediately. It's used by the
//! main binary and by every test in this crate.

use std::time::Duration;
use thiserror::Error;

pub mod headless;

#[doc(inline)]
pub use handles::*;
mod handles;

#[doc(inline)]
pub use types::*;
mod types;

#[doc(inline)]
pub use command::*;
mod command;

pub type GpuResult<T = ()> = Result<T, GpuError>;

/// Errors surfaced by the graphics API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    #[error("the logical device was lost")]
    DeviceLost,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("the swapchain is out of date")]
    SwapchainOutOfDate,
    #[error("the swapchain is suboptimal for the surface")]
    SwapchainSuboptimal,
    #[error("no GPU meets the minimum requirements: {0}")]
    IncompatibleDevice(String),
    #[error("timed out waiting for the device")]
    Timeout,
    #[error("invalid {kind} handle {raw:#x}")]
    InvalidHandle { kind: &'static str, raw: u64 },
    #[error("invalid API usage: {0}")]
    InvalidUsage(String),
}

impl GpuError {
    /// Returns true for the two results that mean "recreate the swapchain and move on".
    pub fn is_stale_swapchain(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate | Self::SwapchainSuboptimal)
    }

    pub(crate) fn invalid_handle(object: impl Into<GpuObject>) -> Self {
        let object = object.into();
        Self::InvalidHandle {
            kind: object.kind(),
            raw: object.raw(),
        }
    }
}

/// A logical device together with its queues and the surface it presents to.
///
/// All functions take `&self`; implementations synchronize internally, as the device is shared
/// between the main thread and worker threads recording secondary command buffers. Queue
/// submission, presentation and swapchain-class object management are main thread only by
/// convention.
pub trait Device: Send + Sync {
    fn limits(&self) -> DeviceLimits;
    fn queue_families(&self) -> QueueFamilies;
    fn surface_capabilities(&self) -> SurfaceCapabilities;
    fn surface_formats(&self) -> Vec<SurfaceFormat>;
    fn present_modes(&self) -> Vec<PresentMode>;

    /// Checks whether the object was created by this device and not yet destroyed.
    fn is_alive(&self, object: GpuObject) -> bool;

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Buffer>;
    fn destroy_buffer(&self, buffer: Buffer);
    /// Maps a host-visible buffer. The mapping stays valid until [`Device::unmap_memory`].
    fn map_memory(&self, buffer: Buffer) -> GpuResult;
    fn unmap_memory(&self, buffer: Buffer);
    /// Writes into a mapped buffer at a byte offset.
    fn write_mapped(&self, buffer: Buffer, offset: u64, data: &[u8]) -> GpuResult;
    /// Reads back from a mapped buffer.
    fn read_mapped(&self, buffer: Buffer, offset: u64, len: u64) -> GpuResult<Vec<u8>>;

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<Image>;
    fn destroy_image(&self, image: Image);
    fn create_image_view(&self, image: Image, format: Format) -> GpuResult<ImageView>;
    fn destroy_image_view(&self, view: ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> GpuResult<Sampler>;
    fn destroy_sampler(&self, sampler: Sampler);

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<Swapchain>;
    fn destroy_swapchain(&self, swapchain: Swapchain);
    fn swapchain_images(&self, swapchain: Swapchain) -> GpuResult<Vec<Image>>;

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GpuResult<RenderPass>;
    fn destroy_render_pass(&self, render_pass: RenderPass);
    fn create_pipeline(&self, render_pass: RenderPass) -> GpuResult<Pipeline>;
    fn destroy_pipeline(&self, pipeline: Pipeline);
    fn create_framebuffer(
        &self,
        render_pass: RenderPass,
        attachments: &[ImageView],
        extent: Extent2D,
    ) -> GpuResult<Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: Framebuffer);

    fn create_descriptor_pool(&self, max_sets: u32, max_images: u32) -> GpuResult<DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPool);
    /// Allocates a descriptor set with a variable-count image array of `variable_count` slots.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPool,
        variable_count: u32,
    ) -> GpuResult<DescriptorSet>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> GpuResult;

    fn create_command_pool(&self, queue_family: u32, flags: CommandPoolFlags)
        -> GpuResult<CommandPool>;
    fn destroy_command_pool(&self, pool: CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: CommandPool,
        level: CommandBufferLevel,
        count: u32,
    ) -> GpuResult<Vec<CommandBuffer>>;
    fn free_command_buffers(&self, pool: CommandPool, buffers: &[CommandBuffer]);
    fn begin_command_buffer(
        &self,
        buffer: CommandBuffer,
        usage: CommandBufferUsage,
        inheritance: Option<&InheritanceInfo>,
    ) -> GpuResult;
    /// Records a single command.
    fn cmd(&self, buffer: CommandBuffer, command: Command) -> GpuResult;
    fn end_command_buffer(&self, buffer: CommandBuffer) -> GpuResult;
    fn reset_command_buffer(&self, buffer: CommandBuffer) -> GpuResult;

    fn create_semaphore(&self) -> GpuResult<Semaphore>;
    fn destroy_semaphore(&self, semaphore: Semaphore);
    fn create_fence(&self, signalled: bool) -> GpuResult<Fence>;
    fn destroy_fence(&self, fence: Fence);
    /// Waits until all fences are signalled. `None` means no timeout.
    fn wait_for_fences(&self, fences: &[Fence], timeout: Option<Duration>) -> GpuResult;
    fn reset_fences(&self, fences: &[Fence]) -> GpuResult;
    fn fence_signalled(&self, fence: Fence) -> GpuResult<bool>;

    /// Acquires the next presentable image, signalling `signal` once it's ready for rendering.
    fn acquire_next_image(
        &self,
        swapchain: Swapchain,
        timeout: Option<Duration>,
        signal: Semaphore,
    ) -> GpuResult<u32>;
    fn queue_submit(&self, queue: QueueKind, submits: &[SubmitInfo], fence: Option<Fence>)
        -> GpuResult;
    fn queue_present(&self, info: &PresentInfo) -> GpuResult;
    fn queue_wait_idle(&self, queue: QueueKind) -> GpuResult;
    fn device_wait_idle(&self) -> GpuResult;
}

/// The window side of the presentation surface.
pub trait WindowSurface: Send + Sync {
    /// Current framebuffer size in pixels. Either component is zero while the window is minimized.
    fn framebuffer_size(&self) -> Extent2D;
    /// Blocks until the windowing system delivers new events.
    fn wait_events(&self);
}

use super::{
    CommandBuffer, DescriptorSet, Framebuffer, Image, ImageView, RenderPass, Sampler, Semaphore,
    Swapchain,
};
use bitflags::bitflags;
use ordered_float::OrderedFloat;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Undefined,
    R8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R16G16B16A16Sfloat,
    D32Sfloat,
}

impl Format {
    /// Size of a single texel, or [`None`] for [`Format::Undefined`].
    pub const fn texel_size(self) -> Option<u64> {
        match self {
            Self::Undefined => None,
            Self::R8Unorm => Some(1),
            Self::R8G8B8A8Unorm | Self::R8G8B8A8Srgb => Some(4),
            Self::B8G8R8A8Unorm | Self::B8G8R8A8Srgb => Some(4),
            Self::R16G16B16A16Sfloat => Some(8),
            Self::D32Sfloat => Some(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    SrgbNonlinear,
    ExtendedSrgbLinear,
    Hdr10St2084,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub format: Format,
    pub color_space: ColorSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    /// Surfaces report this as their current extent when the window decides the size instead.
    pub const UNDEFINED: Self = Self::new(u32::MAX, u32::MAX);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect_ratio(self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means there's no upper limit.
    pub max_image_count: u32,
    pub current_extent: Extent2D,
    pub min_image_extent: Extent2D,
    pub max_image_extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_sampler_anisotropy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    /// A dedicated transfer family, if the device exposes one.
    pub transfer: Option<u32>,
    pub graphics_supports_present: bool,
}

impl QueueFamilies {
    /// Family index backing a queue kind. Transfer work falls back to the graphics family.
    pub fn family_of(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Graphics => self.graphics,
            QueueKind::Present => self.present,
            QueueKind::Transfer => self.transfer.unwrap_or(self.graphics),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Present,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharingMode {
    Exclusive,
    /// Shared between the listed queue families.
    Concurrent(SmallVec<[u32; 3]>),
}

bitflags! {
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const VERTEX = 1 << 3;
        const INDEX = 1 << 4;
        const STORAGE = 1 << 5;
    }
}

bitflags! {
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
    }
}

bitflags! {
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const COLOR_ATTACHMENT = 1 << 3;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const TRANSFER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 3;
        const BOTTOM_OF_PIPE = 1 << 4;
    }
}

bitflags! {
    pub struct AccessFlags: u32 {
        const TRANSFER_READ = 1 << 0;
        const TRANSFER_WRITE = 1 << 1;
        const SHADER_READ = 1 << 2;
        const COLOR_ATTACHMENT_WRITE = 1 << 3;
        const MEMORY_READ = 1 << 4;
    }
}

bitflags! {
    pub struct CommandBufferUsage: u32 {
        const ONE_TIME_SUBMIT = 1 << 0;
        const RENDER_PASS_CONTINUE = 1 << 1;
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

bitflags! {
    pub struct CommandPoolFlags: u32 {
        const TRANSIENT = 1 << 0;
        const RESET_COMMAND_BUFFER = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferSrcOptimal,
    TransferDstOptimal,
    ShaderReadOnlyOptimal,
    ColorAttachmentOptimal,
    DepthAttachmentOptimal,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubpassContents {
    Inline,
    SecondaryCommandBuffers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryProperties,
    pub sharing: SharingMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: &'static str,
    pub extent: Extent2D,
    pub format: Format,
    pub usage: ImageUsage,
    pub mip_levels: u32,
    pub memory: MemoryProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorderColor {
    FloatTransparentBlack,
    IntTransparentBlack,
    FloatOpaqueBlack,
    IntOpaqueBlack,
    FloatOpaqueWhite,
    IntOpaqueWhite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

/// Sampler creation parameters. Equality and hashing are structural, float fields included,
/// which lets equivalent descriptors share one sampler object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub border_color: BorderColor,
    pub anisotropy_enable: bool,
    pub max_anisotropy: OrderedFloat<f32>,
    pub unnormalized_coordinates: bool,
    pub compare_enable: bool,
    pub compare_op: CompareOp,
    pub mipmap_mode: SamplerMipmapMode,
    pub mip_lod_bias: OrderedFloat<f32>,
    pub min_lod: OrderedFloat<f32>,
    pub max_lod: OrderedFloat<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub surface_format: SurfaceFormat,
    pub extent: Extent2D,
    pub present_mode: PresentMode,
    pub usage: ImageUsage,
    pub sharing: SharingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub label: &'static str,
    pub color_format: Format,
    /// Layout color attachments are left in when the pass ends.
    pub final_layout: ImageLayout,
}

/// State inherited by a secondary command buffer executed inside a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InheritanceInfo {
    pub render_pass: Option<RenderPass>,
    pub subpass: u32,
    pub framebuffer: Option<Framebuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorImageInfo {
    pub sampler: Sampler,
    pub image_view: ImageView,
    pub layout: ImageLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub image: DescriptorImageInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitInfo {
    pub wait: Vec<(Semaphore, PipelineStages)>,
    pub command_buffers: Vec<CommandBuffer>,
    pub signal: Vec<Semaphore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentInfo {
    pub wait: Vec<Semaphore>,
    pub swapchain: Swapchain,
    pub image_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: Image,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassBegin {
    pub render_pass: RenderPass,
    pub framebuffer: Framebuffer,
    pub extent: Extent2D,
    pub clear_color: [f32; 4],
    pub contents: SubpassContents,
}

/// Convenience for code that only deals with one buffer at a time.
pub fn single_submit(
    wait: Option<(Semaphore, PipelineStages)>,
    command_buffer: CommandBuffer,
    signal: Option<Semaphore>,
) -> SubmitInfo {
    SubmitInfo {
        wait: wait.into_iter().collect(),
        command_buffers: vec![command_buffer],
        signal: signal.into_iter().collect(),
    }
}

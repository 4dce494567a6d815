//! Events exchanged between the core and its collaborators

use super::Event;
use crate::gpu::{
    CommandBuffer, DescriptorSet, Extent2D, Framebuffer, Image, ImageLayout, ImageView, Pipeline,
    RenderPass, Sampler,
};
use crate::render::Vertex;
use bitflags::bitflags;
use glam::DVec3;
use std::path::PathBuf;

bitflags! {
    /// One bit per event type, see [`Event::FLAG`].
    pub struct EventFlags: u64 {
        const INIT_SWAPCHAIN_MANAGER = 1 << 0;
        const SWAPCHAIN_RECREATED = 1 << 1;
        const INIT_OFFSCREEN_PIPELINE = 1 << 2;
        const INIT_PRESENT_PIPELINE = 1 << 3;
        const OFFSCREEN_RESOURCES_RECREATED = 1 << 4;
        const UPDATE_SESSION_STATUS = 1 << 5;
        const UPDATE_VIEWPORT_SIZE = 1 << 6;
        const UPDATE_RENDERABLES = 1 << 7;
        const UPDATE_UBOS = 1 << 8;
        const REQUEST_INIT_SESSION = 1 << 9;
        const PROCESS_SECONDARY_COMMAND_BUFFERS = 1 << 10;
        const REGISTRY_RESET = 1 << 11;
        const SCENE_LOAD_PROGRESS = 1 << 12;
        const SCENE_LOAD_COMPLETE = 1 << 13;
        const GEOMETRY_INITIALIZED = 1 << 14;
        const BUFFER_MANAGER_IS_VALID = 1 << 15;
    }
}

macro_rules! impl_event {
    ($($name:ident => $flag:ident),* $(,)?) => {
        $(
            impl Event for $name {
                const FLAG: EventFlags = EventFlags::$flag;
            }
        )*
    };
}

impl_event! {
    InitSwapchainManager => INIT_SWAPCHAIN_MANAGER,
    SwapchainRecreated => SWAPCHAIN_RECREATED,
    InitOffscreenPipeline => INIT_OFFSCREEN_PIPELINE,
    InitPresentPipeline => INIT_PRESENT_PIPELINE,
    OffscreenResourcesRecreated => OFFSCREEN_RESOURCES_RECREATED,
    UpdateSessionStatus => UPDATE_SESSION_STATUS,
    UpdateViewportSize => UPDATE_VIEWPORT_SIZE,
    UpdateRenderables => UPDATE_RENDERABLES,
    UpdateUbos => UPDATE_UBOS,
    RequestInitSession => REQUEST_INIT_SESSION,
    ProcessSecondaryCommandBuffers => PROCESS_SECONDARY_COMMAND_BUFFERS,
    RegistryReset => REGISTRY_RESET,
    SceneLoadProgress => SCENE_LOAD_PROGRESS,
    SceneLoadComplete => SCENE_LOAD_COMPLETE,
    GeometryInitialized => GEOMETRY_INITIALIZED,
    BufferManagerIsValid => BUFFER_MANAGER_IS_VALID,
}

/// The swapchain manager finished its initial setup.
#[derive(Debug, Clone, Default)]
pub struct InitSwapchainManager;

#[derive(Debug, Clone)]
pub struct SwapchainRecreated {
    pub extent: Extent2D,
    /// Current layout of each swapchain image, all [`ImageLayout::Undefined`] after recreation.
    pub image_layouts: Vec<ImageLayout>,
    pub framebuffers: Vec<Framebuffer>,
}

/// The offscreen pipeline is ready. Resources that depend on it (the texture array descriptor set
/// in particular) can be written from now on.
#[derive(Debug, Clone)]
pub struct InitOffscreenPipeline {
    pub render_pass: RenderPass,
    pub pipeline: Pipeline,
    pub offscreen_images: Vec<Image>,
    pub offscreen_image_views: Vec<ImageView>,
    pub offscreen_samplers: Vec<Sampler>,
    pub framebuffers: Vec<Framebuffer>,
    pub tex_array_descriptor_set: DescriptorSet,
}

#[derive(Debug, Clone)]
pub struct InitPresentPipeline {
    pub render_pass: RenderPass,
}

#[derive(Debug, Clone)]
pub struct OffscreenResourcesRecreated {
    pub image_views: Vec<ImageView>,
    pub samplers: Vec<Sampler>,
    pub framebuffers: Vec<Framebuffer>,
}

/// Stages of the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionStatus {
    PrepareForReset = 0,
    Reset = 1,
    PrepareForInit = 2,
    Initialized = 3,
    PostInitialization = 4,
}

impl SessionStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::PrepareForReset,
            1 => Self::Reset,
            2 => Self::PrepareForInit,
            3 => Self::Initialized,
            4 => Self::PostInitialization,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateSessionStatus {
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateViewportSize {
    pub extent: Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderableKind {
    Gui,
    Mesh,
}

/// Asks subscribers to record their draws of the given kind into `command_buffer`, which is
/// currently inside a render pass.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRenderables {
    pub kind: RenderableKind,
    pub command_buffer: CommandBuffer,
    pub current_frame: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateUbos {
    pub current_frame: usize,
    pub render_origin: DVec3,
}

#[derive(Debug, Clone)]
pub struct RequestInitSession {
    pub config_path: PathBuf,
}

/// Where a batch of secondary command buffers gets executed in the next primary recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecondaryStage {
    /// Outside of any render pass, before the offscreen pass.
    None = 0,
    Offscreen = 1,
    Present = 2,
}

#[derive(Debug, Clone)]
pub struct ProcessSecondaryCommandBuffers {
    pub stage: SecondaryStage,
    pub buffers: Vec<CommandBuffer>,
}

/// The registry was cleared and its sentinel entities recreated.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryReset;

#[derive(Debug, Clone, Copy)]
pub struct SceneLoadProgress {
    pub loaded: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SceneLoadComplete {
    pub entity_count: usize,
}

/// Global scene geometry is available. `renderable_count` sizes the object uniform buffers.
#[derive(Debug, Clone)]
pub struct GeometryInitialized {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub renderable_count: u32,
}

/// The buffer manager finished (re)creating its global buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferManagerIsValid;

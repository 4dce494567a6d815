//! The Orrery frame pipeline
//!
//! Each frame, registry state flows through the managers in this module:
//!  1. the [`BufferManager`] packs the global and per-object uniform buffers,
//!  2. the [`CommandManager`] records the primary command buffer, pulling in secondary buffers
//!     recorded by other threads and the textures published by the [`TextureRegistry`],
//!  3. the [`SyncManager`]'s fences and semaphores gate submission and presentation,
//!  4. the [`SwapchainManager`] presents, and recreates itself when the surface changes.
//!
//! The [`Renderer`] drives all of the above, see [`Renderer::draw_frame`].
//!
//! ## Object lifetimes
//! Managers never destroy GPU objects themselves. Everything they create is registered with the
//! [`crate::gc::GarbageCollector`], and released when the cleanup stack is processed at shutdown
//! (or earlier, through a specific cleanup task, when a resource is recreated).

use crate::{ecs::EcsError, events::EventError, gc::GcError, gpu::GpuError, gpu::ImageLayout};
use std::path::PathBuf;
use thiserror::Error;

pub mod geometry;

#[doc(inline)]
pub use context::*;
mod context;

#[doc(inline)]
pub use ubo::*;
mod ubo;

#[doc(inline)]
pub use camera::*;
mod camera;

#[doc(inline)]
pub use frame_timing::*;
mod frame_timing;

#[doc(inline)]
pub use sync::*;
mod sync;

#[doc(inline)]
pub use command::*;
mod command;

#[doc(inline)]
pub use buffer::*;
mod buffer;

#[doc(inline)]
pub use texture::*;
mod texture;

#[doc(inline)]
pub use swapchain::*;
mod swapchain;

#[doc(inline)]
pub use renderer::*;
mod renderer;

/// Amount of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Capacity of the bindless texture array.
pub const MAX_TEXTURES: u32 = 128;

/// Meters per render space unit.
pub const SIMULATION_SCALE: f64 = 1e6;

pub type RenderResult<T = ()> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("object UBO index {index} is out of range ({total} renderables)")]
    UboIndexOutOfRange { index: u32, total: u32 },
    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition { old: ImageLayout, new: ImageLayout },
    #[error("couldn't load texture `{}`: {reason}", .path.display())]
    TextureLoadFailed { path: PathBuf, reason: String },
    #[error("texture `{}` has an unsupported file format", .0.display())]
    UnsupportedTextureFormat(PathBuf),
    #[error("the texture array is full ({0} slots)")]
    TextureArrayFull(u32),
    #[error("present stage secondary buffers can't be mixed with inline GUI draws")]
    MixedPresentContents,
    #[error("{0} isn't initialized yet")]
    NotInitialized(&'static str),
    #[error("invalid single-use command buffer configuration: {0}")]
    InvalidSingleUseConfig(#[from] SingleUseConfigBuilderError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Ecs(#[from] EcsError),
    #[error(transparent)]
    Gc(#[from] GcError),
    #[error(transparent)]
    Event(#[from] EventError),
}

impl RenderError {
    /// Checks whether the error is a recoverable out of date/suboptimal swapchain.
    pub fn is_stale_swapchain(&self) -> bool {
        matches!(self, Self::Gpu(error) if error.is_stale_swapchain())
    }
}

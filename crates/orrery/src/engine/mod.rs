//! Engine bootstrap and the session lifecycle
//!
//! [`Engine::start`] wires every subsystem together on the calling thread, which becomes the
//! main thread: the only one that submits work, presents and manages swapchain-class objects.
//! Worker threads (texture loading, in particular) only record secondary command buffers and
//! hand them over through the event dispatcher.
//!
//! State shared by all subsystems lives in [`AppState`], a handful of atomics reachable from every
//! [`RenderContext`].

use crate::{
    config::EngineConfig,
    ecs::Registry,
    events::{RequestInitSession, SessionStatus},
    gpu::{Device, Format, WindowSurface},
    render::{FrameOutcome, RenderContext, Renderer},
};
use anyhow::bail;
use log::*;
use orrery_utils::{plural, AnyResult};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

#[doc(inline)]
pub use session::*;
mod session;

#[doc(inline)]
pub use targets::*;
mod targets;

/// Flags shared by every subsystem.
pub struct AppState {
    /// See: [`Self::request_shutdown`]
    should_run: AtomicBool,
    /// Set for the duration of a swapchain recreation. Primary buffers recorded meanwhile stay
    /// empty.
    swapchain_recreating: AtomicBool,
    session_status: AtomicU8,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            should_run: AtomicBool::new(true),
            swapchain_recreating: AtomicBool::new(false),
            session_status: AtomicU8::new(SessionStatus::Reset as u8),
        }
    }
}

impl AppState {
    /// Tells [`Engine::run`] to stop after the current frame.
    pub fn request_shutdown(&self) {
        trace!(
            "Thread `{}` requesting shutdown",
            thread::current().name().unwrap_or("(no name)")
        );
        self.should_run.store(false, Ordering::Release);
    }

    pub fn should_run(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    pub fn swapchain_recreating(&self) -> bool {
        self.swapchain_recreating.load(Ordering::Acquire)
    }

    pub fn set_swapchain_recreating(&self, recreating: bool) {
        self.swapchain_recreating
            .store(recreating, Ordering::Release);
    }

    pub fn session_status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.session_status.load(Ordering::Acquire))
            .unwrap_or(SessionStatus::Reset)
    }

    pub fn set_session_status(&self, status: SessionStatus) {
        self.session_status.store(status as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("should_run", &self.should_run())
            .field("swapchain_recreating", &self.swapchain_recreating())
            .field("session_status", &self.session_status())
            .finish()
    }
}

/// Frame statistics of an [`Engine::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub presented: u64,
    pub dropped: u64,
    pub average_cpu_time: Duration,
}

pub struct Engine {
    context: RenderContext,
    renderer: Renderer,
    targets: Arc<RenderTargets>,
    session: Arc<Session>,
}

impl Engine {
    /// Creates every subsystem, publishes the pipelines and, if the config names a scene,
    /// initializes the first session.
    pub fn start(
        config: &EngineConfig,
        device: Arc<dyn Device>,
        window: Arc<dyn WindowSurface>,
    ) -> AnyResult<Self> {
        let context = RenderContext::new(device, window);
        Self::wire(config, context.clone()).map_err(|error| {
            // Whatever got created before the failure is still registered
            context.gc.process_cleanup_stack();
            error
        })
    }

    fn wire(config: &EngineConfig, context: RenderContext) -> AnyResult<Self> {
        let registry = Arc::new(Registry::with_context(
            context.dispatcher.clone(),
            context.device.clone(),
        )?);

        let renderer = Renderer::new(context.clone(), registry.clone(), &config.renderer)?;
        let surface_format = renderer
            .swapchains()
            .surface_format()
            .map_or(Format::R8G8B8A8Srgb, |format| format.format);
        let targets = RenderTargets::new(
            context.clone(),
            renderer.textures(),
            surface_format,
            renderer.swapchains().extent(),
        )?;
        let session = Session::new(
            context.clone(),
            registry,
            renderer.textures().clone(),
            renderer.buffers().clone(),
        )?;
        targets.publish();

        if let Some(scene) = &config.session.scene {
            context.dispatcher.dispatch(&RequestInitSession {
                config_path: scene.clone(),
            });
            if context.app_state.session_status() != SessionStatus::PostInitialization {
                bail!("couldn't load scene `{}`", scene.display());
            }
        }

        info!("Engine started");
        Ok(Self {
            context,
            renderer,
            targets,
            session,
        })
    }

    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    pub fn app_state(&self) -> &Arc<AppState> {
        &self.context.app_state
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    pub fn targets(&self) -> &Arc<RenderTargets> {
        &self.targets
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Draws frames until `frames` were presented or a shutdown is requested.
    pub fn run(&mut self, frames: u64) -> AnyResult<RunSummary> {
        let mut summary = RunSummary::default();
        while summary.presented < frames && self.app_state().should_run() {
            match self.renderer.draw_frame()? {
                FrameOutcome::Presented => summary.presented += 1,
                FrameOutcome::Dropped => summary.dropped += 1,
            }
        }
        summary.average_cpu_time = self.renderer.timing().average_cpu_time();

        info!(
            "Presented {} {} ({} dropped), {:?} on average",
            summary.presented,
            plural(summary.presented as usize, "frame", "frames"),
            summary.dropped,
            summary.average_cpu_time,
        );
        Ok(summary)
    }

    /// Waits for the device and releases every GPU object, newest first.
    pub fn shutdown(self) {
        if let Err(error) = self.renderer.wait_idle() {
            error!("Couldn't wait for the device before shutting down: {error}");
        }
        self.context.gc.process_cleanup_stack();
        info!("Engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("renderer", &self.renderer)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

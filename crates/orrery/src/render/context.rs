use crate::{
    engine::AppState,
    events::EventDispatcher,
    gc::GarbageCollector,
    gpu::{
        headless::{HeadlessConfig, HeadlessDevice},
        Device, WindowSurface,
    },
};
use std::sync::Arc;

/// Shared handles every render manager needs.
///
/// Cloning is cheap, all fields are reference counted.
#[derive(Clone)]
pub struct RenderContext {
    pub device: Arc<dyn Device>,
    pub window: Arc<dyn WindowSurface>,
    pub gc: Arc<GarbageCollector>,
    pub dispatcher: Arc<EventDispatcher>,
    pub app_state: Arc<AppState>,
}

impl RenderContext {
    pub fn new(device: Arc<dyn Device>, window: Arc<dyn WindowSurface>) -> Self {
        Self {
            gc: Arc::new(GarbageCollector::new(device.clone())),
            dispatcher: Arc::new(EventDispatcher::new()),
            app_state: Arc::new(AppState::default()),
            device,
            window,
        }
    }

    /// Creates a context backed by a [`HeadlessDevice`], which doubles as the window.
    pub fn headless(config: HeadlessConfig) -> (Self, Arc<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new(config));
        (Self::new(device.clone(), device.clone()), device)
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("gc", &self.gc)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

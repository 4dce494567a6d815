use crate::{
    ecs::{
        components::{EntityKind, Identifiers, MeshRenderable, ReferenceFrame, Transform},
        systems::propagate_reference_frames,
        EntityId, Registry, RENDER_SPACE_ENTITY,
    },
    events::{
        GeometryInitialized, RequestInitSession, SceneLoadComplete, SceneLoadProgress,
        SessionStatus, SubscriberIndex, UpdateSessionStatus,
    },
    gpu::Format,
    render::{geometry, BufferManager, Camera, RenderContext, RenderResult, TextureRegistry},
    scene::SceneDescription,
};
use ahash::AHashMap;
use anyhow::anyhow;
use log::*;
use orrery_utils::{plural, AnyResult};
use parking_lot::Mutex;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

/// Builds the registry contents out of a scene description, on every [`RequestInitSession`].
pub struct Session {
    context: RenderContext,
    registry: Arc<Registry>,
    textures: Arc<TextureRegistry>,
    buffers: Arc<BufferManager>,
    subscriber: SubscriberIndex,
    scene_path: Mutex<Option<PathBuf>>,
}

impl Session {
    pub fn new(
        context: RenderContext,
        registry: Arc<Registry>,
        textures: Arc<TextureRegistry>,
        buffers: Arc<BufferManager>,
    ) -> RenderResult<Arc<Self>> {
        let session = Arc::new(Self {
            subscriber: context.dispatcher.register_subscriber::<Self>(),
            context,
            registry,
            textures,
            buffers,
            scene_path: Mutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        session
            .context
            .dispatcher
            .subscribe::<RequestInitSession>(session.subscriber, move |event| {
                with_session(&weak, |session| {
                    if let Err(error) = session.init(&event.config_path) {
                        error!("Couldn't initialize the session: {error:#}");
                    }
                })
            })?;
        Ok(session)
    }

    /// Scene description of the last successfully initialized session.
    pub fn scene_path(&self) -> Option<PathBuf> {
        self.scene_path.lock().clone()
    }

    /// Replaces the registry contents with the scene at `path`. Returns the amount of entities
    /// in the registry afterwards, sentinels included.
    pub fn init(&self, path: &Path) -> AnyResult<usize> {
        info!("Initializing a session from `{}`", path.display());
        self.set_status(SessionStatus::PrepareForReset);
        self.registry.clear()?;
        self.set_status(SessionStatus::Reset);
        *self.scene_path.lock() = None;

        self.set_status(SessionStatus::PrepareForInit);
        let scene = SceneDescription::load(path)?;
        let textures = self.load_textures(&scene);
        let bodies = self.create_bodies(&scene, &textures)?;

        let report = propagate_reference_frames(&self.registry)?;
        if !report.cyclic.is_empty() {
            warn!(
                "{} {} left in place, their parents form a cycle",
                report.cyclic.len(),
                plural(report.cyclic.len(), "body was", "bodies were"),
            );
        }

        let renderable_count = bodies.len() as u32;
        if renderable_count > 0 {
            let (cube_vertices, cube_indices) = geometry::unit_cube();
            let (vertices, indices) =
                geometry::replicate(&cube_vertices, &cube_indices, bodies.len());
            self.context.dispatcher.dispatch(&GeometryInitialized {
                vertices,
                indices,
                renderable_count,
            });
        } else {
            warn!("Scene `{}` has no bodies", path.display());
        }

        self.buffers.set_camera(Camera {
            position: scene.camera_position(),
            ..Camera::default()
        });

        let entity_count = self.registry.entity_count();
        self.context
            .dispatcher
            .dispatch(&SceneLoadComplete { entity_count });
        self.set_status(SessionStatus::Initialized);
        self.set_status(SessionStatus::PostInitialization);
        *self.scene_path.lock() = Some(path.to_owned());

        info!(
            "Session ready: {} {}, {} {}",
            bodies.len(),
            plural(bodies.len(), "body", "bodies"),
            textures.len(),
            plural(textures.len(), "texture", "textures"),
        );
        Ok(entity_count)
    }

    fn set_status(&self, status: SessionStatus) {
        self.context.app_state.set_session_status(status);
        self.context
            .dispatcher
            .dispatch(&UpdateSessionStatus { status });
    }

    /// Requests every texture of the scene, each on its own worker thread. Textures that fail to
    /// load are left out of the returned map.
    fn load_textures(&self, scene: &SceneDescription) -> AHashMap<PathBuf, u32> {
        let paths = scene.textures();
        let mut indices = AHashMap::with_capacity(paths.len());
        if paths.is_empty() {
            return indices;
        }

        let (sender, receiver) = crossbeam::channel::unbounded();
        let textures = &self.textures;
        let joined = crossbeam::thread::scope(|scope| {
            for &path in &paths {
                let sender = sender.clone();
                scope.spawn(move |_| {
                    let result = textures.create_indexed_texture(path, Format::Undefined, 4);
                    // The receiver outlives the scope
                    let _ = sender.send((path, result));
                });
            }
        });
        drop(sender);
        if joined.is_err() {
            error!("A texture loading thread panicked");
        }

        for (path, result) in receiver {
            match result {
                Ok(index) => {
                    indices.insert(path.to_owned(), index);
                }
                Err(error) => warn!("Skipping texture `{}`: {error}", path.display()),
            }
        }
        indices
    }

    fn create_bodies(
        &self,
        scene: &SceneDescription,
        textures: &AHashMap<PathBuf, u32>,
    ) -> AnyResult<Vec<EntityId>> {
        let registry = &self.registry;
        let ids = scene
            .bodies
            .iter()
            .map(|body| registry.create_entity(Some(&*body.name)).map(|entity| entity.id))
            .collect::<Result<Vec<_>, _>>()?;

        let index_count = geometry::unit_cube().1.len() as u32;
        let total = scene.bodies.len();
        for (ubo_index, (body, &id)) in scene.bodies.iter().zip(&ids).enumerate() {
            let parent = match &body.parent {
                Some(name) => {
                    let index = scene.body_index(name).ok_or_else(|| {
                        anyhow!("body `{}` has an unknown parent `{name}`", body.name)
                    })?;
                    ids[index]
                }
                None => RENDER_SPACE_ENTITY,
            };
            let local = Transform {
                position: body.position(),
                rotation: body.rotation(),
                scale: 1.0,
            };

            registry.add_component(
                id,
                ReferenceFrame {
                    scale: body.scale,
                    visual_scale: body.visual_scale,
                    ..ReferenceFrame::child_of(parent, local)
                },
            )?;
            registry.add_component(
                id,
                MeshRenderable {
                    mesh_offset: ubo_index as u32 * index_count,
                    index_count,
                    vertex_offset: 0,
                    ubo_index: ubo_index as u32,
                    texture_index: body
                        .texture
                        .as_ref()
                        .and_then(|path| textures.get(path).copied()),
                },
            )?;
            registry.add_component(
                id,
                Identifiers {
                    kind: EntityKind::CelestialBody,
                },
            )?;

            self.context.dispatcher.dispatch_quiet(&SceneLoadProgress {
                loaded: ubo_index + 1,
                total,
            });
        }

        Ok(ids)
    }
}

fn with_session(session: &Weak<Session>, f: impl FnOnce(&Session)) {
    if let Some(session) = session.upgrade() {
        f(&session);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("scene_path", &*self.scene_path.lock())
            .finish_non_exhaustive()
    }
}

use super::{
    Camera, CommandManager, GlobalUbo, MeshDraw, ObjectUbo, RenderContext, RenderError,
    RenderResult, SingleUseConfig, Vertex, MAX_FRAMES_IN_FLIGHT, SIMULATION_SCALE,
};
use crate::{
    ecs::{
        components::{MeshRenderable, ReferenceFrame},
        EcsError, Registry, RENDER_SPACE_ENTITY,
    },
    events::{
        BufferManagerIsValid, GeometryInitialized, SubscriberIndex, SwapchainRecreated,
        UpdateUbos, UpdateViewportSize,
    },
    gc::{CleanupId, CleanupTask},
    gpu::{
        Buffer, BufferCopy, BufferDesc, BufferUsage, Command, Extent2D, MemoryProperties,
        QueueKind, SharingMode,
    },
};
use glam::{DVec3, Mat4, Quat, Vec3};
use log::*;
use orrery_utils::{align, aligned_offset};
use parking_lot::Mutex;
use smallvec::smallvec;
use std::{
    fmt, mem,
    sync::{Arc, Weak},
};

/// Buffer allocation preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHints {
    pub memory: MemoryProperties,
    pub label: &'static str,
}

impl AllocationHints {
    pub const fn device_local(label: &'static str) -> Self {
        Self {
            memory: MemoryProperties::DEVICE_LOCAL,
            label,
        }
    }

    pub const fn host_visible(label: &'static str) -> Self {
        Self {
            memory: MemoryProperties::from_bits_truncate(
                MemoryProperties::HOST_VISIBLE.bits() | MemoryProperties::HOST_COHERENT.bits(),
            ),
            label,
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    vertex_buffer: Option<Buffer>,
    index_buffer: Option<Buffer>,
    global_ubos: Vec<Buffer>,
    object_ubos: Vec<Buffer>,
    total_renderables: u32,
    render_origin: DVec3,
    /// Tasks releasing the geometry and uniform buffers, run when the geometry changes.
    owned: Vec<CleanupId>,
}

/// Owns the global geometry buffers and the per-frame uniform buffers.
///
/// Uniform buffers are host-visible and coherent, and stay mapped for as long as they live. There's
/// one global UBO and one object UBO block per frame in flight. The object block holds one
/// [`ObjectUbo`] per renderable, each padded to the device's uniform offset alignment.
pub struct BufferManager {
    context: RenderContext,
    registry: Arc<Registry>,
    commands: Arc<CommandManager>,
    subscriber: SubscriberIndex,
    object_ubo_stride: u64,
    state: Mutex<BufferState>,
    camera: Mutex<Camera>,
    extent: Mutex<Extent2D>,
}

impl BufferManager {
    pub fn new(
        context: RenderContext,
        registry: Arc<Registry>,
        commands: Arc<CommandManager>,
    ) -> RenderResult<Arc<Self>> {
        let alignment = context.device.limits().min_uniform_buffer_offset_alignment.max(1);
        let object_ubo_stride = align(mem::size_of::<ObjectUbo>() as u64, alignment);
        debug!("Object UBO stride is {object_ubo_stride} bytes (alignment {alignment})");

        let manager = Arc::new(Self {
            subscriber: context.dispatcher.register_subscriber::<Self>(),
            extent: Mutex::new(context.window.framebuffer_size()),
            context,
            registry,
            commands,
            object_ubo_stride,
            state: Mutex::new(BufferState::default()),
            camera: Mutex::new(Camera::default()),
        });
        manager.subscribe()?;

        manager.context.dispatcher.dispatch(&BufferManagerIsValid);
        Ok(manager)
    }

    fn subscribe(self: &Arc<Self>) -> RenderResult {
        let dispatcher = &self.context.dispatcher;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<GeometryInitialized>(self.subscriber, move |event| {
            with_manager(&weak, |manager| {
                if let Err(error) = manager.init_geometry(event) {
                    error!("Couldn't create geometry buffers: {error}");
                }
            })
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<UpdateUbos>(self.subscriber, move |event| {
            with_manager(&weak, |manager| {
                if let Err(error) = manager.update_ubos(event.current_frame, event.render_origin) {
                    error!("Couldn't update uniform buffers: {error}");
                }
            })
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<SwapchainRecreated>(self.subscriber, move |event| {
            with_manager(&weak, |manager| *manager.extent.lock() = event.extent)
        })?;

        let weak = Arc::downgrade(self);
        dispatcher.subscribe::<UpdateViewportSize>(self.subscriber, move |event| {
            with_manager(&weak, |manager| *manager.extent.lock() = event.extent)
        })?;

        Ok(())
    }

    pub fn object_ubo_stride(&self) -> u64 {
        self.object_ubo_stride
    }

    pub fn total_renderables(&self) -> u32 {
        self.state.lock().total_renderables
    }

    pub fn vertex_buffer(&self) -> Option<Buffer> {
        self.state.lock().vertex_buffer
    }

    pub fn index_buffer(&self) -> Option<Buffer> {
        self.state.lock().index_buffer
    }

    pub fn global_ubo(&self, frame: usize) -> Option<Buffer> {
        self.state.lock().global_ubos.get(frame).copied()
    }

    pub fn object_ubo(&self, frame: usize) -> Option<Buffer> {
        self.state.lock().object_ubos.get(frame).copied()
    }

    pub fn camera(&self) -> Camera {
        self.camera.lock().clone()
    }

    pub fn set_camera(&self, camera: Camera) {
        *self.camera.lock() = camera;
    }

    /// Queue families buffers are shared between. Transfers may run on a dedicated family.
    fn sharing_mode(&self) -> SharingMode {
        let families = self.context.device.queue_families();
        match families.transfer {
            Some(transfer) if transfer != families.graphics => {
                SharingMode::Concurrent(smallvec![families.graphics, transfer])
            }
            _ => SharingMode::Exclusive,
        }
    }

    /// Creates a buffer and registers its cleanup task.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        hints: AllocationHints,
    ) -> RenderResult<(Buffer, CleanupId)> {
        let device = self.context.device.clone();
        let buffer = device.create_buffer(&BufferDesc {
            label: hints.label,
            size,
            usage,
            memory: hints.memory,
            sharing: self.sharing_mode(),
        })?;

        let cleanup = self.context.gc.create_cleanup_task(
            CleanupTask::new("BufferManager::create_buffer", move || {
                device.destroy_buffer(buffer)
            })
            .with_object(hints.label, buffer),
        );
        Ok((buffer, cleanup))
    }

    /// Like [`Self::create_buffer`], but the buffer is mapped for its whole lifetime.
    fn create_mapped_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        label: &'static str,
    ) -> RenderResult<(Buffer, CleanupId)> {
        let device = self.context.device.clone();
        let buffer = device.create_buffer(&BufferDesc {
            label,
            size,
            usage,
            memory: AllocationHints::host_visible(label).memory,
            sharing: self.sharing_mode(),
        })?;
        device.map_memory(buffer)?;

        let cleanup = self.context.gc.create_cleanup_task(
            CleanupTask::new("BufferManager::create_mapped_buffer", move || {
                device.unmap_memory(buffer);
                device.destroy_buffer(buffer);
            })
            .with_object(label, buffer),
        );
        Ok((buffer, cleanup))
    }

    /// Queue used for staged copies.
    fn transfer_queue(&self) -> QueueKind {
        if self.context.device.queue_families().transfer.is_some() {
            QueueKind::Transfer
        } else {
            warn!("No dedicated transfer queue family, staging through the graphics queue");
            QueueKind::Graphics
        }
    }

    /// Copies `src` into the start of a device-local `dst` through a staging buffer. Returns once
    /// the copy finished executing.
    pub fn upload_to_device_buffer(&self, src: &[u8], dst: Buffer, size: u64) -> RenderResult {
        let size = size.min(src.len() as u64);
        if size == 0 {
            return Ok(());
        }

        let (staging, staging_cleanup) = self.create_buffer(
            size,
            BufferUsage::TRANSFER_SRC,
            AllocationHints::host_visible("staging buffer"),
        )?;
        let device = &self.context.device;
        device.map_memory(staging)?;
        device.write_mapped(staging, 0, &src[..size as usize])?;
        device.unmap_memory(staging);

        let copied = self.copy_buffer(staging, dst, size);
        self.context.gc.execute_cleanup_task(staging_cleanup)?;
        copied
    }

    /// Reads back the first `size` bytes of a device-local buffer through a staging buffer.
    pub fn read_device_buffer(&self, src: Buffer, size: u64) -> RenderResult<Vec<u8>> {
        let (staging, staging_cleanup) = self.create_buffer(
            size,
            BufferUsage::TRANSFER_DST,
            AllocationHints::host_visible("readback buffer"),
        )?;

        let result = self.copy_buffer(src, staging, size).and_then(|_| {
            let device = &self.context.device;
            device.map_memory(staging)?;
            let bytes = device.read_mapped(staging, 0, size);
            device.unmap_memory(staging);
            Ok(bytes?)
        });
        self.context.gc.execute_cleanup_task(staging_cleanup)?;
        result
    }

    fn copy_buffer(&self, src: Buffer, dst: Buffer, size: u64) -> RenderResult {
        let config = SingleUseConfig::builder()
            .queue(self.transfer_queue())
            .uses_single_use_fence(true)
            .build()?;

        let single = self.commands.begin_single_use(&config)?;
        self.context.device.cmd(
            single.buffer,
            Command::CopyBuffer {
                src,
                dst,
                region: BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                },
            },
        )?;
        self.commands.end_single_use(single, &config)
    }

    fn create_device_local_buffer(
        &self,
        bytes: &[u8],
        usage: BufferUsage,
        label: &'static str,
    ) -> RenderResult<(Buffer, CleanupId)> {
        let (buffer, cleanup) = self.create_buffer(
            bytes.len() as u64,
            usage | BufferUsage::TRANSFER_DST,
            AllocationHints::device_local(label),
        )?;
        self.upload_to_device_buffer(bytes, buffer, bytes.len() as u64)?;
        Ok((buffer, cleanup))
    }

    pub fn create_global_vertex_buffer(&self, vertices: &[Vertex]) -> RenderResult<Buffer> {
        let (buffer, cleanup) = self.create_device_local_buffer(
            bytemuck::cast_slice(vertices),
            BufferUsage::VERTEX,
            "global vertex buffer",
        )?;
        let mut state = self.state.lock();
        state.vertex_buffer = Some(buffer);
        state.owned.push(cleanup);
        Ok(buffer)
    }

    pub fn create_global_index_buffer(&self, indices: &[u32]) -> RenderResult<Buffer> {
        let (buffer, cleanup) = self.create_device_local_buffer(
            bytemuck::cast_slice(indices),
            BufferUsage::INDEX,
            "global index buffer",
        )?;
        let mut state = self.state.lock();
        state.index_buffer = Some(buffer);
        state.owned.push(cleanup);
        Ok(buffer)
    }

    /// (Re)creates the global and object uniform buffers for `total_renderables` objects.
    pub fn create_uniform_buffers(&self, total_renderables: u32) -> RenderResult {
        let object_block_size = self.object_ubo_stride * total_renderables.max(1) as u64;
        let mut global_ubos = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut object_ubos = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut owned = Vec::with_capacity(2 * MAX_FRAMES_IN_FLIGHT);

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let (global, global_cleanup) = self.create_mapped_buffer(
                mem::size_of::<GlobalUbo>() as u64,
                BufferUsage::UNIFORM,
                "global UBO",
            )?;
            let (object, object_cleanup) =
                self.create_mapped_buffer(object_block_size, BufferUsage::UNIFORM, "object UBOs")?;
            global_ubos.push(global);
            object_ubos.push(object);
            owned.extend([global_cleanup, object_cleanup]);
        }

        let mut state = self.state.lock();
        state.global_ubos = global_ubos;
        state.object_ubos = object_ubos;
        state.total_renderables = total_renderables;
        state.owned.extend(owned);
        Ok(())
    }

    /// Handles a new session's geometry. Buffers of the previous session are released first.
    fn init_geometry(&self, event: &GeometryInitialized) -> RenderResult {
        let previous = mem::take(&mut self.state.lock().owned);
        if !previous.is_empty() {
            self.context.device.device_wait_idle()?;
            for cleanup in previous {
                self.context.gc.execute_cleanup_task(cleanup)?;
            }
            let mut state = self.state.lock();
            state.vertex_buffer = None;
            state.index_buffer = None;
            state.global_ubos.clear();
            state.object_ubos.clear();
        }

        if !event.vertices.is_empty() {
            self.create_global_vertex_buffer(&event.vertices)?;
        }
        if !event.indices.is_empty() {
            self.create_global_index_buffer(&event.indices)?;
        }
        self.create_uniform_buffers(event.renderable_count)?;
        info!(
            "Created geometry buffers: {} vertices, {} indices, {} renderables",
            event.vertices.len(),
            event.indices.len(),
            event.renderable_count
        );
        Ok(())
    }

    /// Updates both uniform buffers of a frame slot. Returns the draws referencing them.
    pub fn update_ubos(&self, frame: usize, render_origin: DVec3) -> RenderResult<Vec<MeshDraw>> {
        self.state.lock().render_origin = render_origin;
        self.update_global_ubo(frame)?;
        self.update_object_ubos(frame, render_origin)
    }

    fn mapped_ubo(&self, frame: usize, global: bool) -> RenderResult<Buffer> {
        let state = self.state.lock();
        let list = if global {
            &state.global_ubos
        } else {
            &state.object_ubos
        };
        list.get(frame)
            .copied()
            .ok_or(RenderError::NotInitialized("the uniform buffers"))
    }

    pub fn update_global_ubo(&self, frame: usize) -> RenderResult {
        let buffer = self.mapped_ubo(frame, true)?;
        let render_origin = self.state.lock().render_origin;
        let camera = self.camera();
        let extent = *self.extent.lock();

        let ubo = GlobalUbo {
            view: camera.view_matrix(render_origin),
            projection: camera.projection_matrix(extent.aspect_ratio()),
            render_origin: (render_origin / SIMULATION_SCALE).as_vec3().extend(1.0),
            camera_position: camera.render_position(render_origin).extend(1.0),
        };
        self.context
            .device
            .write_mapped(buffer, 0, bytemuck::bytes_of(&ubo))?;
        Ok(())
    }

    /// Reads the global UBO of a frame back from its mapping.
    pub fn read_global_ubo(&self, frame: usize) -> RenderResult<GlobalUbo> {
        let buffer = self.mapped_ubo(frame, true)?;
        let bytes =
            self.context
                .device
                .read_mapped(buffer, 0, mem::size_of::<GlobalUbo>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    pub fn read_object_ubo(&self, frame: usize, ubo_index: u32) -> RenderResult<ObjectUbo> {
        let buffer = self.mapped_ubo(frame, false)?;
        let offset = aligned_offset(self.object_ubo_stride, ubo_index as u64);
        let bytes = self.context.device.read_mapped(
            buffer,
            offset,
            mem::size_of::<ObjectUbo>() as u64,
        )?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Writes the object UBO of every mesh renderable with a reference frame.
    ///
    /// Positions are converted to render space relative to `render_origin`. A frame parented to
    /// something other than render space is placed at its parent's global position, offset by
    /// its local position magnified by the parent's visual scale.
    pub fn update_object_ubos(
        &self,
        frame: usize,
        render_origin: DVec3,
    ) -> RenderResult<Vec<MeshDraw>> {
        let buffer = self.mapped_ubo(frame, false)?;
        let total = self.total_renderables();
        let view = match self.registry.get_view::<(ReferenceFrame, MeshRenderable)>() {
            Ok(view) => view,
            // Nothing was ever made renderable
            Err(EcsError::UnregisteredComponent(_)) => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut draws = Vec::with_capacity(view.size());

        for (_, (reference_frame, renderable)) in &view {
            if renderable.ubo_index >= total {
                return Err(RenderError::UboIndexOutOfRange {
                    index: renderable.ubo_index,
                    total,
                });
            }

            let global_position = match reference_frame.parent {
                Some(parent) if parent != RENDER_SPACE_ENTITY => {
                    let parent = self.registry.get_component::<ReferenceFrame>(parent)?;
                    parent.global.position
                        + reference_frame.local.position * parent.visual_scale
                }
                _ => reference_frame.global.position,
            };

            let render_position = ((global_position - render_origin) / SIMULATION_SCALE).as_vec3();
            let render_scale =
                (reference_frame.scale / SIMULATION_SCALE * reference_frame.visual_scale) as f32;
            let rotation = reference_frame.global.rotation;
            let rotation = Quat::from_xyzw(
                rotation.x as f32,
                rotation.y as f32,
                rotation.z as f32,
                rotation.w as f32,
            );

            let model = Mat4::from_scale_rotation_translation(
                Vec3::splat(render_scale),
                rotation,
                render_position,
            );
            let ubo = ObjectUbo {
                model,
                normal_matrix: model.inverse().transpose(),
            };

            let offset = aligned_offset(self.object_ubo_stride, renderable.ubo_index as u64);
            self.context
                .device
                .write_mapped(buffer, offset, bytemuck::bytes_of(&ubo))?;

            draws.push(MeshDraw {
                first_index: renderable.mesh_offset,
                index_count: renderable.index_count,
                vertex_offset: renderable.vertex_offset,
                dynamic_offset: offset as u32,
            });
        }

        Ok(draws)
    }
}

fn with_manager(manager: &Weak<BufferManager>, f: impl FnOnce(&BufferManager)) {
    if let Some(manager) = manager.upgrade() {
        f(&manager);
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("object_ubo_stride", &self.object_ubo_stride)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

use super::{
    swapchain::choose_surface_format, AllocationHints, BufferManager, CommandManager,
    RenderContext, RenderError, RenderResult, SingleUseConfig, MAX_TEXTURES,
};
use crate::{
    events::{
        InitOffscreenPipeline, ProcessSecondaryCommandBuffers, RegistryReset, SecondaryStage,
        SubscriberIndex,
    },
    gc::{CleanupId, CleanupTask},
    gpu::{
        AccessFlags, BorderColor, BufferImageCopy, BufferUsage, Command, CommandBuffer,
        CommandBufferLevel, CommandBufferUsage, CompareOp, DescriptorImageInfo, DescriptorSet,
        DescriptorWrite, Extent2D, Filter, Format, Image, ImageBarrier, ImageDesc, ImageLayout,
        ImageUsage, ImageView, InheritanceInfo, MemoryProperties, PipelineStages, QueueKind,
        RenderPass, Sampler, SamplerAddressMode, SamplerDesc, SamplerMipmapMode,
    },
};
use ahash::AHashMap;
use log::*;
use ordered_float::OrderedFloat;
use orrery_utils::Fnv1aHasher;
use parking_lot::Mutex;
use std::{
    fmt,
    hash::{Hash, Hasher},
    mem,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    thread::{self, ThreadId},
};

/// Binding of the texture array in the scene descriptor set.
pub const TEXTURE_ARRAY_BINDING: u32 = 1;

/// File extensions the decoder is asked to handle.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["jpeg", "jpg", "png", "tga", "bmp", "gif", "hdr", "pnm"];

/// A sampled 2D texture, in its final layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub image: Image,
    pub image_view: ImageView,
    pub sampler: Sampler,
    pub layout: ImageLayout,
    /// Structural hash of the sampler's descriptor.
    pub sampler_hash: u64,
    pub extent: Extent2D,
    pub format: Format,
}

impl Texture {
    pub fn descriptor_info(&self) -> DescriptorImageInfo {
        DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image_view,
            layout: self.layout,
        }
    }
}

/// The sampler used by every texture loaded from disk. Anisotropy is requested at the maximum,
/// which resolves to the device limit.
pub fn default_sampler_desc() -> SamplerDesc {
    SamplerDesc {
        mag_filter: Filter::Linear,
        min_filter: Filter::Linear,
        address_mode_u: SamplerAddressMode::Repeat,
        address_mode_v: SamplerAddressMode::Repeat,
        address_mode_w: SamplerAddressMode::Repeat,
        border_color: BorderColor::IntOpaqueBlack,
        anisotropy_enable: true,
        max_anisotropy: OrderedFloat(f32::MAX),
        unnormalized_coordinates: false,
        compare_enable: false,
        compare_op: CompareOp::Always,
        mipmap_mode: SamplerMipmapMode::Linear,
        mip_lod_bias: OrderedFloat(0.0),
        min_lod: OrderedFloat(0.0),
        max_lod: OrderedFloat(0.0),
    }
}

/// 64-bit FNV-1a over the descriptor's fields.
pub fn sampler_hash(desc: &SamplerDesc) -> u64 {
    let mut hasher = Fnv1aHasher::new();
    desc.hash(&mut hasher);
    hasher.finish()
}

/// Decoded pixels, tightly packed in `format`.
#[derive(Debug)]
struct DecodedImage {
    extent: Extent2D,
    format: Format,
    pixels: Vec<u8>,
}

#[derive(Debug, Clone)]
struct DeferredTexture {
    index: u32,
    path: PathBuf,
    format: Format,
    channels: u32,
}

#[derive(Debug, Default)]
struct TextureState {
    path_to_index: AHashMap<PathBuf, u32>,
    /// One entry per array slot, empty until the texture is uploaded.
    slots: Vec<Option<Texture>>,
    /// Cleanup tasks of the images uploaded into slots.
    slot_cleanups: Vec<CleanupId>,
    samplers: AHashMap<SamplerDesc, Sampler>,
    deferred: Vec<DeferredTexture>,
    descriptor_set: Option<DescriptorSet>,
    offscreen_render_pass: Option<RenderPass>,
}

/// Content-addressed texture cache backing the scene's texture array.
///
/// Indexed textures are identified by their path. Every path gets exactly one slot in the array,
/// assigned in request order. Requests made before the offscreen pipeline exists are queued, and
/// uploaded as soon as [`InitOffscreenPipeline`] hands over the descriptor set.
///
/// The array belongs to the current scene: slots are released whenever the ECS registry is
/// cleared. Samplers outlive scenes.
///
/// Uploads on the thread that created the registry are submitted and waited on right away. Uploads
/// on any other thread are recorded into a secondary command buffer, which the command manager
/// executes at the start of the next frame.
pub struct TextureRegistry {
    context: RenderContext,
    commands: Arc<CommandManager>,
    buffers: Arc<BufferManager>,
    subscriber: SubscriberIndex,
    main_thread: ThreadId,
    max_anisotropy: f32,
    surface_format: Format,
    state: Mutex<TextureState>,
}

impl TextureRegistry {
    /// `max_anisotropy` overrides the device limit for samplers asking for the maximum. It's
    /// clamped to the device limit either way.
    pub fn new(
        context: RenderContext,
        commands: Arc<CommandManager>,
        buffers: Arc<BufferManager>,
        max_anisotropy: Option<f32>,
    ) -> RenderResult<Arc<Self>> {
        let device_limit = context.device.limits().max_sampler_anisotropy;
        let max_anisotropy = max_anisotropy.map_or(device_limit, |value| value.min(device_limit));
        let surface_format = choose_surface_format(&context.device.surface_formats()).format;

        let registry = Arc::new(Self {
            subscriber: context.dispatcher.register_subscriber::<Self>(),
            main_thread: thread::current().id(),
            context,
            commands,
            buffers,
            max_anisotropy,
            surface_format,
            state: Mutex::new(TextureState::default()),
        });

        let weak = Arc::downgrade(&registry);
        registry
            .context
            .dispatcher
            .subscribe::<InitOffscreenPipeline>(registry.subscriber, move |event| {
                with_registry(&weak, |registry| registry.on_offscreen_pipeline(event))
            })?;

        let weak = Arc::downgrade(&registry);
        registry
            .context
            .dispatcher
            .subscribe::<RegistryReset>(registry.subscriber, move |_| {
                with_registry(&weak, TextureRegistry::release_slots)
            })?;

        Ok(registry)
    }

    /// Amount of slots handed out so far.
    pub fn texture_count(&self) -> u32 {
        self.state.lock().slots.len() as u32
    }

    pub fn texture(&self, index: u32) -> Option<Texture> {
        self.state.lock().slots.get(index as usize).copied().flatten()
    }

    pub fn index_of(&self, path: impl AsRef<Path>) -> Option<u32> {
        self.state.lock().path_to_index.get(path.as_ref()).copied()
    }

    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    pub fn sampler_cache_size(&self) -> usize {
        self.state.lock().samplers.len()
    }

    /// Whether the texture array's descriptor set is available.
    pub fn is_ready(&self) -> bool {
        self.state.lock().descriptor_set.is_some()
    }

    /// Returns the array slot of the texture at `path`, loading it if needed.
    ///
    /// The slot is reserved even if the upload has to wait for the offscreen pipeline. A failed
    /// upload leaves the slot empty.
    pub fn create_indexed_texture(
        &self,
        path: impl AsRef<Path>,
        format: Format,
        channels: u32,
    ) -> RenderResult<u32> {
        let path = path.as_ref();
        let (index, descriptor_set) = {
            let mut state = self.state.lock();
            if let Some(&index) = state.path_to_index.get(path) {
                return Ok(index);
            }
            if state.slots.len() as u32 >= MAX_TEXTURES {
                return Err(RenderError::TextureArrayFull(MAX_TEXTURES));
            }

            let index = state.slots.len() as u32;
            state.slots.push(None);
            state.path_to_index.insert(path.to_path_buf(), index);

            match state.descriptor_set {
                Some(set) => (index, set),
                None => {
                    debug!(
                        "Deferring texture #{index} ({}) until the pipeline is ready",
                        path.display()
                    );
                    state.deferred.push(DeferredTexture {
                        index,
                        path: path.to_path_buf(),
                        format,
                        channels,
                    });
                    return Ok(index);
                }
            }
        };

        self.load_into_slot(index, path, format, channels, descriptor_set)?;
        Ok(index)
    }

    /// Loads a texture outside the array, for one-off use.
    pub fn create_independent_texture(
        &self,
        path: impl AsRef<Path>,
        format: Format,
        channels: u32,
    ) -> RenderResult<Texture> {
        let decoded = self.decode(path.as_ref(), format, channels)?;
        self.upload(&decoded).map(|(texture, _)| texture)
    }

    /// Returns a sampler for `desc`, creating it only if no equal descriptor was seen before.
    pub fn create_sampler(&self, desc: &SamplerDesc) -> RenderResult<(Sampler, u64)> {
        let mut desc = *desc;
        if desc.max_anisotropy.0 == f32::MAX {
            desc.max_anisotropy = OrderedFloat(self.max_anisotropy);
        }
        let hash = sampler_hash(&desc);

        let mut state = self.state.lock();
        if let Some(&sampler) = state.samplers.get(&desc) {
            return Ok((sampler, hash));
        }

        let device = self.context.device.clone();
        let sampler = device.create_sampler(&desc)?;
        self.context.gc.create_cleanup_task(
            CleanupTask::new("TextureRegistry::create_sampler", move || {
                device.destroy_sampler(sampler)
            })
            .with_object("texture sampler", sampler),
        );
        trace!("Created sampler {hash:#018x}");
        state.samplers.insert(desc, sampler);
        Ok((sampler, hash))
    }

    /// Destroys every indexed texture and frees all slots. Expects the device to be idle.
    pub fn release_slots(&self) {
        let (count, cleanups) = {
            let mut state = self.state.lock();
            state.path_to_index.clear();
            state.deferred.clear();
            let count = mem::take(&mut state.slots).len();
            (count, mem::take(&mut state.slot_cleanups))
        };

        for id in cleanups {
            if let Err(error) = self.context.gc.execute_cleanup_task(id) {
                error!("Couldn't release a texture: {error}");
            }
        }
        if count > 0 {
            debug!("Released {count} texture slot(s)");
        }
    }

    fn on_offscreen_pipeline(&self, event: &InitOffscreenPipeline) {
        let deferred = {
            let mut state = self.state.lock();
            state.descriptor_set = Some(event.tex_array_descriptor_set);
            state.offscreen_render_pass = Some(event.render_pass);
            mem::take(&mut state.deferred)
        };

        if !deferred.is_empty() {
            info!("Uploading {} deferred texture(s)", deferred.len());
        }
        for texture in deferred {
            let loaded = self.load_into_slot(
                texture.index,
                &texture.path,
                texture.format,
                texture.channels,
                event.tex_array_descriptor_set,
            );
            if let Err(error) = loaded {
                error!("Couldn't load deferred texture {}: {error}", texture.path.display());
            }
        }
    }

    fn load_into_slot(
        &self,
        index: u32,
        path: &Path,
        format: Format,
        channels: u32,
        descriptor_set: DescriptorSet,
    ) -> RenderResult {
        let decoded = self.decode(path, format, channels)?;
        let (texture, cleanup) = self.upload(&decoded)?;

        self.context.device.update_descriptor_sets(&[DescriptorWrite {
            set: descriptor_set,
            binding: TEXTURE_ARRAY_BINDING,
            array_element: index,
            image: texture.descriptor_info(),
        }])?;
        {
            let mut state = self.state.lock();
            state.slot_cleanups.push(cleanup);
            match state.slots.get_mut(index as usize) {
                Some(slot) => *slot = Some(texture),
                None => warn!("Texture #{index} was released while it was loading"),
            }
        }

        debug!(
            "Loaded texture #{index} from {} ({}x{}, {:?})",
            path.display(),
            decoded.extent.width,
            decoded.extent.height,
            decoded.format
        );
        Ok(())
    }

    /// Format the pixels are actually stored in. Single channel images are always `R8`, everything
    /// else needs a 4 byte color format.
    fn resolve_format(&self, requested: Format, channels: u32) -> Format {
        if channels == 1 {
            if !matches!(requested, Format::R8Unorm | Format::Undefined) {
                warn!("Single channel texture requested as {requested:?}, using R8Unorm");
            }
            return Format::R8Unorm;
        }

        let format = match requested {
            Format::Undefined => self.surface_format,
            format => format,
        };
        match format {
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8Srgb
            | Format::B8G8R8A8Unorm
            | Format::B8G8R8A8Srgb => format,
            other => {
                warn!("{other:?} can't hold 8-bit RGBA pixels, using R8G8B8A8Srgb");
                Format::R8G8B8A8Srgb
            }
        }
    }

    fn decode(&self, path: &Path, format: Format, channels: u32) -> RenderResult<DecodedImage> {
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase);
        if !matches!(extension, Some(ref ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str())) {
            return Err(RenderError::UnsupportedTextureFormat(path.to_path_buf()));
        }

        let image = image::open(path).map_err(|error| RenderError::TextureLoadFailed {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        let format = self.resolve_format(format, channels);
        let (extent, pixels) = if format == Format::R8Unorm {
            let luma = image.into_luma8();
            (Extent2D::new(luma.width(), luma.height()), luma.into_raw())
        } else {
            let rgba = image.into_rgba8();
            let extent = Extent2D::new(rgba.width(), rgba.height());
            let mut pixels = rgba.into_raw();
            if matches!(format, Format::B8G8R8A8Unorm | Format::B8G8R8A8Srgb) {
                for texel in pixels.chunks_exact_mut(4) {
                    texel.swap(0, 2);
                }
            }
            (extent, pixels)
        };
        if extent.is_zero() {
            return Err(RenderError::TextureLoadFailed {
                path: path.to_path_buf(),
                reason: "image is empty".into(),
            });
        }

        Ok(DecodedImage {
            extent,
            format,
            pixels,
        })
    }

    fn create_image(
        &self,
        extent: Extent2D,
        format: Format,
    ) -> RenderResult<(Image, ImageView, CleanupId)> {
        let device = self.context.device.clone();
        let image = device.create_image(&ImageDesc {
            label: "texture",
            extent,
            format,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            mip_levels: 1,
            memory: MemoryProperties::DEVICE_LOCAL,
        })?;
        let view = match device.create_image_view(image, format) {
            Ok(view) => view,
            Err(error) => {
                device.destroy_image(image);
                return Err(error.into());
            }
        };

        let cleanup = self.context.gc.create_cleanup_task(
            CleanupTask::new("TextureRegistry::create_image", move || {
                device.destroy_image_view(view);
                device.destroy_image(image);
            })
            .with_object("texture image view", view)
            .with_object("texture image", image),
        );
        Ok((image, view, cleanup))
    }

    fn upload(&self, decoded: &DecodedImage) -> RenderResult<(Texture, CleanupId)> {
        let device = &self.context.device;
        let (staging, staging_cleanup) = self.buffers.create_buffer(
            decoded.pixels.len() as u64,
            BufferUsage::TRANSFER_SRC,
            AllocationHints::host_visible("texture staging buffer"),
        )?;
        device.map_memory(staging)?;
        device.write_mapped(staging, 0, &decoded.pixels)?;
        device.unmap_memory(staging);

        let (image, image_view, image_cleanup) = self.create_image(decoded.extent, decoded.format)?;
        let record = |buffer: CommandBuffer| -> RenderResult {
            self.transition_image_layout(
                buffer,
                image,
                ImageLayout::Undefined,
                ImageLayout::TransferDstOptimal,
            )?;
            device.cmd(
                buffer,
                Command::CopyBufferToImage {
                    src: staging,
                    dst: image,
                    dst_layout: ImageLayout::TransferDstOptimal,
                    region: BufferImageCopy {
                        buffer_offset: 0,
                        extent: decoded.extent,
                    },
                },
            )?;
            self.transition_image_layout(
                buffer,
                image,
                ImageLayout::TransferDstOptimal,
                ImageLayout::ShaderReadOnlyOptimal,
            )
        };

        if thread::current().id() == self.main_thread {
            let config = SingleUseConfig::builder()
                .queue(QueueKind::Graphics)
                .uses_single_use_fence(true)
                .build()?;
            let single = self.commands.begin_single_use(&config)?;
            record(single.buffer)?;
            self.commands.end_single_use(single, &config)?;
            self.context.gc.execute_cleanup_task(staging_cleanup)?;
        } else {
            // The staging buffer has to outlive the secondary buffer, the cleanup stack gets it
            let inheritance = InheritanceInfo {
                render_pass: self.state.lock().offscreen_render_pass,
                subpass: 0,
                framebuffer: None,
            };
            let config = SingleUseConfig::builder()
                .level(CommandBufferLevel::Secondary)
                .usage(CommandBufferUsage::ONE_TIME_SUBMIT)
                .inheritance(inheritance)
                .auto_submit(false)
                .build()?;
            let single = self.commands.begin_single_use(&config)?;
            record(single.buffer)?;
            self.commands.end_single_use(single, &config)?;

            trace!("Handing over texture upload buffer {:#x}", single.buffer.raw());
            self.context
                .dispatcher
                .dispatch(&ProcessSecondaryCommandBuffers {
                    stage: SecondaryStage::None,
                    buffers: vec![single.buffer],
                });
        }

        let (sampler, sampler_hash) = self.create_sampler(&default_sampler_desc())?;
        let texture = Texture {
            image,
            image_view,
            sampler,
            layout: ImageLayout::ShaderReadOnlyOptimal,
            sampler_hash,
            extent: decoded.extent,
            format: decoded.format,
        };
        Ok((texture, image_cleanup))
    }

    /// Records a layout transition of a whole texture image. Only the two transitions of an upload
    /// are supported.
    pub fn transition_image_layout(
        &self,
        buffer: CommandBuffer,
        image: Image,
        old: ImageLayout,
        new: ImageLayout,
    ) -> RenderResult {
        let (src_stage, dst_stage, src_access, dst_access) = match (old, new) {
            (ImageLayout::Undefined, ImageLayout::TransferDstOptimal) => (
                PipelineStages::TOP_OF_PIPE,
                PipelineStages::TRANSFER,
                AccessFlags::empty(),
                AccessFlags::TRANSFER_WRITE,
            ),
            (ImageLayout::TransferDstOptimal, ImageLayout::ShaderReadOnlyOptimal) => (
                PipelineStages::TRANSFER,
                PipelineStages::FRAGMENT_SHADER,
                AccessFlags::TRANSFER_WRITE,
                AccessFlags::SHADER_READ,
            ),
            (old, new) => return Err(RenderError::UnsupportedLayoutTransition { old, new }),
        };

        self.context.device.cmd(
            buffer,
            Command::PipelineBarrier(ImageBarrier {
                image,
                old_layout: old,
                new_layout: new,
                src_stage,
                dst_stage,
                src_access,
                dst_access,
            }),
        )?;
        Ok(())
    }
}

fn with_registry(registry: &Weak<TextureRegistry>, f: impl FnOnce(&TextureRegistry)) {
    if let Some(registry) = registry.upgrade() {
        f(&registry);
    }
}

impl fmt::Debug for TextureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TextureRegistry")
            .field("textures", &state.slots.len())
            .field("deferred", &state.deferred.len())
            .field("samplers", &state.samplers.len())
            .field("max_anisotropy", &self.max_anisotropy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ecs::Registry,
        gpu::{
            headless::{DeviceCall, HeadlessConfig, HeadlessDevice},
            Device, RenderPassDesc,
        },
    };

    struct Fixture {
        textures: Arc<TextureRegistry>,
        registry: Arc<Registry>,
        commands: Arc<CommandManager>,
        context: RenderContext,
        device: Arc<HeadlessDevice>,
    }

    fn fixture(max_anisotropy: Option<f32>) -> Fixture {
        let (context, device) = RenderContext::headless(HeadlessConfig::default());
        let registry = Arc::new(
            Registry::with_context(context.dispatcher.clone(), context.device.clone()).unwrap(),
        );
        let commands = CommandManager::new(context.clone()).unwrap();
        let buffers =
            BufferManager::new(context.clone(), registry.clone(), commands.clone()).unwrap();
        let textures =
            TextureRegistry::new(context.clone(), commands.clone(), buffers, max_anisotropy)
                .unwrap();
        Fixture {
            textures,
            registry,
            commands,
            context,
            device,
        }
    }

    /// Publishes a minimal offscreen pipeline, returning the texture array's descriptor set.
    fn init_offscreen(fixture: &Fixture) -> DescriptorSet {
        let device = &fixture.device;
        let render_pass = device
            .create_render_pass(&RenderPassDesc {
                label: "offscreen",
                color_format: Format::R16G16B16A16Sfloat,
                final_layout: ImageLayout::ShaderReadOnlyOptimal,
            })
            .unwrap();
        let pipeline = device.create_pipeline(render_pass).unwrap();
        let pool = device.create_descriptor_pool(1, MAX_TEXTURES).unwrap();
        let set = device.allocate_descriptor_set(pool, MAX_TEXTURES).unwrap();

        fixture.context.dispatcher.dispatch(&InitOffscreenPipeline {
            render_pass,
            pipeline,
            offscreen_images: Vec::new(),
            offscreen_image_views: Vec::new(),
            offscreen_samplers: Vec::new(),
            framebuffers: Vec::new(),
            tex_array_descriptor_set: set,
        });
        set
    }

    /// Writes a small image into a directory unique to the calling test.
    fn write_image(test: &str, file: &str, color: [u8; 4]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orrery-{test}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file);
        image::RgbaImage::from_pixel(2, 2, image::Rgba(color))
            .save(&path)
            .unwrap();
        path
    }

    fn descriptor_writes(device: &HeadlessDevice, element: u32) -> usize {
        device
            .calls()
            .iter()
            .filter(|call| match call {
                DeviceCall::DescriptorWrite { array_element, .. } => *array_element == element,
                _ => false,
            })
            .count()
    }

    #[test]
    pub fn deferred_textures_upload_on_pipeline_init() {
        let fixture = fixture(None);
        let earth = write_image("deferred", "earth.png", [0, 0, 255, 255]);

        let index = fixture
            .textures
            .create_indexed_texture(&earth, Format::R8G8B8A8Srgb, 4)
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(fixture.textures.texture_count(), 1);
        assert_eq!(fixture.textures.texture(0), None);
        assert_eq!(fixture.textures.deferred_count(), 1);

        let set = init_offscreen(&fixture);
        let texture = fixture.textures.texture(0).unwrap();
        assert_eq!(fixture.device.descriptor(set, 0), Some(texture.descriptor_info()));
        assert_eq!(descriptor_writes(&fixture.device, 0), 1);
        assert_eq!(fixture.textures.deferred_count(), 0);

        assert_eq!(
            fixture.device.image_layout(texture.image),
            Some(ImageLayout::ShaderReadOnlyOptimal)
        );
        assert_eq!(
            fixture.device.image_data(texture.image).unwrap(),
            [0u8, 0, 255, 255].repeat(4)
        );
    }

    #[test]
    pub fn same_path_same_index() {
        let fixture = fixture(None);
        init_offscreen(&fixture);
        let a = write_image("idempotence", "a.png", [10, 20, 30, 255]);
        let b = write_image("idempotence", "b.png", [40, 50, 60, 255]);

        let textures = &fixture.textures;
        let first = textures.create_indexed_texture(&a, Format::Undefined, 4).unwrap();
        let second = textures.create_indexed_texture(&b, Format::B8G8R8A8Unorm, 4).unwrap();
        let again = textures.create_indexed_texture(&a, Format::R8Unorm, 1).unwrap();

        assert_eq!((first, second, again), (0, 1, 0));
        assert_eq!(textures.texture_count(), 2);
        assert_eq!(fixture.device.live_count("Image"), 2);

        // Undefined picks the preferred surface format
        let texture = textures.texture(0).unwrap();
        assert_eq!(texture.format, Format::R8G8B8A8Srgb);
        assert_eq!(fixture.device.image_data(texture.image).unwrap()[..4], [10, 20, 30, 255]);

        let texture = textures.texture(1).unwrap();
        assert_eq!(fixture.device.image_data(texture.image).unwrap()[..4], [60, 50, 40, 255]);
    }

    #[test]
    pub fn equal_samplers_are_shared() {
        let fixture = fixture(None);
        init_offscreen(&fixture);
        let a = write_image("samplers", "a.png", [255; 4]);
        let b = write_image("samplers", "b.png", [0; 4]);

        fixture.textures.create_indexed_texture(&a, Format::R8G8B8A8Srgb, 4).unwrap();
        fixture.textures.create_indexed_texture(&b, Format::R8G8B8A8Srgb, 4).unwrap();

        assert_eq!(fixture.device.live_count("Sampler"), 1);
        assert_eq!(fixture.textures.sampler_cache_size(), 1);
        let (a, b) = (
            fixture.textures.texture(0).unwrap(),
            fixture.textures.texture(1).unwrap(),
        );
        assert_eq!(a.sampler, b.sampler);
        assert_eq!(a.sampler_hash, b.sampler_hash);

        let mut nearest = default_sampler_desc();
        nearest.mag_filter = Filter::Nearest;
        let (sampler, hash) = fixture.textures.create_sampler(&nearest).unwrap();
        assert_ne!(sampler, a.sampler);
        assert_ne!(hash, a.sampler_hash);
        assert_eq!(fixture.textures.sampler_cache_size(), 2);
    }

    #[test]
    pub fn anisotropy_resolves_to_the_limit() {
        let fixture = fixture(Some(64.0));
        let (sampler, _) = fixture.textures.create_sampler(&default_sampler_desc()).unwrap();
        let desc = fixture.device.sampler_desc(sampler).unwrap();
        assert_eq!(desc.max_anisotropy, OrderedFloat(16.0));

        let fixture = self::fixture(Some(4.0));
        let (sampler, _) = fixture.textures.create_sampler(&default_sampler_desc()).unwrap();
        let desc = fixture.device.sampler_desc(sampler).unwrap();
        assert_eq!(desc.max_anisotropy, OrderedFloat(4.0));
    }

    #[test]
    pub fn single_channel_textures_are_r8() {
        let fixture = fixture(None);
        let path = write_image("single-channel", "mask.png", [200, 200, 200, 255]);
        let texture = fixture
            .textures
            .create_independent_texture(&path, Format::R8G8B8A8Srgb, 1)
            .unwrap();

        assert_eq!(texture.format, Format::R8Unorm);
        assert_eq!(fixture.device.image_data(texture.image).unwrap(), vec![200; 4]);
        // Independent textures don't take array slots
        assert_eq!(fixture.textures.texture_count(), 0);
        // Nor does the staging buffer outlive the upload
        assert_eq!(fixture.device.live_count("Buffer"), 0);
    }

    #[test]
    pub fn bad_files_are_reported() {
        let fixture = fixture(None);
        init_offscreen(&fixture);

        let text = std::env::temp_dir().join("orrery-notes.txt");
        assert!(matches!(
            fixture.textures.create_independent_texture(&text, Format::Undefined, 4),
            Err(RenderError::UnsupportedTextureFormat(_))
        ));

        let missing = std::env::temp_dir().join("orrery-does-not-exist.png");
        assert!(matches!(
            fixture.textures.create_indexed_texture(&missing, Format::Undefined, 4),
            Err(RenderError::TextureLoadFailed { .. })
        ));
        // The slot is still taken, so later indices stay stable
        assert_eq!(fixture.textures.index_of(&missing), Some(0));
        assert_eq!(fixture.textures.texture(0), None);
    }

    #[test]
    pub fn array_capacity_is_enforced() {
        let fixture = fixture(None);
        for i in 0..MAX_TEXTURES {
            let index = fixture
                .textures
                .create_indexed_texture(format!("texture-{i}.png"), Format::Undefined, 4)
                .unwrap();
            assert_eq!(index, i);
        }

        assert!(matches!(
            fixture
                .textures
                .create_indexed_texture("one-too-many.png", Format::Undefined, 4),
            Err(RenderError::TextureArrayFull(MAX_TEXTURES))
        ));
        // Known paths still resolve
        assert_eq!(
            fixture
                .textures
                .create_indexed_texture("texture-3.png", Format::Undefined, 4)
                .unwrap(),
            3
        );
    }

    #[test]
    pub fn registry_resets_free_the_array() {
        let fixture = fixture(None);
        init_offscreen(&fixture);
        let earth = write_image("reset", "earth.png", [0, 0, 255, 255]);
        let moon = write_image("reset", "moon.png", [128, 128, 128, 255]);

        let textures = &fixture.textures;
        textures.create_indexed_texture(&earth, Format::R8G8B8A8Srgb, 4).unwrap();
        textures.create_indexed_texture(&moon, Format::R8G8B8A8Srgb, 4).unwrap();
        assert_eq!(fixture.device.live_count("Image"), 2);

        fixture.registry.clear().unwrap();
        assert_eq!(textures.texture_count(), 0);
        assert_eq!(textures.index_of(&earth), None);
        assert_eq!(fixture.device.live_count("Image"), 0);
        assert_eq!(fixture.device.live_count("ImageView"), 0);
        // Samplers aren't tied to a scene
        assert_eq!(textures.sampler_cache_size(), 1);
        assert_eq!(fixture.device.live_count("Sampler"), 1);

        // Slots are handed out from the start again
        assert_eq!(textures.create_indexed_texture(&moon, Format::R8G8B8A8Srgb, 4).unwrap(), 0);
        assert_eq!(fixture.device.live_count("Image"), 1);
    }

    #[test]
    pub fn worker_uploads_become_secondary_buffers() {
        let fixture = fixture(None);
        init_offscreen(&fixture);
        let path = write_image("worker", "moon.png", [128, 128, 128, 255]);
        let submits_before = fixture.device.submit_count();

        let index = thread::scope(|scope| {
            scope
                .spawn(|| {
                    fixture
                        .textures
                        .create_indexed_texture(&path, Format::R8G8B8A8Unorm, 4)
                })
                .join()
                .unwrap()
        })
        .unwrap();

        assert_eq!(index, 0);
        assert_eq!(fixture.device.submit_count(), submits_before);
        assert_eq!(fixture.commands.pending_secondary_buffers(), [1, 0, 0]);

        // Not executed yet, the next primary recording takes care of that
        let texture = fixture.textures.texture(0).unwrap();
        assert_eq!(
            fixture.device.image_layout(texture.image),
            Some(ImageLayout::Undefined)
        );
    }

    #[test]
    pub fn unsupported_transitions_fail() {
        let fixture = fixture(None);
        let config = SingleUseConfig::builder().auto_submit(false).build().unwrap();
        let single = fixture.commands.begin_single_use(&config).unwrap();
        let (image, _, _) = fixture
            .textures
            .create_image(Extent2D::new(1, 1), Format::R8Unorm)
            .unwrap();

        assert!(matches!(
            fixture.textures.transition_image_layout(
                single.buffer,
                image,
                ImageLayout::ShaderReadOnlyOptimal,
                ImageLayout::PresentSrc,
            ),
            Err(RenderError::UnsupportedLayoutTransition { .. })
        ));
    }
}

//! Render passes and offscreen targets
//!
//! Shading pipelines belong to the host application. The engine only creates the objects the
//! frame pipeline can't run without: the present pass, the offscreen pass with a pipeline, one
//! offscreen color target per frame in flight, and the bindless texture array's descriptor set.

use crate::{
    events::{
        InitOffscreenPipeline, InitPresentPipeline, OffscreenResourcesRecreated, SubscriberIndex,
        SwapchainRecreated,
    },
    gc::{CleanupId, CleanupTask},
    gpu::{
        DescriptorSet, Extent2D, Format, Framebuffer, Image, ImageDesc, ImageLayout, ImageUsage,
        ImageView, MemoryProperties, Pipeline, RenderPass, RenderPassDesc, Sampler,
        SamplerAddressMode,
    },
    render::{
        default_sampler_desc, RenderContext, RenderResult, TextureRegistry, MAX_FRAMES_IN_FLIGHT,
        MAX_TEXTURES,
    },
};
use log::*;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, Weak},
};

/// Color format of the offscreen targets.
pub const OFFSCREEN_FORMAT: Format = Format::R16G16B16A16Sfloat;

#[derive(Debug, Default)]
struct OffscreenTargets {
    images: Vec<Image>,
    image_views: Vec<ImageView>,
    framebuffers: Vec<Framebuffer>,
    cleanup: Option<CleanupId>,
}

pub struct RenderTargets {
    context: RenderContext,
    subscriber: SubscriberIndex,
    present_render_pass: RenderPass,
    offscreen_render_pass: RenderPass,
    pipeline: Pipeline,
    sampler: Sampler,
    descriptor_set: DescriptorSet,
    offscreen: Mutex<OffscreenTargets>,
}

impl RenderTargets {
    pub fn new(
        context: RenderContext,
        textures: &TextureRegistry,
        surface_format: Format,
        extent: Extent2D,
    ) -> RenderResult<Arc<Self>> {
        let device = context.device.clone();

        let present_render_pass = device.create_render_pass(&RenderPassDesc {
            label: "present",
            color_format: surface_format,
            final_layout: ImageLayout::PresentSrc,
        })?;
        let offscreen_render_pass = device.create_render_pass(&RenderPassDesc {
            label: "offscreen",
            color_format: OFFSCREEN_FORMAT,
            final_layout: ImageLayout::ShaderReadOnlyOptimal,
        })?;
        let pipeline = device.create_pipeline(offscreen_render_pass)?;
        let descriptor_pool = device.create_descriptor_pool(1, MAX_TEXTURES)?;
        let descriptor_set = device.allocate_descriptor_set(descriptor_pool, MAX_TEXTURES)?;

        let cleanup_device = device.clone();
        context.gc.create_cleanup_task(
            CleanupTask::new("RenderTargets::new", move || {
                cleanup_device.destroy_descriptor_pool(descriptor_pool);
                cleanup_device.destroy_pipeline(pipeline);
                cleanup_device.destroy_render_pass(offscreen_render_pass);
                cleanup_device.destroy_render_pass(present_render_pass);
            })
            .with_object("texture array descriptor pool", descriptor_pool)
            .with_object("offscreen pipeline", pipeline)
            .with_object("offscreen render pass", offscreen_render_pass)
            .with_object("present render pass", present_render_pass),
        );

        let (sampler, _) = textures.create_sampler(&{
            let mut desc = default_sampler_desc();
            desc.address_mode_u = SamplerAddressMode::ClampToEdge;
            desc.address_mode_v = SamplerAddressMode::ClampToEdge;
            desc.address_mode_w = SamplerAddressMode::ClampToEdge;
            desc.anisotropy_enable = false;
            desc
        })?;

        let mut targets = Self {
            subscriber: context.dispatcher.register_subscriber::<Self>(),
            context,
            present_render_pass,
            offscreen_render_pass,
            pipeline,
            sampler,
            descriptor_set,
            offscreen: Mutex::default(),
        };
        *targets.offscreen.get_mut() = targets.create_offscreen(extent)?;

        let targets = Arc::new(targets);
        let weak = Arc::downgrade(&targets);
        targets
            .context
            .dispatcher
            .subscribe::<SwapchainRecreated>(targets.subscriber, move |event| {
                with_targets(&weak, |targets| {
                    if let Err(error) = targets.recreate_offscreen(event.extent) {
                        error!("Couldn't recreate the offscreen targets: {error}");
                    }
                })
            })?;
        Ok(targets)
    }

    pub fn present_render_pass(&self) -> RenderPass {
        self.present_render_pass
    }

    pub fn offscreen_render_pass(&self) -> RenderPass {
        self.offscreen_render_pass
    }

    pub fn descriptor_set(&self) -> DescriptorSet {
        self.descriptor_set
    }

    pub fn offscreen_framebuffers(&self) -> Vec<Framebuffer> {
        self.offscreen.lock().framebuffers.clone()
    }

    /// Publishes both pipelines. Deferred texture uploads run during this call.
    pub fn publish(&self) {
        let dispatcher = &self.context.dispatcher;
        dispatcher.dispatch(&InitPresentPipeline {
            render_pass: self.present_render_pass,
        });

        let event = {
            let offscreen = self.offscreen.lock();
            InitOffscreenPipeline {
                render_pass: self.offscreen_render_pass,
                pipeline: self.pipeline,
                offscreen_images: offscreen.images.clone(),
                offscreen_image_views: offscreen.image_views.clone(),
                offscreen_samplers: vec![self.sampler; MAX_FRAMES_IN_FLIGHT],
                framebuffers: offscreen.framebuffers.clone(),
                tex_array_descriptor_set: self.descriptor_set,
            }
        };
        dispatcher.dispatch(&event);
    }

    fn create_offscreen(&self, extent: Extent2D) -> RenderResult<OffscreenTargets> {
        let device = self.context.device.clone();
        let mut targets = OffscreenTargets::default();

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let image = device.create_image(&ImageDesc {
                label: "offscreen target",
                extent,
                format: OFFSCREEN_FORMAT,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
                mip_levels: 1,
                memory: MemoryProperties::DEVICE_LOCAL,
            })?;
            let view = device.create_image_view(image, OFFSCREEN_FORMAT)?;
            let framebuffer =
                device.create_framebuffer(self.offscreen_render_pass, &[view], extent)?;
            targets.images.push(image);
            targets.image_views.push(view);
            targets.framebuffers.push(framebuffer);
        }

        let (images, views, framebuffers) = (
            targets.images.clone(),
            targets.image_views.clone(),
            targets.framebuffers.clone(),
        );
        let mut task = CleanupTask::new("RenderTargets::create_offscreen", move || {
            for &framebuffer in &framebuffers {
                device.destroy_framebuffer(framebuffer);
            }
            for (&view, &image) in views.iter().zip(&images) {
                device.destroy_image_view(view);
                device.destroy_image(image);
            }
        });
        for &image in &targets.images {
            task = task.with_object("offscreen target", image);
        }
        targets.cleanup = Some(self.context.gc.create_cleanup_task(task));

        debug!("Created {MAX_FRAMES_IN_FLIGHT} offscreen targets of {extent:?}");
        Ok(targets)
    }

    fn recreate_offscreen(&self, extent: Extent2D) -> RenderResult {
        let old = self.offscreen.lock().cleanup.take();
        if let Some(cleanup) = old {
            self.context.gc.execute_cleanup_task(cleanup)?;
        }

        let targets = self.create_offscreen(extent)?;
        let event = OffscreenResourcesRecreated {
            image_views: targets.image_views.clone(),
            samplers: vec![self.sampler; MAX_FRAMES_IN_FLIGHT],
            framebuffers: targets.framebuffers.clone(),
        };
        *self.offscreen.lock() = targets;
        self.context.dispatcher.dispatch(&event);
        Ok(())
    }
}

fn with_targets(targets: &Weak<RenderTargets>, f: impl FnOnce(&RenderTargets)) {
    if let Some(targets) = targets.upgrade() {
        f(&targets);
    }
}

impl fmt::Debug for RenderTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTargets")
            .field("present_render_pass", &self.present_render_pass)
            .field("offscreen_render_pass", &self.offscreen_render_pass)
            .field("descriptor_set", &self.descriptor_set)
            .finish_non_exhaustive()
    }
}

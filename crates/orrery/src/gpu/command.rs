use super::{
    Buffer, BufferCopy, BufferImageCopy, CommandBuffer, DescriptorSet, Image, ImageBarrier,
    ImageLayout, Pipeline, RenderPassBegin,
};
use smallvec::SmallVec;

/// A single recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass(RenderPassBegin),
    EndRenderPass,
    /// Executes secondary command buffers. Only valid in primary buffers.
    ExecuteCommands(Vec<CommandBuffer>),
    PipelineBarrier(ImageBarrier),
    CopyBuffer {
        src: Buffer,
        dst: Buffer,
        region: BufferCopy,
    },
    CopyBufferToImage {
        src: Buffer,
        dst: Image,
        dst_layout: ImageLayout,
        region: BufferImageCopy,
    },
    CopyImageToBuffer {
        src: Image,
        src_layout: ImageLayout,
        dst: Buffer,
        region: BufferImageCopy,
    },
    BindPipeline(Pipeline),
    BindDescriptorSet {
        set: DescriptorSet,
        dynamic_offsets: SmallVec<[u32; 2]>,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
}

impl Command {
    /// Short name, used by logs and the headless call log.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeginRenderPass(_) => "BeginRenderPass",
            Self::EndRenderPass => "EndRenderPass",
            Self::ExecuteCommands(_) => "ExecuteCommands",
            Self::PipelineBarrier(_) => "PipelineBarrier",
            Self::CopyBuffer { .. } => "CopyBuffer",
            Self::CopyBufferToImage { .. } => "CopyBufferToImage",
            Self::CopyImageToBuffer { .. } => "CopyImageToBuffer",
            Self::BindPipeline(_) => "BindPipeline",
            Self::BindDescriptorSet { .. } => "BindDescriptorSet",
            Self::DrawIndexed { .. } => "DrawIndexed",
        }
    }
}

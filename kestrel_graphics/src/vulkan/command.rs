use std::{ffi::CString, sync::Arc};

use anyhow::Result;
use ash::vk;

use super::{
    impl_set_name,
    resource::{Buffer, DescriptorSet, Image, Pipeline, PipelineLayout, QueryPool},
    types::ResourceState,
    ContextShared, Queue,
};

const MEMORY_BARRIERS_MAX: usize = 4;
const BUFFER_BARRIERS_MAX: usize = 16;
const IMAGE_BARRIERS_MAX: usize = 16;

/// Wraps the raw vulkan CommandPool object. Buffers allocated from it can be
/// reset individually.
pub struct CommandPool {
    pub(crate) raw: vk::CommandPool,
    context: Arc<ContextShared>,
}

impl CommandPool {
    pub fn new(context: Arc<ContextShared>, queue: &Queue) -> Result<Self> {
        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue.family_index);

        let raw = unsafe { context.raw.create_command_pool(&command_pool_info, None)? };

        Ok(Self { raw, context })
    }

    pub fn allocate_command_buffer(&self) -> Result<CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let raw = unsafe { self.context.raw.allocate_command_buffers(&allocate_info)? }[0];

        Ok(CommandBuffer {
            raw,
            context: self.context.clone(),
        })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.context.raw.destroy_command_pool(self.raw, None) }
    }
}

impl_set_name!(CommandPool);

/// Does not hold the command pool; the pool outlives its buffers by
/// construction (renderer and uploader own both).
#[derive(Clone)]
pub struct CommandBuffer {
    pub(crate) raw: vk::CommandBuffer,
    context: Arc<ContextShared>,
}

impl CommandBuffer {
    pub fn begin(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.context
                .raw
                .begin_command_buffer(self.raw, &begin_info)?
        };

        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe {
            self.context.raw.end_command_buffer(self.raw)?;
        }

        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.context
                .raw
                .reset_command_buffer(self.raw, vk::CommandBufferResetFlags::empty())?;
        }

        Ok(())
    }

    pub fn begin_marker(&self, name: &str) {
        let Ok(label_name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default().label_name(label_name.as_c_str());
        unsafe {
            self.context
                .debug_utils_fn
                .cmd_begin_debug_utils_label(self.raw, &label);
        }
    }

    pub fn end_marker(&self) {
        unsafe {
            self.context.debug_utils_fn.cmd_end_debug_utils_label(self.raw);
        }
    }

    pub fn pipeline_barrier(&self, builder: &PipelineBarrierBuilder) {
        if builder.is_empty() {
            return;
        }

        let dependency_info = vk::DependencyInfo::default()
            .memory_barriers(&builder.memory_barriers)
            .buffer_memory_barriers(&builder.buffer_barriers)
            .image_memory_barriers(&builder.image_barriers);
        unsafe {
            self.context
                .raw
                .cmd_pipeline_barrier2(self.raw, &dependency_info);
        }
    }

    pub fn begin_rendering(
        &self,
        color_attachments: &[vk::RenderingAttachmentInfo],
        depth_attachment: Option<&vk::RenderingAttachmentInfo>,
        render_area: vk::Rect2D,
    ) {
        let empty_depth_attachment = vk::RenderingAttachmentInfo::default();

        let rendering_info = vk::RenderingInfo::default()
            .color_attachments(color_attachments)
            .depth_attachment(depth_attachment.unwrap_or(&empty_depth_attachment))
            .render_area(render_area)
            .layer_count(1);
        unsafe {
            self.context
                .raw
                .cmd_begin_rendering(self.raw, &rendering_info);
        }
    }

    pub fn end_rendering(&self) {
        unsafe {
            self.context.raw.cmd_end_rendering(self.raw);
        }
    }

    pub fn bind_pipeline(&self, pipeline: &Pipeline) {
        unsafe {
            self.context.raw.cmd_bind_pipeline(
                self.raw,
                pipeline.bind_point,
                pipeline.raw,
            );
        }
    }

    pub fn bind_descriptor_set(
        &self,
        layout: &PipelineLayout,
        descriptor_set: &DescriptorSet,
        bind_point: vk::PipelineBindPoint,
    ) {
        unsafe {
            self.context.raw.cmd_bind_descriptor_sets(
                self.raw,
                bind_point,
                layout.raw,
                0,
                std::slice::from_ref(&descriptor_set.raw),
                &[],
            )
        }
    }

    pub fn bind_index_buffer(&self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.context
                .raw
                .cmd_bind_index_buffer(self.raw, buffer.raw, offset, index_type);
        }
    }

    pub fn set_viewport(&self, x: f32, y: f32, width: f32, height: f32) {
        let viewport = vk::Viewport::default()
            .x(x)
            .y(y)
            .width(width)
            .height(height)
            .min_depth(0.0)
            .max_depth(1.0);
        unsafe {
            self.context
                .raw
                .cmd_set_viewport(self.raw, 0, std::slice::from_ref(&viewport));
        }
    }

    pub fn set_scissor(&self, offset_x: i32, offset_y: i32, width: u32, height: u32) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: offset_x,
                y: offset_y,
            },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.context
                .raw
                .cmd_set_scissor(self.raw, 0, std::slice::from_ref(&scissor));
        }
    }

    pub fn push_constants(
        &self,
        layout: &PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.context
                .raw
                .cmd_push_constants(self.raw, layout.raw, stage_flags, offset, data);
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.context.raw.cmd_draw_indexed(
                self.raw,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn reset_query(&self, query_pool: &QueryPool, first_query: u32, query_count: u32) {
        unsafe {
            self.context
                .raw
                .cmd_reset_query_pool(self.raw, query_pool.raw, first_query, query_count);
        }
    }

    pub fn write_timestamp(
        &self,
        query_pool: &QueryPool,
        stage: vk::PipelineStageFlags2,
        query_index: u32,
    ) {
        unsafe {
            self.context
                .raw
                .cmd_write_timestamp2(self.raw, stage, query_pool.raw, query_index);
        }
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy2]) {
        let info = vk::CopyBufferInfo2::default()
            .src_buffer(src)
            .dst_buffer(dst)
            .regions(regions);
        unsafe {
            self.context.raw.cmd_copy_buffer2(self.raw, &info);
        }
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy2],
    ) {
        let info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(src)
            .dst_image(dst)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(regions);
        unsafe {
            self.context.raw.cmd_copy_buffer_to_image2(self.raw, &info);
        }
    }
}

impl_set_name!(CommandBuffer);

/// Accumulates memory, buffer and image barriers, deriving synchronization
/// scopes from logical resource states. Bounded; `add_*` returns false when
/// the corresponding table is full.
#[derive(Default)]
pub struct PipelineBarrierBuilder {
    memory_barriers: Vec<vk::MemoryBarrier2<'static>>,
    buffer_barriers: Vec<vk::BufferMemoryBarrier2<'static>>,
    image_barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl PipelineBarrierBuilder {
    pub fn add_memory(
        &mut self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> bool {
        if self.memory_barriers.len() >= MEMORY_BARRIERS_MAX {
            return false;
        }

        self.memory_barriers.push(
            vk::MemoryBarrier2::default()
                .src_stage_mask(src_stage)
                .src_access_mask(src_access)
                .dst_stage_mask(dst_stage)
                .dst_access_mask(dst_access),
        );
        true
    }

    pub fn add_buffer(
        &mut self,
        buffer: &Buffer,
        old_state: ResourceState,
        new_state: ResourceState,
        offset: u64,
        size: u64,
    ) -> bool {
        if self.buffer_barriers.len() >= BUFFER_BARRIERS_MAX {
            return false;
        }

        let src = old_state.access_info();
        let dst = new_state.access_info();
        self.buffer_barriers.push(
            vk::BufferMemoryBarrier2::default()
                .src_stage_mask(src.stage)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stage)
                .dst_access_mask(dst.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer.raw)
                .offset(offset)
                .size(size),
        );
        true
    }

    pub fn add_image(
        &mut self,
        image: &Image,
        old_state: ResourceState,
        new_state: ResourceState,
        subresource_range: vk::ImageSubresourceRange,
    ) -> bool {
        if self.image_barriers.len() >= IMAGE_BARRIERS_MAX {
            return false;
        }

        let src = old_state.access_info();
        let dst = new_state.access_info();
        self.image_barriers.push(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src.stage)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stage)
                .dst_access_mask(dst.access)
                .old_layout(src.layout)
                .new_layout(dst.layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.raw)
                .subresource_range(subresource_range),
        );
        true
    }

    pub fn is_empty(&self) -> bool {
        self.memory_barriers.is_empty()
            && self.buffer_barriers.is_empty()
            && self.image_barriers.is_empty()
    }

    pub fn image_barrier_count(&self) -> usize {
        self.image_barriers.len()
    }

    pub fn reset(&mut self) {
        self.memory_barriers.clear();
        self.buffer_barriers.clear();
        self.image_barriers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_barriers_are_bounded() {
        let mut builder = PipelineBarrierBuilder::default();
        for _ in 0..MEMORY_BARRIERS_MAX {
            assert!(builder.add_memory(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::NONE,
            ));
        }
        assert!(!builder.add_memory(
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::NONE,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::NONE,
        ));

        builder.reset();
        assert!(builder.is_empty());
    }
}

use std::path::Path;

use anyhow::{Context as _, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::{
    handle::Handle,
    renderer::{
        frame::{BufferUpdateInfo, ImageSubresourceData, ImageUpdateInfo},
        Renderer, BINDLESS_STAGES,
    },
    vulkan::{
        command::PipelineBarrierBuilder,
        resource::{
            BufferDescriptor, BufferFlags, GraphicsPipelineDescriptor, Image, ImageDescriptor,
            Pipeline, SamplerDescriptor, ShaderModule,
        },
        types::ResourceState,
    },
};

use super::{DrawData, DrawIdx, DrawVert, TextureBinding, TextureData, TextureStatus};

pub const GUI_INITIAL_VERTEX_COUNT: u32 = 2048;
pub const GUI_INITIAL_INDEX_COUNT: u32 = 4096;

/// Textures the UI stopped referencing are kept alive this many frames
/// before a destroy request is honored.
const TEXTURE_DESTROY_UNUSED_FRAMES: u32 = 256;

const VERTEX_BUFFER_FLAGS: BufferFlags = BufferFlags::DYNAMIC
    .union(BufferFlags::DEVICE_ADDRESS)
    .union(BufferFlags::VERTEX);
const INDEX_BUFFER_FLAGS: BufferFlags = BufferFlags::DYNAMIC
    .union(BufferFlags::DEVICE_ADDRESS)
    .union(BufferFlags::INDEX);

/// 32 bytes, std430. Must match the layout in shaders/gui.vert.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GuiPushConstant {
    vertices: u64,
    scale: [f32; 2],
    translate: [f32; 2],
    image_index: u32,
    sampler_index: u32,
}

fn grow_capacity(start: u32, required: u32) -> u32 {
    let mut result = start.max(1);
    while result < required {
        result *= 2;
    }
    result
}

/// Projects a clip rectangle into framebuffer pixels and clamps it to the
/// framebuffer. Returns `None` for degenerate rectangles.
fn project_clip_rect(
    clip_rect: [f32; 4],
    clip_off: [f32; 2],
    clip_scale: [f32; 2],
    framebuffer_size: [f32; 2],
) -> Option<(i32, i32, u32, u32)> {
    let mut min_x = (clip_rect[0] - clip_off[0]) * clip_scale[0];
    let mut min_y = (clip_rect[1] - clip_off[1]) * clip_scale[1];
    let mut max_x = (clip_rect[2] - clip_off[0]) * clip_scale[0];
    let mut max_y = (clip_rect[3] - clip_off[1]) * clip_scale[1];

    min_x = min_x.max(0.0);
    min_y = min_y.max(0.0);
    max_x = max_x.min(framebuffer_size[0]);
    max_y = max_y.min(framebuffer_size[1]);
    if max_x <= min_x || max_y <= min_y {
        return None;
    }

    Some((
        min_x as i32,
        min_y as i32,
        (max_x - min_x) as u32,
        (max_y - min_y) as u32,
    ))
}

pub struct GuiRendererDescriptor<'a> {
    pub vertex_shader_path: &'a Path,
    pub fragment_shader_path: &'a Path,
}

/// Precompiled binaries load directly, everything else goes through the
/// glslangValidator CLI.
fn load_shader(
    context: &std::sync::Arc<crate::vulkan::ContextShared>,
    path: &Path,
    stage: vk::ShaderStageFlags,
) -> Result<ShaderModule> {
    if path.extension().and_then(|ext| ext.to_str()) == Some("spv") {
        ShaderModule::from_spirv_file(context.clone(), path, stage)
    } else {
        ShaderModule::from_glsl_file(context.clone(), path, stage)
    }
}

/// Draws UI draw lists into the backbuffer: texture lifecycle, growing
/// vertex/index buffers, staged geometry upload and bindless indexed draws.
pub struct GuiRenderer {
    pipeline: Pipeline,
    default_sampler: Handle,
    vertex_buffer: Handle,
    vertex_capacity: u32,
    index_buffer: Handle,
    index_capacity: u32,
}

impl GuiRenderer {
    pub fn new(renderer: &mut Renderer, desc: GuiRendererDescriptor) -> Result<Self> {
        let context = renderer.context_shared().clone();

        let vertex_shader = load_shader(
            &context,
            desc.vertex_shader_path,
            vk::ShaderStageFlags::VERTEX,
        )?;
        let fragment_shader = load_shader(
            &context,
            desc.fragment_shader_path,
            vk::ShaderStageFlags::FRAGMENT,
        )?;

        let pipeline = Pipeline::new_graphics(
            context,
            GraphicsPipelineDescriptor {
                vertex_shader: &vertex_shader,
                fragment_shader: &fragment_shader,
                layout: renderer.pipeline_layout(),
                cache: None,
                color_attachment_formats: vec![renderer.swapchain_format()],
                depth_attachment_format: vk::Format::UNDEFINED,
                alpha_blend: true,
            },
        )?;

        let default_sampler = renderer.create_sampler(SamplerDescriptor::default())?;

        let vertex_buffer = renderer.create_buffer(BufferDescriptor::new(
            GUI_INITIAL_VERTEX_COUNT as u64 * std::mem::size_of::<DrawVert>() as u64,
            VERTEX_BUFFER_FLAGS,
        ))?;
        let index_buffer = renderer.create_buffer(BufferDescriptor::new(
            GUI_INITIAL_INDEX_COUNT as u64 * std::mem::size_of::<DrawIdx>() as u64,
            INDEX_BUFFER_FLAGS,
        ))?;

        Ok(Self {
            pipeline,
            default_sampler,
            vertex_buffer,
            vertex_capacity: GUI_INITIAL_VERTEX_COUNT,
            index_buffer,
            index_capacity: GUI_INITIAL_INDEX_COUNT,
        })
    }

    pub fn vertex_capacity(&self) -> u32 {
        self.vertex_capacity
    }

    pub fn index_capacity(&self) -> u32 {
        self.index_capacity
    }

    /// Records the whole pass into the active frame. Call between
    /// `frame_begin` and `frame_end`.
    pub fn execute(&mut self, renderer: &mut Renderer, draw_data: &mut DrawData) -> Result<()> {
        for texture in &mut draw_data.textures {
            self.update_texture(renderer, texture)?;
        }

        if draw_data.total_vtx_count == 0 || draw_data.total_idx_count == 0 {
            return Ok(());
        }

        self.update_geometry(renderer, draw_data)?;
        self.render(renderer, draw_data)?;

        Ok(())
    }

    fn update_texture(&mut self, renderer: &mut Renderer, texture: &mut TextureData) -> Result<()> {
        match texture.status {
            TextureStatus::Ok | TextureStatus::Destroyed => Ok(()),
            TextureStatus::WantCreate => self.create_texture(renderer, texture),
            TextureStatus::WantUpdates => self.apply_texture_updates(renderer, texture),
            TextureStatus::WantDestroy => {
                if texture.unused_frames < TEXTURE_DESTROY_UNUSED_FRAMES {
                    return Ok(());
                }
                renderer.free_resource(texture.binding.image);
                texture.binding = TextureBinding::INVALID;
                texture.status = TextureStatus::Destroyed;
                Ok(())
            }
        }
    }

    fn create_texture(&mut self, renderer: &mut Renderer, texture: &mut TextureData) -> Result<()> {
        let cmd = renderer
            .active_command_buffer()
            .context("No frame is recording")?;

        let handle = renderer.add_resource();
        anyhow::ensure!(handle.is_valid(), "Resource pool exhausted");

        let image = match Image::new(
            renderer.context_shared().clone(),
            ImageDescriptor::new_2d(texture.width, texture.height, vk::Format::R8G8B8A8_SRGB),
        ) {
            Ok(image) => image,
            Err(error) => {
                log::error!("Failed to create UI texture: {}", error);
                renderer.free_resource(handle);
                texture.binding = TextureBinding::INVALID;
                texture.status = TextureStatus::Destroyed;
                return Ok(());
            }
        };

        let mut builder = PipelineBarrierBuilder::default();
        builder.add_image(
            &image,
            ResourceState::Undefined,
            ResourceState::TransferDst,
            image.full_subresource_range(),
        );
        cmd.pipeline_barrier(&builder);

        let whole_size = (texture.width * texture.height * texture.bytes_per_pixel) as u64;
        let view = renderer.try_allocate_staging_memory(whole_size, 1)?;

        let mut update = ImageUpdateInfo::new(&image, view);
        update.write(&ImageSubresourceData::new(
            &texture.pixels,
            vk::Extent3D {
                width: texture.width,
                height: texture.height,
                depth: 1,
            },
        ));
        renderer.image_update_end(update)?;

        renderer.attach_image(handle, image, ResourceState::TransferDst)?;
        renderer.add_state_translation(handle, ResourceState::ShaderRead);

        texture.binding = TextureBinding::new(handle);
        texture.status = TextureStatus::Ok;

        Ok(())
    }

    fn apply_texture_updates(
        &mut self,
        renderer: &mut Renderer,
        texture: &mut TextureData,
    ) -> Result<()> {
        let cmd = renderer
            .active_command_buffer()
            .context("No frame is recording")?;

        let handle = texture.binding.image;
        let Some(image_raw) = renderer
            .get_resource(handle)
            .and_then(|resource| resource.image())
            .map(|image| image.raw)
        else {
            log::error!("UI texture update targets a stale resource");
            texture.status = TextureStatus::Destroyed;
            return Ok(());
        };

        renderer.add_state_translation(handle, ResourceState::TransferDst);
        renderer.translate_states(&cmd);

        let total_size: u64 = texture
            .updates
            .iter()
            .map(|rect| (rect.width * texture.bytes_per_pixel * rect.height) as u64)
            .sum();
        let view = renderer.try_allocate_staging_memory(total_size, 1)?;
        let mut update = ImageUpdateInfo::new_raw(image_raw, view);

        for rect in &texture.updates {
            let mut region_data =
                Vec::with_capacity((rect.width * texture.bytes_per_pixel * rect.height) as usize);
            for row in 0..rect.height {
                region_data.extend_from_slice(texture.row_bytes(rect, row));
            }

            let mut subresource = ImageSubresourceData::new(
                &region_data,
                vk::Extent3D {
                    width: rect.width,
                    height: rect.height,
                    depth: 1,
                },
            );
            subresource.offset = vk::Offset3D {
                x: rect.x as i32,
                y: rect.y as i32,
                z: 0,
            };
            update.write(&subresource);
        }

        renderer.image_update_end(update)?;

        renderer.add_state_translation(handle, ResourceState::ShaderRead);
        renderer.translate_states(&cmd);

        texture.updates.clear();
        texture.status = TextureStatus::Ok;

        Ok(())
    }

    /// Grows the geometry buffers by doubling when the draw data outgrew
    /// them, then streams the packed vertex/index data through staging.
    fn update_geometry(&mut self, renderer: &mut Renderer, draw_data: &DrawData) -> Result<()> {
        if draw_data.total_vtx_count > self.vertex_capacity {
            self.vertex_capacity = grow_capacity(self.vertex_capacity, draw_data.total_vtx_count);
            let buffer = crate::vulkan::resource::Buffer::new(
                renderer.context_shared().clone(),
                BufferDescriptor::new(
                    self.vertex_capacity as u64 * std::mem::size_of::<DrawVert>() as u64,
                    VERTEX_BUFFER_FLAGS,
                ),
            )?;
            self.vertex_buffer = renderer.update_buffer(self.vertex_buffer, buffer)?;
        }

        if draw_data.total_idx_count > self.index_capacity {
            self.index_capacity = grow_capacity(self.index_capacity, draw_data.total_idx_count);
            let buffer = crate::vulkan::resource::Buffer::new(
                renderer.context_shared().clone(),
                BufferDescriptor::new(
                    self.index_capacity as u64 * std::mem::size_of::<DrawIdx>() as u64,
                    INDEX_BUFFER_FLAGS,
                ),
            )?;
            self.index_buffer = renderer.update_buffer(self.index_buffer, buffer)?;
        }

        let cmd = renderer
            .active_command_buffer()
            .context("No frame is recording")?;

        let vtx_bytes = draw_data.total_vtx_count as u64 * std::mem::size_of::<DrawVert>() as u64;
        let idx_bytes = draw_data.total_idx_count as u64 * std::mem::size_of::<DrawIdx>() as u64;

        let vb_view = renderer.try_allocate_staging_memory(vtx_bytes, 1)?;
        let ib_view = renderer.try_allocate_staging_memory(idx_bytes, 1)?;

        let vb_raw = renderer
            .get_resource(self.vertex_buffer)
            .and_then(|resource| resource.buffer())
            .context("Vertex buffer resource missing")?
            .raw;
        let ib_raw = renderer
            .get_resource(self.index_buffer)
            .and_then(|resource| resource.buffer())
            .context("Index buffer resource missing")?
            .raw;

        let mut vb_update = BufferUpdateInfo::new_raw(vb_raw, vb_view);
        let mut ib_update = BufferUpdateInfo::new_raw(ib_raw, ib_view);

        let mut vtx_offset = 0u64;
        let mut idx_offset = 0u64;
        for list in &draw_data.lists {
            let vertices: &[u8] = bytemuck::cast_slice(&list.vertices);
            vb_update.write(vertices, vtx_offset);
            vtx_offset += vertices.len() as u64;

            let indices: &[u8] = bytemuck::cast_slice(&list.indices);
            ib_update.write(indices, idx_offset);
            idx_offset += indices.len() as u64;
        }

        renderer.add_state_translation(self.vertex_buffer, ResourceState::TransferDst);
        renderer.add_state_translation(self.index_buffer, ResourceState::TransferDst);
        renderer.translate_states(&cmd);

        renderer.buffer_update_end(vb_update)?;
        renderer.buffer_update_end(ib_update)?;

        renderer.add_state_translation(self.vertex_buffer, ResourceState::VertexBuffer);
        renderer.add_state_translation(self.index_buffer, ResourceState::IndexBuffer);
        renderer.translate_states(&cmd);

        Ok(())
    }

    fn render(&mut self, renderer: &mut Renderer, draw_data: &DrawData) -> Result<()> {
        let cmd = renderer
            .active_command_buffer()
            .context("No frame is recording")?;

        let backbuffer = renderer.backbuffer_handle();
        let load_op = if renderer
            .get_resource(backbuffer)
            .map(|resource| resource.state())
            != Some(ResourceState::ColorAttachment)
        {
            renderer.add_state_translation(backbuffer, ResourceState::ColorAttachment);
            renderer.translate_states(&cmd);
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };

        let backbuffer_view = renderer
            .get_resource(backbuffer)
            .and_then(|resource| resource.srv_view_raw())
            .context("Backbuffer has no view")?;
        let extent = renderer.swapchain_extent();

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(backbuffer_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE);
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        cmd.begin_rendering(std::slice::from_ref(&color_attachment), None, render_area);

        let index_type = if std::mem::size_of::<DrawIdx>() == 2 {
            vk::IndexType::UINT16
        } else {
            vk::IndexType::UINT32
        };
        {
            let index_buffer = renderer
                .get_resource(self.index_buffer)
                .and_then(|resource| resource.buffer())
                .context("Index buffer resource missing")?;
            cmd.bind_index_buffer(index_buffer, 0, index_type);
        }
        cmd.bind_pipeline(&self.pipeline);
        cmd.set_viewport(0.0, 0.0, extent.width as f32, extent.height as f32);

        let vertex_address = renderer
            .get_resource(self.vertex_buffer)
            .and_then(|resource| resource.buffer())
            .and_then(|buffer| buffer.device_address)
            .context("Vertex buffer has no device address")?;

        let scale = [
            2.0 / draw_data.display_size[0],
            2.0 / draw_data.display_size[1],
        ];
        let mut push_constant = GuiPushConstant {
            vertices: vertex_address,
            scale,
            translate: [
                -1.0 - draw_data.display_pos[0] * scale[0],
                -1.0 - draw_data.display_pos[1] * scale[1],
            ],
            image_index: 0,
            sampler_index: 0,
        };

        let clip_off = draw_data.display_pos;
        let clip_scale = draw_data.framebuffer_scale;
        let framebuffer_size = [
            draw_data.display_size[0] * clip_scale[0],
            draw_data.display_size[1] * clip_scale[1],
        ];

        let mut last_binding = TextureBinding::INVALID;
        let mut global_vtx_offset = 0u32;
        let mut global_idx_offset = 0u32;

        for list in &draw_data.lists {
            for draw in &list.commands {
                let Some((x, y, width, height)) =
                    project_clip_rect(draw.clip_rect, clip_off, clip_scale, framebuffer_size)
                else {
                    continue;
                };
                cmd.set_scissor(x, y, width, height);

                if draw.texture != last_binding {
                    // A stale or missing texture must not sample whatever
                    // happens to sit in slot 0; drop the draw instead.
                    let Some(image_index) = renderer
                        .get_resource(draw.texture.image)
                        .and_then(|resource| resource.srv_index())
                    else {
                        log::warn!("Draw command references a missing texture, skipped");
                        continue;
                    };
                    let sampler = if draw.texture.sampler.is_valid() {
                        draw.texture.sampler
                    } else {
                        self.default_sampler
                    };
                    let Some(sampler_index) = renderer
                        .get_resource(sampler)
                        .and_then(|resource| resource.srv_index())
                    else {
                        log::warn!("Draw command references a missing sampler, skipped");
                        continue;
                    };

                    push_constant.image_index = image_index;
                    push_constant.sampler_index = sampler_index;
                    renderer.push_constants(BINDLESS_STAGES, &push_constant)?;
                    last_binding = draw.texture;
                }

                cmd.draw_indexed(
                    draw.element_count,
                    1,
                    draw.index_offset + global_idx_offset,
                    (draw.vertex_offset + global_vtx_offset) as i32,
                    0,
                );
            }

            global_idx_offset += list.indices.len() as u32;
            global_vtx_offset += list.vertices.len() as u32;
        }

        cmd.end_rendering();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_doubles_until_sufficient() {
        assert_eq!(grow_capacity(2048, 2048), 2048);
        assert_eq!(grow_capacity(2048, 2049), 4096);
        assert_eq!(grow_capacity(2048, 3000), 4096);
        assert_eq!(grow_capacity(2048, 9000), 16384);
    }

    #[test]
    fn clip_rect_projects_and_clamps() {
        let clip = project_clip_rect(
            [-10.0, 5.0, 120.0, 40.0],
            [0.0, 0.0],
            [1.0, 1.0],
            [100.0, 100.0],
        )
        .unwrap();
        assert_eq!(clip, (0, 5, 100, 35));
    }

    #[test]
    fn clip_rect_applies_framebuffer_scale() {
        let clip = project_clip_rect(
            [10.0, 10.0, 20.0, 20.0],
            [0.0, 0.0],
            [2.0, 2.0],
            [200.0, 200.0],
        )
        .unwrap();
        assert_eq!(clip, (20, 20, 20, 20));
    }

    #[test]
    fn degenerate_clip_rect_is_skipped() {
        assert!(project_clip_rect(
            [50.0, 50.0, 50.0, 80.0],
            [0.0, 0.0],
            [1.0, 1.0],
            [100.0, 100.0],
        )
        .is_none());
        // Entirely off-screen.
        assert!(project_clip_rect(
            [150.0, 0.0, 200.0, 50.0],
            [0.0, 0.0],
            [1.0, 1.0],
            [100.0, 100.0],
        )
        .is_none());
    }
}

//! Draw-data model consumed by the GUI pass. The immediate-mode UI library
//! living above the engine fills these structures every frame; the pass
//! turns them into staged uploads and indexed draws.

use bytemuck::{Pod, Zeroable};

use crate::handle::Handle;

pub mod renderer;

pub use renderer::{GuiRenderer, GuiRendererDescriptor};

pub type DrawIdx = u16;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct DrawVert {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    pub col: [u8; 4],
}

/// Texture reference carried by draw commands: the image resource plus an
/// optional sampler override.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TextureBinding {
    pub image: Handle,
    pub sampler: Handle,
}

impl TextureBinding {
    pub const INVALID: TextureBinding = TextureBinding {
        image: Handle::INVALID,
        sampler: Handle::INVALID,
    };

    pub fn new(image: Handle) -> Self {
        Self {
            image,
            sampler: Handle::INVALID,
        }
    }
}

impl Default for TextureBinding {
    fn default() -> Self {
        Self::INVALID
    }
}

#[derive(Clone, Debug)]
pub struct DrawCommand {
    /// Clip rectangle in draw-data coordinates: x1, y1, x2, y2.
    pub clip_rect: [f32; 4],
    pub texture: TextureBinding,
    pub index_offset: u32,
    pub vertex_offset: u32,
    pub element_count: u32,
}

#[derive(Default)]
pub struct DrawList {
    pub vertices: Vec<DrawVert>,
    pub indices: Vec<DrawIdx>,
    pub commands: Vec<DrawCommand>,
}

/// Everything the pass needs for one frame of UI.
#[derive(Default)]
pub struct DrawData {
    pub lists: Vec<DrawList>,
    pub total_vtx_count: u32,
    pub total_idx_count: u32,
    pub display_pos: [f32; 2],
    pub display_size: [f32; 2],
    pub framebuffer_scale: [f32; 2],
    pub textures: Vec<TextureData>,
}

impl DrawData {
    pub fn push_list(&mut self, list: DrawList) {
        self.total_vtx_count += list.vertices.len() as u32;
        self.total_idx_count += list.indices.len() as u32;
        self.lists.push(list);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextureStatus {
    WantCreate,
    WantUpdates,
    WantDestroy,
    Ok,
    Destroyed,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// CPU-side texture owned by the UI library. The pass reacts to the status
/// field and writes back the resource handle and `Ok`/`Destroyed`.
pub struct TextureData {
    pub status: TextureStatus,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub pixels: Vec<u8>,
    pub updates: Vec<TextureRect>,
    pub unused_frames: u32,
    pub binding: TextureBinding,
}

impl TextureData {
    pub fn new_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * 4) as usize);
        Self {
            status: TextureStatus::WantCreate,
            width,
            height,
            bytes_per_pixel: 4,
            pixels,
            updates: Vec::new(),
            unused_frames: 0,
            binding: TextureBinding::INVALID,
        }
    }

    pub(crate) fn row_bytes(&self, rect: &TextureRect, row: u32) -> &[u8] {
        let pitch = (self.width * self.bytes_per_pixel) as usize;
        let start = (rect.y + row) as usize * pitch
            + (rect.x * self.bytes_per_pixel) as usize;
        let length = (rect.width * self.bytes_per_pixel) as usize;
        &self.pixels[start..start + length]
    }
}

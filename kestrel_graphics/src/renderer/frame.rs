use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::vulkan::{
    command::{CommandBuffer, CommandPool},
    resource::{Buffer, BufferDescriptor, BufferFlags, BufferView},
    types::align_up,
    ContextShared, Fence, Semaphore, SemaphoreKind,
};

use super::resource::RenderResource;

pub const RENDERER_STAGING_ARENA_SIZE: u64 = 1024 * 1024;

const FENCE_WAIT_TIMEOUT_NS: u64 = 1_000_000_000;

pub(crate) enum StagingPlacement {
    Arena { offset: u64 },
    Spill,
}

/// Decides where a staging request lands: inside the arena at an aligned
/// offset, or in a dedicated one-shot buffer when it does not fit.
pub(crate) fn plan_staging(
    arena_size: u64,
    cursor: u64,
    required_size: u64,
    required_alignment: u64,
) -> StagingPlacement {
    let aligned_size = align_up(required_size, required_alignment);
    let aligned_offset = align_up(cursor, required_alignment);

    if arena_size < aligned_size || arena_size - aligned_offset < aligned_size {
        StagingPlacement::Spill
    } else {
        StagingPlacement::Arena {
            offset: aligned_offset,
        }
    }
}

/// Host-visible scratch memory with a monotonic cursor. Oversized requests
/// spill into one-shot buffers that live until the next `reset`.
pub(crate) struct StagingArena {
    arena: Buffer,
    cursor: u64,
    spill: Vec<Buffer>,
}

impl StagingArena {
    pub(crate) fn new(context: Arc<ContextShared>, size: u64) -> Result<Self> {
        let arena = Buffer::new(
            context,
            BufferDescriptor::new(size, BufferFlags::STAGING),
        )?;

        Ok(Self {
            arena,
            cursor: 0,
            spill: Vec::new(),
        })
    }

    /// Rewinds the cursor and releases spill buffers. Only call once the GPU
    /// is done with every view handed out since the previous reset.
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
        self.spill.clear();
    }

    pub(crate) fn allocate(
        &mut self,
        context: &Arc<ContextShared>,
        required_size: u64,
        required_alignment: u64,
    ) -> Result<BufferView> {
        let aligned_size = align_up(required_size, required_alignment);

        match plan_staging(self.arena.size, self.cursor, required_size, required_alignment) {
            StagingPlacement::Arena { offset } => {
                let view = self
                    .arena
                    .view(offset, aligned_size)
                    .ok_or_else(|| anyhow::anyhow!("Staging arena is not host-visible"))?;
                self.cursor = offset + aligned_size;
                Ok(view)
            }
            StagingPlacement::Spill => {
                let buffer = Buffer::new(
                    context.clone(),
                    BufferDescriptor::new(aligned_size, BufferFlags::STAGING)
                        .alignment(required_alignment),
                )?;
                let view = buffer
                    .view(0, aligned_size)
                    .ok_or_else(|| anyhow::anyhow!("Spill staging buffer is not host-visible"))?;
                self.spill.push(buffer);
                Ok(view)
            }
        }
    }
}

/// Per-frame GPU state: sync objects, the primary command buffer, staging
/// memory and the deferred-destroy queue drained when the slot is reused.
pub struct RendererFrame {
    pub(crate) image_available: Semaphore,
    pub(crate) rendering_finished: Semaphore,
    pub(crate) fence: Fence,
    pub(crate) cmd: CommandBuffer,
    pub(crate) staging: StagingArena,
    pub(crate) pending_destroys: Vec<RenderResource>,
    pub(crate) is_recording: bool,
    /// Whether the fence has a submission to wait for.
    pub(crate) submitted: bool,
}

impl RendererFrame {
    pub(crate) fn new(context: &Arc<ContextShared>, cmd_pool: &CommandPool) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(context.clone(), SemaphoreKind::Binary, 0)?,
            rendering_finished: Semaphore::new(context.clone(), SemaphoreKind::Binary, 0)?,
            fence: Fence::new(context.clone(), true)?,
            cmd: cmd_pool.allocate_command_buffer()?,
            staging: StagingArena::new(context.clone(), RENDERER_STAGING_ARENA_SIZE)?,
            pending_destroys: Vec::new(),
            is_recording: false,
            submitted: false,
        })
    }

    /// Retires the previous use of this slot and opens the command buffer.
    /// Returns false when the fence wait timed out; the frame is skipped.
    pub(crate) fn begin(&mut self) -> Result<bool> {
        anyhow::ensure!(!self.is_recording, "Frame is already recording");

        if self.submitted {
            if !self.fence.wait(FENCE_WAIT_TIMEOUT_NS)? {
                log::warn!("Frame fence wait timed out, skipping frame");
                return Ok(false);
            }
            self.fence.reset()?;
            self.submitted = false;
        }
        self.cmd.reset()?;

        self.staging.reset();

        self.cmd.begin()?;
        self.is_recording = true;

        Ok(true)
    }

    /// Byte-writable staging span valid for the rest of the frame.
    pub fn try_allocate_staging_memory(
        &mut self,
        context: &Arc<ContextShared>,
        required_size: u64,
        required_alignment: u64,
    ) -> Result<BufferView> {
        anyhow::ensure!(self.is_recording, "Frame is not recording");
        self.staging
            .allocate(context, required_size, required_alignment)
    }
}

/// Accumulates staged writes targeting one buffer; the copy regions are
/// emitted in a single `vkCmdCopyBuffer2` by `Renderer::buffer_update_end`.
pub struct BufferUpdateInfo {
    pub(crate) dst_buffer: vk::Buffer,
    pub(crate) view: BufferView,
    pub(crate) copy_regions: Vec<vk::BufferCopy2<'static>>,
    cursor: u64,
}

impl BufferUpdateInfo {
    pub fn new(dst_buffer: &Buffer, view: BufferView) -> Self {
        Self::new_raw(dst_buffer.raw, view)
    }

    pub(crate) fn new_raw(dst_buffer: vk::Buffer, view: BufferView) -> Self {
        Self {
            dst_buffer,
            view,
            copy_regions: Vec::new(),
            cursor: 0,
        }
    }

    pub fn write(&mut self, data: &[u8], dst_offset: u64) -> bool {
        let available = self.view.size - self.cursor;
        if data.len() as u64 > available {
            return false;
        }

        self.view.write(data, self.cursor);
        self.copy_regions.push(
            vk::BufferCopy2::default()
                .src_offset(self.view.local_offset + self.cursor)
                .dst_offset(dst_offset)
                .size(data.len() as u64),
        );
        self.cursor += data.len() as u64;

        true
    }
}

pub struct ImageSubresourceData<'a> {
    pub data: &'a [u8],
    pub offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub mip_level: u32,
    pub array_layer: u32,
    pub layer_count: u32,
}

impl<'a> ImageSubresourceData<'a> {
    pub fn new(data: &'a [u8], extent: vk::Extent3D) -> Self {
        Self {
            data,
            offset: vk::Offset3D::default(),
            extent,
            mip_level: 0,
            array_layer: 0,
            layer_count: 1,
        }
    }
}

/// Same as [`BufferUpdateInfo`], for buffer-to-image copies.
pub struct ImageUpdateInfo {
    pub(crate) dst_image: vk::Image,
    pub(crate) view: BufferView,
    pub(crate) copy_regions: Vec<vk::BufferImageCopy2<'static>>,
    cursor: u64,
}

impl ImageUpdateInfo {
    pub fn new(dst_image: &crate::vulkan::resource::Image, view: BufferView) -> Self {
        Self::new_raw(dst_image.raw, view)
    }

    pub(crate) fn new_raw(dst_image: vk::Image, view: BufferView) -> Self {
        Self {
            dst_image,
            view,
            copy_regions: Vec::new(),
            cursor: 0,
        }
    }

    pub fn write(&mut self, subresource: &ImageSubresourceData) -> bool {
        let available = self.view.size - self.cursor;
        if subresource.data.len() as u64 > available {
            return false;
        }

        self.view.write(subresource.data, self.cursor);
        self.copy_regions.push(
            vk::BufferImageCopy2::default()
                .buffer_offset(self.view.local_offset + self.cursor)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(subresource.mip_level)
                        .base_array_layer(subresource.array_layer)
                        .layer_count(subresource.layer_count),
                )
                .image_offset(subresource.offset)
                .image_extent(subresource.extent),
        );
        self.cursor += subresource.data.len() as u64;

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_fits_in_arena() {
        match plan_staging(1024, 0, 100, 16) {
            StagingPlacement::Arena { offset } => assert_eq!(offset, 0),
            StagingPlacement::Spill => panic!("should fit"),
        }
    }

    #[test]
    fn staging_offset_respects_alignment() {
        match plan_staging(1024, 10, 100, 16) {
            StagingPlacement::Arena { offset } => assert_eq!(offset, 16),
            StagingPlacement::Spill => panic!("should fit"),
        }
    }

    #[test]
    fn oversized_request_spills() {
        assert!(matches!(plan_staging(64, 0, 100, 16), StagingPlacement::Spill));
    }

    #[test]
    fn exhausted_arena_spills() {
        assert!(matches!(
            plan_staging(128, 100, 64, 16),
            StagingPlacement::Spill
        ));
    }

    #[test]
    fn sequential_plans_never_overlap() {
        let mut cursor = 0;
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for size in [100u64, 3, 64, 17] {
            match plan_staging(1024, cursor, size, 16) {
                StagingPlacement::Arena { offset } => {
                    let aligned = align_up(size, 16);
                    for (start, end) in &ranges {
                        assert!(offset >= *end || offset + aligned <= *start);
                    }
                    ranges.push((offset, offset + aligned));
                    cursor = offset + aligned;
                }
                StagingPlacement::Spill => panic!("should fit"),
            }
        }
    }

    #[test]
    fn buffer_update_records_regions_and_advances() {
        let mut backing = vec![0u8; 256];
        let view = BufferView::for_tests(&mut backing, 64);
        let mut update = BufferUpdateInfo {
            dst_buffer: vk::Buffer::null(),
            view,
            copy_regions: Vec::new(),
            cursor: 0,
        };

        assert!(update.write(&[1, 2, 3, 4], 128));
        assert!(update.write(&[5, 6], 132));

        assert_eq!(update.copy_regions.len(), 2);
        assert_eq!(update.copy_regions[0].src_offset, 64);
        assert_eq!(update.copy_regions[0].dst_offset, 128);
        assert_eq!(update.copy_regions[0].size, 4);
        assert_eq!(update.copy_regions[1].src_offset, 68);
        assert_eq!(update.copy_regions[1].size, 2);
        assert_eq!(&backing[64..70], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn buffer_update_rejects_overflow() {
        let mut backing = vec![0u8; 8];
        let view = BufferView::for_tests(&mut backing, 0);
        let mut update = BufferUpdateInfo {
            dst_buffer: vk::Buffer::null(),
            view,
            copy_regions: Vec::new(),
            cursor: 0,
        };

        assert!(update.write(&[0; 8], 0));
        assert!(!update.write(&[0; 1], 8));
        assert_eq!(update.copy_regions.len(), 1);
    }

    #[test]
    fn image_update_mirrors_subresource() {
        let mut backing = vec![0u8; 64];
        let view = BufferView::for_tests(&mut backing, 0);
        let mut update = ImageUpdateInfo {
            dst_image: vk::Image::null(),
            view,
            copy_regions: Vec::new(),
            cursor: 0,
        };

        let extent = vk::Extent3D {
            width: 2,
            height: 2,
            depth: 1,
        };
        let mut subresource = ImageSubresourceData::new(&[7u8; 16], extent);
        subresource.mip_level = 3;
        subresource.array_layer = 1;
        subresource.offset = vk::Offset3D { x: 4, y: 8, z: 0 };

        assert!(update.write(&subresource));

        let region = &update.copy_regions[0];
        assert_eq!(region.buffer_offset, 0);
        assert_eq!(region.image_subresource.mip_level, 3);
        assert_eq!(region.image_subresource.base_array_layer, 1);
        assert_eq!(region.image_subresource.layer_count, 1);
        assert_eq!(region.image_offset.x, 4);
        assert_eq!(region.image_offset.y, 8);
        assert_eq!(region.image_extent.width, 2);
    }
}

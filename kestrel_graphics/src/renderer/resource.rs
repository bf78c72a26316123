use ash::vk;

use crate::vulkan::{
    resource::{Buffer, Image, ImageView, Sampler},
    types::ResourceState,
};

/// Default number of per-mip UAV slots reserved per storage image.
pub const RENDERER_UAV_MAX: usize = 16;

pub enum RenderResourceKind {
    Empty,
    Image {
        image: Image,
        srv_view: Option<ImageView>,
        uav_views: Vec<ImageView>,
    },
    Buffer {
        buffer: Buffer,
    },
    Sampler {
        sampler: Sampler,
    },
}

/// Slot-stored logical resource: the GPU object variant, its current logical
/// state and the bindless array slots its views occupy.
pub struct RenderResource {
    pub(crate) kind: RenderResourceKind,
    pub(crate) state: ResourceState,
    pub(crate) srv_slot: Option<u32>,
    pub(crate) uav_slots: Vec<u32>,
}

impl RenderResource {
    pub(crate) fn empty() -> Self {
        Self {
            kind: RenderResourceKind::Empty,
            state: ResourceState::Undefined,
            srv_slot: None,
            uav_slots: Vec::new(),
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn image(&self) -> Option<&Image> {
        match &self.kind {
            RenderResourceKind::Image { image, .. } => Some(image),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        match &self.kind {
            RenderResourceKind::Buffer { buffer } => Some(buffer),
            _ => None,
        }
    }

    pub fn sampler(&self) -> Option<&Sampler> {
        match &self.kind {
            RenderResourceKind::Sampler { sampler } => Some(sampler),
            _ => None,
        }
    }

    /// Index into the bindless SRV array (sampled images) or the sampler
    /// array (samplers).
    pub fn srv_index(&self) -> Option<u32> {
        self.srv_slot
    }

    pub fn uav_index(&self, mip: usize) -> Option<u32> {
        self.uav_slots.get(mip).copied()
    }

    pub(crate) fn srv_view_raw(&self) -> Option<vk::ImageView> {
        match &self.kind {
            RenderResourceKind::Image { srv_view, .. } => srv_view.as_ref().map(|view| view.raw),
            _ => None,
        }
    }
}

/// Descriptor update recorded while the frame is recording and flushed as a
/// single `vkUpdateDescriptorSets` call at `frame_end`.
pub(crate) enum QueuedDescriptorWrite {
    Sampler { slot: u32, sampler: vk::Sampler },
    SampledImage { slot: u32, view: vk::ImageView },
    StorageImage { slot: u32, view: vk::ImageView },
}

use ash::vk;

/// Logical resource states used by passes. The state translator turns these
/// into concrete stage/access masks and image layouts, see
/// [`ResourceState::access_info`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ResourceState {
    #[default]
    Undefined,
    ColorAttachment,
    DepthAttachment,
    DepthRead,
    ShaderRead,
    TransferSrc,
    TransferDst,
    IndexBuffer,
    VertexBuffer,
    Present,
    General,
}

/// Concrete synchronization scope of a [`ResourceState`].
#[derive(Clone, Copy, Debug)]
pub struct ResourceAccess {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl ResourceState {
    pub fn access_info(self) -> ResourceAccess {
        match self {
            Self::Undefined => ResourceAccess {
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                access: vk::AccessFlags2::NONE,
                layout: vk::ImageLayout::UNDEFINED,
            },
            Self::ColorAttachment => ResourceAccess {
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
            Self::DepthAttachment => ResourceAccess {
                stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            },
            Self::DepthRead => ResourceAccess {
                stage: vk::PipelineStageFlags2::FRAGMENT_SHADER
                    | vk::PipelineStageFlags2::COMPUTE_SHADER,
                access: vk::AccessFlags2::SHADER_READ,
                layout: vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
            },
            Self::ShaderRead => ResourceAccess {
                stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                access: vk::AccessFlags2::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            Self::TransferSrc => ResourceAccess {
                stage: vk::PipelineStageFlags2::TRANSFER,
                access: vk::AccessFlags2::TRANSFER_READ,
                layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            },
            Self::TransferDst => ResourceAccess {
                stage: vk::PipelineStageFlags2::TRANSFER,
                access: vk::AccessFlags2::TRANSFER_WRITE,
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
            Self::IndexBuffer => ResourceAccess {
                stage: vk::PipelineStageFlags2::INDEX_INPUT,
                access: vk::AccessFlags2::INDEX_READ,
                layout: vk::ImageLayout::UNDEFINED,
            },
            Self::VertexBuffer => ResourceAccess {
                stage: vk::PipelineStageFlags2::VERTEX_INPUT,
                access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                layout: vk::ImageLayout::UNDEFINED,
            },
            Self::Present => ResourceAccess {
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                access: vk::AccessFlags2::NONE,
                layout: vk::ImageLayout::PRESENT_SRC_KHR,
            },
            Self::General => ResourceAccess {
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
        }
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if format_has_depth(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Picks the view type matching an image's shape. Cubes are recognized from
/// the face count, arrays from the layer count.
pub fn image_view_type(
    extent: vk::Extent3D,
    layer_count: u32,
    face_count: u32,
) -> vk::ImageViewType {
    if extent.depth > 1 {
        vk::ImageViewType::TYPE_3D
    } else if extent.height > 1 {
        match (face_count > 1, layer_count > 1) {
            (true, true) => vk::ImageViewType::CUBE_ARRAY,
            (true, false) => vk::ImageViewType::CUBE,
            (false, true) => vk::ImageViewType::TYPE_2D_ARRAY,
            (false, false) => vk::ImageViewType::TYPE_2D,
        }
    } else if layer_count > 1 {
        vk::ImageViewType::TYPE_1D_ARRAY
    } else {
        vk::ImageViewType::TYPE_1D
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 4), 20);
    }

    #[test]
    fn state_mapping_matches_table() {
        let transfer_dst = ResourceState::TransferDst.access_info();
        assert_eq!(transfer_dst.stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(transfer_dst.access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(transfer_dst.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let present = ResourceState::Present.access_info();
        assert_eq!(present.access, vk::AccessFlags2::NONE);
        assert_eq!(present.layout, vk::ImageLayout::PRESENT_SRC_KHR);

        let undefined = ResourceState::Undefined.access_info();
        assert_eq!(undefined.layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn view_type_from_shape() {
        let flat = vk::Extent3D {
            width: 64,
            height: 64,
            depth: 1,
        };
        assert_eq!(image_view_type(flat, 1, 1), vk::ImageViewType::TYPE_2D);
        assert_eq!(
            image_view_type(flat, 4, 1),
            vk::ImageViewType::TYPE_2D_ARRAY
        );
        assert_eq!(image_view_type(flat, 1, 6), vk::ImageViewType::CUBE);
        assert_eq!(image_view_type(flat, 2, 6), vk::ImageViewType::CUBE_ARRAY);

        let volume = vk::Extent3D {
            width: 8,
            height: 8,
            depth: 8,
        };
        assert_eq!(image_view_type(volume, 1, 1), vk::ImageViewType::TYPE_3D);

        let line = vk::Extent3D {
            width: 256,
            height: 1,
            depth: 1,
        };
        assert_eq!(image_view_type(line, 1, 1), vk::ImageViewType::TYPE_1D);
        assert_eq!(image_view_type(line, 3, 1), vk::ImageViewType::TYPE_1D_ARRAY);
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(
            format_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_aspect_mask(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }
}

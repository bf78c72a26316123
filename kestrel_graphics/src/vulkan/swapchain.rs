use std::sync::Arc;

use anyhow::{Context as _, Result};
use ash::vk;

use super::{impl_set_name, ContextShared, Queue};

pub struct SwapchainDescriptor {
    pub preferred_present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainDescriptor {
    fn default() -> Self {
        Self {
            preferred_present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

pub struct Swapchain {
    pub(crate) raw: vk::SwapchainKHR,
    images_raw: Vec<vk::Image>,
    pub(crate) image_views_raw: Vec<vk::ImageView>,
    pub(crate) image_index: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    min_image_count: u32,
    context: Arc<ContextShared>,
}

impl Swapchain {
    pub fn new(context: Arc<ContextShared>, desc: SwapchainDescriptor) -> Result<Self> {
        let surface_format = {
            let formats = unsafe {
                context
                    .surface_fn()
                    .get_physical_device_surface_formats(context.adapter_raw(), context.surface_raw())?
            };

            if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }
            } else {
                *formats
                    .iter()
                    .find(|format| {
                        format.format == vk::Format::B8G8R8A8_UNORM
                            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                    })
                    .unwrap_or(&formats[0])
            }
        };

        let present_mode = {
            let present_modes = unsafe {
                context
                    .surface_fn()
                    .get_physical_device_surface_present_modes(
                        context.adapter_raw(),
                        context.surface_raw(),
                    )?
            };

            if present_modes.contains(&desc.preferred_present_mode) {
                desc.preferred_present_mode
            } else {
                vk::PresentModeKHR::FIFO
            }
        };

        Self::new_with_state(context, surface_format, present_mode, None)
    }

    fn new_with_state(
        context: Arc<ContextShared>,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        min_image_count: Option<u32>,
    ) -> Result<Self> {
        let capabilities = unsafe {
            context
                .surface_fn()
                .get_physical_device_surface_capabilities(
                    context.adapter_raw(),
                    context.surface_raw(),
                )?
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            capabilities.max_image_extent
        };

        let image_count = min_image_count.unwrap_or_else(|| {
            if capabilities.max_image_count > 0 {
                capabilities
                    .max_image_count
                    .min(capabilities.min_image_count + 1)
            } else {
                capabilities.min_image_count + 1
            }
        });

        let composite_alpha = vk::CompositeAlphaFlagsKHR::OPAQUE;

        log::debug!("Swapchain extent: {} x {}", extent.width, extent.height);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(context.surface_raw())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .pre_transform(capabilities.current_transform)
            .composite_alpha(composite_alpha)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(present_mode)
            .clipped(true);

        let raw = unsafe { context.swapchain_fn.create_swapchain(&create_info, None)? };

        let images_raw = unsafe { context.swapchain_fn.get_swapchain_images(raw)? };
        let image_views_raw = images_raw
            .iter()
            .map(|image| {
                let image_view_info = vk::ImageViewCreateInfo::default()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                Ok(unsafe { context.raw.create_image_view(&image_view_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw,
            images_raw,
            image_views_raw,
            image_index: 0,
            surface_format,
            extent,
            present_mode,
            composite_alpha,
            min_image_count: image_count,
            context,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images_raw.len()
    }

    pub(crate) fn image_raw(&self, index: usize) -> vk::Image {
        self.images_raw[index]
    }

    pub(crate) fn image_view_raw(&self, index: usize) -> vk::ImageView {
        self.image_views_raw[index]
    }

    /// Compares the cached extent against the surface's current extent. The
    /// special `0xFFFFFFFF` extent means the compositor defers sizing and is
    /// never treated as outdated.
    pub fn is_outdated(&self) -> bool {
        let capabilities = unsafe {
            self.context
                .surface_fn()
                .get_physical_device_surface_capabilities(
                    self.context.adapter_raw(),
                    self.context.surface_raw(),
                )
        };

        match capabilities {
            Ok(capabilities) => {
                let current = capabilities.current_extent;
                current.width != u32::MAX
                    && (current.width != self.extent.width
                        || current.height != self.extent.height)
            }
            Err(error) => {
                log::warn!("Failed to query surface capabilities: {}", error);
                false
            }
        }
    }

    /// Rebuilds the swapchain reusing the negotiated format, color space,
    /// image count and present mode. The caller must have idled the queues.
    pub fn recreate(&mut self) -> Result<()> {
        log::debug!("Recreating swapchain...");
        let surface_format = self.surface_format;
        let present_mode = self.present_mode;
        let min_image_count = self.min_image_count;

        self.destroy();
        // The emptied-out shell is safe to drop, destroy() is idempotent.
        *self = Self::new_with_state(
            self.context.clone(),
            surface_format,
            present_mode,
            Some(min_image_count),
        )?;

        Ok(())
    }

    pub fn acquire_next_image(
        &mut self,
        timeout_ns: u64,
        signal_semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        let (image_index, is_suboptimal) = unsafe {
            self.context.swapchain_fn.acquire_next_image(
                self.raw,
                timeout_ns,
                signal_semaphore,
                vk::Fence::null(),
            )?
        };
        self.image_index = image_index;
        Ok((image_index, is_suboptimal))
    }

    /// Returns whether the swapchain is suboptimal for the surface.
    pub fn queue_present(&self, queue: &Queue, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        let swapchains = [self.raw];
        let image_indices = [self.image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _guard = queue.submit_lock.lock();
        let result = unsafe {
            self.context
                .swapchain_fn
                .queue_present(queue.raw, &present_info)
                .with_context(|| "Failed swapchain queue present")?
        };

        Ok(result)
    }

    fn destroy(&mut self) {
        if !self.image_views_raw.is_empty() {
            unsafe {
                for image_view in self.image_views_raw.drain(..) {
                    self.context.raw.destroy_image_view(image_view, None);
                }
            }
        }
        if self.raw != vk::SwapchainKHR::null() {
            unsafe {
                self.context.swapchain_fn.destroy_swapchain(self.raw, None);
            }
            self.raw = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl_set_name!(Swapchain);
